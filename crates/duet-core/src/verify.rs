use async_trait::async_trait;

use duet_types::CollaborativeTask;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
}

/// Post-check gating a task between completed and debugging. The hook point
/// is the contract; what a check actually inspects is up to the host.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, task_id: &str, task: &CollaborativeTask, output: &str) -> Verdict;
}

/// The shipped verifier accepts everything.
pub struct AcceptAll;

#[async_trait]
impl Verifier for AcceptAll {
    async fn verify(&self, _task_id: &str, _task: &CollaborativeTask, _output: &str) -> Verdict {
        Verdict::Pass
    }
}
