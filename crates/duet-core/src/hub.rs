use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use duet_middleware::{DelegationGateway, DelegationOutcome};
use duet_router::{RouteOutcome, TaskRouter};
use duet_types::TaskType;

const PLANNING_KEYWORDS: [&str; 5] = ["plan", "architecture", "design", "strategy", "roadmap"];
const REVIEW_KEYWORDS: [&str; 5] = ["review", "analyze", "check", "audit", "quality"];
const IMPLEMENTATION_KEYWORDS: [&str; 8] = [
    "implement", "code", "write", "create", "build", "function", "class", "method",
];
const DOCUMENTATION_KEYWORDS: [&str; 3] = ["document", "docs", "documentation"];
const REFACTOR_KEYWORDS: [&str; 4] = ["refactor", "improve", "optimize", "clean up"];
const TEST_KEYWORDS: [&str; 3] = ["test", "testing", "unit tests"];

const URGENT_KEYWORDS: [&str; 5] = ["urgent", "critical", "important", "priority", "asap"];
const SOON_KEYWORDS: [&str; 3] = ["soon", "next", "required"];

/// Bridges the agent's conversational loop to the routing stack: classifies a
/// user prompt into a task type, files it as a routing task, and runs it
/// synchronously.
pub struct DelegationHub {
    router: Arc<TaskRouter>,
    enabled: AtomicBool,
}

impl DelegationHub {
    pub fn new(router: Arc<TaskRouter>, enabled: bool) -> Self {
        Self {
            router,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn router(&self) -> &Arc<TaskRouter> {
        &self.router
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// First keyword bucket wins; planning and review take precedence over
    /// implementation so "review the implementation" goes to the reviewer.
    pub fn classify(prompt: &str) -> Option<TaskType> {
        let lower = prompt.to_lowercase();
        let contains_any = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

        if contains_any(&PLANNING_KEYWORDS) {
            return Some(TaskType::Planning);
        }
        if contains_any(&REVIEW_KEYWORDS) {
            return Some(TaskType::Review);
        }
        if contains_any(&IMPLEMENTATION_KEYWORDS) {
            return Some(TaskType::Implementation);
        }
        if contains_any(&DOCUMENTATION_KEYWORDS) {
            return Some(TaskType::Documentation);
        }
        if contains_any(&REFACTOR_KEYWORDS) {
            return Some(TaskType::Refactor);
        }
        if contains_any(&TEST_KEYWORDS) {
            return Some(TaskType::Test);
        }
        None
    }

    pub fn priority_for(prompt: &str) -> u8 {
        let lower = prompt.to_lowercase();
        if URGENT_KEYWORDS.iter().any(|k| lower.contains(k)) {
            1
        } else if SOON_KEYWORDS.iter().any(|k| lower.contains(k)) {
            2
        } else {
            3
        }
    }
}

#[async_trait]
impl DelegationGateway for DelegationHub {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn route_prompt(&self, prompt: &str) -> anyhow::Result<Option<DelegationOutcome>> {
        let Some(task_type) = Self::classify(prompt) else {
            return Ok(None);
        };
        let priority = Self::priority_for(prompt);

        let task_id = self.router.create_task(prompt, task_type, priority).await?;
        let outcome = match self.router.route(&task_id).await? {
            RouteOutcome::Completed {
                model_used,
                output,
                fallback,
                ..
            } => DelegationOutcome::Completed {
                model_used,
                output,
                fallback,
            },
            RouteOutcome::Busy { retry_after } => DelegationOutcome::Busy { retry_after },
            RouteOutcome::Failed {
                error,
                oom_detected,
                ..
            } => DelegationOutcome::Failed {
                error,
                oom_detected,
            },
        };
        Ok(Some(outcome))
    }
}
