mod coordinator;
mod hub;
mod plan;
mod verify;
mod worker;

pub use coordinator::{Execution, ExecutionCoordinator};
pub use hub::DelegationHub;
pub use plan::{DevelopmentPlan, PlannedTask};
pub use verify::{AcceptAll, Verdict, Verifier};
pub use worker::{BackgroundResult, LocalWorkerPool, LOCAL_WORKER_CAPACITY};
