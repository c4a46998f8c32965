mod error;
mod routing;
mod task;

pub use error::{OrchestrationError, Result};
pub use routing::{RouteState, RoutingTask, TaskAttempt, DEFAULT_MAX_ATTEMPTS};
pub use task::{
    local_eligible, role_for_task_type, BackendRole, CollaborativeTask, TaskStatus, TaskType,
    DEFAULT_PRIORITY,
};
