use thiserror::Error;

use crate::task::BackendRole;

#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("unknown task `{0}`")]
    UnknownTask(String),

    #[error("invalid priority {0}; expected 1..=5")]
    InvalidPriority(u8),

    #[error("task `{0}` is not assigned to any role")]
    Unassigned(String),

    #[error("no backend configured for role `{0}`")]
    RoleNotConfigured(BackendRole),

    #[error("backend request failed: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;

impl OrchestrationError {
    /// Validation errors are caller mistakes and must never be retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            OrchestrationError::UnknownTask(_)
                | OrchestrationError::InvalidPriority(_)
                | OrchestrationError::Unassigned(_)
                | OrchestrationError::RoleNotConfigured(_)
        )
    }
}
