use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{BackendRole, TaskType};

/// Local attempts allowed before a routing task is permanently escalated.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// One execution attempt against a backend. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub attempt_id: String,
    pub timestamp: DateTime<Utc>,
    pub model_used: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub oom_detected: bool,
}

impl TaskAttempt {
    pub fn success(model_used: impl Into<String>) -> Self {
        Self {
            attempt_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            model_used: model_used.into(),
            success: true,
            error: None,
            oom_detected: false,
        }
    }

    pub fn failure(model_used: impl Into<String>, error: impl Into<String>, oom: bool) -> Self {
        Self {
            attempt_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            model_used: model_used.into(),
            success: false,
            error: Some(error.into()),
            oom_detected: oom,
        }
    }
}

/// A prompt travelling through the safety routing layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTask {
    pub original_prompt: String,
    pub task_type: TaskType,
    pub priority: u8,
    pub max_attempts: u32,
    #[serde(default)]
    pub attempts: Vec<TaskAttempt>,
    #[serde(default)]
    pub current_attempt: u32,
    #[serde(default)]
    pub fallback_to_planner: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
}

impl RoutingTask {
    pub fn new(prompt: impl Into<String>, task_type: TaskType, priority: u8) -> Self {
        let now = Utc::now();
        Self {
            original_prompt: prompt.into(),
            task_type,
            priority,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempts: Vec::new(),
            current_attempt: 0,
            fallback_to_planner: false,
            created_at: now,
            updated_at: now,
            locked_by: None,
        }
    }

    /// Routing state derived from the attempt history; never stored.
    pub fn state(&self) -> RouteState {
        let Some(last) = self.attempts.last() else {
            return RouteState::Pending;
        };
        if last.success {
            if last.model_used == BackendRole::Planner.as_str() {
                RouteState::CompletedFallback
            } else {
                RouteState::Completed
            }
        } else if self.fallback_to_planner {
            RouteState::FailedFallback
        } else if last.oom_detected {
            RouteState::FailedOom
        } else {
            RouteState::FailedRetryable
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    Pending,
    Completed,
    CompletedFallback,
    FailedRetryable,
    FailedOom,
    FailedFallback,
}

impl RouteState {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteState::Pending => "pending",
            RouteState::Completed => "completed",
            RouteState::CompletedFallback => "completed_fallback",
            RouteState::FailedRetryable => "failed_retryable",
            RouteState::FailedOom => "failed_oom",
            RouteState::FailedFallback => "failed_fallback",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_task_is_pending() {
        let task = RoutingTask::new("write a parser", TaskType::Implementation, 2);
        assert_eq!(task.state(), RouteState::Pending);
        assert_eq!(task.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn planner_success_reads_as_completed_fallback() {
        let mut task = RoutingTask::new("tidy the readme", TaskType::Documentation, 3);
        task.attempts
            .push(TaskAttempt::success(BackendRole::Planner.as_str()));
        assert_eq!(task.state(), RouteState::CompletedFallback);

        task.attempts
            .push(TaskAttempt::success("deepseek-coder-v2:latest"));
        assert_eq!(task.state(), RouteState::Completed);
    }

    #[test]
    fn failure_states_follow_flags() {
        let mut task = RoutingTask::new("refactor the cache", TaskType::Refactor, 3);
        task.attempts.push(TaskAttempt::failure(
            "deepseek-coder-v2:latest",
            "connection reset",
            false,
        ));
        assert_eq!(task.state(), RouteState::FailedRetryable);

        task.attempts.push(TaskAttempt::failure(
            "deepseek-coder-v2:latest",
            "CUDA out of memory",
            true,
        ));
        assert_eq!(task.state(), RouteState::FailedOom);

        task.fallback_to_planner = true;
        assert_eq!(task.state(), RouteState::FailedFallback);
    }
}
