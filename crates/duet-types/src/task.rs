use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default priority for newly created tasks (1 = highest, 5 = lowest).
pub const DEFAULT_PRIORITY: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Planning,
    Architecture,
    Implementation,
    Documentation,
    Review,
    Refactor,
    Test,
    Maintenance,
    Hygiene,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Planning => "planning",
            TaskType::Architecture => "architecture",
            TaskType::Implementation => "implementation",
            TaskType::Documentation => "documentation",
            TaskType::Review => "review",
            TaskType::Refactor => "refactor",
            TaskType::Test => "test",
            TaskType::Maintenance => "maintenance",
            TaskType::Hygiene => "hygiene",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Debugging,
    Completed,
    Blocked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Debugging,
        TaskStatus::Completed,
        TaskStatus::Blocked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Debugging => "debugging",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendRole {
    Planner,
    Implementer,
    Reviewer,
    Docs,
}

impl BackendRole {
    pub const ALL: [BackendRole; 4] = [
        BackendRole::Planner,
        BackendRole::Implementer,
        BackendRole::Reviewer,
        BackendRole::Docs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendRole::Planner => "planner",
            BackendRole::Implementer => "implementer",
            BackendRole::Reviewer => "reviewer",
            BackendRole::Docs => "docs",
        }
    }
}

impl std::fmt::Display for BackendRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch table from task type to the backend role that owns it.
///
/// Kept as an exhaustive match so a new task type is a compile error here,
/// never a silent default.
pub fn role_for_task_type(task_type: TaskType) -> BackendRole {
    match task_type {
        TaskType::Planning | TaskType::Architecture => BackendRole::Planner,
        TaskType::Review => BackendRole::Reviewer,
        TaskType::Implementation | TaskType::Refactor | TaskType::Test | TaskType::Maintenance => {
            BackendRole::Implementer
        }
        TaskType::Documentation | TaskType::Hygiene => BackendRole::Docs,
    }
}

/// Whether a task type may be offloaded to a local specialized backend.
/// Planning, architecture and review always stay with the planner path.
pub fn local_eligible(task_type: TaskType) -> bool {
    matches!(
        task_type,
        TaskType::Implementation
            | TaskType::Documentation
            | TaskType::Refactor
            | TaskType::Test
            | TaskType::Maintenance
            | TaskType::Hygiene
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborativeTask {
    pub task_type: TaskType,
    pub description: String,
    pub priority: u8,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<BackendRole>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl CollaborativeTask {
    pub fn new(
        task_type: TaskType,
        description: impl Into<String>,
        priority: u8,
        dependencies: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_type,
            description: description.into(),
            priority,
            status: TaskStatus::Pending,
            assigned_to: None,
            created_at: now,
            updated_at: now,
            dependencies,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_table_routes_each_type_to_its_role() {
        assert_eq!(role_for_task_type(TaskType::Planning), BackendRole::Planner);
        assert_eq!(
            role_for_task_type(TaskType::Architecture),
            BackendRole::Planner
        );
        assert_eq!(role_for_task_type(TaskType::Review), BackendRole::Reviewer);
        assert_eq!(
            role_for_task_type(TaskType::Implementation),
            BackendRole::Implementer
        );
        assert_eq!(
            role_for_task_type(TaskType::Refactor),
            BackendRole::Implementer
        );
        assert_eq!(role_for_task_type(TaskType::Test), BackendRole::Implementer);
        assert_eq!(
            role_for_task_type(TaskType::Maintenance),
            BackendRole::Implementer
        );
        assert_eq!(
            role_for_task_type(TaskType::Documentation),
            BackendRole::Docs
        );
        assert_eq!(role_for_task_type(TaskType::Hygiene), BackendRole::Docs);
    }

    #[test]
    fn planner_owned_types_are_not_local_eligible() {
        assert!(!local_eligible(TaskType::Planning));
        assert!(!local_eligible(TaskType::Architecture));
        assert!(!local_eligible(TaskType::Review));
        assert!(local_eligible(TaskType::Implementation));
        assert!(local_eligible(TaskType::Documentation));
        assert!(local_eligible(TaskType::Hygiene));
    }
}
