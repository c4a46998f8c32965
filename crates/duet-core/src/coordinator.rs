use std::sync::Arc;

use tracing::Level;

use duet_backend::ModelBackend;
use duet_observability::{emit_event, ProcessKind, RoutingEvent};
use duet_tasks::{TaskScheduler, TaskStore};
use duet_types::{
    CollaborativeTask, OrchestrationError, Result, TaskStatus, TaskType,
};

use crate::plan::DevelopmentPlan;
use crate::verify::{AcceptAll, Verdict, Verifier};

/// Outcome of driving one task through execution and verification. Debugging
/// is recoverable — a human or a later retry can pick the task back up — so
/// it is a normal outcome, not an error.
#[derive(Debug, Clone)]
pub enum Execution {
    Completed { output: String },
    Debugging { message: String },
}

/// Drives a task through in-progress, backend execution, and the
/// verification gate.
pub struct ExecutionCoordinator {
    store: Arc<TaskStore>,
    scheduler: TaskScheduler,
    backend: Arc<dyn ModelBackend>,
    verifier: Arc<dyn Verifier>,
}

impl ExecutionCoordinator {
    pub fn new(store: Arc<TaskStore>, backend: Arc<dyn ModelBackend>) -> Self {
        Self::with_verifier(store, backend, Arc::new(AcceptAll))
    }

    pub fn with_verifier(
        store: Arc<TaskStore>,
        backend: Arc<dyn ModelBackend>,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        let scheduler = TaskScheduler::new(store.clone());
        Self {
            store,
            scheduler,
            backend,
            verifier,
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub async fn execute(&self, task_id: &str) -> Result<Execution> {
        let task = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| OrchestrationError::UnknownTask(task_id.to_string()))?;
        let role = task
            .assigned_to
            .ok_or_else(|| OrchestrationError::Unassigned(task_id.to_string()))?;

        self.store.set_status(task_id, TaskStatus::InProgress).await?;
        emit_event(
            Level::INFO,
            ProcessKind::Agent,
            RoutingEvent {
                task_id: Some(task_id),
                role: Some(role.as_str()),
                status: Some("start"),
                ..RoutingEvent::new("task.execute.start", "coordinator")
            },
        );

        let prompt = self.build_prompt(&task).await;
        match self.backend.query(role, &prompt).await {
            Ok(output) => match self.verifier.verify(task_id, &task, &output).await {
                Verdict::Pass => {
                    self.store.complete(task_id).await?;
                    emit_event(
                        Level::INFO,
                        ProcessKind::Agent,
                        RoutingEvent {
                            task_id: Some(task_id),
                            role: Some(role.as_str()),
                            status: Some("completed"),
                            ..RoutingEvent::new("task.execute.completed", "coordinator")
                        },
                    );
                    Ok(Execution::Completed { output })
                }
                Verdict::Fail(reason) => {
                    self.store.set_status(task_id, TaskStatus::Debugging).await?;
                    tracing::warn!("task {} failed verification: {}", task_id, reason);
                    Ok(Execution::Debugging {
                        message: format!("output failed verification: {}", reason),
                    })
                }
            },
            Err(err) => {
                self.store.set_status(task_id, TaskStatus::Debugging).await?;
                emit_event(
                    Level::WARN,
                    ProcessKind::Agent,
                    RoutingEvent {
                        task_id: Some(task_id),
                        role: Some(role.as_str()),
                        status: Some("debugging"),
                        error_code: Some("backend_error"),
                        ..RoutingEvent::new("task.execute.debugging", "coordinator")
                    },
                );
                Ok(Execution::Debugging {
                    message: format!("execution failed: {}", err),
                })
            }
        }
    }

    pub async fn execute_next(&self) -> Result<Option<(String, Execution)>> {
        let Some((task_id, _)) = self.scheduler.next_ready().await else {
            return Ok(None);
        };
        let execution = self.execute(&task_id).await?;
        Ok(Some((task_id, execution)))
    }

    /// Pull-and-execute until no ready task remains.
    pub async fn run_all(&self) -> Vec<(String, Execution)> {
        self.scheduler.auto_assign().await;

        let mut results = Vec::new();
        loop {
            match self.execute_next().await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("stopping task loop: {}", err);
                    break;
                }
            }
        }
        results
    }

    /// Decompose a project description into tasks: execute a planning task
    /// against the planner, then instantiate the tasks its plan declares.
    pub async fn start_session(&self, project_description: &str) -> Result<String> {
        let planning_id = self
            .store
            .create(
                TaskType::Planning,
                format!("Create development plan for: {}", project_description),
                1,
                Vec::new(),
            )
            .await?;
        self.scheduler.auto_assign().await;

        let plan_text = match self.execute(&planning_id).await? {
            Execution::Completed { output } => output,
            Execution::Debugging { message } => return Ok(message),
        };

        match DevelopmentPlan::parse(&plan_text) {
            Ok(plan) => {
                if let Err(err) = plan.instantiate(&self.store).await {
                    tracing::warn!("could not instantiate plan tasks: {}", err);
                }
                self.scheduler.auto_assign().await;
            }
            Err(err) => {
                tracing::warn!("could not parse development plan: {}", err);
            }
        }

        Ok(plan_text)
    }

    async fn build_prompt(&self, task: &CollaborativeTask) -> String {
        let mut prompt = format!(
            "Task: {}\n\nTask Type: {}\nPriority: {}\n",
            task.description, task.task_type, task.priority
        );

        let mut dependency_lines = Vec::new();
        for dep_id in &task.dependencies {
            if let Some(dep) = self.store.get(dep_id).await {
                dependency_lines.push(dep.description);
            }
        }
        if !dependency_lines.is_empty() {
            prompt.push_str(&format!("\nDependencies: {}", dependency_lines.join(", ")));
        }

        prompt.push_str("\n\nPlease complete this task:");
        if let Some(instructions) = task_instructions(task.task_type) {
            prompt.push_str("\n\n");
            prompt.push_str(instructions);
        }
        prompt
    }
}

fn task_instructions(task_type: TaskType) -> Option<&'static str> {
    match task_type {
        TaskType::Implementation => Some(
            "Write clean, well-documented code. Follow best practices and include appropriate tests.",
        ),
        TaskType::Documentation => Some(
            "Write comprehensive documentation. Include examples, usage instructions, and technical details.",
        ),
        TaskType::Review => Some(
            "Perform a thorough code review. Check for bugs, security issues, performance problems, and adherence to best practices.",
        ),
        TaskType::Refactor => Some(
            "Refactor the code to improve quality, performance, and maintainability while preserving behavior.",
        ),
        TaskType::Test => Some(
            "Write comprehensive tests including unit tests, integration tests, and edge case coverage.",
        ),
        TaskType::Planning | TaskType::Architecture => None,
        TaskType::Maintenance | TaskType::Hygiene => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use duet_backend::LocalBackendStatus;
    use duet_types::BackendRole;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedBackend {
        responses: Mutex<VecDeque<Result<String>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        async fn query_with_system(
            &self,
            _role: BackendRole,
            prompt: &str,
            _system: Option<&str>,
        ) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("scripted default".to_string()))
        }

        fn model_for(&self, role: BackendRole) -> Option<String> {
            Some(format!("{}-model", role))
        }

        async fn availability(&self) -> LocalBackendStatus {
            LocalBackendStatus {
                available: true,
                endpoint: String::new(),
                detail: None,
            }
        }
    }

    struct RejectAll;

    #[async_trait]
    impl Verifier for RejectAll {
        async fn verify(
            &self,
            _task_id: &str,
            _task: &CollaborativeTask,
            _output: &str,
        ) -> Verdict {
            Verdict::Fail("output did not satisfy the post-check".to_string())
        }
    }

    async fn store(dir: &tempfile::TempDir) -> Arc<TaskStore> {
        Arc::new(
            TaskStore::open(dir.path().join("tasks.json"))
                .await
                .expect("store"),
        )
    }

    #[tokio::test]
    async fn successful_execution_completes_the_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await;
        let backend = ScriptedBackend::new(vec![Ok("here is the patch".to_string())]);
        let coordinator = ExecutionCoordinator::new(store.clone(), backend.clone());

        let id = store
            .create(TaskType::Implementation, "implement the codec", 2, Vec::new())
            .await
            .expect("create");
        coordinator.scheduler().auto_assign().await;

        let execution = coordinator.execute(&id).await.expect("execute");
        match execution {
            Execution::Completed { output } => assert_eq!(output, "here is the patch"),
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(
            store.get(&id).await.map(|t| t.status),
            Some(TaskStatus::Completed)
        );

        let prompts = backend.prompts.lock().unwrap();
        assert!(prompts[0].contains("implement the codec"));
        assert!(prompts[0].contains("Task Type: implementation"));
        assert!(prompts[0].contains("include appropriate tests"));
    }

    #[tokio::test]
    async fn backend_error_lands_in_debugging_with_the_error_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await;
        let backend = ScriptedBackend::new(vec![Err(OrchestrationError::Backend(
            "connection refused".to_string(),
        ))]);
        let coordinator = ExecutionCoordinator::new(store.clone(), backend);

        let id = store
            .create(TaskType::Test, "cover the decoder", 2, Vec::new())
            .await
            .expect("create");
        coordinator.scheduler().auto_assign().await;

        let execution = coordinator.execute(&id).await.expect("execute");
        match execution {
            Execution::Debugging { message } => {
                assert!(message.contains("connection refused"));
            }
            other => panic!("expected debugging, got {:?}", other),
        }
        assert_eq!(
            store.get(&id).await.map(|t| t.status),
            Some(TaskStatus::Debugging)
        );
    }

    #[tokio::test]
    async fn verification_failure_is_recoverable_not_terminal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await;
        let backend = ScriptedBackend::new(vec![Ok("suspicious output".to_string())]);
        let coordinator =
            ExecutionCoordinator::with_verifier(store.clone(), backend, Arc::new(RejectAll));

        let id = store
            .create(TaskType::Review, "audit the parser", 2, Vec::new())
            .await
            .expect("create");
        coordinator.scheduler().auto_assign().await;

        let execution = coordinator.execute(&id).await.expect("execute");
        assert!(matches!(execution, Execution::Debugging { .. }));
        assert_eq!(
            store.get(&id).await.map(|t| t.status),
            Some(TaskStatus::Debugging)
        );

        store.reopen(&id).await.expect("reopen");
        assert_eq!(
            store.get(&id).await.map(|t| t.status),
            Some(TaskStatus::Assigned)
        );
    }

    #[tokio::test]
    async fn unassigned_task_is_a_validation_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await;
        let backend = ScriptedBackend::new(Vec::new());
        let coordinator = ExecutionCoordinator::new(store.clone(), backend);

        let id = store
            .create(TaskType::Implementation, "orphan work", 3, Vec::new())
            .await
            .expect("create");
        let err = coordinator.execute(&id).await.err().expect("error");
        assert!(matches!(err, OrchestrationError::Unassigned(_)));
    }

    #[tokio::test]
    async fn run_all_drains_the_queue_in_dependency_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await;
        let backend = ScriptedBackend::new(vec![
            Ok("first done".to_string()),
            Ok("second done".to_string()),
        ]);
        let coordinator = ExecutionCoordinator::new(store.clone(), backend);

        let a = store
            .create(TaskType::Implementation, "build the core", 1, Vec::new())
            .await
            .expect("a");
        let b = store
            .create(TaskType::Test, "test the core", 1, vec![a.clone()])
            .await
            .expect("b");

        let results = coordinator.run_all().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, a);
        assert_eq!(results[1].0, b);
        assert_eq!(
            store.get(&b).await.map(|t| t.status),
            Some(TaskStatus::Completed)
        );
    }

    #[tokio::test]
    async fn dependency_descriptions_are_resolved_into_the_prompt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await;
        let backend = ScriptedBackend::new(vec![
            Ok("core built".to_string()),
            Ok("tests written".to_string()),
        ]);
        let coordinator = ExecutionCoordinator::new(store.clone(), backend.clone());

        let a = store
            .create(TaskType::Implementation, "build the event bus", 1, Vec::new())
            .await
            .expect("a");
        store
            .create(TaskType::Test, "test the event bus", 1, vec![a])
            .await
            .expect("b");

        coordinator.run_all().await;
        let prompts = backend.prompts.lock().unwrap();
        assert!(prompts[1].contains("Dependencies: build the event bus"));
    }
}
