use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::Level;
use uuid::Uuid;

use duet_backend::ModelBackend;
use duet_observability::{emit_event, ProcessKind, RoutingEvent};
use duet_types::{
    local_eligible, role_for_task_type, BackendRole, OrchestrationError, Result, RouteState,
    RoutingTask, TaskAttempt, TaskType,
};

use crate::cooldown::{CooldownGate, CooldownState};
use crate::lock::{lock_for_platform, SystemLock};
use crate::oom::is_oom_error;

pub const MAX_CONSECUTIVE_OOM: u32 = 3;
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const RETRY_DELAY_BASE: f64 = 2.0;
pub const RETRY_DELAY_CAP: f64 = 30.0;
pub const RETRY_AFTER_BUSY: Duration = Duration::from_secs(2);

const LOCK_FILE: &str = "router.lock";
const TASKS_FILE: &str = "routing_tasks.json";
const COOLDOWN_FILE: &str = "memory_pressure_cooldown.json";

/// Exponential backoff before the next local attempt: 1, 2, 4, 8, 16, 30,
/// 30, ... seconds.
pub fn retry_delay(attempt_number: u32) -> Duration {
    let exp = attempt_number.saturating_sub(1).min(31) as i32;
    Duration::from_secs_f64(RETRY_DELAY_BASE.powi(exp).min(RETRY_DELAY_CAP))
}

/// What happened to one routing call. Busy and retryable failures are normal
/// outcomes, not errors; the caller decides whether to wait or escalate.
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    Completed {
        model_used: String,
        output: String,
        attempt_id: String,
        fallback: bool,
    },
    Busy {
        retry_after: Duration,
    },
    Failed {
        error: String,
        oom_detected: bool,
        retry_after: Option<Duration>,
        attempt_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub memory_pressure: bool,
    pub consecutive_oom_count: u32,
    pub last_oom: Option<DateTime<Utc>>,
    pub active_locks: usize,
    pub total_tasks: usize,
    pub pending_tasks: usize,
}

struct RouterInner {
    tasks: HashMap<String, RoutingTask>,
    memory_pressure: bool,
    last_oom: Option<DateTime<Utc>>,
    consecutive_oom: u32,
}

/// Routes prompts to the local specialized backends with the guard rails the
/// shared inference host needs: a cross-process advisory lock, heuristic OOM
/// detection with a persisted cooldown window, bounded retry with
/// exponential backoff, and escalation to the planner role.
pub struct TaskRouter {
    tasks_path: PathBuf,
    instance_id: String,
    lock: Arc<dyn SystemLock>,
    cooldown: CooldownGate,
    backend: Arc<dyn ModelBackend>,
    inner: RwLock<RouterInner>,
}

impl TaskRouter {
    pub async fn open(base_dir: impl AsRef<Path>, backend: Arc<dyn ModelBackend>) -> anyhow::Result<Self> {
        let base_dir = base_dir.as_ref();
        let instance_id = Uuid::new_v4().to_string();
        let lock = lock_for_platform(&base_dir.join(LOCK_FILE), &instance_id);
        Self::with_lock_and_instance(base_dir, backend, lock, instance_id).await
    }

    /// Same as [`open`] but with an explicit lock implementation.
    pub async fn with_lock(
        base_dir: impl AsRef<Path>,
        backend: Arc<dyn ModelBackend>,
        lock: Arc<dyn SystemLock>,
    ) -> anyhow::Result<Self> {
        Self::with_lock_and_instance(base_dir.as_ref(), backend, lock, Uuid::new_v4().to_string())
            .await
    }

    async fn with_lock_and_instance(
        base_dir: &Path,
        backend: Arc<dyn ModelBackend>,
        lock: Arc<dyn SystemLock>,
        instance_id: String,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(base_dir).await?;
        let tasks_path = base_dir.join(TASKS_FILE);

        let mut tasks = HashMap::new();
        if tasks_path.exists() {
            match tokio::fs::read_to_string(&tasks_path).await {
                Ok(raw) => match serde_json::from_str::<HashMap<String, RoutingTask>>(&raw) {
                    Ok(loaded) => tasks = loaded,
                    Err(err) => {
                        tracing::warn!(
                            "could not load routing tasks from {}: {}",
                            tasks_path.display(),
                            err
                        );
                    }
                },
                Err(err) => {
                    tracing::warn!("could not read {}: {}", tasks_path.display(), err);
                }
            }
        }

        Ok(Self {
            tasks_path,
            instance_id,
            lock,
            cooldown: CooldownGate::new(base_dir.join(COOLDOWN_FILE)),
            backend,
            inner: RwLock::new(RouterInner {
                tasks,
                memory_pressure: false,
                last_oom: None,
                consecutive_oom: 0,
            }),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn create_task(
        &self,
        prompt: impl Into<String>,
        task_type: TaskType,
        priority: u8,
    ) -> Result<String> {
        if !(1..=5).contains(&priority) {
            return Err(OrchestrationError::InvalidPriority(priority));
        }
        let id = Uuid::new_v4().to_string();
        let task = RoutingTask::new(prompt, task_type, priority);

        let mut inner = self.inner.write().await;
        inner.tasks.insert(id.clone(), task);
        self.persist(&inner).await;
        Ok(id)
    }

    /// Route one task. Order of gates: local eligibility and the shared
    /// cooldown window first, then the system lock, then the attempt itself.
    pub async fn route(&self, task_id: &str) -> Result<RouteOutcome> {
        let (task_type, flagged) = {
            let inner = self.inner.read().await;
            let task = inner
                .tasks
                .get(task_id)
                .ok_or_else(|| OrchestrationError::UnknownTask(task_id.to_string()))?;
            (task.task_type, task.fallback_to_planner)
        };

        if flagged || !self.should_use_local(task_type).await {
            return self.route_to_planner(task_id).await;
        }

        if !self.acquire_lock().await {
            let pressure = self.inner.read().await.memory_pressure;
            if pressure {
                {
                    let mut inner = self.inner.write().await;
                    if let Some(task) = inner.tasks.get_mut(task_id) {
                        task.fallback_to_planner = true;
                        task.touch();
                    }
                    self.persist(&inner).await;
                }
                return self.route_to_planner(task_id).await;
            }

            emit_event(
                Level::INFO,
                ProcessKind::Agent,
                RoutingEvent {
                    routing_task_id: Some(task_id),
                    status: Some("busy"),
                    ..RoutingEvent::new("route.busy", "router")
                },
            );
            return Ok(RouteOutcome::Busy {
                retry_after: RETRY_AFTER_BUSY,
            });
        }

        let result = self.local_attempt(task_id).await;
        self.lock.release();
        result
    }

    pub async fn task(&self, task_id: &str) -> Option<RoutingTask> {
        self.inner.read().await.tasks.get(task_id).cloned()
    }

    pub async fn task_state(&self, task_id: &str) -> Option<RouteState> {
        self.inner
            .read()
            .await
            .tasks
            .get(task_id)
            .map(|task| task.state())
    }

    pub async fn system_status(&self) -> SystemStatus {
        let inner = self.inner.read().await;
        let pending = inner
            .tasks
            .values()
            .filter(|task| {
                matches!(
                    task.state(),
                    RouteState::Pending | RouteState::FailedRetryable
                )
            })
            .count();
        SystemStatus {
            memory_pressure: inner.memory_pressure,
            consecutive_oom_count: inner.consecutive_oom,
            last_oom: inner.last_oom,
            active_locks: self.lock.holder_count(),
            total_tasks: inner.tasks.len(),
            pending_tasks: pending,
        }
    }

    pub async fn reset_memory_pressure(&self) {
        let mut inner = self.inner.write().await;
        inner.memory_pressure = false;
        inner.consecutive_oom = 0;
        inner.last_oom = None;
        self.cooldown.clear();
        self.persist(&inner).await;
    }

    /// Drop completed tasks last touched before the cutoff. Returns how many
    /// were removed.
    pub async fn cleanup_old_tasks(&self, max_age_days: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
        let mut inner = self.inner.write().await;
        let before = inner.tasks.len();
        inner.tasks.retain(|_, task| {
            task.updated_at > cutoff
                || !matches!(
                    task.state(),
                    RouteState::Completed | RouteState::CompletedFallback
                )
        });
        let removed = before - inner.tasks.len();
        if removed > 0 {
            self.persist(&inner).await;
        }
        removed
    }

    async fn should_use_local(&self, task_type: TaskType) -> bool {
        if !local_eligible(task_type) {
            return false;
        }
        if self.cooldown_active().await {
            return false;
        }
        let status = self.backend.availability().await;
        if !status.available {
            tracing::debug!(
                "local backend unavailable, skipping local routing: {}",
                status.detail.unwrap_or_default()
            );
            return false;
        }
        true
    }

    /// Consult the shared cooldown file, syncing the in-process pressure view
    /// with it in both directions.
    async fn cooldown_active(&self) -> bool {
        match self.cooldown.check() {
            CooldownState::Active(record) => {
                let mut inner = self.inner.write().await;
                inner.memory_pressure = true;
                inner.consecutive_oom = record.consecutive_oom_count;
                inner.last_oom = Some(record.last_oom);
                true
            }
            CooldownState::Expired(_) => {
                let mut inner = self.inner.write().await;
                inner.memory_pressure = false;
                inner.consecutive_oom = 0;
                emit_event(
                    Level::INFO,
                    ProcessKind::Agent,
                    RoutingEvent {
                        status: Some("cleared"),
                        ..RoutingEvent::new("route.cooldown_cleared", "router")
                    },
                );
                false
            }
            CooldownState::Clear => false,
        }
    }

    async fn acquire_lock(&self) -> bool {
        let deadline = tokio::time::Instant::now() + LOCK_TIMEOUT;
        loop {
            match self.lock.try_acquire() {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!("could not acquire system lock: {}", err);
                    return false;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    /// Escalation target. The planner path has no modeled failure: the task
    /// is handed back to the primary agent loop, which runs it inline.
    async fn route_to_planner(&self, task_id: &str) -> Result<RouteOutcome> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestrationError::UnknownTask(task_id.to_string()))?;

        let attempt = TaskAttempt::success(BackendRole::Planner.as_str());
        let attempt_id = attempt.attempt_id.clone();
        task.attempts.push(attempt);
        task.touch();
        self.persist(&inner).await;
        drop(inner);

        emit_event(
            Level::INFO,
            ProcessKind::Agent,
            RoutingEvent {
                routing_task_id: Some(task_id),
                role: Some(BackendRole::Planner.as_str()),
                status: Some("fallback"),
                ..RoutingEvent::new("route.fallback", "router")
            },
        );

        Ok(RouteOutcome::Completed {
            model_used: BackendRole::Planner.as_str().to_string(),
            output: "task routed to the planner role".to_string(),
            attempt_id,
            fallback: true,
        })
    }

    async fn local_attempt(&self, task_id: &str) -> Result<RouteOutcome> {
        let (prompt, task_type) = {
            let mut inner = self.inner.write().await;
            let task = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| OrchestrationError::UnknownTask(task_id.to_string()))?;
            task.locked_by = Some(self.instance_id.clone());
            let extracted = (build_local_prompt(task), task.task_type);
            self.persist(&inner).await;
            extracted
        };

        let role = role_for_task_type(task_type);
        let model = self
            .backend
            .model_for(role)
            .unwrap_or_else(|| role.as_str().to_string());

        let attempt_result = self.run_local_query(role, &prompt).await;

        let mut inner = self.inner.write().await;
        let outcome = match attempt_result {
            Ok(output) => {
                let task = inner
                    .tasks
                    .get_mut(task_id)
                    .ok_or_else(|| OrchestrationError::UnknownTask(task_id.to_string()))?;
                let attempt = TaskAttempt::success(model.as_str());
                let attempt_id = attempt.attempt_id.clone();
                task.attempts.push(attempt);
                task.current_attempt += 1;
                task.locked_by = None;
                task.touch();
                RouteOutcome::Completed {
                    model_used: model,
                    output,
                    attempt_id,
                    fallback: false,
                }
            }
            Err(err) => {
                let error_text = err.to_string();
                let oom = is_oom_error(&error_text);
                if oom {
                    inner.memory_pressure = true;
                    inner.last_oom = Some(Utc::now());
                    inner.consecutive_oom += 1;
                    emit_event(
                        Level::WARN,
                        ProcessKind::Agent,
                        RoutingEvent {
                            routing_task_id: Some(task_id),
                            role: Some(role.as_str()),
                            model_id: Some(&model),
                            status: Some("oom"),
                            error_code: Some("oom_detected"),
                            ..RoutingEvent::new("route.oom_detected", "router")
                        },
                    );
                    if inner.consecutive_oom >= MAX_CONSECUTIVE_OOM {
                        self.cooldown.engage(inner.consecutive_oom);
                        emit_event(
                            Level::WARN,
                            ProcessKind::Agent,
                            RoutingEvent {
                                status: Some("engaged"),
                                ..RoutingEvent::new("route.cooldown_engaged", "router")
                            },
                        );
                    }
                }

                let task = inner
                    .tasks
                    .get_mut(task_id)
                    .ok_or_else(|| OrchestrationError::UnknownTask(task_id.to_string()))?;
                let attempt = TaskAttempt::failure(model.as_str(), error_text.as_str(), oom);
                let attempt_id = attempt.attempt_id.clone();
                task.attempts.push(attempt);
                task.current_attempt += 1;
                task.locked_by = None;
                task.touch();

                let retry_after = if oom || task.current_attempt >= task.max_attempts {
                    task.fallback_to_planner = true;
                    None
                } else {
                    Some(retry_delay(task.current_attempt))
                };

                RouteOutcome::Failed {
                    error: error_text,
                    oom_detected: oom,
                    retry_after,
                    attempt_id,
                }
            }
        };
        self.persist(&inner).await;
        Ok(outcome)
    }

    async fn run_local_query(&self, role: BackendRole, prompt: &str) -> Result<String> {
        let status = self.backend.availability().await;
        if !status.available {
            return Err(OrchestrationError::Backend(format!(
                "local inference host unavailable: {}",
                status.detail.unwrap_or_else(|| "no detail".to_string())
            )));
        }

        let output = self.backend.query(role, prompt).await?;
        if is_oom_error(&output) {
            return Err(OrchestrationError::Backend(format!(
                "out-of-memory phrase in model response: {}",
                truncate(&output, 200)
            )));
        }
        Ok(output)
    }

    async fn persist(&self, inner: &RouterInner) {
        let snapshot: BTreeMap<&String, &RoutingTask> = inner.tasks.iter().collect();
        let data = match serde_json::to_string_pretty(&snapshot) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!("could not serialize routing tasks: {}", err);
                return;
            }
        };
        if let Err(err) = tokio::fs::write(&self.tasks_path, data).await {
            tracing::warn!(
                "could not save routing tasks to {}: {}",
                self.tasks_path.display(),
                err
            );
        }
    }
}

fn build_local_prompt(task: &RoutingTask) -> String {
    let mut prompt = format!(
        "Task: {}\n\nTask Type: {}\nPriority: {}\n\n",
        task.original_prompt, task.task_type, task.priority
    );
    let instruction = match task.task_type {
        TaskType::Implementation => {
            "Write clean, well-documented code. Follow best practices and include appropriate tests."
        }
        TaskType::Documentation => {
            "Write comprehensive documentation. Include examples, usage instructions, and technical details."
        }
        TaskType::Review => {
            "Perform a thorough code review. Check for bugs, security issues, performance problems, and adherence to best practices."
        }
        TaskType::Refactor => {
            "Refactor the code to improve quality, performance, and maintainability."
        }
        TaskType::Test => {
            "Write comprehensive tests including unit tests, integration tests, and edge case coverage."
        }
        TaskType::Maintenance | TaskType::Hygiene => {
            "Keep the project tidy: remove dead weight and organize files sensibly."
        }
        TaskType::Planning | TaskType::Architecture => {
            "Lay out a clear, dependency-ordered plan before any implementation detail."
        }
    };
    prompt.push_str(instruction);
    prompt.push_str("\n\nPlease provide your implementation:");
    prompt
}

fn truncate(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        format!("{}...", &input[..max_len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use duet_backend::LocalBackendStatus;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedBackend {
        responses: Mutex<VecDeque<Result<String>>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        async fn query_with_system(
            &self,
            _role: BackendRole,
            _prompt: &str,
            _system: Option<&str>,
        ) -> Result<String> {
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
                endpoint: "http://localhost:11434/api/generate".to_string(),
                detail: None,
            }
        }
    }

    struct CountingLock {
        allow: AtomicBool,
        acquires: AtomicUsize,
    }

    impl CountingLock {
        fn new(allow: bool) -> Arc<Self> {
            Arc::new(Self {
                allow: AtomicBool::new(allow),
                acquires: AtomicUsize::new(0),
            })
        }
    }

    impl SystemLock for CountingLock {
        fn try_acquire(&self) -> anyhow::Result<bool> {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            Ok(self.allow.load(Ordering::SeqCst))
        }

        fn release(&self) {}

        fn holder_count(&self) -> usize {
            0
        }
    }

    fn oom_response() -> Result<String> {
        Err(OrchestrationError::Backend(
            "CUDA out of memory on device 0".to_string(),
        ))
    }

    #[test]
    fn backoff_sequence_matches_the_contract() {
        let delays: Vec<u64> = (1..=6).map(|n| retry_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30]);
        assert_eq!(retry_delay(7).as_secs(), 30);
    }

    #[tokio::test]
    async fn successful_local_route_records_one_attempt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(vec![Ok("patch written".to_string())]);
        let lock = CountingLock::new(true);
        let router = TaskRouter::with_lock(dir.path(), backend, lock)
            .await
            .expect("router");

        let id = router
            .create_task("implement the cache", TaskType::Implementation, 2)
            .await
            .expect("create");
        let outcome = router.route(&id).await.expect("route");

        match outcome {
            RouteOutcome::Completed {
                output, fallback, ..
            } => {
                assert_eq!(output, "patch written");
                assert!(!fallback);
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(router.task_state(&id).await, Some(RouteState::Completed));
        let task = router.task(&id).await.expect("task");
        assert_eq!(task.current_attempt, 1);
        assert!(task.locked_by.is_none());
    }

    #[tokio::test]
    async fn planner_owned_types_never_touch_the_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(Vec::new());
        let lock = CountingLock::new(true);
        let router = TaskRouter::with_lock(dir.path(), backend, lock.clone())
            .await
            .expect("router");

        let id = router
            .create_task("shape the architecture", TaskType::Architecture, 1)
            .await
            .expect("create");
        let outcome = router.route(&id).await.expect("route");

        assert!(matches!(
            outcome,
            RouteOutcome::Completed { fallback: true, .. }
        ));
        assert_eq!(lock.acquires.load(Ordering::SeqCst), 0);
        assert_eq!(
            router.task_state(&id).await,
            Some(RouteState::CompletedFallback)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn busy_lock_reports_retry_without_consuming_an_attempt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(Vec::new());
        let lock = CountingLock::new(false);
        let router = TaskRouter::with_lock(dir.path(), backend, lock)
            .await
            .expect("router");

        let id = router
            .create_task("write the migration", TaskType::Implementation, 2)
            .await
            .expect("create");
        let outcome = router.route(&id).await.expect("route");

        match outcome {
            RouteOutcome::Busy { retry_after } => assert_eq!(retry_after, RETRY_AFTER_BUSY),
            other => panic!("expected busy, got {:?}", other),
        }
        let task = router.task(&id).await.expect("task");
        assert_eq!(task.current_attempt, 0);
        assert!(task.attempts.is_empty());
    }

    #[tokio::test]
    async fn retryable_failure_backs_off_then_escalates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(vec![
            Err(OrchestrationError::Backend("connection reset".to_string())),
            Err(OrchestrationError::Backend("connection reset".to_string())),
            Err(OrchestrationError::Backend("connection reset".to_string())),
        ]);
        let lock = CountingLock::new(true);
        let router = TaskRouter::with_lock(dir.path(), backend, lock)
            .await
            .expect("router");

        let id = router
            .create_task("refactor the store", TaskType::Refactor, 3)
            .await
            .expect("create");

        let first = router.route(&id).await.expect("route 1");
        match first {
            RouteOutcome::Failed {
                retry_after,
                oom_detected,
                ..
            } => {
                assert!(!oom_detected);
                assert_eq!(retry_after, Some(Duration::from_secs(1)));
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let second = router.route(&id).await.expect("route 2");
        match second {
            RouteOutcome::Failed { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(2)));
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let third = router.route(&id).await.expect("route 3");
        match third {
            RouteOutcome::Failed { retry_after, .. } => assert_eq!(retry_after, None),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(router.task(&id).await.expect("task").fallback_to_planner);

        // Attempts exhausted: the next route escalates without local work.
        let fourth = router.route(&id).await.expect("route 4");
        assert!(matches!(
            fourth,
            RouteOutcome::Completed { fallback: true, .. }
        ));
    }

    #[tokio::test]
    async fn three_ooms_engage_the_cooldown_and_short_circuit_routing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend =
            ScriptedBackend::new(vec![oom_response(), oom_response(), oom_response()]);
        let lock = CountingLock::new(true);
        let router = TaskRouter::with_lock(dir.path(), backend, lock.clone())
            .await
            .expect("router");

        for n in 0..3 {
            let id = router
                .create_task(format!("implement module {}", n), TaskType::Implementation, 2)
                .await
                .expect("create");
            let outcome = router.route(&id).await.expect("route");
            match outcome {
                RouteOutcome::Failed {
                    oom_detected,
                    retry_after,
                    ..
                } => {
                    assert!(oom_detected);
                    assert_eq!(retry_after, None);
                }
                other => panic!("expected OOM failure, got {:?}", other),
            }
            assert!(router.task(&id).await.expect("task").fallback_to_planner);
        }

        let status = router.system_status().await;
        assert!(status.memory_pressure);
        assert_eq!(status.consecutive_oom_count, 3);
        assert!(dir.path().join(COOLDOWN_FILE).exists());

        // Any further local-eligible task skips the lock entirely.
        let acquires_before = lock.acquires.load(Ordering::SeqCst);
        let id = router
            .create_task("implement module 4", TaskType::Implementation, 2)
            .await
            .expect("create");
        let outcome = router.route(&id).await.expect("route");
        assert!(matches!(
            outcome,
            RouteOutcome::Completed { fallback: true, .. }
        ));
        assert_eq!(lock.acquires.load(Ordering::SeqCst), acquires_before);
    }

    #[tokio::test]
    async fn expired_cooldown_clears_pressure_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(vec![Ok("done".to_string())]);
        let lock = CountingLock::new(true);
        let router = TaskRouter::with_lock(dir.path(), backend, lock)
            .await
            .expect("router");

        let past = Utc::now() - chrono::Duration::minutes(1);
        let record = crate::cooldown::CooldownRecord {
            memory_pressure: true,
            last_oom: past,
            consecutive_oom_count: 3,
            cooldown_until: past,
        };
        std::fs::write(
            dir.path().join(COOLDOWN_FILE),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();

        let id = router
            .create_task("write tests for the codec", TaskType::Test, 2)
            .await
            .expect("create");
        let outcome = router.route(&id).await.expect("route");

        assert!(matches!(
            outcome,
            RouteOutcome::Completed { fallback: false, .. }
        ));
        assert!(!dir.path().join(COOLDOWN_FILE).exists());
        let status = router.system_status().await;
        assert!(!status.memory_pressure);
        assert_eq!(status.consecutive_oom_count, 0);
    }

    #[tokio::test]
    async fn routing_tasks_survive_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id;
        {
            let backend = ScriptedBackend::new(vec![Ok("done".to_string())]);
            let lock = CountingLock::new(true);
            let router = TaskRouter::with_lock(dir.path(), backend, lock)
                .await
                .expect("router");
            id = router
                .create_task("document the wire format", TaskType::Documentation, 3)
                .await
                .expect("create");
            router.route(&id).await.expect("route");
        }

        let backend = ScriptedBackend::new(Vec::new());
        let lock = CountingLock::new(true);
        let router = TaskRouter::with_lock(dir.path(), backend, lock)
            .await
            .expect("router");
        assert_eq!(router.task_state(&id).await, Some(RouteState::Completed));
    }
}
