use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use duet_router::{RouteOutcome, TaskRouter};

/// Hard cap on concurrent background local-backend jobs. The shared
/// inference host cannot take more than one heavy generation at a time.
pub const LOCAL_WORKER_CAPACITY: usize = 1;

#[derive(Debug)]
pub struct BackgroundResult {
    pub routing_task_id: String,
    pub outcome: duet_types::Result<RouteOutcome>,
}

/// Fire-and-forget execution of routing tasks against the local backend.
///
/// Results land on a queue the owner drains opportunistically on its next
/// scheduling poll. Cancellation is not preemptive: an in-flight job runs to
/// completion and its result is discarded, so external side effects are
/// never half-applied.
pub struct LocalWorkerPool {
    permits: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<BackgroundResult>,
    rx: Mutex<mpsc::UnboundedReceiver<BackgroundResult>>,
    cancel: CancellationToken,
}

impl LocalWorkerPool {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            permits: Arc::new(Semaphore::new(LOCAL_WORKER_CAPACITY)),
            tx,
            rx: Mutex::new(rx),
            cancel: CancellationToken::new(),
        }
    }

    pub fn spawn_route(&self, router: Arc<TaskRouter>, routing_task_id: String) {
        let permits = self.permits.clone();
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let outcome = router.route(&routing_task_id).await;
            if cancel.is_cancelled() {
                tracing::debug!(
                    "discarding background result for cancelled session: {}",
                    routing_task_id
                );
                return;
            }
            let _ = tx.send(BackgroundResult {
                routing_task_id,
                outcome,
            });
        });
    }

    /// Collect whatever has finished so far without waiting.
    pub async fn drain(&self) -> Vec<BackgroundResult> {
        let mut rx = self.rx.lock().await;
        let mut results = Vec::new();
        while let Ok(result) = rx.try_recv() {
            results.push(result);
        }
        results
    }

    /// Stop delivering results. In-flight jobs finish on their own time.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for LocalWorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use duet_backend::{LocalBackendStatus, ModelBackend};
    use duet_types::{BackendRole, TaskType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Backend that tracks how many queries run at once.
    struct GaugedBackend {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GaugedBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelBackend for GaugedBackend {
        async fn query_with_system(
            &self,
            _role: BackendRole,
            _prompt: &str,
            _system: Option<&str>,
        ) -> duet_types::Result<String> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok("background output".to_string())
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

    struct OpenLock;

    impl duet_router::SystemLock for OpenLock {
        fn try_acquire(&self) -> anyhow::Result<bool> {
            Ok(true)
        }

        fn release(&self) {}

        fn holder_count(&self) -> usize {
            0
        }
    }

    async fn router(dir: &tempfile::TempDir, backend: Arc<GaugedBackend>) -> Arc<TaskRouter> {
        Arc::new(
            TaskRouter::with_lock(dir.path(), backend, Arc::new(OpenLock))
                .await
                .expect("router"),
        )
    }

    #[tokio::test]
    async fn background_jobs_never_overlap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = GaugedBackend::new();
        let router = router(&dir, backend.clone()).await;
        let pool = LocalWorkerPool::new();

        for n in 0..3 {
            let id = router
                .create_task(format!("implement part {}", n), TaskType::Implementation, 2)
                .await
                .expect("create");
            pool.spawn_route(router.clone(), id);
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        let results = pool.drain().await;
        assert_eq!(results.len(), 3);
        assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
        for result in results {
            assert!(result.outcome.is_ok());
        }
    }

    #[tokio::test]
    async fn cancelled_results_are_discarded_not_interrupted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = GaugedBackend::new();
        let router = router(&dir, backend).await;
        let pool = LocalWorkerPool::new();

        let id = router
            .create_task("implement the store", TaskType::Implementation, 2)
            .await
            .expect("create");
        pool.spawn_route(router.clone(), id.clone());
        pool.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(pool.drain().await.is_empty());

        // The attempt itself still ran to completion and was recorded.
        let task = router.task(&id).await.expect("task");
        assert_eq!(task.current_attempt, 1);
    }
}
