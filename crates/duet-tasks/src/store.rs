use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

use duet_types::{
    BackendRole, CollaborativeTask, OrchestrationError, Result, TaskStatus, TaskType,
};

pub(crate) struct StoreInner {
    pub tasks: HashMap<String, CollaborativeTask>,
    /// Scheduling candidates in creation order. Tasks leave only on completion
    /// or clear-all; blocked tasks stay and are skipped by the scheduler.
    pub queue: Vec<String>,
    pub completed: Vec<String>,
}

/// Durable record of collaborative tasks, persisted as one JSON snapshot
/// keyed by task id. All mutations serialize the full snapshot; a failed
/// write is logged and never raised so a task mutation cannot crash the
/// session.
pub struct TaskStore {
    path: PathBuf,
    pub(crate) inner: RwLock<StoreInner>,
}

impl TaskStore {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut tasks: HashMap<String, CollaborativeTask> = HashMap::new();
        if path.exists() {
            match fs::read_to_string(&path).await {
                Ok(raw) => match serde_json::from_str::<BTreeMap<String, CollaborativeTask>>(&raw)
                {
                    Ok(loaded) => {
                        // Deduplicate by description so a replayed crashed
                        // write does not double tasks.
                        let mut seen = HashSet::new();
                        for (id, task) in loaded {
                            let desc = task.description.trim().to_string();
                            if !seen.insert(desc.clone()) {
                                continue;
                            }
                            let mut task = task;
                            task.description = desc;
                            tasks.insert(id, task);
                        }
                    }
                    Err(err) => {
                        tracing::warn!("could not load tasks from {}: {}", path.display(), err);
                    }
                },
                Err(err) => {
                    tracing::warn!("could not read {}: {}", path.display(), err);
                }
            }
        }

        let mut queue: Vec<String> = tasks
            .iter()
            .filter(|(_, t)| t.status != TaskStatus::Completed)
            .map(|(id, _)| id.clone())
            .collect();
        queue.sort_by_key(|id| tasks[id].created_at);
        let mut completed: Vec<String> = tasks
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Completed)
            .map(|(id, _)| id.clone())
            .collect();
        completed.sort_by_key(|id| tasks[id].updated_at);

        Ok(Self {
            path,
            inner: RwLock::new(StoreInner {
                tasks,
                queue,
                completed,
            }),
        })
    }

    pub async fn create(
        &self,
        task_type: TaskType,
        description: impl Into<String>,
        priority: u8,
        dependencies: Vec<String>,
    ) -> Result<String> {
        if !(1..=5).contains(&priority) {
            return Err(OrchestrationError::InvalidPriority(priority));
        }
        let id = Uuid::new_v4().to_string();
        let task = CollaborativeTask::new(task_type, description, priority, dependencies);

        let mut inner = self.inner.write().await;
        inner.tasks.insert(id.clone(), task);
        inner.queue.push(id.clone());
        self.persist(&inner).await;
        Ok(id)
    }

    pub async fn set_dependencies(&self, id: &str, dependencies: Vec<String>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| OrchestrationError::UnknownTask(id.to_string()))?;
        task.dependencies = dependencies;
        task.touch();
        self.persist(&inner).await;
        Ok(())
    }

    pub async fn assign(&self, id: &str, role: BackendRole) -> Result<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| OrchestrationError::UnknownTask(id.to_string()))?;
        task.assigned_to = Some(role);
        task.status = TaskStatus::Assigned;
        task.touch();
        self.persist(&inner).await;
        Ok(())
    }

    /// Move a task into an intermediate status (in-progress, debugging). The
    /// task stays in the queue; completion goes through [`complete`].
    pub async fn set_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| OrchestrationError::UnknownTask(id.to_string()))?;
        task.status = status;
        task.touch();
        self.persist(&inner).await;
        Ok(())
    }

    pub async fn complete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| OrchestrationError::UnknownTask(id.to_string()))?;
        task.status = TaskStatus::Completed;
        task.touch();
        inner.queue.retain(|queued| queued != id);
        inner.completed.push(id.to_string());
        self.persist(&inner).await;
        Ok(())
    }

    /// Put a debugging task back on the pending path so the scheduler can
    /// pick it up again.
    pub async fn reopen(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| OrchestrationError::UnknownTask(id.to_string()))?;
        task.status = match task.assigned_to {
            Some(_) => TaskStatus::Assigned,
            None => TaskStatus::Pending,
        };
        task.touch();
        if !inner.queue.iter().any(|queued| queued == id) {
            inner.queue.push(id.to_string());
        }
        self.persist(&inner).await;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<CollaborativeTask> {
        self.inner.read().await.tasks.get(id).cloned()
    }

    pub async fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let inner = self.inner.read().await;
        let mut counts: HashMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for task in inner.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub async fn tasks_for_role(&self, role: BackendRole) -> Vec<(String, CollaborativeTask)> {
        self.inner
            .read()
            .await
            .tasks
            .iter()
            .filter(|(_, t)| t.assigned_to == Some(role) && t.status != TaskStatus::Completed)
            .map(|(id, t)| (id.clone(), t.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.tasks.is_empty()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.read().await.queue.len()
    }

    pub async fn completed_count(&self) -> usize {
        self.inner.read().await.completed.len()
    }

    pub async fn clear_all(&self) {
        let mut inner = self.inner.write().await;
        inner.tasks.clear();
        inner.queue.clear();
        inner.completed.clear();
        self.persist(&inner).await;
    }

    /// Serialize the whole store under the caller's write guard. Failures are
    /// observable in the log but never propagate.
    pub(crate) async fn persist(&self, inner: &StoreInner) {
        let snapshot: BTreeMap<&String, &CollaborativeTask> = inner.tasks.iter().collect();
        let data = match serde_json::to_string_pretty(&snapshot) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!("could not serialize tasks: {}", err);
                return;
            }
        };
        if let Err(err) = fs::write(&self.path, data).await {
            tracing::warn!("could not save tasks to {}: {}", self.path.display(), err);
        }
    }
}
