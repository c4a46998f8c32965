use std::sync::Arc;

use duet_types::{role_for_task_type, BackendRole, CollaborativeTask, TaskStatus};

use crate::store::TaskStore;

/// Selects the next eligible task under priority and dependency constraints
/// and performs automatic role assignment by task type.
#[derive(Clone)]
pub struct TaskScheduler {
    store: Arc<TaskStore>,
}

impl TaskScheduler {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Next unblocked task, lowest priority number first, creation order on
    /// ties. Blocked candidates are (re)marked and skipped, never removed.
    /// An empty result is normal, not an error.
    pub async fn next_ready(&self) -> Option<(String, CollaborativeTask)> {
        self.next_ready_filtered(None).await
    }

    pub async fn next_ready_for_role(
        &self,
        role: BackendRole,
    ) -> Option<(String, CollaborativeTask)> {
        self.next_ready_filtered(Some(role)).await
    }

    async fn next_ready_filtered(
        &self,
        role: Option<BackendRole>,
    ) -> Option<(String, CollaborativeTask)> {
        let mut guard = self.store.inner.write().await;
        let inner = &mut *guard;

        // Stable sort keeps creation order within a priority band.
        let tasks = &inner.tasks;
        inner
            .queue
            .sort_by_key(|id| tasks.get(id).map(|t| t.priority).unwrap_or(u8::MAX));

        let mut changed = false;
        let mut selected = None;

        for id in inner.queue.clone() {
            let Some(task) = inner.tasks.get(&id) else {
                continue;
            };
            match task.status {
                TaskStatus::InProgress | TaskStatus::Debugging => continue,
                _ => {}
            }
            if let Some(role) = role {
                if task.assigned_to != Some(role) {
                    continue;
                }
            }

            let blocked = task.dependencies.iter().any(|dep| {
                inner
                    .tasks
                    .get(dep)
                    .map_or(true, |d| d.status != TaskStatus::Completed)
            });

            let task = inner.tasks.get_mut(&id).expect("task present");
            if blocked {
                if task.status != TaskStatus::Blocked {
                    task.status = TaskStatus::Blocked;
                    task.touch();
                    changed = true;
                }
                continue;
            }

            // Dependencies resolved since the last scan; unblock in place.
            if task.status == TaskStatus::Blocked {
                task.status = match task.assigned_to {
                    Some(_) => TaskStatus::Assigned,
                    None => TaskStatus::Pending,
                };
                task.touch();
                changed = true;
            }

            selected = Some((id.clone(), task.clone()));
            break;
        }

        if changed {
            self.store.persist(inner).await;
        }
        selected
    }

    /// Assign every pending queued task to the role owning its task type.
    pub async fn auto_assign(&self) {
        let mut guard = self.store.inner.write().await;
        let inner = &mut *guard;
        let mut changed = false;

        for id in &inner.queue {
            let Some(task) = inner.tasks.get_mut(id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            task.assigned_to = Some(role_for_task_type(task.task_type));
            task.status = TaskStatus::Assigned;
            task.touch();
            changed = true;
        }

        if changed {
            self.store.persist(inner).await;
        }
    }
}
