use crate::services::batch::BatchStatus;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-wide store of batch task statuses keyed by task id.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, BatchStatus>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one task.
    pub async fn get(&self, task_id: &str) -> Option<BatchStatus> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn put(&self, status: BatchStatus) {
        self.tasks
            .write()
            .await
            .insert(status.task_id.clone(), status);
    }

    /// Mutate a task in place under the write lock. Returns false for unknown ids.
    pub async fn update<F>(&self, task_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut BatchStatus),
    {
        match self.tasks.write().await.get_mut(task_id) {
            Some(status) => {
                f(status);
                status.recompute_in_flight();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, task_id: &str) -> Option<BatchStatus> {
        self.tasks.write().await.remove(task_id)
    }

    /// Drop terminal tasks that finished more than `older_than` ago.
    pub async fn prune_finished(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, status| {
            !(status.state.is_terminal()
                && status.finished_at.is_some_and(|finished| finished <= cutoff))
        });
        let pruned = before - tasks.len();
        if pruned > 0 {
            log::debug!("Pruned {} finished task(s)", pruned);
        }
        pruned
    }

    /// All tasks, most recently started first.
    pub async fn list(&self) -> Vec<BatchStatus> {
        let mut tasks: Vec<BatchStatus> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::ExtractionKind;
    use crate::services::batch::TaskState;

    fn status(task_id: &str) -> BatchStatus {
        BatchStatus::new(task_id.to_string(), ExtractionKind::Fingerprint, 10, 1)
    }

    #[tokio::test]
    async fn test_put_get_update_remove() {
        let registry = TaskRegistry::new();
        assert!(registry.get("task_missing").await.is_none());
        assert!(!registry.update("task_missing", |s| s.completed = 1).await);

        registry.put(status("task_a")).await;
        assert!(
            registry
                .update("task_a", |s| {
                    s.completed = 4;
                    s.failed = 1;
                })
                .await
        );

        let snapshot = registry.get("task_a").await.unwrap();
        assert_eq!(snapshot.completed, 4);
        assert_eq!(snapshot.in_flight, 5);

        assert!(registry.remove("task_a").await.is_some());
        assert!(registry.get("task_a").await.is_none());
    }

    #[tokio::test]
    async fn test_prune_finished_keeps_running_tasks() {
        let registry = TaskRegistry::new();

        let mut done = status("task_done");
        done.state = TaskState::Completed;
        done.finished_at = Some(Utc::now() - Duration::hours(2));
        registry.put(done).await;

        let mut recent = status("task_recent");
        recent.state = TaskState::Failed;
        recent.finished_at = Some(Utc::now());
        registry.put(recent).await;

        let mut running = status("task_running");
        running.state = TaskState::Processing;
        registry.put(running).await;

        assert_eq!(registry.prune_finished(Duration::hours(1)).await, 1);
        assert!(registry.get("task_done").await.is_none());
        assert_eq!(registry.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_puts_of_distinct_tasks() {
        let registry = std::sync::Arc::new(TaskRegistry::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.put(status(&format!("task_{}", i))).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.list().await.len(), 16);
    }
}
