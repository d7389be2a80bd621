//! In-memory storage backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{format_task_id, StorageError, TaskStore, UsageEntry, UsageStore, UsageTotals};
use crate::task::Task;

/// Process-local store, used for tests and `backend = "memory"`
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<String, Task>>,
    sequence: AtomicU64,
    usage: Mutex<Vec<UsageEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn next_task_id(&self) -> Result<String, StorageError> {
        Ok(format_task_id(self.sequence.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn save_task(&self, task: &Task) -> Result<(), StorageError> {
        self.tasks.write().insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn load_task(&self, id: &str) -> Result<Option<Task>, StorageError> {
        Ok(self.tasks.read().get(id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, StorageError> {
        let mut tasks: Vec<Task> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn delete_task(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.tasks.write().remove(id).is_some())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn record_usage(&self, entry: &UsageEntry) -> Result<(), StorageError> {
        self.usage.lock().push(entry.clone());
        Ok(())
    }

    async fn usage_since(&self, since: DateTime<Utc>) -> Result<UsageTotals, StorageError> {
        let usage = self.usage.lock();
        Ok(usage
            .iter()
            .filter(|e| e.recorded_at >= since)
            .fold(UsageTotals::default(), |mut acc, e| {
                acc.input_tokens += e.tokens.input_tokens;
                acc.output_tokens += e.tokens.output_tokens;
                acc.cost_usd += e.cost_usd;
                acc
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TokenUsage;
    use chrono::Duration;

    #[tokio::test]
    async fn test_task_crud() {
        let store = MemoryStore::new();
        let id = store.next_task_id().await.unwrap();
        assert_eq!(id, "TASK-001");
        assert_eq!(store.next_task_id().await.unwrap(), "TASK-002");

        let task = Task::new(&id, "Add cache");
        store.save_task(&task).await.unwrap();
        assert_eq!(store.load_task(&id).await.unwrap().unwrap().title, "Add cache");
        assert_eq!(store.list_tasks().await.unwrap().len(), 1);

        assert!(store.delete_task(&id).await.unwrap());
        assert!(!store.delete_task(&id).await.unwrap());
        assert!(store.load_task(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_usage_window() {
        let store = MemoryStore::new();
        let mut old = UsageEntry::new("TASK-001", "spec", TokenUsage::new(1000, 1000), 1.0);
        old.recorded_at = Utc::now() - Duration::days(2);
        store.record_usage(&old).await.unwrap();
        store
            .record_usage(&UsageEntry::new("TASK-001", "implement", TokenUsage::new(100, 40), 0.5))
            .await
            .unwrap();

        let totals = store.usage_since(Utc::now() - Duration::hours(1)).await.unwrap();
        assert_eq!(totals.input_tokens, 100);
        assert_eq!(totals.output_tokens, 40);
        assert!((totals.cost_usd - 0.5).abs() < f64::EPSILON);
    }
}
