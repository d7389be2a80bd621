//! SQLite storage backend
//!
//! Tasks are stored as JSON documents next to a few indexed columns. Usage
//! entries go to their own table so daily totals are a single aggregate query.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use super::{format_task_id, StorageError, TaskStore, UsageEntry, UsageStore, UsageTotals};
use crate::task::Task;

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// sqlx-backed task and usage store
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect using a connection string such as `sqlite://phaseline.db?mode=rwc`
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Open (creating if needed) a database file
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self, StorageError> {
        // Every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run a trivial query to verify the connection
    pub async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn next_task_id(&self) -> Result<String, StorageError> {
        let (value,): (i64,) = sqlx::query_as(
            "INSERT INTO sequences (name, value) VALUES ('task', 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1
             RETURNING value",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(format_task_id(value.max(0) as u64))
    }

    async fn save_task(&self, task: &Task) -> Result<(), StorageError> {
        let data = serde_json::to_string(task)?;
        sqlx::query(
            "INSERT INTO tasks (id, title, status, workflow_id, data, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                status = excluded.status,
                workflow_id = excluded.workflow_id,
                data = excluded.data,
                updated_at = excluded.updated_at",
        )
        .bind(&task.id)
        .bind(&task.title)
        .bind(task.status.as_str())
        .bind(&task.workflow_id)
        .bind(&data)
        .bind(timestamp(&task.created_at))
        .bind(timestamp(&task.updated_at))
        .execute(&self.pool)
        .await?;
        debug!(task_id = %task.id, status = %task.status, "saved task");
        Ok(())
    }

    async fn load_task(&self, id: &str) -> Result<Option<Task>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((data,)) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, StorageError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT data FROM tasks ORDER BY created_at ASC, id ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(data,)| serde_json::from_str(&data).map_err(StorageError::from))
            .collect()
    }

    async fn delete_task(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn record_usage(&self, entry: &UsageEntry) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO usage_entries (task_id, phase, input_tokens, output_tokens, cost_usd, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.task_id)
        .bind(&entry.phase)
        .bind(entry.tokens.input_tokens as i64)
        .bind(entry.tokens.output_tokens as i64)
        .bind(entry.cost_usd)
        .bind(timestamp(&entry.recorded_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn usage_since(&self, since: DateTime<Utc>) -> Result<UsageTotals, StorageError> {
        let (input, output, cost): (i64, i64, f64) = sqlx::query_as(
            "SELECT COALESCE(SUM(input_tokens), 0),
                    COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(cost_usd), 0.0)
             FROM usage_entries WHERE recorded_at >= ?",
        )
        .bind(timestamp(&since))
        .fetch_one(&self.pool)
        .await?;
        Ok(UsageTotals {
            input_tokens: input.max(0) as u64,
            output_tokens: output.max(0) as u64,
            cost_usd: cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{PhaseStatus, TaskStatus, TokenUsage};
    use chrono::Duration;

    #[tokio::test]
    async fn test_task_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.health_check().await.unwrap();

        let id = store.next_task_id().await.unwrap();
        assert_eq!(id, "TASK-001");
        assert_eq!(store.next_task_id().await.unwrap(), "TASK-002");

        let mut task = Task::new(&id, "Add cache").with_workflow("implement-small");
        task.phase_mut("implement").status = PhaseStatus::Completed;
        store.save_task(&task).await.unwrap();

        task.set_status(TaskStatus::Running);
        store.save_task(&task).await.unwrap();

        let loaded = store.load_task(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert_eq!(loaded.phase_status("implement"), PhaseStatus::Completed);
        assert_eq!(store.list_tasks().await.unwrap().len(), 1);

        assert!(store.delete_task(&id).await.unwrap());
        assert!(store.load_task(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_usage_since() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut old = UsageEntry::new("TASK-001", "spec", TokenUsage::new(500, 500), 2.0);
        old.recorded_at = Utc::now() - Duration::days(3);
        store.record_usage(&old).await.unwrap();
        store
            .record_usage(&UsageEntry::new("TASK-001", "implement", TokenUsage::new(10, 5), 0.25))
            .await
            .unwrap();

        let totals = store.usage_since(Utc::now() - Duration::hours(1)).await.unwrap();
        assert_eq!(totals.input_tokens, 10);
        assert_eq!(totals.output_tokens, 5);
        assert!((totals.cost_usd - 0.25).abs() < 1e-9);

        let empty = SqliteStore::in_memory().await.unwrap();
        assert_eq!(empty.usage_since(Utc::now()).await.unwrap(), UsageTotals::default());
    }

    #[tokio::test]
    async fn test_open_file_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("phaseline.db");
        let store = SqliteStore::open(&path).await.unwrap();
        store.save_task(&Task::new("TASK-001", "x")).await.unwrap();
        store.close().await;
        assert!(store.is_closed());

        let reopened = SqliteStore::open(&path).await.unwrap();
        assert!(reopened.load_task("TASK-001").await.unwrap().is_some());
    }
}
