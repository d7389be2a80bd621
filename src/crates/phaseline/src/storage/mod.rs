//! Persistence boundary
//!
//! The engine only sees the [`TaskStore`] and [`UsageStore`] traits. Two
//! backends ship with the crate: [`MemoryStore`] and the sqlx-based
//! [`SqliteStore`].

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::{Task, TokenUsage};

/// Storage error type
#[derive(Debug, Error)]
pub enum StorageError {
    /// Query or connection failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend refused the operation
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Task persistence
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Allocate the next `TASK-NNN` identifier
    async fn next_task_id(&self) -> Result<String, StorageError>;

    /// Insert or replace a task
    async fn save_task(&self, task: &Task) -> Result<(), StorageError>;

    async fn load_task(&self, id: &str) -> Result<Option<Task>, StorageError>;

    /// All tasks, oldest first
    async fn list_tasks(&self) -> Result<Vec<Task>, StorageError>;

    /// Returns false when the task did not exist
    async fn delete_task(&self, id: &str) -> Result<bool, StorageError>;
}

/// One phase attempt's token and cost usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub task_id: String,
    pub phase: String,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

impl UsageEntry {
    pub fn new(
        task_id: impl Into<String>,
        phase: impl Into<String>,
        tokens: TokenUsage,
        cost_usd: f64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            phase: phase.into(),
            tokens,
            cost_usd,
            recorded_at: Utc::now(),
        }
    }
}

/// Aggregated usage over a time window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl UsageTotals {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Token and cost ledger feeding session metrics
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn record_usage(&self, entry: &UsageEntry) -> Result<(), StorageError>;

    /// Totals of entries recorded at or after `since`
    async fn usage_since(&self, since: DateTime<Utc>) -> Result<UsageTotals, StorageError>;
}

/// Format a task sequence number as an ID
pub fn format_task_id(sequence: u64) -> String {
    format!("TASK-{:03}", sequence)
}
