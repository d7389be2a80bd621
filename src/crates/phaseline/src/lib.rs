//! Multi-phase task orchestration for AI coding agents
//!
//! A task advances through the ordered phases of a workflow. Each phase has its
//! own retry budget and an optional approval gate, and every state change is
//! announced on an in-process event bus that feeds WebSocket and SSE observers.
//!
//! The main pieces:
//! - [`events`]: bounded, non-blocking pub/sub keyed by task ID
//! - [`gate`]: gate types, auto-gate criteria and the pending decision store
//! - [`workflow`]: phase graphs, built-in workflows and the workflow registry
//! - [`engine`]: the task state machine and phase driver
//! - [`session`]: live aggregate metrics across running tasks
//! - [`project`]: LRU cache of per-project database handles
//! - [`api`]: axum routes for tasks, decisions, workflows, sessions and streams

pub mod api;
pub mod config;
pub mod engine;
pub mod events;
pub mod gate;
pub mod project;
pub mod session;
pub mod storage;
pub mod task;
pub mod workflow;

use thiserror::Error;

pub use engine::{CreateTaskRequest, TaskEngine};
pub use events::{Event, EventBus, EventPayload, EventPublisher, Publisher, GLOBAL_TASK_ID};
pub use gate::{DecisionStore, GateType, PendingDecision};
pub use session::{SessionBroadcaster, SessionUpdate};
pub use storage::StorageError;
pub use task::{Task, TaskStatus, TaskWeight};
pub use workflow::{Workflow, WorkflowRegistry};

/// Errors that can occur during orchestration
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Decision not found
    #[error("Decision not found: {0}")]
    DecisionNotFound(String),

    /// Workflow not found
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Project not found
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    /// Operation not allowed from the task's current status
    #[error("Cannot {action} task {task_id} while it is {from}")]
    InvalidStateTransition {
        task_id: String,
        action: String,
        from: TaskStatus,
    },

    /// An execution is already registered for the task
    #[error("Task {0} is already running")]
    AlreadyRunning(String),

    /// Conflicting concurrent or duplicate operation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Workflow definition failed validation
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Request failed validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Phase execution error
    #[error("Phase execution failed: {0}")]
    ExecutionFailed(String),

    /// Persistence error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error
    #[error("Orchestrator error: {0}")]
    General(String),
}

impl OrchestratorError {
    pub fn invalid_transition(task: &Task, action: impl Into<String>) -> Self {
        OrchestratorError::InvalidStateTransition {
            task_id: task.id.clone(),
            action: action.into(),
            from: task.status,
        }
    }

    /// Check if this error means the addressed resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TaskNotFound(_)
                | OrchestratorError::DecisionNotFound(_)
                | OrchestratorError::WorkflowNotFound(_)
                | OrchestratorError::ProjectNotFound(_)
        )
    }

    /// Check if this error is a state conflict the caller may resolve by retrying later
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            OrchestratorError::InvalidStateTransition { .. }
                | OrchestratorError::AlreadyRunning(_)
                | OrchestratorError::Conflict(_)
        )
    }
}

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
