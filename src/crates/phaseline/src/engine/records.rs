//! Task record layer
//!
//! Every task write goes through [`TaskRecords::update`]: the change is
//! applied to a copy, the copy is persisted, and only then does it replace the
//! in-memory record. A failed write leaves the previous state in place.
//!
//! While an execution is live its handle owns the authoritative record.
//! Otherwise the store does, and writes are serialized by a single lock that
//! is also held while an execution slot is claimed.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use super::registry::{ExecutionHandle, ExecutionRegistry};
use crate::events::EventPublisher;
use crate::gate::{DecisionSink, PendingDecision, Resolution};
use crate::storage::TaskStore;
use crate::task::{GateRecord, PhaseStatus, Task, TaskStatus};
use crate::{OrchestratorError, Result};

pub struct TaskRecords {
    store: Arc<dyn TaskStore>,
    registry: Arc<ExecutionRegistry>,
    events: EventPublisher,
    write_lock: tokio::sync::Mutex<()>,
}

impl TaskRecords {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<ExecutionRegistry>,
        events: EventPublisher,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    /// Current state of a task
    pub async fn load(&self, id: &str) -> Result<Task> {
        if let Some(handle) = self.registry.get(id) {
            return Ok(handle.record().lock().await.clone());
        }
        self.store
            .load_task(id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound(id.to_string()))
    }

    /// Apply `change` to a task and persist it
    pub async fn update<F>(&self, id: &str, change: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        if let Some(handle) = self.registry.get(id) {
            return Self::update_live(&handle, self.store.as_ref(), change).await;
        }

        let guard = self.write_lock.lock().await;
        // A run may have claimed the slot while we waited
        if let Some(handle) = self.registry.get(id) {
            drop(guard);
            return Self::update_live(&handle, self.store.as_ref(), change).await;
        }

        let mut next = self
            .store
            .load_task(id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound(id.to_string()))?;
        change(&mut next)?;
        next.updated_at = Utc::now();
        self.store.save_task(&next).await?;
        drop(guard);
        Ok(next)
    }

    async fn update_live<F>(handle: &ExecutionHandle, store: &dyn TaskStore, change: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let mut record = handle.record().lock().await;
        let mut next = record.clone();
        change(&mut next)?;
        next.updated_at = Utc::now();
        store.save_task(&next).await?;
        *record = next.clone();
        Ok(next)
    }

    /// Claim the execution slot for a task after `check` accepts its stored state
    pub async fn claim<F>(&self, id: &str, check: F) -> Result<Arc<ExecutionHandle>>
    where
        F: FnOnce(&Task) -> Result<()>,
    {
        let _guard = self.write_lock.lock().await;
        if self.registry.contains(id) {
            return Err(OrchestratorError::AlreadyRunning(id.to_string()));
        }
        let task = self
            .store
            .load_task(id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound(id.to_string()))?;
        check(&task)?;
        self.registry.register(task)
    }

    /// Delete a task that has no live execution
    pub async fn remove<F>(&self, id: &str, check: F) -> Result<Task>
    where
        F: FnOnce(&Task) -> Result<()>,
    {
        let _guard = self.write_lock.lock().await;
        if self.registry.contains(id) {
            return Err(OrchestratorError::Conflict(format!(
                "task {} has a live execution",
                id
            )));
        }
        let task = self
            .store
            .load_task(id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound(id.to_string()))?;
        check(&task)?;
        if !self.store.delete_task(id).await? {
            return Err(OrchestratorError::TaskNotFound(id.to_string()));
        }
        Ok(task)
    }
}

/// Change status unless the task was cancelled in the meantime
pub(crate) fn set_status_unless_cancelled(task: &mut Task, status: TaskStatus) -> bool {
    if task.status == TaskStatus::Cancelled {
        return false;
    }
    task.set_status(status);
    true
}

#[async_trait]
impl DecisionSink for TaskRecords {
    async fn apply_resolution(
        &self,
        decision: &PendingDecision,
        resolution: &Resolution,
    ) -> Result<TaskStatus> {
        let action = if resolution.approved { "approve" } else { "reject" };
        let task = self
            .update(&decision.task_id, |task| {
                if task.status != TaskStatus::Blocked
                    || task.current_phase.as_deref() != Some(decision.phase.as_str())
                {
                    return Err(OrchestratorError::invalid_transition(task, action));
                }

                task.execution.gates.push(GateRecord {
                    phase: decision.phase.clone(),
                    gate_type: decision.gate_type,
                    approved: resolution.approved,
                    reason: resolution.reason.clone(),
                    resolved_by: resolution.resolved_by.clone(),
                    resolved_at: Utc::now(),
                });

                if !resolution.approved {
                    let reason = if resolution.reason.is_empty() {
                        format!("gate rejected at phase {}", decision.phase)
                    } else {
                        resolution.reason.clone()
                    };
                    let phase = task.phase_mut(&decision.phase);
                    phase.status = PhaseStatus::Failed;
                    phase.error = Some(reason.clone());
                    task.error = Some(reason);
                }
                task.set_status(resolution.target_status());
                Ok(())
            })
            .await?;

        debug!(task_id = %task.id, status = %task.status, "gate resolution persisted");
        self.events.state(&task, Some(TaskStatus::Blocked));
        Ok(task.status)
    }
}
