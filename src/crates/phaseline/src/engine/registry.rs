//! Execution registry
//!
//! At most one live execution exists per task. Inserting a handle is the
//! exclusivity check; the phase driver removes its handle when it exits.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::task::Task;
use crate::{OrchestratorError, Result};

/// Task record shared by the driver and every writer while an execution is live
pub type SharedTask = Arc<tokio::sync::Mutex<Task>>;

/// Control surface of one live execution
#[derive(Debug)]
pub struct ExecutionHandle {
    task_id: String,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    record: SharedTask,
}

impl ExecutionHandle {
    fn new(task: Task) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            task_id: task.id.clone(),
            cancel: CancellationToken::new(),
            pause,
            record: Arc::new(tokio::sync::Mutex::new(task)),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn set_paused(&self, paused: bool) {
        self.pause.send_replace(paused);
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Receiver that observes pause signal changes
    pub fn pause_signal(&self) -> watch::Receiver<bool> {
        self.pause.subscribe()
    }

    pub fn record(&self) -> &SharedTask {
        &self.record
    }
}

/// Map of task ID to live execution handle
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    handles: Mutex<HashMap<String, Arc<ExecutionHandle>>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the execution slot for a task
    pub fn register(&self, task: Task) -> Result<Arc<ExecutionHandle>> {
        let mut handles = self.handles.lock();
        if handles.contains_key(&task.id) {
            return Err(OrchestratorError::AlreadyRunning(task.id));
        }
        let handle = Arc::new(ExecutionHandle::new(task));
        handles.insert(handle.task_id.clone(), handle.clone());
        Ok(handle)
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<ExecutionHandle>> {
        self.handles.lock().get(task_id).cloned()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.handles.lock().contains_key(task_id)
    }

    /// Release a slot; returns the handle if one was registered
    pub fn remove(&self, task_id: &str) -> Option<Arc<ExecutionHandle>> {
        self.handles.lock().remove(task_id)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn paused_count(&self) -> usize {
        self.handles.lock().values().filter(|h| h.is_paused()).count()
    }

    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.handles.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Releases an execution slot when dropped
pub(crate) struct SlotGuard {
    registry: Arc<ExecutionRegistry>,
    task_id: String,
}

impl SlotGuard {
    pub(crate) fn new(registry: Arc<ExecutionRegistry>, task_id: impl Into<String>) -> Self {
        Self {
            registry,
            task_id: task_id.into(),
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.task_id);
    }
}
