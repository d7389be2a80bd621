//! Pending decision store
//!
//! Holds the approvals that block tasks. Each entry owns the oneshot sender the
//! blocked phase driver is waiting on. Resolution persists the task change
//! through a [`DecisionSink`] before the entry is removed, so a failed write
//! leaves the decision pending and the call can be retried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::GateType;
use crate::events::{DecisionRequired, DecisionResolved, EventPublisher};
use crate::task::TaskStatus;
use crate::{OrchestratorError, Result};

/// Build the decision ID for a task's gate at a phase
///
/// The first gate of a phase is `gate_<task>_<phase>`; repeats carry the
/// attempt number as a suffix.
pub fn decision_id(task_id: &str, phase: &str, nonce: usize) -> String {
    if nonce <= 1 {
        format!("gate_{}_{}", task_id, phase)
    } else {
        format!("gate_{}_{}_{}", task_id, phase, nonce)
    }
}

/// An approval request awaiting resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDecision {
    pub decision_id: String,
    pub task_id: String,
    pub task_title: String,
    pub phase: String,
    pub gate_type: GateType,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub requested_at: DateTime<Utc>,
}

impl PendingDecision {
    pub fn new(
        task_id: impl Into<String>,
        task_title: impl Into<String>,
        phase: impl Into<String>,
        gate_type: GateType,
        nonce: usize,
    ) -> Self {
        let task_id = task_id.into();
        let phase = phase.into();
        Self {
            decision_id: decision_id(&task_id, &phase, nonce),
            question: format!("Approve phase '{}' and continue?", phase),
            task_id,
            task_title: task_title.into(),
            phase,
            gate_type,
            context: None,
            requested_at: Utc::now(),
        }
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = question.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Outcome delivered to the blocked phase driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub approved: bool,
    pub reason: String,
    pub resolved_by: String,
}

impl Resolution {
    pub fn new(approved: bool, reason: impl Into<String>) -> Self {
        Self {
            approved,
            reason: reason.into(),
            resolved_by: "api".to_string(),
        }
    }

    pub fn by(mut self, resolved_by: impl Into<String>) -> Self {
        let resolved_by = resolved_by.into();
        if !resolved_by.is_empty() {
            self.resolved_by = resolved_by;
        }
        self
    }

    /// Status the task moves to once the resolution is persisted
    pub fn target_status(&self) -> TaskStatus {
        if self.approved {
            TaskStatus::Planned
        } else {
            TaskStatus::Failed
        }
    }
}

/// Result of a successful resolution
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub decision: PendingDecision,
    pub new_status: TaskStatus,
}

/// Persists the task side of a resolution
#[async_trait]
pub trait DecisionSink: Send + Sync {
    /// Record the gate outcome on the task and return its new status
    async fn apply_resolution(
        &self,
        decision: &PendingDecision,
        resolution: &Resolution,
    ) -> Result<TaskStatus>;
}

struct Entry {
    decision: PendingDecision,
    waiter: Option<oneshot::Sender<Resolution>>,
    resolving: bool,
}

/// Concurrent registry of pending decisions
pub struct DecisionStore {
    entries: Mutex<HashMap<String, Entry>>,
    events: EventPublisher,
}

impl DecisionStore {
    pub fn new(events: EventPublisher) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Register a decision and announce it
    ///
    /// Returns the receiver that yields the resolution. Fails with a conflict
    /// when the ID or the (task, phase) pair is already pending.
    pub fn add(&self, decision: PendingDecision) -> Result<oneshot::Receiver<Resolution>> {
        let id = decision.decision_id.clone();
        let rx = self.register(decision)?;
        self.announce(&id);
        Ok(rx)
    }

    /// Register a decision without publishing `decision_required`
    pub fn register(&self, decision: PendingDecision) -> Result<oneshot::Receiver<Resolution>> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock();
        if entries.contains_key(&decision.decision_id) {
            return Err(OrchestratorError::Conflict(format!(
                "decision {} is already pending",
                decision.decision_id
            )));
        }
        if entries
            .values()
            .any(|e| e.decision.task_id == decision.task_id && e.decision.phase == decision.phase)
        {
            return Err(OrchestratorError::Conflict(format!(
                "task {} already has a pending decision for phase {}",
                decision.task_id, decision.phase
            )));
        }
        entries.insert(
            decision.decision_id.clone(),
            Entry {
                decision,
                waiter: Some(tx),
                resolving: false,
            },
        );
        Ok(rx)
    }

    /// Publish `decision_required` for a registered decision
    ///
    /// Returns false, publishing nothing, once the decision has been
    /// discarded or resolved. The check and the publish share the entry lock.
    pub fn announce(&self, decision_id: &str) -> bool {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(decision_id) else {
            debug!(decision_id, "decision no longer pending, not announced");
            return false;
        };
        let decision = &entry.decision;
        info!(
            decision_id = %decision.decision_id,
            task_id = %decision.task_id,
            phase = %decision.phase,
            gate_type = %decision.gate_type,
            "decision required"
        );
        self.events.decision_required(
            &decision.task_id,
            DecisionRequired {
                decision_id: decision.decision_id.clone(),
                task_title: decision.task_title.clone(),
                phase: decision.phase.clone(),
                gate_type: decision.gate_type,
                question: decision.question.clone(),
                context: decision.context.clone(),
            },
        );
        true
    }

    pub fn get(&self, decision_id: &str) -> Option<PendingDecision> {
        self.entries
            .lock()
            .get(decision_id)
            .map(|e| e.decision.clone())
    }

    pub fn contains(&self, decision_id: &str) -> bool {
        self.entries.lock().contains_key(decision_id)
    }

    /// Pending decisions, oldest first, optionally for one task
    pub fn list(&self, task_id: Option<&str>) -> Vec<PendingDecision> {
        let mut decisions: Vec<_> = self
            .entries
            .lock()
            .values()
            .filter(|e| task_id.map_or(true, |id| e.decision.task_id == id))
            .map(|e| e.decision.clone())
            .collect();
        decisions.sort_by(|a, b| {
            a.requested_at
                .cmp(&b.requested_at)
                .then_with(|| a.decision_id.cmp(&b.decision_id))
        });
        decisions
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every decision of a task without resolving it
    ///
    /// Waiting drivers observe a closed channel.
    pub fn discard_for_task(&self, task_id: &str) -> Vec<PendingDecision> {
        let mut entries = self.entries.lock();
        let ids: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.decision.task_id == task_id)
            .map(|(id, _)| id.clone())
            .collect();
        let removed: Vec<_> = ids
            .iter()
            .filter_map(|id| entries.remove(id))
            .map(|e| e.decision)
            .collect();
        if !removed.is_empty() {
            debug!(task_id, count = removed.len(), "discarded pending decisions");
        }
        removed
    }

    /// Resolve a decision
    ///
    /// The task change is persisted first. Only then is the entry removed,
    /// `decision_resolved` published and the waiting driver woken.
    pub async fn resolve(
        &self,
        decision_id: &str,
        resolution: Resolution,
        sink: &dyn DecisionSink,
    ) -> Result<ResolveOutcome> {
        let decision = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(decision_id)
                .ok_or_else(|| OrchestratorError::DecisionNotFound(decision_id.to_string()))?;
            if entry.resolving {
                return Err(OrchestratorError::Conflict(format!(
                    "decision {} is already being resolved",
                    decision_id
                )));
            }
            entry.resolving = true;
            entry.decision.clone()
        };

        let new_status = match sink.apply_resolution(&decision, &resolution).await {
            Ok(status) => status,
            Err(e) => {
                warn!(decision_id, error = %e, "decision resolution not persisted");
                if let Some(entry) = self.entries.lock().get_mut(decision_id) {
                    entry.resolving = false;
                }
                return Err(e);
            }
        };

        let waiter = self
            .entries
            .lock()
            .remove(decision_id)
            .and_then(|mut e| e.waiter.take());

        info!(
            decision_id,
            task_id = %decision.task_id,
            approved = resolution.approved,
            new_status = %new_status,
            "decision resolved"
        );
        self.events.decision_resolved(
            &decision.task_id,
            DecisionResolved {
                decision_id: decision.decision_id.clone(),
                phase: decision.phase.clone(),
                approved: resolution.approved,
                reason: resolution.reason.clone(),
                resolved_by: resolution.resolved_by.clone(),
                resolved_at: Utc::now(),
            },
        );

        if let Some(tx) = waiter {
            if tx.send(resolution).is_err() {
                debug!(decision_id, "no driver waiting on resolved decision");
            }
        }

        Ok(ResolveOutcome {
            decision,
            new_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, EventPayload, Publisher, GLOBAL_TASK_ID};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct StatusSink {
        fail: AtomicBool,
    }

    impl StatusSink {
        fn ok() -> Self {
            Self {
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl DecisionSink for StatusSink {
        async fn apply_resolution(
            &self,
            _decision: &PendingDecision,
            resolution: &Resolution,
        ) -> Result<TaskStatus> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(OrchestratorError::General("disk full".into()));
            }
            Ok(resolution.target_status())
        }
    }

    fn review_gate(task_id: &str) -> PendingDecision {
        PendingDecision::new(task_id, "Refactor auth", "review", GateType::Human, 1)
    }

    #[test]
    fn test_decision_id_format() {
        assert_eq!(decision_id("TASK-001", "review", 1), "gate_TASK-001_review");
        assert_eq!(decision_id("TASK-001", "review", 2), "gate_TASK-001_review_2");
    }

    #[test]
    fn test_add_rejects_duplicate_phase() {
        let store = DecisionStore::new(EventPublisher::none());
        let _rx = store.add(review_gate("TASK-001")).unwrap();
        let again = PendingDecision::new("TASK-001", "Refactor auth", "review", GateType::Ai, 2);
        assert!(store.add(again).unwrap_err().is_conflict());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_list_filters_and_sorts() {
        let store = DecisionStore::new(EventPublisher::none());
        let _a = store.add(review_gate("TASK-001")).unwrap();
        let _b = store.add(review_gate("TASK-002")).unwrap();

        assert_eq!(store.list(None).len(), 2);
        let only = store.list(Some("TASK-002"));
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].decision_id, "gate_TASK-002_review");
        assert!(store.list(Some("TASK-404")).is_empty());
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter_and_publishes() {
        let bus = Arc::new(EventBus::new());
        let mut global = bus.subscribe(GLOBAL_TASK_ID);
        let store = DecisionStore::new(EventPublisher::new(bus.clone()));

        let rx = store.add(review_gate("TASK-001")).unwrap();
        assert_eq!(global.recv().await.unwrap().event_type(), "decision_required");

        let outcome = store
            .resolve("gate_TASK-001_review", Resolution::new(true, ""), &StatusSink::ok())
            .await
            .unwrap();
        assert_eq!(outcome.new_status, TaskStatus::Planned);
        assert!(!store.contains("gate_TASK-001_review"));

        let resolution = rx.await.unwrap();
        assert!(resolution.approved);
        assert_eq!(resolution.resolved_by, "api");

        match global.recv().await.unwrap().payload {
            EventPayload::DecisionResolved(data) => {
                assert!(data.approved);
                assert_eq!(data.decision_id, "gate_TASK-001_review");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_twice_is_not_found() {
        let bus = Arc::new(EventBus::new());
        let store = DecisionStore::new(EventPublisher::new(bus.clone()));
        let _rx = store.add(review_gate("TASK-001")).unwrap();
        let mut global = bus.subscribe(GLOBAL_TASK_ID);

        let sink = StatusSink::ok();
        let rejected = Resolution::new(false, "needs more work");
        let outcome = store
            .resolve("gate_TASK-001_review", rejected.clone(), &sink)
            .await
            .unwrap();
        assert_eq!(outcome.new_status, TaskStatus::Failed);

        let err = store
            .resolve("gate_TASK-001_review", rejected, &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DecisionNotFound(_)));

        assert_eq!(global.recv().await.unwrap().event_type(), "decision_resolved");
        assert!(global.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_decision() {
        let store = DecisionStore::new(EventPublisher::none());
        let _rx = store.add(review_gate("TASK-001")).unwrap();
        let sink = StatusSink {
            fail: AtomicBool::new(true),
        };

        let err = store
            .resolve("gate_TASK-001_review", Resolution::new(true, ""), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::General(_)));
        assert!(store.contains("gate_TASK-001_review"));

        sink.fail.store(false, Ordering::SeqCst);
        let outcome = store
            .resolve("gate_TASK-001_review", Resolution::new(true, ""), &sink)
            .await
            .unwrap();
        assert_eq!(outcome.new_status, TaskStatus::Planned);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_discard_closes_waiter() {
        let store = DecisionStore::new(EventPublisher::none());
        let rx = store.add(review_gate("TASK-001")).unwrap();
        let _other = store.add(review_gate("TASK-002")).unwrap();

        let removed = store.discard_for_task("TASK-001");
        assert_eq!(removed.len(), 1);
        assert!(rx.await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_discarded_decision_is_not_announced() {
        let bus = Arc::new(EventBus::new());
        let mut global = bus.subscribe(GLOBAL_TASK_ID);
        let store = DecisionStore::new(EventPublisher::new(bus.clone()));

        let rx = store.register(review_gate("TASK-001")).unwrap();
        assert!(global.try_recv().is_none());
        store.discard_for_task("TASK-001");
        assert!(!store.announce("gate_TASK-001_review"));
        assert!(global.try_recv().is_none());
        assert!(rx.await.is_err());

        let _rx = store.register(review_gate("TASK-002")).unwrap();
        assert!(store.announce("gate_TASK-002_review"));
        match global.try_recv().unwrap().payload {
            EventPayload::DecisionRequired(data) => {
                assert_eq!(data.decision_id, "gate_TASK-002_review");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_resolution_resolved_by() {
        assert_eq!(Resolution::new(true, "").by("").resolved_by, "api");
        assert_eq!(Resolution::new(true, "").by("alice").resolved_by, "alice");
    }
}
