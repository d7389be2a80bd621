//! Typed publishing helpers over an optional publisher handle

use chrono::Utc;
use std::sync::Arc;

use super::{
    CompleteData, DecisionRequired, DecisionResolved, ErrorData, Event, EventPayload, PhaseUpdate,
    Publisher, StateChange, TaskDeleted, TokenUpdate,
};
use crate::session::SessionUpdate;
use crate::task::{Task, TaskStatus, TokenUsage};

/// Cloneable publishing handle
///
/// A handle without a publisher drops every event, so components can be
/// constructed without a bus.
#[derive(Clone, Default)]
pub struct EventPublisher {
    inner: Option<Arc<dyn Publisher>>,
}

impl EventPublisher {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            inner: Some(publisher),
        }
    }

    /// Handle that drops everything
    pub fn none() -> Self {
        Self { inner: None }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_some()
    }

    pub fn publisher(&self) -> Option<&Arc<dyn Publisher>> {
        self.inner.as_ref()
    }

    pub fn publish(&self, event: Event) {
        if let Some(publisher) = &self.inner {
            publisher.publish(event);
        }
    }

    pub fn task_created(&self, task: &Task) {
        self.publish(Event::new(&task.id, EventPayload::TaskCreated(task.clone())));
    }

    pub fn task_updated(&self, task: &Task) {
        self.publish(Event::new(&task.id, EventPayload::TaskUpdated(task.clone())));
    }

    pub fn task_deleted(&self, task_id: &str) {
        self.publish(Event::new(
            task_id,
            EventPayload::TaskDeleted(TaskDeleted {
                task_id: task_id.to_string(),
            }),
        ));
    }

    pub fn state(&self, task: &Task, previous: Option<TaskStatus>) {
        self.publish(Event::new(
            &task.id,
            EventPayload::State(StateChange {
                status: task.status,
                previous,
                current_phase: task.current_phase.clone(),
                error: task.error.clone(),
            }),
        ));
    }

    pub fn phase(&self, task: &Task, phase: &str) {
        let state = task.phase(phase).cloned().unwrap_or_default();
        self.publish(Event::new(
            &task.id,
            EventPayload::Phase(PhaseUpdate {
                phase: phase.to_string(),
                status: state.status,
                iteration: state.iterations,
                commit_sha: state.commit_sha,
                error: state.error,
            }),
        ));
    }

    pub fn tokens(&self, task_id: &str, phase: &str, usage: TokenUsage, cost_usd: f64) {
        self.publish(Event::new(
            task_id,
            EventPayload::Tokens(TokenUpdate {
                phase: phase.to_string(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                total_tokens: usage.total(),
                cost_usd,
            }),
        ));
    }

    pub fn error(&self, task_id: &str, phase: Option<&str>, message: impl Into<String>, fatal: bool) {
        self.publish(Event::new(
            task_id,
            EventPayload::Error(ErrorData {
                phase: phase.map(str::to_string),
                message: message.into(),
                fatal,
            }),
        ));
    }

    pub fn complete(&self, task: &Task, commit_sha: Option<String>) {
        let duration_seconds = task
            .started_at
            .map(|start| (task.completed_at.unwrap_or_else(Utc::now) - start).num_seconds());
        self.publish(Event::new(
            &task.id,
            EventPayload::Complete(CompleteData {
                status: task.status,
                duration_seconds,
                commit_sha,
            }),
        ));
    }

    pub fn decision_required(&self, task_id: &str, data: DecisionRequired) {
        self.publish(Event::new(task_id, EventPayload::DecisionRequired(data)));
    }

    pub fn decision_resolved(&self, task_id: &str, data: DecisionResolved) {
        self.publish(Event::new(task_id, EventPayload::DecisionResolved(data)));
    }

    pub fn session(&self, update: SessionUpdate) {
        self.publish(Event::global(EventPayload::SessionUpdate(update)));
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("connected", &self.is_connected())
            .finish()
    }
}
