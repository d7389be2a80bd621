//! Event types and the in-process event bus
//!
//! Every state change is announced as an [`Event`] whose payload is one
//! variant of [`EventPayload`]. Events are scoped to a task ID; the reserved
//! [`GLOBAL_TASK_ID`] marks events that belong to no single task.

mod bus;
mod publisher;

pub use bus::{EventBus, NopPublisher, Publisher, Subscription, SubscriptionId};
pub use publisher::EventPublisher;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gate::GateType;
use crate::session::SessionUpdate;
use crate::task::{PhaseStatus, Task, TaskStatus};

/// Subscription key that receives global events and every task's events
pub const GLOBAL_TASK_ID: &str = "*";

/// Returns true for task IDs that denote a global event
pub fn is_global(task_id: &str) -> bool {
    task_id.is_empty() || task_id == GLOBAL_TASK_ID
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDeleted {
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseUpdate {
    pub phase: String,
    pub status: PhaseStatus,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUpdate {
    pub phase: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequired {
    pub decision_id: String,
    pub task_title: String,
    pub phase: String,
    pub gate_type: GateType,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResolved {
    pub decision_id: String,
    pub phase: String,
    pub approved: bool,
    #[serde(default)]
    pub reason: String,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub message: String,
    pub fatal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteData {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

/// Typed event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    TaskCreated(Task),
    TaskUpdated(Task),
    TaskDeleted(TaskDeleted),
    State(StateChange),
    Phase(PhaseUpdate),
    Tokens(TokenUpdate),
    DecisionRequired(DecisionRequired),
    DecisionResolved(DecisionResolved),
    SessionUpdate(SessionUpdate),
    Error(ErrorData),
    Complete(CompleteData),
    Heartbeat,
}

impl EventPayload {
    /// Wire name of the event kind
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::TaskCreated(_) => "task_created",
            EventPayload::TaskUpdated(_) => "task_updated",
            EventPayload::TaskDeleted(_) => "task_deleted",
            EventPayload::State(_) => "state",
            EventPayload::Phase(_) => "phase",
            EventPayload::Tokens(_) => "tokens",
            EventPayload::DecisionRequired(_) => "decision_required",
            EventPayload::DecisionResolved(_) => "decision_resolved",
            EventPayload::SessionUpdate(_) => "session_update",
            EventPayload::Error(_) => "error",
            EventPayload::Complete(_) => "complete",
            EventPayload::Heartbeat => "heartbeat",
        }
    }
}

/// An immutable state-change announcement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub task_id: String,
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(task_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            task_id: task_id.into(),
            time: Utc::now(),
            payload,
        }
    }

    /// Event not scoped to a task
    pub fn global(payload: EventPayload) -> Self {
        Self::new(GLOBAL_TASK_ID, payload)
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn is_global(&self) -> bool {
        is_global(&self.task_id)
    }

    /// Payload body without its type tag
    pub fn data(&self) -> serde_json::Value {
        match serde_json::to_value(&self.payload) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("data").unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let event = Event::new(
            "TASK-001",
            EventPayload::TaskDeleted(TaskDeleted {
                task_id: "TASK-001".into(),
            }),
        );
        assert_eq!(event.event_type(), "task_deleted");
        assert!(!event.is_global());
        assert_eq!(Event::global(EventPayload::Heartbeat).event_type(), "heartbeat");
    }

    #[test]
    fn test_global_detection() {
        assert!(is_global(""));
        assert!(is_global("*"));
        assert!(!is_global("TASK-001"));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = Event::new(
            "TASK-001",
            EventPayload::Phase(PhaseUpdate {
                phase: "implement".into(),
                status: PhaseStatus::Completed,
                iteration: 2,
                commit_sha: Some("abc123".into()),
                error: None,
            }),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "phase");
        assert_eq!(json["task_id"], "TASK-001");
        assert_eq!(json["data"]["status"], "completed");
        assert_eq!(json["data"]["iteration"], 2);
    }

    #[test]
    fn test_event_data_strips_tag() {
        let event = Event::new(
            "TASK-001",
            EventPayload::Error(ErrorData {
                phase: Some("review".into()),
                message: "agent crashed".into(),
                fatal: true,
            }),
        );
        let data = event.data();
        assert_eq!(data["message"], "agent crashed");
        assert!(data.get("type").is_none());
        assert_eq!(Event::global(EventPayload::Heartbeat).data(), serde_json::Value::Null);
    }
}
