//! Server-Sent Events stream of bus events
//!
//! GET /api/events?task_id=<id> follows one task; without `task_id` the stream
//! follows the global key and carries every event.

use axum::{
    extract::{Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::api::routes::AppState;
use crate::api::ws::ServerMessage;
use crate::events::{Publisher, SubscriptionId, GLOBAL_TASK_ID};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventStreamQuery {
    pub task_id: Option<String>,
}

/// Releases the bus subscription when the client goes away
struct StreamGuard {
    events: Arc<dyn Publisher>,
    task_id: String,
    id: SubscriptionId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.events.unsubscribe(&self.task_id, self.id);
        debug!(task_id = %self.task_id, "event stream closed");
    }
}

/// GET /api/events
pub async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, axum::Error>>> {
    let task_id = query
        .task_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| GLOBAL_TASK_ID.to_string());
    let subscription = state.events.subscribe(&task_id);
    let guard = StreamGuard {
        events: state.events.clone(),
        id: subscription.id(),
        task_id,
    };
    debug!(task_id = %guard.task_id, "event stream opened");

    let stream = subscription.into_stream().map(move |event| {
        let _guard = &guard;
        SseEvent::default()
            .event(event.event_type())
            .json_data(ServerMessage::from_event(&event))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
