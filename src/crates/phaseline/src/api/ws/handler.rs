//! WebSocket endpoint
//!
//! One connection follows at most one subscription key at a time. Client
//! messages:
//!
//! ```json
//! {"type":"subscribe","task_id":"TASK-001"}
//! {"type":"unsubscribe"}
//! {"type":"command","task_id":"TASK-001","action":"pause"}
//! {"type":"ping"}
//! ```
//!
//! Bus events are forwarded as `{"type":"event","event","task_id","data","time"}`.
//! Outbound messages go through a bounded per-connection buffer; when the
//! client cannot keep up, messages are dropped rather than stalling the bus.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pool::ConnectionPool;
use crate::api::routes::AppState;
use crate::events::{Event, Subscription, SubscriptionId, GLOBAL_TASK_ID};

/// Capacity of each connection's outbound buffer
pub const OUTBOUND_BUFFER: usize = 256;

/// Interval between protocol-level pings
const PING_INTERVAL: Duration = Duration::from_secs(54);

/// Messages accepted from clients
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default)]
        task_id: String,
    },
    Unsubscribe,
    Command {
        #[serde(default)]
        task_id: String,
        #[serde(default)]
        action: String,
    },
    Ping,
}

/// Messages sent to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        task_id: String,
    },
    Unsubscribed {
        task_id: Option<String>,
    },
    Event {
        event: String,
        task_id: String,
        data: Value,
        time: DateTime<Utc>,
    },
    CommandResult {
        task_id: String,
        action: String,
        status: String,
    },
    Pong,
    Error {
        error: String,
    },
}

impl ServerMessage {
    pub fn from_event(event: &Event) -> Self {
        ServerMessage::Event {
            event: event.event_type().to_string(),
            task_id: event.task_id.clone(),
            data: event.data(),
            time: event.time,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: message.into(),
        }
    }
}

/// Parse a client frame, naming the offending type when it is unknown
pub fn parse_client_message(text: &str) -> Result<ClientMessage, String> {
    let value: Value =
        serde_json::from_str(text).map_err(|_| "invalid message format".to_string())?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| "invalid message format".to_string())?;
    serde_json::from_value(value).map_err(|_| format!("unknown message type: {}", kind))
}

/// Queues serialized messages onto a connection's outbound buffer
#[derive(Clone)]
struct Outbound {
    client_id: String,
    tx: mpsc::Sender<String>,
    pool: Arc<ConnectionPool>,
}

impl Outbound {
    fn send(&self, message: &ServerMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "failed to encode websocket message");
                return;
            }
        };
        match self.tx.try_send(text) {
            Ok(()) => self.pool.record_sent(&self.client_id),
            Err(TrySendError::Full(_)) => {
                self.pool.record_dropped(&self.client_id);
                warn!(client_id = %self.client_id, "websocket send buffer full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

struct ActiveSubscription {
    task_id: String,
    id: SubscriptionId,
    forwarder: JoinHandle<()>,
}

/// Per-connection protocol state
struct WsSession {
    state: AppState,
    outbound: Outbound,
    subscription: Option<ActiveSubscription>,
}

impl WsSession {
    async fn handle_text(&mut self, text: &str) {
        match parse_client_message(text) {
            Ok(ClientMessage::Subscribe { task_id }) => self.subscribe(task_id).await,
            Ok(ClientMessage::Unsubscribe) => {
                let task_id = self.unsubscribe();
                self.outbound.send(&ServerMessage::Unsubscribed { task_id });
            }
            Ok(ClientMessage::Command { task_id, action }) => self.command(task_id, action).await,
            Ok(ClientMessage::Ping) => self.outbound.send(&ServerMessage::Pong),
            Err(message) => self.outbound.send(&ServerMessage::error(message)),
        }
    }

    async fn subscribe(&mut self, task_id: String) {
        if task_id.is_empty() {
            self.outbound.send(&ServerMessage::error(
                "task_id required for subscribe (use \"*\" for all tasks)",
            ));
            return;
        }

        self.unsubscribe();
        let subscription = self.state.events.subscribe(&task_id);
        let id = subscription.id();
        self.state
            .connections
            .set_subscription(&self.outbound.client_id, Some(task_id.clone()));

        // The subscription buffers events until the forwarder starts, so the
        // acknowledgement always precedes them
        self.outbound.send(&ServerMessage::Subscribed {
            task_id: task_id.clone(),
        });
        if task_id == GLOBAL_TASK_ID {
            if let Some(session) = self.state.engine.session() {
                let metrics = session.current_metrics().await;
                self.outbound.send(&ServerMessage::Event {
                    event: "session_update".to_string(),
                    task_id: GLOBAL_TASK_ID.to_string(),
                    data: serde_json::to_value(metrics).unwrap_or(Value::Null),
                    time: Utc::now(),
                });
            }
        }
        debug!(client_id = %self.outbound.client_id, task_id = %task_id, "websocket subscribed");

        let forwarder = tokio::spawn(forward_events(subscription, self.outbound.clone()));
        self.subscription = Some(ActiveSubscription {
            task_id,
            id,
            forwarder,
        });
    }

    /// Drop the current subscription, returning its key
    fn unsubscribe(&mut self) -> Option<String> {
        let active = self.subscription.take()?;
        active.forwarder.abort();
        self.state.events.unsubscribe(&active.task_id, active.id);
        self.state
            .connections
            .set_subscription(&self.outbound.client_id, None);
        debug!(client_id = %self.outbound.client_id, task_id = %active.task_id, "websocket unsubscribed");
        Some(active.task_id)
    }

    async fn command(&mut self, task_id: String, action: String) {
        if task_id.is_empty() {
            self.outbound
                .send(&ServerMessage::error("task_id required for command"));
            return;
        }

        let engine = &self.state.engine;
        let result = match action.as_str() {
            "pause" => engine.pause(&task_id).await.map(|_| "paused"),
            "resume" => engine.resume(&task_id).await.map(|_| "resumed"),
            "cancel" => engine.cancel(&task_id).await.map(|_| "cancelled"),
            other => {
                self.outbound
                    .send(&ServerMessage::error(format!("unknown action: {}", other)));
                return;
            }
        };

        match result {
            Ok(status) => self.outbound.send(&ServerMessage::CommandResult {
                task_id,
                action,
                status: status.to_string(),
            }),
            Err(e) => self.outbound.send(&ServerMessage::error(e.to_string())),
        }
    }
}

async fn forward_events(mut subscription: Subscription, outbound: Outbound) {
    while let Some(event) = subscription.recv().await {
        outbound.send(&ServerMessage::from_event(&event));
    }
}

/// WebSocket upgrade handler
///
/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let client_id = match state.connections.connect() {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "rejecting websocket connection");
            return (StatusCode::SERVICE_UNAVAILABLE, e).into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, client_id: String) {
    info!(client_id = %client_id, "websocket connected");
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + PING_INTERVAL;
        let mut ping = tokio::time::interval_at(start, PING_INTERVAL);
        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(text) = message else { break };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    let mut session = WsSession {
        outbound: Outbound {
            client_id: client_id.clone(),
            tx,
            pool: state.connections.clone(),
        },
        state,
        subscription: None,
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => session.handle_text(&text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "websocket read error");
                break;
            }
        }
    }

    session.unsubscribe();
    session.state.connections.disconnect(&client_id);
    drop(session);
    writer.abort();
    info!(client_id = %client_id, "websocket disconnected");
}
