//! HTTP and WebSocket API
//!
//! REST endpoints for tasks, decisions, workflows, session metrics and
//! projects, plus two live feeds of bus events: a WebSocket endpoint that
//! also accepts task commands, and a Server-Sent Events stream.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod ws;

pub use error::{ApiError, ApiErrorResponse, ApiResult};
pub use routes::{create_router, AppState};
pub use ws::{ClientMessage, ConnectionPool, ServerMessage};
