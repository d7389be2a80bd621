//! WebSocket streaming of bus events and task commands

pub mod handler;
pub mod pool;

pub use handler::{ws_handler, ClientMessage, ServerMessage, OUTBOUND_BUFFER};
pub use pool::{ConnectionPool, PoolEntry, PoolStats};
