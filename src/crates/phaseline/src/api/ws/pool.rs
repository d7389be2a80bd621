//! WebSocket connection table
//!
//! Tracks live connections, the key each one is subscribed to and per-client
//! delivery counters.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Default maximum concurrent connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Connection pool entry
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub client_id: String,
    /// Unix timestamp of the upgrade
    pub connected_at: i64,
    /// Task ID or `*` the client currently follows
    pub subscription: Option<String>,
    pub messages_sent: Arc<AtomicU64>,
    /// Messages dropped because the outbound buffer was full
    pub messages_dropped: Arc<AtomicU64>,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub max_connections: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

/// Live WebSocket connections
pub struct ConnectionPool {
    connections: DashMap<String, PoolEntry>,
    max_connections: usize,
    total_created: AtomicU64,
}

impl ConnectionPool {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_connections,
            total_created: AtomicU64::new(0),
        }
    }

    /// Register a new connection and return its client ID
    pub fn connect(&self) -> Result<String, String> {
        if self.connections.len() >= self.max_connections {
            return Err(format!(
                "Connection limit reached: {} connections",
                self.max_connections
            ));
        }

        let client_id = Uuid::new_v4().to_string();
        let entry = PoolEntry {
            client_id: client_id.clone(),
            connected_at: chrono::Utc::now().timestamp(),
            subscription: None,
            messages_sent: Arc::new(AtomicU64::new(0)),
            messages_dropped: Arc::new(AtomicU64::new(0)),
        };
        self.connections.insert(client_id.clone(), entry);
        self.total_created.fetch_add(1, Ordering::Relaxed);
        Ok(client_id)
    }

    pub fn disconnect(&self, client_id: &str) -> Option<PoolEntry> {
        self.connections.remove(client_id).map(|(_, entry)| entry)
    }

    pub fn set_subscription(&self, client_id: &str, task_id: Option<String>) {
        if let Some(mut entry) = self.connections.get_mut(client_id) {
            entry.subscription = task_id;
        }
    }

    pub fn record_sent(&self, client_id: &str) {
        if let Some(entry) = self.connections.get(client_id) {
            entry.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dropped(&self, client_id: &str) {
        if let Some(entry) = self.connections.get(client_id) {
            entry.messages_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_connection(&self, client_id: &str) -> Option<PoolEntry> {
        self.connections.get(client_id).map(|entry| entry.clone())
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Connections currently subscribed to `task_id`
    pub fn subscribers(&self, task_id: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.subscription.as_deref() == Some(task_id))
            .count()
    }

    pub fn stats(&self) -> PoolStats {
        let (sent, dropped) = self.connections.iter().fold((0, 0), |(sent, dropped), entry| {
            (
                sent + entry.messages_sent.load(Ordering::Relaxed),
                dropped + entry.messages_dropped.load(Ordering::Relaxed),
            )
        });
        PoolStats {
            active_connections: self.connections.len(),
            total_connections: self.total_created.load(Ordering::Relaxed),
            max_connections: self.max_connections,
            messages_sent: sent,
            messages_dropped: dropped,
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_and_disconnect() {
        let pool = ConnectionPool::new(10);
        let client = pool.connect().unwrap();
        assert_eq!(pool.active_connections(), 1);
        assert!(pool.get_connection(&client).is_some());

        assert!(pool.disconnect(&client).is_some());
        assert!(pool.disconnect(&client).is_none());
        assert_eq!(pool.active_connections(), 0);
        assert_eq!(pool.stats().total_connections, 1);
    }

    #[test]
    fn test_connection_limit() {
        let pool = ConnectionPool::new(1);
        pool.connect().unwrap();
        assert!(pool.connect().is_err());
    }

    #[test]
    fn test_subscription_tracking() {
        let pool = ConnectionPool::default();
        let a = pool.connect().unwrap();
        let b = pool.connect().unwrap();
        pool.set_subscription(&a, Some("TASK-001".into()));
        pool.set_subscription(&b, Some("*".into()));
        assert_eq!(pool.subscribers("TASK-001"), 1);

        pool.set_subscription(&a, None);
        assert_eq!(pool.subscribers("TASK-001"), 0);
    }

    #[test]
    fn test_counters() {
        let pool = ConnectionPool::default();
        let client = pool.connect().unwrap();
        pool.record_sent(&client);
        pool.record_sent(&client);
        pool.record_dropped(&client);
        let stats = pool.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 1);
    }
}
