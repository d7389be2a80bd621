//! In-memory publisher
//!
//! Each subscriber owns a bounded mpsc channel. Publishing never waits on a
//! subscriber: when a channel is full the event is dropped for that subscriber
//! only. Subscribers of [`GLOBAL_TASK_ID`] see global events and every
//! task-scoped event.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{is_global, Event, GLOBAL_TASK_ID};

/// Default per-subscriber channel capacity
pub const DEFAULT_BUFFER_SIZE: usize = 100;

pub type SubscriptionId = u64;

/// Pub/sub contract shared by the state machine, gate store and session broadcaster
pub trait Publisher: Send + Sync {
    /// Deliver an event to every matching subscriber without blocking
    fn publish(&self, event: Event);

    /// Register a new bounded subscription for a task ID or [`GLOBAL_TASK_ID`]
    fn subscribe(&self, task_id: &str) -> Subscription;

    /// Remove a subscription; unknown or repeated IDs are ignored
    fn unsubscribe(&self, task_id: &str, id: SubscriptionId);

    /// Release every subscriber channel
    fn close(&self);
}

/// Receiving side of a subscription
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    task_id: String,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    fn closed(id: SubscriptionId, task_id: &str) -> Self {
        let (_, rx) = mpsc::channel(1);
        Self {
            id,
            task_id: task_id.to_string(),
            rx,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the next event; `None` once the subscription is released
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<Event> {
        ReceiverStream::new(self.rx)
    }
}

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct BusState {
    closed: bool,
    subscribers: HashMap<String, Vec<Subscriber>>,
}

/// Bounded fan-out event bus
pub struct EventBus {
    buffer_size: usize,
    next_id: AtomicU64,
    dropped: AtomicU64,
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Create a bus whose subscriber channels hold `buffer_size` events
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            state: Mutex::new(BusState::default()),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of live subscriptions for a key
    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(task_id)
            .map_or(0, Vec::len)
    }

    /// Number of keys with at least one subscription
    pub fn task_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Events dropped because a subscriber channel was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn deliver(&self, subscribers: &mut Vec<Subscriber>, key: &str, event: &Event) {
        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key,
                    subscription = sub.id,
                    event_type = event.event_type(),
                    "subscriber buffer full, dropping event"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(key, subscription = sub.id, "pruning dropped subscriber");
                false
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for EventBus {
    fn publish(&self, event: Event) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }

        if !is_global(&event.task_id) {
            if let Some(subs) = state.subscribers.get_mut(&event.task_id) {
                self.deliver(subs, &event.task_id, &event);
                if subs.is_empty() {
                    state.subscribers.remove(&event.task_id);
                }
            }
        }
        if let Some(subs) = state.subscribers.get_mut(GLOBAL_TASK_ID) {
            self.deliver(subs, GLOBAL_TASK_ID, &event);
            if subs.is_empty() {
                state.subscribers.remove(GLOBAL_TASK_ID);
            }
        }
    }

    fn subscribe(&self, task_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = if is_global(task_id) {
            GLOBAL_TASK_ID
        } else {
            task_id
        };

        let mut state = self.state.lock();
        if state.closed {
            return Subscription::closed(id, key);
        }

        let (tx, rx) = mpsc::channel(self.buffer_size);
        state
            .subscribers
            .entry(key.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        debug!(key, subscription = id, "subscribed");

        Subscription {
            id,
            task_id: key.to_string(),
            rx,
        }
    }

    fn unsubscribe(&self, task_id: &str, id: SubscriptionId) {
        let key = if is_global(task_id) {
            GLOBAL_TASK_ID
        } else {
            task_id
        };

        let mut state = self.state.lock();
        if let Some(subs) = state.subscribers.get_mut(key) {
            subs.retain(|sub| sub.id != id);
            if subs.is_empty() {
                state.subscribers.remove(key);
            }
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }
}

/// Publisher that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NopPublisher;

impl Publisher for NopPublisher {
    fn publish(&self, _event: Event) {}

    fn subscribe(&self, task_id: &str) -> Subscription {
        Subscription::closed(0, task_id)
    }

    fn unsubscribe(&self, _task_id: &str, _id: SubscriptionId) {}

    fn close(&self) {}
}
