//! Session metrics broadcaster
//!
//! Tracks aggregate activity of the server process: how long the session
//! has been up, how many tasks are running, whether execution is paused and
//! today's token and cost totals. Every lifecycle hook pushes a fresh
//! `session_update` to the global subscription; a background ticker refreshes
//! the time-dependent fields while tasks are running.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::EventPublisher;
use crate::storage::{UsageStore, UsageTotals};

/// Default interval of background snapshots
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Snapshot of session activity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
    pub tasks_running: u32,
    pub is_paused: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    running: u32,
    paused: bool,
}

pub struct SessionBroadcaster {
    session_id: String,
    started_at: DateTime<Utc>,
    events: EventPublisher,
    usage: Option<Arc<dyn UsageStore>>,
    tick_interval: Duration,
    state: Mutex<SessionState>,
    shutdown: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionBroadcaster {
    /// Create a broadcaster; `usage` may be absent, in which case tokens and cost read zero
    pub fn new(events: EventPublisher, usage: Option<Arc<dyn UsageStore>>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            events,
            usage,
            tick_interval: DEFAULT_TICK_INTERVAL,
            state: Mutex::new(SessionState::default()),
            shutdown: CancellationToken::new(),
            ticker: Mutex::new(None),
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn running_tasks(&self) -> u32 {
        self.state.lock().running
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// A task began executing
    pub async fn on_task_start(&self) {
        let totals = self.usage_totals().await;
        let mut state = self.state.lock();
        state.running += 1;
        debug!(tasks_running = state.running, "task started");
        self.events.session(self.snapshot(&state, totals));
    }

    /// A task stopped executing; the counter never drops below zero
    pub async fn on_task_complete(&self) {
        let totals = self.usage_totals().await;
        let mut state = self.state.lock();
        if state.running == 0 {
            warn!("task completion reported with no running tasks");
        }
        state.running = state.running.saturating_sub(1);
        debug!(tasks_running = state.running, "task finished");
        self.events.session(self.snapshot(&state, totals));
    }

    pub async fn on_pause_changed(&self, paused: bool) {
        let totals = self.usage_totals().await;
        let mut state = self.state.lock();
        state.paused = paused;
        self.events.session(self.snapshot(&state, totals));
    }

    /// Compute the current snapshot without publishing it
    pub async fn current_metrics(&self) -> SessionUpdate {
        let totals = self.usage_totals().await;
        let state = self.state.lock();
        self.snapshot(&state, totals)
    }

    /// Publish the current snapshot to global subscribers
    pub async fn publish_now(&self) {
        let totals = self.usage_totals().await;
        let state = self.state.lock();
        self.events.session(self.snapshot(&state, totals));
    }

    /// Spawn the background ticker; calling again while it runs is a no-op
    pub fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let this = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let period = self.tick_interval;
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if this.running_tasks() > 0 {
                            this.publish_now().await;
                        }
                    }
                }
            }
            debug!("session ticker stopped");
        }));
        info!(session_id = %self.session_id, interval = ?period, "session broadcaster started");
    }

    /// Stop the ticker; safe to call more than once
    pub fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
            info!(session_id = %self.session_id, "session broadcaster stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn usage_totals(&self) -> UsageTotals {
        let Some(usage) = &self.usage else {
            return UsageTotals::default();
        };
        match usage.usage_since(start_of_day(Utc::now())).await {
            Ok(totals) => totals,
            Err(e) => {
                warn!(error = %e, "usage store unavailable, reporting zero tokens");
                UsageTotals::default()
            }
        }
    }

    fn snapshot(&self, state: &SessionState, totals: UsageTotals) -> SessionUpdate {
        SessionUpdate {
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            duration_seconds: (Utc::now() - self.started_at).num_seconds().max(0),
            total_tokens: totals.total_tokens(),
            input_tokens: totals.input_tokens,
            output_tokens: totals.output_tokens,
            estimated_cost_usd: totals.cost_usd,
            tasks_running: state.running,
            is_paused: state.paused,
        }
    }
}

impl Drop for SessionBroadcaster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or(now)
}
