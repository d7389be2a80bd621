#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use phaseline::api::{create_router, AppState};
use phaseline::engine::{PhaseOutcome, PhaseRequest, PhaseRunner};
use phaseline::events::Subscription;
use phaseline::storage::{MemoryStore, TaskStore, UsageStore};
use phaseline::task::TaskStatus;
use phaseline::workflow::{Workflow, WorkflowPhase};
use phaseline::{
    Event, EventBus, EventPublisher, GateType, OrchestratorError, Publisher, SessionBroadcaster,
    TaskEngine, WorkflowRegistry,
};

/// Phase runner driven by per-phase scripts
///
/// Phases without a script succeed with output "done".
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Result<PhaseOutcome, String>>>>,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<PhaseRequest>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, phase: &str, results: Vec<Result<PhaseOutcome, String>>) {
        self.scripts
            .lock()
            .entry(phase.to_string())
            .or_default()
            .extend(results);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<PhaseRequest> {
        self.calls.lock().clone()
    }

    pub fn phases_run(&self) -> Vec<String> {
        self.calls.lock().iter().map(|r| r.phase.clone()).collect()
    }
}

#[async_trait]
impl PhaseRunner for ScriptedRunner {
    async fn run_phase(
        &self,
        request: &PhaseRequest,
        cancel: &CancellationToken,
    ) -> phaseline::Result<PhaseOutcome> {
        self.calls.lock().push(request.clone());
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(OrchestratorError::ExecutionFailed("cancelled".into()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let next = self
            .scripts
            .lock()
            .get_mut(&request.phase)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(OrchestratorError::ExecutionFailed(message)),
            None => Ok(PhaseOutcome::new("done")),
        }
    }
}

pub struct Harness {
    pub engine: TaskEngine,
    pub bus: Arc<EventBus>,
    pub store: Arc<MemoryStore>,
    pub runner: Arc<ScriptedRunner>,
    pub workflows: Arc<WorkflowRegistry>,
    pub session: Arc<SessionBroadcaster>,
}

impl Harness {
    pub fn new() -> Self {
        let bus = Arc::new(EventBus::with_buffer_size(256));
        let publisher: Arc<dyn Publisher> = bus.clone();
        let events = EventPublisher::new(publisher);
        let store = Arc::new(MemoryStore::new());
        let runner = ScriptedRunner::new();
        let workflows = Arc::new(WorkflowRegistry::with_builtins().unwrap());
        for workflow in test_workflows() {
            workflows.create(workflow).unwrap();
        }
        let usage: Arc<dyn UsageStore> = store.clone();
        let session = Arc::new(SessionBroadcaster::new(events.clone(), Some(usage.clone())));
        let task_store: Arc<dyn TaskStore> = store.clone();
        let engine = TaskEngine::builder(task_store, workflows.clone(), runner.clone())
            .events(events)
            .usage(usage)
            .session(session.clone())
            .build();

        Self {
            engine,
            bus,
            store,
            runner,
            workflows,
            session,
        }
    }

    pub fn subscribe(&self, task_id: &str) -> Subscription {
        self.bus.subscribe(task_id)
    }

    /// Wait until the task reaches `status` and its driver has exited
    pub async fn wait_settled(&self, task_id: &str, status: TaskStatus) {
        let engine = self.engine.clone();
        let id = task_id.to_string();
        wait_until(move || {
            let engine = engine.clone();
            let id = id.clone();
            async move {
                let task = engine.get(&id).await.unwrap();
                task.status == status && !engine.is_executing(&id)
            }
        })
        .await;
    }

    /// Serve the API on an ephemeral local port, returning its address
    pub async fn serve(&self) -> SocketAddr {
        self.serve_with(|state| state).await
    }

    pub async fn serve_with<F>(&self, configure: F) -> SocketAddr
    where
        F: FnOnce(AppState) -> AppState,
    {
        let events: Arc<dyn Publisher> = self.bus.clone();
        let state = configure(AppState::new(self.engine.clone(), events));
        let app = create_router(state, &[]);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        addr
    }

    /// Wait until the task reaches `status`, driver still live or not
    pub async fn wait_status(&self, task_id: &str, status: TaskStatus) {
        let engine = self.engine.clone();
        let id = task_id.to_string();
        wait_until(move || {
            let engine = engine.clone();
            let id = id.clone();
            async move { engine.get(&id).await.unwrap().status == status }
        })
        .await;
    }
}

/// Workflows registered on top of the built-ins
pub fn test_workflows() -> Vec<Workflow> {
    vec![
        Workflow::new("two-step", "Two step")
            .with_phase(WorkflowPhase::new("plan", 1).with_gate(GateType::Skip))
            .with_phase(
                WorkflowPhase::new("build", 2)
                    .depends_on("plan")
                    .with_gate(GateType::Skip),
            ),
        Workflow::new("gated", "Gated")
            .with_phase(WorkflowPhase::new("build", 1).with_gate(GateType::Skip))
            .with_phase(
                WorkflowPhase::new("review", 2)
                    .depends_on("build")
                    .with_gate(GateType::Human),
            ),
        Workflow::new("retrying", "Retrying")
            .with_phase(
                WorkflowPhase::new("build", 1)
                    .with_gate(GateType::Skip)
                    .with_max_iterations(3),
            ),
    ]
}

/// Poll `check` until it returns true, panicking after five seconds
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive events until one matches, panicking after five seconds
pub async fn next_matching<F>(subscription: &mut Subscription, mut matches: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = subscription.recv().await {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;
    match result {
        Ok(Some(event)) => event,
        Ok(None) => panic!("subscription closed before a matching event"),
        Err(_) => panic!("no matching event within 5s"),
    }
}
