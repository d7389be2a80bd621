//! Task state machine
//!
//! [`TaskEngine`] owns the lifecycle operations of tasks: create, run, pause,
//! resume, cancel, delete and decision resolution. Each running task is
//! driven by its own tokio task (see [`driver`]); the engine itself is a
//! cheap handle that can be cloned into API state.

mod driver;
pub mod records;
pub mod registry;
pub mod runner;

pub use records::TaskRecords;
pub use registry::{ExecutionHandle, ExecutionRegistry};
pub use runner::{CommandRunner, PhaseOutcome, PhaseRequest, PhaseRunner};

use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

use crate::config::WeightsConfig;
use crate::events::EventPublisher;
use crate::gate::{DecisionStore, PendingDecision, Resolution, ResolveOutcome};
use crate::session::SessionBroadcaster;
use crate::storage::{TaskStore, UsageStore};
use crate::task::{assign_workflow, Task, TaskStatus, TaskWeight};
use crate::workflow::{ResolvedPhase, Workflow, WorkflowRegistry};
use crate::{OrchestratorError, Result};
use driver::PhaseDriver;

/// Parameters of a new task
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub weight: Option<TaskWeight>,
    /// Unset picks the weight's workflow, an empty string opts out
    #[serde(default)]
    pub workflow_id: Option<String>,
}

impl CreateTaskRequest {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_weight(mut self, weight: TaskWeight) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }
}

/// Builder for [`TaskEngine`]
pub struct TaskEngineBuilder {
    store: Arc<dyn TaskStore>,
    workflows: Arc<WorkflowRegistry>,
    runner: Arc<dyn PhaseRunner>,
    events: EventPublisher,
    usage: Option<Arc<dyn UsageStore>>,
    session: Option<Arc<SessionBroadcaster>>,
    weights: WeightsConfig,
}

impl TaskEngineBuilder {
    pub fn events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn usage(mut self, usage: Arc<dyn UsageStore>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn session(mut self, session: Arc<SessionBroadcaster>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn weights(mut self, weights: WeightsConfig) -> Self {
        self.weights = weights;
        self
    }

    pub fn build(self) -> TaskEngine {
        let registry = Arc::new(ExecutionRegistry::new());
        TaskEngine {
            records: Arc::new(TaskRecords::new(
                self.store.clone(),
                registry.clone(),
                self.events.clone(),
            )),
            decisions: Arc::new(DecisionStore::new(self.events.clone())),
            store: self.store,
            registry,
            workflows: self.workflows,
            runner: self.runner,
            events: self.events,
            usage: self.usage,
            session: self.session,
            weights: Arc::new(self.weights),
        }
    }
}

/// Task lifecycle coordinator
#[derive(Clone)]
pub struct TaskEngine {
    store: Arc<dyn TaskStore>,
    records: Arc<TaskRecords>,
    registry: Arc<ExecutionRegistry>,
    decisions: Arc<DecisionStore>,
    workflows: Arc<WorkflowRegistry>,
    runner: Arc<dyn PhaseRunner>,
    events: EventPublisher,
    usage: Option<Arc<dyn UsageStore>>,
    session: Option<Arc<SessionBroadcaster>>,
    weights: Arc<WeightsConfig>,
}

impl TaskEngine {
    pub fn builder(
        store: Arc<dyn TaskStore>,
        workflows: Arc<WorkflowRegistry>,
        runner: Arc<dyn PhaseRunner>,
    ) -> TaskEngineBuilder {
        TaskEngineBuilder {
            store,
            workflows,
            runner,
            events: EventPublisher::none(),
            usage: None,
            session: None,
            weights: WeightsConfig::default(),
        }
    }

    pub fn decisions(&self) -> &Arc<DecisionStore> {
        &self.decisions
    }

    pub fn workflows(&self) -> &Arc<WorkflowRegistry> {
        &self.workflows
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn session(&self) -> Option<&Arc<SessionBroadcaster>> {
        self.session.as_ref()
    }

    /// Whether a driver currently owns the task
    pub fn is_executing(&self, task_id: &str) -> bool {
        self.registry.contains(task_id)
    }

    pub fn executing_count(&self) -> usize {
        self.registry.len()
    }

    /// Create and persist a task
    pub async fn create(&self, request: CreateTaskRequest) -> Result<Task> {
        let title = request.title.trim();
        if title.is_empty() {
            return Err(OrchestratorError::Validation("title is required".into()));
        }
        if let Some(workflow_id) = request.workflow_id.as_deref().filter(|id| !id.is_empty()) {
            if !self.workflows.contains(workflow_id) {
                return Err(OrchestratorError::Validation(format!(
                    "unknown workflow: {}",
                    workflow_id
                )));
            }
        }

        let id = self.store.next_task_id().await?;
        let mut task = Task::new(id, title);
        task.description = request.description;
        task.weight = request.weight;
        task.workflow_id = assign_workflow(request.workflow_id, request.weight, &self.weights);

        self.store.save_task(&task).await?;
        info!(task_id = %task.id, workflow_id = ?task.workflow_id, "task created");
        self.events.task_created(&task);
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.records.load(task_id).await
    }

    /// All tasks, oldest first, optionally filtered by status
    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let tasks = self.store.list_tasks().await?;
        Ok(tasks
            .into_iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .collect())
    }

    /// Start executing a created or planned task
    pub async fn run(&self, task_id: &str) -> Result<Task> {
        let task = self.records.load(task_id).await?;
        check_runnable(&task)?;
        let (workflow, phases) = self.resolve_workflow(&task)?;

        let handle = self.records.claim(task_id, check_runnable).await?;
        self.start(handle, workflow, phases, task.status).await
    }

    /// Suspend a running task at its next checkpoint
    pub async fn pause(&self, task_id: &str) -> Result<Task> {
        let Some(handle) = self.registry.get(task_id) else {
            let task = self.records.load(task_id).await?;
            return Err(OrchestratorError::invalid_transition(&task, "pause"));
        };

        let task = self
            .records
            .update(task_id, |task| {
                if task.status != TaskStatus::Running {
                    return Err(OrchestratorError::invalid_transition(task, "pause"));
                }
                task.set_status(TaskStatus::Paused);
                Ok(())
            })
            .await?;
        handle.set_paused(true);

        info!(task_id, "task paused");
        self.events.state(&task, Some(TaskStatus::Running));
        self.publish_pause_state().await;
        Ok(task)
    }

    /// Continue a paused task, restarting its driver if none is live
    pub async fn resume(&self, task_id: &str) -> Result<Task> {
        if let Some(handle) = self.registry.get(task_id) {
            let task = self
                .records
                .update(task_id, |task| {
                    if task.status != TaskStatus::Paused {
                        return Err(OrchestratorError::invalid_transition(task, "resume"));
                    }
                    task.set_status(TaskStatus::Running);
                    Ok(())
                })
                .await?;
            handle.set_paused(false);

            info!(task_id, "task resumed");
            self.events.state(&task, Some(TaskStatus::Paused));
            self.publish_pause_state().await;
            return Ok(task);
        }

        let task = self.records.load(task_id).await?;
        check_resumable(&task)?;
        let (workflow, phases) = self.resolve_workflow(&task)?;
        let handle = self.records.claim(task_id, check_resumable).await?;
        info!(task_id, "restarting driver for paused task");
        self.start(handle, workflow, phases, TaskStatus::Paused).await
    }

    /// Cancel a task in any non-terminal status
    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        let mut previous = None;
        let task = self
            .records
            .update(task_id, |task| {
                if task.status.is_terminal() {
                    return Err(OrchestratorError::invalid_transition(task, "cancel"));
                }
                previous = Some(task.status);
                task.set_status(TaskStatus::Cancelled);
                Ok(())
            })
            .await?;

        self.decisions.discard_for_task(task_id);
        if let Some(handle) = self.registry.get(task_id) {
            handle.cancel();
        }

        info!(task_id, "task cancelled");
        self.events.state(&task, previous);
        Ok(task)
    }

    /// Remove a task that is not executing
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        self.records
            .remove(task_id, |task| {
                if task.status == TaskStatus::Running {
                    return Err(OrchestratorError::invalid_transition(task, "delete"));
                }
                Ok(())
            })
            .await?;

        self.decisions.discard_for_task(task_id);
        info!(task_id, "task deleted");
        self.events.task_deleted(task_id);
        Ok(())
    }

    /// Approve or reject a pending decision
    pub async fn resolve_decision(
        &self,
        decision_id: &str,
        resolution: Resolution,
    ) -> Result<ResolveOutcome> {
        self.decisions
            .resolve(decision_id, resolution, self.records.as_ref())
            .await
    }

    pub fn pending_decisions(&self, task_id: Option<&str>) -> Vec<PendingDecision> {
        self.decisions.list(task_id)
    }

    fn resolve_workflow(&self, task: &Task) -> Result<(Arc<Workflow>, Vec<ResolvedPhase>)> {
        let workflow_id = task.effective_workflow().ok_or_else(|| {
            OrchestratorError::Validation(format!("task {} has no workflow assigned", task.id))
        })?;
        let workflow = self.workflows.get(workflow_id).map_err(|_| {
            OrchestratorError::Validation(format!(
                "task {} references unknown workflow {}",
                task.id, workflow_id
            ))
        })?;
        let phases = self.workflows.resolve_phases(&workflow);
        if phases.is_empty() {
            return Err(OrchestratorError::InvalidWorkflow(format!(
                "workflow {} has no phases",
                workflow.id
            )));
        }
        Ok((workflow, phases))
    }

    /// Mark a claimed task running and spawn its driver
    async fn start(
        &self,
        handle: Arc<ExecutionHandle>,
        workflow: Arc<Workflow>,
        phases: Vec<ResolvedPhase>,
        from: TaskStatus,
    ) -> Result<Task> {
        let task_id = handle.task_id().to_string();
        let started = self
            .records
            .update(&task_id, |task| {
                // A cancel may land between claiming the slot and getting here
                if task.status == TaskStatus::Cancelled {
                    return Err(OrchestratorError::invalid_transition(task, "run"));
                }
                if let Some(next) = phases.iter().find(|p| !task.phase_status(&p.name).is_done()) {
                    task.current_phase = Some(next.name.clone());
                }
                task.error = None;
                task.set_status(TaskStatus::Running);
                Ok(())
            })
            .await;

        let task = match started {
            Ok(task) => task,
            Err(e) => {
                self.registry.remove(&task_id);
                return Err(e);
            }
        };

        info!(task_id = %task.id, workflow_id = %workflow.id, phases = phases.len(), "task started");
        self.events.state(&task, Some(from));

        let driver = PhaseDriver::new(self.clone(), handle, workflow, phases);
        tokio::spawn(
            driver
                .run()
                .instrument(info_span!("task", task_id = %task.id)),
        );
        Ok(task)
    }

    async fn publish_pause_state(&self) {
        if let Some(session) = &self.session {
            session
                .on_pause_changed(self.registry.paused_count() > 0)
                .await;
        }
    }
}

fn check_runnable(task: &Task) -> Result<()> {
    if task.status == TaskStatus::Running {
        return Err(OrchestratorError::AlreadyRunning(task.id.clone()));
    }
    if !task.status.is_runnable() {
        return Err(OrchestratorError::invalid_transition(task, "run"));
    }
    Ok(())
}

fn check_resumable(task: &Task) -> Result<()> {
    if task.status != TaskStatus::Paused {
        return Err(OrchestratorError::invalid_transition(task, "resume"));
    }
    Ok(())
}
