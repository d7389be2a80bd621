//! Phase driver
//!
//! One driver runs per live execution. It walks the resolved phases in
//! sequence order, retries failed attempts within the phase budget, evaluates
//! gates and suspends at pause checkpoints and pending decisions.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::records::set_status_unless_cancelled;
use super::registry::{ExecutionHandle, SlotGuard};
use super::runner::{PhaseOutcome, PhaseRequest};
use super::TaskEngine;
use crate::gate::{evaluate_auto, GateType, PendingDecision};
use crate::storage::UsageEntry;
use crate::task::{PhaseStatus, Task, TaskStatus};
use crate::workflow::{ConditionContext, ResolvedPhase, Workflow};
use crate::{OrchestratorError, Result};

/// How the driver left the phase loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

enum Step {
    Continue,
    Exit(Exit),
}

pub(crate) struct PhaseDriver {
    engine: TaskEngine,
    handle: Arc<ExecutionHandle>,
    cancel: CancellationToken,
    workflow: Arc<Workflow>,
    phases: Vec<ResolvedPhase>,
    task_id: String,
}

impl PhaseDriver {
    pub(crate) fn new(
        engine: TaskEngine,
        handle: Arc<ExecutionHandle>,
        workflow: Arc<Workflow>,
        phases: Vec<ResolvedPhase>,
    ) -> Self {
        Self {
            task_id: handle.task_id().to_string(),
            cancel: handle.cancel_token(),
            engine,
            handle,
            workflow,
            phases,
        }
    }

    /// Drive the task to a terminal or blocked-and-rejected state
    pub(crate) async fn run(self) {
        let guard = SlotGuard::new(self.engine.registry.clone(), self.task_id.clone());
        if let Some(session) = &self.engine.session {
            session.on_task_start().await;
        }

        let exit = match self.drive().await {
            Ok(exit) => exit,
            Err(e) => {
                error!(task_id = %self.task_id, error = %e, "phase driver failed");
                self.fail_task(None, e.to_string()).await;
                Exit::Failed
            }
        };
        info!(task_id = %self.task_id, exit = ?exit, "phase driver finished");

        drop(guard);
        if let Some(session) = &self.engine.session {
            if self.handle.is_paused() {
                session
                    .on_pause_changed(self.engine.registry.paused_count() > 0)
                    .await;
            }
            session.on_task_complete().await;
        }
    }

    async fn drive(&self) -> Result<Exit> {
        for phase in &self.phases {
            if !self.checkpoint().await {
                return Ok(Exit::Cancelled);
            }

            let task = self.current().await;
            if task.phase_status(&phase.name).is_done() {
                debug!(task_id = %self.task_id, phase = %phase.name, "phase already done");
                continue;
            }

            if let Some(condition) = &phase.condition {
                let ctx = ConditionContext::for_task(&task, &self.workflow);
                if !condition.evaluate(&ctx) {
                    self.skip_phase(&phase.name).await?;
                    continue;
                }
            }

            if let Some(missing) = phase
                .depends_on
                .iter()
                .find(|dep| !task.phase_status(dep).is_done())
            {
                let message = format!(
                    "phase {} depends on {} which has not completed",
                    phase.name, missing
                );
                self.fail_task(Some(&phase.name), message).await;
                return Ok(Exit::Failed);
            }

            if let Step::Exit(exit) = self.run_phase(phase).await? {
                return Ok(exit);
            }
            if let Step::Exit(exit) = self.await_gate(phase).await? {
                return Ok(exit);
            }
        }

        self.complete().await
    }

    /// Wait out a pause; false when the execution was cancelled
    async fn checkpoint(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let mut signal = self.handle.pause_signal();
        if *signal.borrow_and_update() {
            info!(task_id = %self.task_id, "execution paused at checkpoint");
            while *signal.borrow_and_update() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return false,
                    changed = signal.changed() => {
                        if changed.is_err() {
                            return false;
                        }
                    }
                }
            }
            info!(task_id = %self.task_id, "execution resumed");
        }
        !self.cancel.is_cancelled()
    }

    async fn current(&self) -> Task {
        self.handle.record().lock().await.clone()
    }

    async fn update<F>(&self, change: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        self.engine.records.update(&self.task_id, change).await
    }

    async fn skip_phase(&self, name: &str) -> Result<()> {
        let task = self
            .update(|task| {
                let state = task.phase_mut(name);
                state.status = PhaseStatus::Skipped;
                state.completed_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        info!(task_id = %self.task_id, phase = name, "phase condition false, skipped");
        self.engine.events.phase(&task, name);
        Ok(())
    }

    async fn run_phase(&self, phase: &ResolvedPhase) -> Result<Step> {
        let name = phase.name.as_str();

        // Budget counts persisted iterations across driver restarts
        loop {
            if !self.checkpoint().await {
                self.roll_back(name).await;
                return Ok(Step::Exit(Exit::Cancelled));
            }

            let task = self
                .update(|task| {
                    task.current_phase = Some(name.to_string());
                    let state = task.phase_mut(name);
                    state.iterations += 1;
                    state.status = PhaseStatus::Running;
                    state.started_at.get_or_insert_with(Utc::now);
                    Ok(())
                })
                .await?;
            self.engine.events.phase(&task, name);

            let state = task.phase(name).cloned().unwrap_or_default();
            let attempt = state.iterations;
            let request = PhaseRequest {
                task_id: task.id.clone(),
                task_title: task.title.clone(),
                task_description: task.description.clone(),
                workflow_id: self.workflow.id.clone(),
                phase: name.to_string(),
                iteration: state.iterations,
                model: phase.model.clone(),
                thinking: phase.thinking,
                retry_context: state.retry_context.clone(),
            };
            info!(task_id = %self.task_id, phase = name, iteration = state.iterations, "running phase");

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = self.engine.runner.run_phase(&request, &self.cancel) => Some(result),
            };
            let result = match result {
                Some(result) if !self.cancel.is_cancelled() => result,
                _ => {
                    self.roll_back(name).await;
                    return Ok(Step::Exit(Exit::Cancelled));
                }
            };

            let failure = match result {
                Ok(outcome) => {
                    self.record_usage(name, &outcome).await?;
                    let verdict = match phase.gate_type {
                        GateType::Auto => Some(evaluate_auto(&phase.criteria, &outcome.output)),
                        _ => None,
                    };
                    match verdict {
                        Some(verdict) if !verdict.approved => {
                            format!("auto gate rejected: {}", verdict.reason)
                        }
                        _ => {
                            self.complete_phase(name, &outcome).await?;
                            return Ok(Step::Continue);
                        }
                    }
                }
                Err(e) => e.to_string(),
            };

            if attempt >= phase.max_iterations {
                let message = format!(
                    "phase {} failed after {} attempts: {}",
                    name, attempt, failure
                );
                self.fail_task(Some(name), message).await;
                return Ok(Step::Exit(Exit::Failed));
            }

            warn!(task_id = %self.task_id, phase = name, attempt, error = %failure, "phase attempt failed, retrying");
            let task = self
                .update(|task| {
                    let state = task.phase_mut(name);
                    state.retry_context =
                        Some(format!("Attempt {} failed: {}", state.iterations, failure));
                    state.error = Some(failure.clone());
                    Ok(())
                })
                .await?;
            self.engine.events.phase(&task, name);
            self.engine
                .events
                .error(&self.task_id, Some(name), failure.as_str(), false);
        }
    }

    async fn record_usage(&self, name: &str, outcome: &PhaseOutcome) -> Result<()> {
        self.update(|task| {
            task.add_usage(outcome.tokens, outcome.cost_usd);
            let state = task.phase_mut(name);
            let mut tokens = state.tokens.unwrap_or_default();
            tokens.input_tokens += outcome.tokens.input_tokens;
            tokens.output_tokens += outcome.tokens.output_tokens;
            state.tokens = Some(tokens);
            Ok(())
        })
        .await?;

        if let Some(usage) = &self.engine.usage {
            let entry = UsageEntry::new(&self.task_id, name, outcome.tokens, outcome.cost_usd);
            if let Err(e) = usage.record_usage(&entry).await {
                warn!(task_id = %self.task_id, phase = name, error = %e, "failed to record usage");
            }
        }
        self.engine
            .events
            .tokens(&self.task_id, name, outcome.tokens, outcome.cost_usd);
        Ok(())
    }

    async fn complete_phase(&self, name: &str, outcome: &PhaseOutcome) -> Result<()> {
        let task = self
            .update(|task| {
                let state = task.phase_mut(name);
                state.status = PhaseStatus::Completed;
                state.completed_at = Some(Utc::now());
                state.error = None;
                state.retry_context = None;
                if outcome.commit_sha.is_some() {
                    state.commit_sha = outcome.commit_sha.clone();
                }
                Ok(())
            })
            .await?;
        info!(task_id = %self.task_id, phase = name, "phase completed");
        self.engine.events.phase(&task, name);
        Ok(())
    }

    async fn await_gate(&self, phase: &ResolvedPhase) -> Result<Step> {
        if !phase.gate_type.requires_decision() {
            return Ok(Step::Continue);
        }
        let name = phase.name.as_str();

        // A paused task blocks only once it is resumed
        let task = loop {
            if !self.checkpoint().await {
                return Ok(Step::Exit(Exit::Cancelled));
            }
            let mut previous = TaskStatus::Running;
            let task = self
                .update(|task| {
                    previous = task.status;
                    if task.status == TaskStatus::Running {
                        task.set_status(TaskStatus::Blocked);
                    }
                    Ok(())
                })
                .await?;
            match previous {
                TaskStatus::Running => break task,
                TaskStatus::Cancelled => return Ok(Step::Exit(Exit::Cancelled)),
                _ => continue,
            }
        };
        self.engine.events.state(&task, Some(TaskStatus::Running));

        let mut decision = PendingDecision::new(
            &task.id,
            &task.title,
            name,
            phase.gate_type,
            task.gate_count(name) + 1,
        );
        if let Some(sha) = task.phase(name).and_then(|p| p.commit_sha.as_deref()) {
            decision = decision.with_context(format!("commit {}", sha));
        }
        if self.cancel.is_cancelled() {
            return Ok(Step::Exit(Exit::Cancelled));
        }
        let id = decision.decision_id.clone();
        let waiter = self.engine.decisions.register(decision)?;
        // Cancel discards before firing the token, so a discarded entry is never announced
        if self.cancel.is_cancelled() || !self.engine.decisions.announce(&id) {
            self.engine.decisions.discard_for_task(&self.task_id);
            return Ok(Step::Exit(Exit::Cancelled));
        }
        info!(task_id = %self.task_id, phase = name, gate_type = %phase.gate_type, "blocked on decision");

        let resolution = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Step::Exit(Exit::Cancelled)),
            resolution = waiter => resolution,
        };
        let Ok(resolution) = resolution else {
            debug!(task_id = %self.task_id, phase = name, "decision discarded");
            return Ok(Step::Exit(Exit::Cancelled));
        };
        if !resolution.approved {
            info!(task_id = %self.task_id, phase = name, "gate rejected");
            return Ok(Step::Exit(Exit::Rejected));
        }

        let mut resumed = true;
        let task = self
            .update(|task| {
                resumed = set_status_unless_cancelled(task, TaskStatus::Running);
                Ok(())
            })
            .await?;
        if !resumed {
            return Ok(Step::Exit(Exit::Cancelled));
        }
        self.engine.events.state(&task, Some(TaskStatus::Planned));
        Ok(Step::Continue)
    }

    async fn complete(&self) -> Result<Exit> {
        let mut completed = true;
        let task = self
            .update(|task| {
                completed = set_status_unless_cancelled(task, TaskStatus::Completed);
                Ok(())
            })
            .await?;
        if !completed {
            return Ok(Exit::Cancelled);
        }

        let commit_sha = self
            .phases
            .iter()
            .rev()
            .find_map(|p| task.phase(&p.name).and_then(|s| s.commit_sha.clone()));
        info!(task_id = %self.task_id, "task completed");
        self.engine.events.state(&task, Some(TaskStatus::Running));
        self.engine.events.complete(&task, commit_sha);
        Ok(Exit::Completed)
    }

    /// Return an interrupted phase to pending
    async fn roll_back(&self, name: &str) {
        let result = self
            .update(|task| {
                let state = task.phase_mut(name);
                if state.status == PhaseStatus::Running {
                    state.status = PhaseStatus::Pending;
                }
                Ok(())
            })
            .await;
        match result {
            Ok(task) => {
                debug!(task_id = %self.task_id, phase = name, "rolled back interrupted phase");
                self.engine.events.phase(&task, name);
            }
            Err(e) => warn!(task_id = %self.task_id, phase = name, error = %e, "failed to roll back phase"),
        }
    }

    async fn fail_task(&self, phase: Option<&str>, message: String) {
        let result = self
            .update(|task| {
                if task.status == TaskStatus::Cancelled {
                    return Err(OrchestratorError::invalid_transition(task, "fail"));
                }
                if let Some(name) = phase {
                    let state = task.phase_mut(name);
                    state.status = PhaseStatus::Failed;
                    state.error = Some(message.clone());
                    state.completed_at = Some(Utc::now());
                }
                task.error = Some(message.clone());
                task.set_status(TaskStatus::Failed);
                Ok(())
            })
            .await;

        match result {
            Ok(task) => {
                error!(task_id = %self.task_id, error = %message, "task failed");
                if let Some(name) = phase {
                    self.engine.events.phase(&task, name);
                }
                self.engine
                    .events
                    .error(&self.task_id, phase, message.as_str(), true);
                self.engine.events.state(&task, Some(TaskStatus::Running));
            }
            Err(OrchestratorError::InvalidStateTransition { .. }) => {
                debug!(task_id = %self.task_id, "task cancelled before failure was recorded");
            }
            Err(e) => {
                error!(task_id = %self.task_id, error = %e, "failed to record task failure");
            }
        }
    }
}
