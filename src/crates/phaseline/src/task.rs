//! Task model
//!
//! A [`Task`] carries its lifecycle status, the per-phase execution record and
//! accumulated usage counters. Status changes go through [`Task::set_status`]
//! so timestamps stay consistent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::config::WeightsConfig;
use crate::gate::GateType;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, never run
    Created,
    /// Ready to run, or approved at a gate and about to continue
    Planned,
    /// Phase driver is active
    Running,
    /// Waiting on a pending decision
    Blocked,
    /// Suspended by a pause request
    Paused,
    /// All phases finished
    Completed,
    /// A phase exhausted its retries or a gate was rejected
    Failed,
    /// Cancelled by request
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Planned => "planned",
            TaskStatus::Running => "running",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `run` may start an execution from this status
    pub fn is_runnable(&self) -> bool {
        matches!(self, TaskStatus::Created | TaskStatus::Planned)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(TaskStatus::Created),
            "planned" => Ok(TaskStatus::Planned),
            "running" => Ok(TaskStatus::Running),
            "blocked" => Ok(TaskStatus::Blocked),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Coarse task size used to pick a default workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskWeight {
    Trivial,
    Small,
    Medium,
    Large,
}

impl TaskWeight {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskWeight::Trivial => "trivial",
            TaskWeight::Small => "small",
            TaskWeight::Medium => "medium",
            TaskWeight::Large => "large",
        }
    }
}

impl fmt::Display for TaskWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskWeight {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trivial" => Ok(TaskWeight::Trivial),
            "small" => Ok(TaskWeight::Small),
            "medium" => Ok(TaskWeight::Medium),
            "large" => Ok(TaskWeight::Large),
            other => Err(format!("unknown task weight: {}", other)),
        }
    }
}

/// Status of one phase of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }

    /// Completed or skipped phases satisfy dependencies
    pub fn is_done(&self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Skipped)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token counts reported by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Execution state of one phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    /// Attempts made so far; never decreases
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Feedback from the previous failed attempt, handed to the next one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A resolved gate, kept in the task's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRecord {
    pub phase: String,
    pub gate_type: GateType,
    pub approved: bool,
    #[serde(default)]
    pub reason: String,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

/// Per-phase states and gate history of a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseState>,
    #[serde(default)]
    pub gates: Vec<GateRecord>,
}

/// A unit of work driven through a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<TaskWeight>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    /// `None` is unset, `Some("")` is an explicit "no workflow"
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub execution: ExecutionState,
}

impl Task {
    /// Create a new task in the `created` status
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            weight: None,
            status: TaskStatus::Created,
            current_phase: None,
            workflow_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            execution: ExecutionState::default(),
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

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.set_status(status);
        self
    }

    /// Change status and maintain the lifecycle timestamps
    pub fn set_status(&mut self, status: TaskStatus) {
        let now = Utc::now();
        if status == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = status;
        self.updated_at = now;
    }

    /// Workflow to execute, ignoring an explicit empty assignment
    pub fn effective_workflow(&self) -> Option<&str> {
        self.workflow_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseState> {
        self.execution.phases.get(name)
    }

    pub fn phase_mut(&mut self, name: &str) -> &mut PhaseState {
        self.execution.phases.entry(name.to_string()).or_default()
    }

    pub fn phase_status(&self, name: &str) -> PhaseStatus {
        self.phase(name).map(|p| p.status).unwrap_or_default()
    }

    /// Add one phase attempt's usage to the running totals
    pub fn add_usage(&mut self, tokens: TokenUsage, cost_usd: f64) {
        self.input_tokens += tokens.input_tokens;
        self.output_tokens += tokens.output_tokens;
        self.cost_usd += cost_usd;
    }

    /// Number of gate decisions already recorded for a phase
    pub fn gate_count(&self, phase: &str) -> usize {
        self.execution
            .gates
            .iter()
            .filter(|g| g.phase == phase)
            .count()
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Decide the workflow a new task is assigned
///
/// An explicit request wins, even when it is the empty string. Only an unset
/// request falls back to the weight mapping.
pub fn assign_workflow(
    requested: Option<String>,
    weight: Option<TaskWeight>,
    weights: &WeightsConfig,
) -> Option<String> {
    if requested.is_some() {
        return requested;
    }
    weight
        .map(|w| weights.workflow_for(w))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
