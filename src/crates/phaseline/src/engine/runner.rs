//! Phase runner seam
//!
//! The engine hands each phase attempt to a [`PhaseRunner`]. [`CommandRunner`]
//! spawns the configured agent command; tests plug in scripted runners.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::task::TokenUsage;
use crate::{OrchestratorError, Result};

/// One attempt of one phase
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseRequest {
    pub task_id: String,
    pub task_title: String,
    pub task_description: Option<String>,
    pub workflow_id: String,
    pub phase: String,
    /// 1-based attempt counter of the phase
    pub iteration: u32,
    pub model: Option<String>,
    pub thinking: bool,
    /// Feedback from the previous failed attempt
    pub retry_context: Option<String>,
}

impl PhaseRequest {
    /// Prompt handed to the agent command
    pub fn prompt(&self) -> String {
        let mut prompt = format!(
            "Task {}: {}\nPhase: {} (attempt {})",
            self.task_id, self.task_title, self.phase, self.iteration
        );
        if let Some(description) = &self.task_description {
            prompt.push_str("\n\n");
            prompt.push_str(description);
        }
        if let Some(context) = &self.retry_context {
            prompt.push_str("\n\nPrevious attempt: ");
            prompt.push_str(context);
        }
        prompt
    }
}

/// Result of a successful attempt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutcome {
    pub output: String,
    pub commit_sha: Option<String>,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
}

impl PhaseOutcome {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn with_tokens(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.tokens = TokenUsage::new(input_tokens, output_tokens);
        self
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }

    pub fn with_commit(mut self, commit_sha: impl Into<String>) -> Self {
        self.commit_sha = Some(commit_sha.into());
        self
    }
}

/// Executes phase attempts
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    /// Run one attempt; implementations should stop promptly once `cancel` fires
    async fn run_phase(&self, request: &PhaseRequest, cancel: &CancellationToken)
        -> Result<PhaseOutcome>;
}

/// JSON result some agents print instead of plain text
#[derive(Debug, Deserialize)]
struct AgentReport {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    usage: Option<TokenUsage>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    commit_sha: Option<String>,
}

/// Runs each attempt as a child process
///
/// The prompt is passed as the final argument and the request fields are
/// exported as `PHASELINE_*` environment variables. Stdout is the phase
/// output; a JSON report with `result`, `usage` and `total_cost_usd` fields
/// is unpacked.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn command(&self, request: &PhaseRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(request.prompt())
            .env("PHASELINE_TASK_ID", &request.task_id)
            .env("PHASELINE_WORKFLOW_ID", &request.workflow_id)
            .env("PHASELINE_PHASE", &request.phase)
            .env("PHASELINE_ITERATION", request.iteration.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(model) = &request.model {
            cmd.env("PHASELINE_MODEL", model);
        }
        if let Some(context) = &request.retry_context {
            cmd.env("PHASELINE_RETRY_CONTEXT", context);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl PhaseRunner for CommandRunner {
    async fn run_phase(
        &self,
        request: &PhaseRequest,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome> {
        debug!(
            program = %self.program,
            task_id = %request.task_id,
            phase = %request.phase,
            iteration = request.iteration,
            "spawning agent"
        );
        let child = self.command(request).spawn().map_err(|e| {
            OrchestratorError::ExecutionFailed(format!("failed to spawn {}: {}", self.program, e))
        })?;

        // Dropping the child on cancellation kills it
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(OrchestratorError::ExecutionFailed("phase cancelled".into()));
            }
            output = child.wait_with_output() => output.map_err(|e| {
                OrchestratorError::ExecutionFailed(format!("agent process failed: {}", e))
            })?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() { stdout.as_str() } else { stderr.trim() };
            warn!(task_id = %request.task_id, phase = %request.phase, status = %output.status, "agent exited with failure");
            return Err(OrchestratorError::ExecutionFailed(format!(
                "agent exited with {}: {}",
                output.status, detail
            )));
        }

        Ok(parse_output(stdout))
    }
}

fn parse_output(stdout: String) -> PhaseOutcome {
    match serde_json::from_str::<AgentReport>(&stdout) {
        Ok(report) if report.result.is_some() || report.usage.is_some() => PhaseOutcome {
            output: report.result.unwrap_or_default(),
            commit_sha: report.commit_sha,
            tokens: report.usage.unwrap_or_default(),
            cost_usd: report.total_cost_usd.unwrap_or_default(),
        },
        _ => PhaseOutcome::new(stdout),
    }
}
