//! Phase gates
//!
//! A gate runs after a phase completes. `auto` gates are checked in-process
//! against the phase output, `human` and `ai` gates register a
//! [`PendingDecision`] and block the task until it is resolved.

mod store;

pub use store::{
    decision_id, DecisionSink, DecisionStore, PendingDecision, Resolution, ResolveOutcome,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a phase transition is approved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    /// Checked against the template's criteria
    #[default]
    Auto,
    /// Waits for a person
    Human,
    /// Waits for an AI reviewer
    Ai,
    /// No gate
    Skip,
}

impl GateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateType::Auto => "auto",
            GateType::Human => "human",
            GateType::Ai => "ai",
            GateType::Skip => "skip",
        }
    }

    /// Gates that block on an external decision
    pub fn requires_decision(&self) -> bool {
        matches!(self, GateType::Human | GateType::Ai)
    }
}

impl fmt::Display for GateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an automatic gate check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateVerdict {
    pub approved: bool,
    pub reason: String,
}

impl GateVerdict {
    fn approve(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
        }
    }
}

#[derive(Deserialize)]
struct CompletionMarker {
    status: String,
}

/// Check phase output against auto-gate criteria
///
/// Known criteria are `has_output`, `no_errors` and `has_completion_marker`.
/// Any other string must appear verbatim in the output. No criteria approves.
pub fn evaluate_auto(criteria: &[String], output: &str) -> GateVerdict {
    if criteria.is_empty() {
        return GateVerdict::approve("no criteria specified");
    }

    for criterion in criteria {
        match criterion.as_str() {
            "has_output" => {
                if output.is_empty() {
                    return GateVerdict::reject("phase produced no output");
                }
            }
            "no_errors" => {
                if output.to_lowercase().contains("error") {
                    return GateVerdict::reject("output contains errors");
                }
            }
            "has_completion_marker" => {
                let complete = serde_json::from_str::<CompletionMarker>(output.trim())
                    .map(|marker| marker.status == "complete")
                    .unwrap_or(false);
                if !complete {
                    return GateVerdict::reject("no completion status found in output");
                }
            }
            custom => {
                if !output.contains(custom) {
                    return GateVerdict::reject(format!("criterion not met: {}", custom));
                }
            }
        }
    }

    GateVerdict::approve("all criteria met")
}
