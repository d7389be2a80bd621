//! Weight-to-workflow mapping

use serde::{Deserialize, Serialize};

use crate::task::TaskWeight;

/// Default workflow per task weight
///
/// An empty entry disables auto-assignment for that weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsConfig {
    pub trivial: String,
    pub small: String,
    pub medium: String,
    pub large: String,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            trivial: "implement-trivial".to_string(),
            small: "implement-small".to_string(),
            medium: "implement-medium".to_string(),
            large: "implement-large".to_string(),
        }
    }
}

impl WeightsConfig {
    /// Workflow ID configured for a weight
    pub fn workflow_for(&self, weight: TaskWeight) -> &str {
        match weight {
            TaskWeight::Trivial => &self.trivial,
            TaskWeight::Small => &self.small,
            TaskWeight::Medium => &self.medium,
            TaskWeight::Large => &self.large,
        }
    }
}
