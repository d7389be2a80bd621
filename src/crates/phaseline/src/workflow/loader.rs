//! YAML workflow files with environment variable expansion
//!
//! A workflow file holds a bundle of phase templates and workflows. String
//! values may reference the environment as `${VAR}` or `${VAR:default}`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::{PhaseTemplate, Workflow};
use crate::{OrchestratorError, Result};

/// Templates and workflows declared together in one file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowBundle {
    #[serde(default)]
    pub templates: Vec<PhaseTemplate>,
    #[serde(default)]
    pub workflows: Vec<Workflow>,
}

impl WorkflowBundle {
    pub fn single(workflow: Workflow) -> Self {
        Self {
            templates: Vec::new(),
            workflows: vec![workflow],
        }
    }
}

fn env_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").ok())
        .as_ref()
}

/// Expand `${VAR}` and `${VAR:default}` references in a string
pub fn expand_env(input: &str) -> String {
    let Some(pattern) = env_pattern().filter(|_| input.contains("${")) else {
        return input.to_string();
    };
    pattern
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let default = caps.get(2).map_or("", |m| m.as_str());
            std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
}

fn expand_strings(value: &mut YamlValue) {
    match value {
        YamlValue::String(s) => {
            if s.contains("${") {
                *s = expand_env(s);
            }
        }
        YamlValue::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_strings(v);
            }
        }
        YamlValue::Sequence(seq) => {
            for item in seq.iter_mut() {
                expand_strings(item);
            }
        }
        YamlValue::Tagged(tagged) => expand_strings(&mut tagged.value),
        _ => {}
    }
}

/// Parse a bundle from YAML text
///
/// A document with a top-level `id` is read as a single workflow.
pub fn parse_bundle(content: &str) -> Result<WorkflowBundle> {
    let mut value: YamlValue = serde_yaml::from_str(content)
        .map_err(|e| OrchestratorError::InvalidWorkflow(format!("invalid YAML: {}", e)))?;
    expand_strings(&mut value);

    let is_single = value
        .as_mapping()
        .map_or(false, |m| m.contains_key(&YamlValue::String("id".to_string())));
    let bundle = if is_single {
        WorkflowBundle::single(
            serde_yaml::from_value(value)
                .map_err(|e| OrchestratorError::InvalidWorkflow(e.to_string()))?,
        )
    } else if value.is_null() {
        WorkflowBundle::default()
    } else {
        serde_yaml::from_value(value)
            .map_err(|e| OrchestratorError::InvalidWorkflow(e.to_string()))?
    };
    Ok(bundle)
}

/// Load a bundle from a YAML file
pub fn load_bundle<P: AsRef<Path>>(path: P) -> Result<WorkflowBundle> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        OrchestratorError::General(format!("Failed to read workflow file {:?}: {}", path, e))
    })?;
    parse_bundle(&content).map_err(|e| match e {
        OrchestratorError::InvalidWorkflow(msg) => {
            OrchestratorError::InvalidWorkflow(format!("{:?}: {}", path, msg))
        }
        other => other,
    })
}

/// YAML files of a directory in name order
pub fn workflow_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let entries = fs::read_dir(dir).map_err(|e| {
        OrchestratorError::General(format!("Failed to read workflow dir {:?}: {}", dir, e))
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    files.sort();
    Ok(files)
}

pub fn workflow_path(dir: &Path, workflow_id: &str) -> PathBuf {
    dir.join(format!("{}.yaml", workflow_id))
}

/// Write a custom workflow to `<dir>/<id>.yaml`
pub fn save_workflow(dir: &Path, workflow: &Workflow) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| {
        OrchestratorError::General(format!("Failed to create workflow dir {:?}: {}", dir, e))
    })?;
    let yaml = serde_yaml::to_string(workflow)
        .map_err(|e| OrchestratorError::General(format!("Failed to encode workflow: {}", e)))?;
    let path = workflow_path(dir, &workflow.id);
    fs::write(&path, yaml).map_err(|e| {
        OrchestratorError::General(format!("Failed to write workflow file {:?}: {}", path, e))
    })
}

/// Remove a custom workflow file; a missing file is not an error
pub fn remove_workflow(dir: &Path, workflow_id: &str) -> Result<()> {
    let path = workflow_path(dir, workflow_id);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OrchestratorError::General(format!(
            "Failed to remove workflow file {:?}: {}",
            path, e
        ))),
    }
}
