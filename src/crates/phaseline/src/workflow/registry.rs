//! Workflow registry
//!
//! Holds phase templates and workflows. Workflows are stored as `Arc`
//! snapshots: a run keeps the snapshot it started with, and edits only
//! affect later runs. Built-in workflows cannot be modified or deleted.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::loader::{self, WorkflowBundle};
use super::{PhaseTemplate, ResolvedPhase, Workflow};
use crate::{OrchestratorError, Result};

const BUILTIN_WORKFLOWS: &str = include_str!("../../workflows/builtin.yaml");

/// Default retry budget when nothing else sets one
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

pub struct WorkflowRegistry {
    templates: RwLock<HashMap<String, PhaseTemplate>>,
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    custom_dir: Option<PathBuf>,
    default_max_iterations: u32,
}

impl WorkflowRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            custom_dir: None,
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Registry preloaded with the built-in templates and workflows
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new();
        let bundle = loader::parse_bundle(BUILTIN_WORKFLOWS)?;
        registry.register_bundle(bundle, true)?;
        Ok(registry)
    }

    pub fn with_default_max_iterations(mut self, max_iterations: u32) -> Self {
        self.default_max_iterations = max_iterations.max(1);
        self
    }

    /// Load custom workflows from `dir` and write later edits back to it
    pub fn with_custom_dir(mut self, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if dir.exists() {
            let loaded = self.load_dir(&dir)?;
            info!(dir = ?dir, workflows = loaded, "loaded custom workflows");
        }
        self.custom_dir = Some(dir);
        Ok(self)
    }

    /// Register every YAML bundle in a directory; returns the workflow count
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let mut count = 0;
        for path in loader::workflow_files(dir)? {
            let bundle = loader::load_bundle(&path)?;
            count += self.register_bundle(bundle, false)?;
        }
        Ok(count)
    }

    /// Add a bundle's templates and workflows
    ///
    /// Custom workflows never replace a built-in one of the same ID.
    pub fn register_bundle(&self, bundle: WorkflowBundle, builtin: bool) -> Result<usize> {
        {
            let mut templates = self.templates.write();
            for mut template in bundle.templates {
                if template.name.is_empty() {
                    template.name = template.id.clone();
                }
                templates.insert(template.id.clone(), template);
            }
        }

        let mut count = 0;
        let mut workflows = self.workflows.write();
        for mut workflow in bundle.workflows {
            workflow.validate()?;
            workflow.is_builtin = builtin;
            if workflow.name.is_empty() {
                workflow.name = workflow.id.clone();
            }
            if !builtin
                && workflows
                    .get(&workflow.id)
                    .map_or(false, |existing| existing.is_builtin)
            {
                warn!(workflow_id = %workflow.id, "ignoring custom workflow shadowing a built-in");
                continue;
            }
            workflows.insert(workflow.id.clone(), Arc::new(workflow));
            count += 1;
        }
        Ok(count)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Workflow>> {
        self.workflows
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::WorkflowNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workflows.read().contains_key(id)
    }

    /// All workflows sorted by ID
    pub fn list(&self) -> Vec<Arc<Workflow>> {
        let mut workflows: Vec<_> = self.workflows.read().values().cloned().collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    pub fn template(&self, id: &str) -> Option<PhaseTemplate> {
        self.templates.read().get(id).cloned()
    }

    pub fn add_template(&self, template: PhaseTemplate) {
        self.templates.write().insert(template.id.clone(), template);
    }

    /// Effective phase settings for a workflow
    pub fn resolve_phases(&self, workflow: &Workflow) -> Vec<ResolvedPhase> {
        workflow.resolve(&self.templates.read(), self.default_max_iterations)
    }

    /// Add a custom workflow
    pub fn create(&self, mut workflow: Workflow) -> Result<Arc<Workflow>> {
        workflow.validate()?;
        workflow.is_builtin = false;
        if workflow.name.is_empty() {
            workflow.name = workflow.id.clone();
        }

        let workflow = Arc::new(workflow);
        {
            let mut workflows = self.workflows.write();
            if workflows.contains_key(&workflow.id) {
                return Err(OrchestratorError::Conflict(format!(
                    "workflow {} already exists",
                    workflow.id
                )));
            }
            workflows.insert(workflow.id.clone(), workflow.clone());
        }
        if let Err(e) = self.persist(&workflow) {
            self.workflows.write().remove(&workflow.id);
            return Err(e);
        }

        info!(workflow_id = %workflow.id, "created workflow");
        Ok(workflow)
    }

    /// Replace a custom workflow's definition
    pub fn update(&self, id: &str, mut workflow: Workflow) -> Result<Arc<Workflow>> {
        let existing = self.get(id)?;
        if existing.is_builtin {
            return Err(OrchestratorError::Conflict(format!(
                "workflow {} is built-in and read-only",
                id
            )));
        }

        workflow.id = id.to_string();
        workflow.is_builtin = false;
        if workflow.based_on.is_none() {
            workflow.based_on = existing.based_on.clone();
        }
        if workflow.name.is_empty() {
            workflow.name = existing.name.clone();
        }
        workflow.validate()?;

        let workflow = Arc::new(workflow);
        self.persist(&workflow)?;
        self.workflows.write().insert(id.to_string(), workflow.clone());

        info!(workflow_id = id, "updated workflow");
        Ok(workflow)
    }

    /// Remove a custom workflow
    pub fn delete(&self, id: &str) -> Result<()> {
        let existing = self.get(id)?;
        if existing.is_builtin {
            return Err(OrchestratorError::Conflict(format!(
                "workflow {} is built-in and cannot be deleted",
                id
            )));
        }
        if let Some(dir) = &self.custom_dir {
            loader::remove_workflow(dir, id)?;
        }
        self.workflows.write().remove(id);

        info!(workflow_id = id, "deleted workflow");
        Ok(())
    }

    /// Copy any workflow into a new custom one
    pub fn clone_workflow(
        &self,
        source_id: &str,
        new_id: &str,
        name: Option<String>,
    ) -> Result<Arc<Workflow>> {
        let source = self.get(source_id)?;
        self.create(source.clone_as(new_id, name))
    }

    fn persist(&self, workflow: &Workflow) -> Result<()> {
        match &self.custom_dir {
            Some(dir) => loader::save_workflow(dir, workflow),
            None => Ok(()),
        }
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}
