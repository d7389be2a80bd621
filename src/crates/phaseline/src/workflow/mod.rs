//! Workflow definitions
//!
//! A [`Workflow`] is an ordered list of phase references. Each reference
//! names a [`PhaseTemplate`] and may override its model, thinking mode, retry
//! budget, gate type, and execution condition. Runs resolve a workflow into
//! [`ResolvedPhase`]s once and keep that snapshot for their lifetime.

pub mod condition;
pub mod loader;
mod registry;

pub use condition::{Comparison, ConditionContext, ConditionOp, PhaseCondition};
pub use loader::WorkflowBundle;
pub use registry::WorkflowRegistry;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::gate::GateType;
use crate::{OrchestratorError, Result};

/// Reusable phase defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTemplate {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub gate_type: GateType,
    /// Auto-gate criteria checked against the phase output
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<String>,
}

impl PhaseTemplate {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            max_iterations: None,
            gate_type: GateType::Auto,
            criteria: Vec::new(),
        }
    }

    pub fn with_gate(mut self, gate_type: GateType) -> Self {
        self.gate_type = gate_type;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_criteria(mut self, criteria: Vec<String>) -> Self {
        self.criteria = criteria;
        self
    }
}

/// Per-phase overrides of template and workflow defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_type: Option<GateType>,
    /// Phase runs only when this evaluates true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<PhaseCondition>,
}

/// One phase reference inside a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPhase {
    /// Template ID, also the phase name within the task
    #[serde(alias = "template")]
    pub template_id: String,
    #[serde(default)]
    pub sequence: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub overrides: PhaseOverrides,
}

impl WorkflowPhase {
    pub fn new(template_id: impl Into<String>, sequence: u32) -> Self {
        Self {
            template_id: template_id.into(),
            sequence,
            depends_on: Vec::new(),
            overrides: PhaseOverrides::default(),
        }
    }

    pub fn depends_on(mut self, phase: impl Into<String>) -> Self {
        self.depends_on.push(phase.into());
        self
    }

    pub fn with_gate(mut self, gate_type: GateType) -> Self {
        self.overrides.gate_type = Some(gate_type);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.overrides.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_condition(mut self, condition: PhaseCondition) -> Self {
        self.overrides.condition = Some(condition);
        self
    }
}

/// Input a workflow expects, exposed to conditions as `var.<name>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowVariable {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// A phase graph tasks are driven through
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_builtin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub based_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default)]
    pub default_thinking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_max_iterations: Option<u32>,
    #[serde(default)]
    pub phases: Vec<WorkflowPhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<WorkflowVariable>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            is_builtin: false,
            based_on: None,
            default_model: None,
            default_thinking: false,
            default_max_iterations: None,
            phases: Vec::new(),
            variables: Vec::new(),
        }
    }

    pub fn with_phase(mut self, phase: WorkflowPhase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn with_variable(mut self, variable: WorkflowVariable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_default_max_iterations(mut self, max_iterations: u32) -> Self {
        self.default_max_iterations = Some(max_iterations);
        self
    }

    /// Phases in execution order (by sequence, then declaration order)
    pub fn ordered_phases(&self) -> Vec<&WorkflowPhase> {
        let mut phases: Vec<_> = self.phases.iter().enumerate().collect();
        phases.sort_by_key(|(index, phase)| (phase.sequence, *index));
        phases.into_iter().map(|(_, phase)| phase).collect()
    }

    pub fn phase(&self, name: &str) -> Option<&WorkflowPhase> {
        self.phases.iter().find(|p| p.template_id == name)
    }

    /// Check structural invariants
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OrchestratorError::InvalidWorkflow(msg));

        if self.id.trim().is_empty() {
            return invalid("workflow id must not be empty".to_string());
        }
        if self
            .id
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        {
            return invalid(format!(
                "workflow id '{}' may only contain letters, digits, '-', '_' and '.'",
                self.id
            ));
        }
        if self.phases.is_empty() {
            return invalid(format!("workflow '{}' has no phases", self.id));
        }
        if self.default_max_iterations == Some(0) {
            return invalid("default_max_iterations must be at least 1".to_string());
        }

        let mut seen = HashSet::new();
        for phase in self.ordered_phases() {
            if phase.template_id.trim().is_empty() {
                return invalid("phase template id must not be empty".to_string());
            }
            if phase.overrides.max_iterations == Some(0) {
                return invalid(format!(
                    "phase '{}' max_iterations must be at least 1",
                    phase.template_id
                ));
            }
            for dep in &phase.depends_on {
                if self.phase(dep).is_none() {
                    return invalid(format!(
                        "phase '{}' depends on unknown phase '{}'",
                        phase.template_id, dep
                    ));
                }
                if !seen.contains(dep.as_str()) {
                    return invalid(format!(
                        "phase '{}' depends on '{}', which does not run before it",
                        phase.template_id, dep
                    ));
                }
            }
            if !seen.insert(phase.template_id.as_str()) {
                return invalid(format!("duplicate phase '{}'", phase.template_id));
            }
        }
        Ok(())
    }

    /// Deep copy under a new ID as a custom workflow
    pub fn clone_as(&self, new_id: impl Into<String>, name: Option<String>) -> Workflow {
        Workflow {
            id: new_id.into(),
            name: name.unwrap_or_else(|| format!("{} (copy)", self.name)),
            description: self.description.clone(),
            is_builtin: false,
            based_on: Some(self.id.clone()),
            default_model: self.default_model.clone(),
            default_thinking: self.default_thinking,
            default_max_iterations: self.default_max_iterations,
            phases: self.phases.clone(),
            variables: self.variables.clone(),
        }
    }

    /// Resolve phases against templates into effective settings
    ///
    /// Retry budget precedence: phase override, template, workflow default,
    /// then `fallback_iterations`.
    pub fn resolve(
        &self,
        templates: &HashMap<String, PhaseTemplate>,
        fallback_iterations: u32,
    ) -> Vec<ResolvedPhase> {
        self.ordered_phases()
            .into_iter()
            .map(|phase| {
                let template = templates.get(&phase.template_id);
                let overrides = &phase.overrides;
                ResolvedPhase {
                    name: phase.template_id.clone(),
                    sequence: phase.sequence,
                    depends_on: phase.depends_on.clone(),
                    max_iterations: overrides
                        .max_iterations
                        .or_else(|| template.and_then(|t| t.max_iterations))
                        .or(self.default_max_iterations)
                        .unwrap_or(fallback_iterations)
                        .max(1),
                    gate_type: overrides
                        .gate_type
                        .or_else(|| template.map(|t| t.gate_type))
                        .unwrap_or_default(),
                    criteria: template.map(|t| t.criteria.clone()).unwrap_or_default(),
                    model: overrides
                        .model
                        .clone()
                        .or_else(|| self.default_model.clone()),
                    thinking: overrides.thinking.unwrap_or(self.default_thinking),
                    condition: overrides.condition.clone(),
                }
            })
            .collect()
    }
}

/// Effective settings of one phase for a run
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPhase {
    pub name: String,
    pub sequence: u32,
    pub depends_on: Vec<String>,
    pub max_iterations: u32,
    pub gate_type: GateType,
    pub criteria: Vec<String>,
    pub model: Option<String>,
    pub thinking: bool,
    pub condition: Option<PhaseCondition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Workflow {
        Workflow::new("implement-small", "Implement (small)")
            .with_phase(WorkflowPhase::new("tiny_spec", 1))
            .with_phase(WorkflowPhase::new("implement", 2).depends_on("tiny_spec"))
            .with_phase(WorkflowPhase::new("review", 3).depends_on("implement"))
    }

    #[test]
    fn test_ordered_phases_by_sequence() {
        let wf = Workflow::new("wf", "wf")
            .with_phase(WorkflowPhase::new("b", 2))
            .with_phase(WorkflowPhase::new("a", 1));
        let names: Vec<_> = wf.ordered_phases().iter().map(|p| p.template_id.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_validate_ok() {
        small().validate().unwrap();
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let wf = Workflow::new("wf", "wf").with_phase(WorkflowPhase::new("a", 1).depends_on("zzz"));
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("unknown phase 'zzz'"));
    }

    #[test]
    fn test_validate_dependency_must_precede() {
        let wf = Workflow::new("wf", "wf")
            .with_phase(WorkflowPhase::new("a", 1).depends_on("b"))
            .with_phase(WorkflowPhase::new("b", 2));
        assert!(matches!(wf.validate(), Err(OrchestratorError::InvalidWorkflow(_))));
    }

    #[test]
    fn test_validate_duplicates_and_ids() {
        let wf = Workflow::new("wf", "wf")
            .with_phase(WorkflowPhase::new("a", 1))
            .with_phase(WorkflowPhase::new("a", 2));
        assert!(wf.validate().is_err());
        assert!(Workflow::new("bad id", "x")
            .with_phase(WorkflowPhase::new("a", 1))
            .validate()
            .is_err());
        assert!(Workflow::new("empty", "x").validate().is_err());
    }

    #[test]
    fn test_clone_as_deep_copies() {
        let mut source = small().with_variable(WorkflowVariable {
            name: "update_docs".into(),
            description: None,
            required: false,
            default_value: Some("true".into()),
        });
        source.is_builtin = true;

        let copy = source.clone_as("my-small", None);
        assert_eq!(copy.based_on.as_deref(), Some("implement-small"));
        assert!(!copy.is_builtin);
        assert_eq!(copy.name, "Implement (small) (copy)");
        assert_eq!(copy.phases, source.phases);
        assert_eq!(copy.variables, source.variables);
    }

    #[test]
    fn test_resolve_precedence() {
        let mut templates = HashMap::new();
        templates.insert(
            "implement".to_string(),
            PhaseTemplate::new("implement")
                .with_max_iterations(5)
                .with_criteria(vec!["has_output".into()]),
        );
        templates.insert(
            "review".to_string(),
            PhaseTemplate::new("review").with_gate(GateType::Human),
        );

        let wf = Workflow::new("wf", "wf")
            .with_default_max_iterations(4)
            .with_phase(WorkflowPhase::new("implement", 1))
            .with_phase(WorkflowPhase::new("review", 2).with_gate(GateType::Skip))
            .with_phase(WorkflowPhase::new("docs", 3).with_max_iterations(1));

        let resolved = wf.resolve(&templates, 3);
        assert_eq!(resolved[0].max_iterations, 5);
        assert_eq!(resolved[0].criteria, vec!["has_output".to_string()]);
        assert_eq!(resolved[1].max_iterations, 4);
        assert_eq!(resolved[1].gate_type, GateType::Skip);
        assert_eq!(resolved[2].max_iterations, 1);
        assert_eq!(resolved[2].gate_type, GateType::Auto);

        let bare = Workflow::new("bare", "bare").with_phase(WorkflowPhase::new("x", 1));
        assert_eq!(bare.resolve(&HashMap::new(), 3)[0].max_iterations, 3);
    }

    #[test]
    fn test_phase_yaml_overrides_are_flat() {
        let yaml = r#"
template: review
sequence: 3
depends_on: [implement]
gate_type: ai
max_iterations: 2
"#;
        let phase: WorkflowPhase = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(phase.template_id, "review");
        assert_eq!(phase.overrides.gate_type, Some(GateType::Ai));
        assert_eq!(phase.overrides.max_iterations, Some(2));
    }
}
