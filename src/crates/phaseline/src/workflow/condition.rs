//! Phase execution conditions
//!
//! A condition is a small predicate tree evaluated against a flat key/value
//! context built from the task:
//!
//! ```yaml
//! condition:
//!   any:
//!     - { field: task.weight, op: in, value: [medium, large] }
//!     - { field: var.update_docs, value: "true" }
//! ```
//!
//! Context keys are `task.id`, `task.title`, `task.weight`,
//! `task.description`, `var.<name>` and `phase.<name>.status`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::Workflow;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    #[default]
    Eq,
    Neq,
    In,
    NotIn,
    Exists,
}

/// Compare one context field with a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub field: String,
    #[serde(default)]
    pub op: ConditionOp,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhaseCondition {
    All { all: Vec<PhaseCondition> },
    Any { any: Vec<PhaseCondition> },
    Not { not: Box<PhaseCondition> },
    Compare(Comparison),
}

impl PhaseCondition {
    pub fn field(field: impl Into<String>, op: ConditionOp, value: impl Into<Value>) -> Self {
        PhaseCondition::Compare(Comparison {
            field: field.into(),
            op,
            value: value.into(),
        })
    }

    pub fn evaluate(&self, ctx: &ConditionContext) -> bool {
        match self {
            PhaseCondition::All { all } => all.iter().all(|c| c.evaluate(ctx)),
            PhaseCondition::Any { any } => any.iter().any(|c| c.evaluate(ctx)),
            PhaseCondition::Not { not } => !not.evaluate(ctx),
            PhaseCondition::Compare(cmp) => cmp.evaluate(ctx),
        }
    }
}

impl Comparison {
    fn evaluate(&self, ctx: &ConditionContext) -> bool {
        let actual = ctx.get(&self.field);
        match self.op {
            ConditionOp::Exists => actual.map_or(false, |v| !v.is_null()),
            ConditionOp::Eq => actual.map_or(false, |v| loosely_equal(v, &self.value)),
            ConditionOp::Neq => !actual.map_or(false, |v| loosely_equal(v, &self.value)),
            ConditionOp::In => actual.map_or(false, |v| contains(&self.value, v)),
            ConditionOp::NotIn => !actual.map_or(false, |v| contains(&self.value, v)),
        }
    }
}

// Context values are mostly strings; let `value: 3` match "3" and `true` match "true".
fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::String(a), Value::Number(_) | Value::Bool(_)) => *a == expected.to_string(),
        (Value::Number(_) | Value::Bool(_), Value::String(e)) => actual.to_string() == *e,
        _ => false,
    }
}

fn contains(set: &Value, actual: &Value) -> bool {
    match set {
        Value::Array(items) => items.iter().any(|item| loosely_equal(actual, item)),
        single => loosely_equal(actual, single),
    }
}

/// Flat key/value view of a task used to evaluate conditions
#[derive(Debug, Clone, Default)]
pub struct ConditionContext {
    values: HashMap<String, Value>,
}

impl ConditionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the context for a task running a workflow
    pub fn for_task(task: &Task, workflow: &Workflow) -> Self {
        let mut ctx = Self::new();
        ctx.insert("task.id", task.id.clone());
        ctx.insert("task.title", task.title.clone());
        if let Some(weight) = task.weight {
            ctx.insert("task.weight", weight.as_str());
        }
        if let Some(description) = &task.description {
            ctx.insert("task.description", description.clone());
        }
        for variable in &workflow.variables {
            if let Some(default) = &variable.default_value {
                ctx.insert(format!("var.{}", variable.name), default.clone());
            }
        }
        for (name, state) in &task.execution.phases {
            ctx.insert(format!("phase.{}.status", name), state.status.as_str());
        }
        ctx
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{PhaseStatus, TaskWeight};
    use crate::workflow::{WorkflowPhase, WorkflowVariable};
    use serde_json::json;

    fn ctx() -> ConditionContext {
        let mut task = Task::new("TASK-001", "Add cache").with_weight(TaskWeight::Medium);
        task.phase_mut("spec").status = PhaseStatus::Completed;
        let wf = Workflow::new("wf", "wf")
            .with_phase(WorkflowPhase::new("spec", 1))
            .with_variable(WorkflowVariable {
                name: "update_docs".into(),
                description: None,
                required: false,
                default_value: Some("true".into()),
            });
        ConditionContext::for_task(&task, &wf)
    }

    #[test]
    fn test_eq_and_neq() {
        let ctx = ctx();
        assert!(PhaseCondition::field("task.weight", ConditionOp::Eq, "medium").evaluate(&ctx));
        assert!(PhaseCondition::field("task.weight", ConditionOp::Neq, "large").evaluate(&ctx));
        assert!(!PhaseCondition::field("missing", ConditionOp::Eq, "x").evaluate(&ctx));
        assert!(PhaseCondition::field("missing", ConditionOp::Neq, "x").evaluate(&ctx));
    }

    #[test]
    fn test_loose_bool_match() {
        let ctx = ctx();
        assert!(PhaseCondition::field("var.update_docs", ConditionOp::Eq, true).evaluate(&ctx));
    }

    #[test]
    fn test_in_and_exists() {
        let ctx = ctx();
        let cond = PhaseCondition::field("task.weight", ConditionOp::In, json!(["medium", "large"]));
        assert!(cond.evaluate(&ctx));
        let cond = PhaseCondition::field("task.weight", ConditionOp::NotIn, json!(["trivial"]));
        assert!(cond.evaluate(&ctx));
        assert!(PhaseCondition::field("phase.spec.status", ConditionOp::Exists, Value::Null)
            .evaluate(&ctx));
        assert!(!PhaseCondition::field("task.description", ConditionOp::Exists, Value::Null)
            .evaluate(&ctx));
    }

    #[test]
    fn test_combinators_from_yaml() {
        let yaml = r#"
all:
  - { field: phase.spec.status, value: completed }
  - any:
      - { field: task.weight, op: in, value: [large] }
      - not: { field: var.update_docs, value: "false" }
"#;
        let cond: PhaseCondition = serde_yaml::from_str(yaml).unwrap();
        assert!(cond.evaluate(&ctx()));
    }
}
