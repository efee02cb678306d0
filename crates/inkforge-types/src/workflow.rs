//! Declarative workflow definitions.
//!
//! `WorkflowDefinition` is the canonical representation parsed from YAML
//! workflow files. The compiler turns it into an [`crate::plan::ExecutionPlan`];
//! nothing executes a definition directly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::ValueMap;

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// A named, declarative description of steps and their dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier (the key in the workflows file).
    pub id: String,
    /// Optional human description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string, recorded on checkpoints.
    #[serde(default = "default_version")]
    pub version: String,
    /// Workflow-level configuration.
    #[serde(default)]
    pub config: WorkflowConfig,
    /// Ordered steps forming the DAG.
    pub steps: Vec<WorkflowStep>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Workflow-level options applied as defaults to every step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Whether the workflow is expected to be deterministic given
    /// deterministic agents.
    #[serde(default)]
    pub deterministic: bool,
    /// Default retry budget for steps that do not declare their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Whether a failed required step terminates the job.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Default step timeout for steps that do not declare their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Step definition
// ---------------------------------------------------------------------------

/// One step of a declarative workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step id, unique within the workflow. Matches the agent id it
    /// dispatches to unless `agent` overrides it.
    pub id: String,
    /// Agent to invoke. Defaults to the step id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Step ids this step depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Wall-clock timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Additional attempts after the first failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Optional steps are skipped (not failed) when their agent is missing,
    /// and their failure never fails the job.
    #[serde(default)]
    pub optional: bool,
    /// Whether a human approval gate guards this step.
    #[serde(default)]
    pub approval_required: bool,
    /// Agent tried once more when the primary exhausts its retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_agent: Option<String>,
    /// Conditional execution against accumulated outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
    /// Free-form step metadata, carried onto the plan.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowStep {
    /// The agent id this step dispatches to.
    pub fn agent_id(&self) -> &str {
        self.agent.as_deref().unwrap_or(&self.id)
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Typed condition evaluated against the accumulated output map before a
/// step is dispatched. A false condition skips the step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepCondition {
    /// Run when `key` is present and truthy.
    If { key: String },
    /// Run unless `key` is present and truthy.
    Unless { key: String },
    /// Run when every key in `keys` is present.
    Requires { keys: Vec<String> },
}

impl StepCondition {
    /// Evaluate against the accumulated outputs.
    pub fn evaluate(&self, outputs: &ValueMap) -> bool {
        match self {
            StepCondition::If { key } => outputs.get(key).is_some_and(is_truthy),
            StepCondition::Unless { key } => !outputs.get(key).is_some_and(is_truthy),
            StepCondition::Requires { keys } => keys.iter().all(|k| outputs.contains_key(k)),
        }
    }

    /// The keys this condition reads.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            StepCondition::If { key } | StepCondition::Unless { key } => vec![key.as_str()],
            StepCondition::Requires { keys } => keys.iter().map(String::as_str).collect(),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
