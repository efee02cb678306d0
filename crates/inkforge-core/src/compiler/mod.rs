//! Workflow compiler: declarative definitions -> validated execution plans.
//!
//! The compiler owns the library of loaded workflow definitions (YAML files
//! keyed by workflow id) and turns them into [`ExecutionPlan`]s: dependency
//! validation, deterministic topological ordering, cycle detection, parallel
//! wave identification, and per-step bounds checks. Compilation is pure --
//! identical inputs produce byte-identical plans.

use std::collections::{BTreeMap, HashSet};

use dashmap::DashMap;
use inkforge_types::plan::{ExecutionPlan, ExecutionStep};
use inkforge_types::workflow::{StepCondition, WorkflowDefinition, WorkflowStep};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

pub mod resolver;

use resolver::DependencyNode;

/// Upper bound on per-step retries accepted by the compiler.
pub const MAX_STEP_RETRIES: u32 = 10;

/// Upper bound on per-step timeout accepted by the compiler (24 hours).
pub const MAX_STEP_TIMEOUT_SECS: u64 = 86_400;

/// Step timeout applied when neither the step nor the workflow declares one.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Retry budget applied when neither the step nor the workflow declares one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Compilation failures. None are retried internally; all surface to the
/// caller.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("workflow not found: '{0}'")]
    WorkflowNotFound(String),

    #[error("circular dependency: {cycle}")]
    CircularDependency { cycle: String },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("invalid step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("workflow file parse error: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Workflow file format
// ---------------------------------------------------------------------------

/// On-disk workflow file: a `workflows` mapping keyed by workflow id, each
/// with a `steps` mapping keyed by step id. `BTreeMap` keys give the loader
/// a stable iteration order independent of declaration order.
#[derive(Debug, Deserialize)]
struct WorkflowsFile {
    workflows: BTreeMap<String, RawWorkflow>,
}

#[derive(Debug, Deserialize)]
struct RawWorkflow {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    config: inkforge_types::workflow::WorkflowConfig,
    steps: BTreeMap<String, RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    approval_required: bool,
    #[serde(default)]
    fallback_agent: Option<String>,
    #[serde(default)]
    condition: Option<StepCondition>,
}

// ---------------------------------------------------------------------------
// WorkflowCompiler
// ---------------------------------------------------------------------------

/// Library of workflow definitions plus the compile operation.
#[derive(Default)]
pub struct WorkflowCompiler {
    definitions: DashMap<String, WorkflowDefinition>,
}

impl WorkflowCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a definition after structural validation.
    pub fn insert(&self, definition: WorkflowDefinition) -> Result<(), CompileError> {
        validate_definition(&definition)?;
        self.definitions.insert(definition.id.clone(), definition);
        Ok(())
    }

    /// Load every workflow from a YAML document in the canonical dict-keyed
    /// format. Returns how many workflows were loaded.
    pub fn load_yaml_str(&self, yaml: &str) -> Result<usize, CompileError> {
        let file: WorkflowsFile =
            serde_yaml_ng::from_str(yaml).map_err(|e| CompileError::Parse(e.to_string()))?;

        let count = file.workflows.len();
        for (id, raw) in file.workflows {
            let definition = WorkflowDefinition {
                id,
                description: raw.description,
                version: raw.version.unwrap_or_else(|| "1.0.0".to_string()),
                config: raw.config,
                steps: raw
                    .steps
                    .into_iter()
                    .map(|(step_id, step)| WorkflowStep {
                        id: step_id,
                        agent: step.agent,
                        depends_on: step.depends_on,
                        timeout: step.timeout,
                        retries: step.retries,
                        optional: step.optional,
                        approval_required: step.approval_required,
                        fallback_agent: step.fallback_agent,
                        condition: step.condition,
                        metadata: Default::default(),
                    })
                    .collect(),
            };
            self.insert(definition)?;
        }
        Ok(count)
    }

    /// Look up a loaded definition.
    pub fn definition(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.definitions.get(workflow_id).map(|d| d.clone())
    }

    /// Ids of all loaded workflows, sorted.
    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.definitions.iter().map(|d| d.key().clone()).collect();
        ids.sort_unstable();
        ids
    }

    /// Compile a workflow into a validated execution plan.
    pub fn compile(&self, workflow_id: &str) -> Result<ExecutionPlan, CompileError> {
        let definition = self
            .definition(workflow_id)
            .ok_or_else(|| CompileError::WorkflowNotFound(workflow_id.to_string()))?;

        let nodes: Vec<DependencyNode> = definition
            .steps
            .iter()
            .map(|s| DependencyNode {
                id: s.id.clone(),
                depends_on: s.depends_on.clone(),
            })
            .collect();

        let order = resolver::deterministic_order(&nodes)?;
        let waves = resolver::parallel_waves(&nodes, &order);

        let wave_of = |id: &str| -> usize {
            waves
                .iter()
                .position(|w| w.iter().any(|m| m == id))
                .unwrap_or(0)
        };

        let default_timeout = definition
            .config
            .default_timeout_secs
            .unwrap_or(DEFAULT_STEP_TIMEOUT_SECS);
        let default_retries = definition.config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);

        let mut steps = Vec::with_capacity(order.len());
        for id in &order {
            let step = definition
                .step(id)
                .ok_or_else(|| CompileError::WorkflowNotFound(workflow_id.to_string()))?;
            let timeout_secs = step.timeout.unwrap_or(default_timeout);
            let max_retries = step.retries.unwrap_or(default_retries);
            validate_step_bounds(step, timeout_secs, max_retries)?;

            steps.push(ExecutionStep {
                agent_id: step.agent_id().to_string(),
                dependencies: step
                    .depends_on
                    .iter()
                    .map(|d| dependency_agent_id(&definition, d))
                    .collect(),
                condition: step.condition.clone(),
                timeout_secs,
                max_retries,
                optional: step.optional,
                approval_required: step.approval_required,
                fallback_agent: step.fallback_agent.clone(),
                parallel_group: wave_of(id),
            });
        }

        // Parallel groups in terms of agent ids, in wave order.
        let parallel_groups: Vec<Vec<String>> = waves
            .iter()
            .map(|wave| {
                let mut group: Vec<String> = wave
                    .iter()
                    .map(|id| dependency_agent_id(&definition, id))
                    .collect();
                group.sort_unstable();
                group
            })
            .collect();

        let metadata = BTreeMap::from([
            ("step_count".to_string(), json!(steps.len())),
            ("parallel_group_count".to_string(), json!(parallel_groups.len())),
            ("workflow_version".to_string(), json!(definition.version)),
            ("deterministic".to_string(), json!(definition.config.deterministic)),
        ]);

        Ok(ExecutionPlan {
            workflow_id: definition.id,
            steps,
            parallel_groups,
            metadata,
        })
    }
}

/// The agent id a step id resolves to (step id itself unless overridden).
fn dependency_agent_id(definition: &WorkflowDefinition, step_id: &str) -> String {
    definition
        .step(step_id)
        .map(|s| s.agent_id().to_string())
        .unwrap_or_else(|| step_id.to_string())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_definition(definition: &WorkflowDefinition) -> Result<(), CompileError> {
    if definition.id.is_empty() {
        return Err(CompileError::Parse("workflow id must not be empty".to_string()));
    }
    if semver::Version::parse(&definition.version).is_err() {
        return Err(CompileError::Parse(format!(
            "workflow '{}' has invalid version '{}'",
            definition.id, definition.version
        )));
    }
    if definition.steps.is_empty() {
        return Err(CompileError::InvalidStep {
            step: definition.id.clone(),
            reason: "workflow has no steps".to_string(),
        });
    }

    let mut seen_agents = HashSet::new();
    for step in &definition.steps {
        if step.id.is_empty() {
            return Err(CompileError::InvalidStep {
                step: definition.id.clone(),
                reason: "step id must not be empty".to_string(),
            });
        }
        if !seen_agents.insert(step.agent_id().to_string()) {
            return Err(CompileError::InvalidStep {
                step: step.id.clone(),
                reason: format!("duplicate agent id '{}' in plan", step.agent_id()),
            });
        }
        if step.fallback_agent.as_deref() == Some(step.agent_id()) {
            return Err(CompileError::InvalidStep {
                step: step.id.clone(),
                reason: "fallback agent must differ from the primary agent".to_string(),
            });
        }
    }
    Ok(())
}

fn validate_step_bounds(
    step: &WorkflowStep,
    timeout_secs: u64,
    max_retries: u32,
) -> Result<(), CompileError> {
    if timeout_secs == 0 || timeout_secs > MAX_STEP_TIMEOUT_SECS {
        return Err(CompileError::InvalidStep {
            step: step.id.clone(),
            reason: format!(
                "timeout {timeout_secs}s outside 1..={MAX_STEP_TIMEOUT_SECS}"
            ),
        });
    }
    if max_retries > MAX_STEP_RETRIES {
        return Err(CompileError::InvalidStep {
            step: step.id.clone(),
            reason: format!("retries {max_retries} exceeds {MAX_STEP_RETRIES}"),
        });
    }
    if let Some(condition) = &step.condition {
        if condition.keys().iter().any(|k| k.is_empty()) {
            return Err(CompileError::InvalidStep {
                step: step.id.clone(),
                reason: "condition references an empty key".to_string(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
