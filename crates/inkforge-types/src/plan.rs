//! Compiled execution plans.
//!
//! An `ExecutionPlan` is the validated, topologically sorted form of a
//! workflow. Plans are pure data: compiling the same workflow twice must
//! produce byte-identical plans, so every collection here either preserves
//! insertion order (`Vec`) or sorts deterministically (`BTreeSet`/`BTreeMap`).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::StepCondition;

// ---------------------------------------------------------------------------
// ExecutionStep
// ---------------------------------------------------------------------------

/// One step of a compiled plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Agent id, unique within the plan.
    pub agent_id: String,
    /// Direct dependencies (agent ids), sorted.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Conditional execution against accumulated outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
    /// Wall-clock timeout in seconds, always > 0.
    pub timeout_secs: u64,
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Whether this step may be skipped without failing the job.
    #[serde(default)]
    pub optional: bool,
    /// Whether an approval gate guards this step.
    #[serde(default)]
    pub approval_required: bool,
    /// Agent tried once more when the primary exhausts its retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_agent: Option<String>,
    /// Index of the parallel group (wave) this step belongs to.
    pub parallel_group: usize,
}

impl ExecutionStep {
    /// Whether this step can run concurrently with another: neither depends
    /// on the other.
    pub fn can_run_parallel_with(&self, other: &ExecutionStep) -> bool {
        !self.dependencies.contains(&other.agent_id)
            && !other.dependencies.contains(&self.agent_id)
    }
}

// ---------------------------------------------------------------------------
// ExecutionPlan
// ---------------------------------------------------------------------------

/// The compiled, validated, topologically sorted form of a workflow.
///
/// Invariants (enforced by the compiler):
/// - every dependency id appears as a step;
/// - the graph is acyclic;
/// - each step belongs to exactly one parallel group;
/// - step order is deterministic (topological, lexical tie-break).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// The workflow this plan was compiled from.
    pub workflow_id: String,
    /// Steps in execution order.
    pub steps: Vec<ExecutionStep>,
    /// Waves of agent ids whose members may be dispatched concurrently.
    pub parallel_groups: Vec<Vec<String>>,
    /// Compiler metadata (step counts, workflow version). Sorted map so the
    /// serialized form is stable.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ExecutionPlan {
    /// Look up a step by agent id.
    pub fn step(&self, agent_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.agent_id == agent_id)
    }

    /// Position of a step in the plan order.
    pub fn index_of(&self, agent_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.agent_id == agent_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, deps: &[&str], group: usize) -> ExecutionStep {
        ExecutionStep {
            agent_id: id.to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            condition: None,
            timeout_secs: 300,
            max_retries: 0,
            optional: false,
            approval_required: false,
            fallback_agent: None,
            parallel_group: group,
        }
    }

    fn sample_plan() -> ExecutionPlan {
        ExecutionPlan {
            workflow_id: "article-pipeline".to_string(),
            steps: vec![
                step("research", &[], 0),
                step("draft", &["research"], 1),
                step("seo", &["research"], 1),
                step("assemble", &["draft", "seo"], 2),
            ],
            parallel_groups: vec![
                vec!["research".to_string()],
                vec!["draft".to_string(), "seo".to_string()],
                vec!["assemble".to_string()],
            ],
            metadata: BTreeMap::from([
                ("step_count".to_string(), json!(4)),
                ("workflow_version".to_string(), json!("1.0.0")),
            ]),
        }
    }

    #[test]
    fn lookup_and_index() {
        let plan = sample_plan();
        assert_eq!(plan.index_of("draft"), Some(1));
        assert!(plan.step("missing").is_none());
        assert_eq!(plan.step("assemble").unwrap().dependencies.len(), 2);
    }

    #[test]
    fn parallel_compatibility() {
        let plan = sample_plan();
        let draft = plan.step("draft").unwrap();
        let seo = plan.step("seo").unwrap();
        let assemble = plan.step("assemble").unwrap();
        assert!(draft.can_run_parallel_with(seo));
        assert!(!assemble.can_run_parallel_with(draft));
    }

    #[test]
    fn serialization_is_stable() {
        // Deterministic compilation demands byte-identical serialization of
        // equal plans.
        let a = serde_json::to_vec(&sample_plan()).unwrap();
        let b = serde_json::to_vec(&sample_plan()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn plan_json_roundtrip() {
        let plan = sample_plan();
        let text = serde_json::to_string(&plan).unwrap();
        let parsed: ExecutionPlan = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, plan);
    }

    #[test]
    fn dependencies_serialize_sorted() {
        let s = step("z", &["beta", "alpha"], 0);
        let text = serde_json::to_string(&s).unwrap();
        let alpha = text.find("alpha").unwrap();
        let beta = text.find("beta").unwrap();
        assert!(alpha < beta);
    }
}
