//! MCP agent contracts.
//!
//! Every agent self-describes through an `McpContract`: its input/output
//! JSON Schemas, the checkpoint names it yields at, runtime bounds, side
//! effects, and which parameters may change mid-run. The engine validates
//! inputs against the contract on dispatch; violations surface as
//! `InvalidInputs` before the agent ever runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Side effects
// ---------------------------------------------------------------------------

/// Declared side-effect classes of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    None,
    Read,
    Write,
    Network,
    Fs,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Machine-readable declaration of an agent's interface and behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpContract {
    /// Agent id, unique in the registry.
    pub id: String,
    /// Contract version string.
    pub version: String,
    /// JSON Schema for the input map.
    pub inputs: Value,
    /// JSON Schema for the output map.
    pub outputs: Value,
    /// Named checkpoints the agent yields at (control-plane yield points).
    #[serde(default)]
    pub checkpoints: Vec<String>,
    /// Upper bound on the agent's own runtime in seconds.
    pub max_runtime_s: u64,
    /// Self-reported confidence in [0, 1].
    pub confidence: f64,
    /// Declared side effects.
    #[serde(default)]
    pub side_effects: Vec<SideEffect>,
    /// Optional human description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Parameters the control plane may change mid-run.
    #[serde(default)]
    pub mutable_params: Vec<String>,
}

impl McpContract {
    /// Validate the contract itself. Returns every violation found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.id.is_empty() {
            errors.push("id is required".to_string());
        }
        if self.version.is_empty() {
            errors.push("version is required".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            errors.push("confidence must be between 0 and 1".to_string());
        }
        if self.max_runtime_s == 0 {
            errors.push("max_runtime_s must be positive".to_string());
        }
        if !self.inputs.is_object() {
            errors.push("inputs must be a JSON Schema object".to_string());
        }
        if !self.outputs.is_object() {
            errors.push("outputs must be a JSON Schema object".to_string());
        }
        errors
    }

    /// Required input keys declared by the schema (`"required": [...]`).
    pub fn required_inputs(&self) -> Vec<&str> {
        self.inputs
            .get("required")
            .and_then(Value::as_array)
            .map(|keys| keys.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Whether the contract declares any agent-side checkpoint yields.
    pub fn yields_checkpoints(&self) -> bool {
        !self.checkpoints.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
