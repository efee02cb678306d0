//! Agent registry: explicit registration and lookup by id.
//!
//! Agents are registered at construction time with [`AgentRegistry::register`]
//! (no discovery by scanning); the registry is read-mostly after startup and
//! shared by all workers. Dispatch-time input validation against the agent's
//! contract also lives here.

use std::sync::Arc;

use dashmap::DashMap;
use inkforge_types::contract::{McpContract, SideEffect};
use inkforge_types::error::AgentError;
use inkforge_types::job::ValueMap;
use serde_json::Value;

pub mod agent;
pub mod tracker;

pub use agent::{Agent, AgentDyn, BoxAgent, StepYield};
pub use tracker::{AgentStats, AgentTracker};

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

/// Registry of agents keyed by contract id.
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Arc<BoxAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its contract id.
    ///
    /// The contract is validated first; an invalid contract is rejected.
    /// Re-registering an id replaces the previous agent.
    pub fn register<T: Agent>(&self, agent: T) -> Result<(), AgentError> {
        let boxed = BoxAgent::new(agent);
        let errors = boxed.contract().validate();
        if !errors.is_empty() {
            return Err(AgentError::InvalidInputs(format!(
                "invalid contract for '{}': {}",
                boxed.contract().id,
                errors.join(", ")
            )));
        }
        let id = boxed.contract().id.clone();
        tracing::debug!(agent_id = id.as_str(), "registered agent");
        self.agents.insert(id, Arc::new(boxed));
        Ok(())
    }

    /// Resolve an agent by id.
    pub fn get(&self, agent_id: &str) -> Option<Arc<BoxAgent>> {
        self.agents.get(agent_id).map(|entry| Arc::clone(&entry))
    }

    /// Whether an agent is registered.
    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// All registered contracts, sorted by id.
    pub fn contracts(&self) -> Vec<McpContract> {
        let mut all: Vec<McpContract> = self
            .agents
            .iter()
            .map(|entry| entry.value().contract().clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Search contracts by description substring and/or declared side effect.
    pub fn search(&self, capability: Option<&str>, side_effect: Option<SideEffect>) -> Vec<McpContract> {
        self.contracts()
            .into_iter()
            .filter(|c| {
                capability.is_none_or(|cap| {
                    c.description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&cap.to_lowercase()))
                })
            })
            .filter(|c| side_effect.is_none_or(|se| c.side_effects.contains(&se)))
            .collect()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Contract input validation
// ---------------------------------------------------------------------------

/// Validate an assembled input map against an agent contract.
///
/// Checks that every `required` key of the input schema is present and that
/// primitive `properties` types match where both sides declare one. Synthetic
/// engine keys (`_job_id`, ...) are always allowed.
pub fn validate_inputs(contract: &McpContract, input: &ValueMap) -> Result<(), AgentError> {
    for key in contract.required_inputs() {
        if !input.contains_key(key) {
            return Err(AgentError::InvalidInputs(format!(
                "agent '{}' requires input key '{}'",
                contract.id, key
            )));
        }
    }

    if let Some(properties) = contract.inputs.get("properties").and_then(Value::as_object) {
        for (key, schema) in properties {
            let Some(value) = input.get(key) else { continue };
            let Some(expected) = schema.get("type").and_then(Value::as_str) else {
                continue;
            };
            if !value_matches_type(value, expected) {
                return Err(AgentError::InvalidInputs(format!(
                    "agent '{}': input key '{}' expected type '{}'",
                    contract.id, key, expected
                )));
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
