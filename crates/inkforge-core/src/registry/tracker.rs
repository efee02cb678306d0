//! Per-agent execution statistics.
//!
//! The engine records every attempt outcome here; operators read the
//! aggregate to spot slow or flaky agents. Tracking is advisory -- it never
//! influences scheduling.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Aggregate statistics for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    /// Attempts dispatched (retries and fallback runs included).
    pub invocations: u64,
    /// Attempts that returned an output.
    pub successes: u64,
    /// Attempts that failed or timed out.
    pub failures: u64,
    /// Total wall-clock across successful attempts, milliseconds.
    pub total_duration_ms: u64,
    /// Most recent failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl AgentStats {
    /// Mean duration of successful attempts, milliseconds.
    pub fn mean_duration_ms(&self) -> u64 {
        if self.successes == 0 {
            0
        } else {
            self.total_duration_ms / self.successes
        }
    }

    /// Fraction of attempts that succeeded, 1.0 when none ran.
    pub fn success_rate(&self) -> f64 {
        if self.invocations == 0 {
            return 1.0;
        }
        self.successes as f64 / self.invocations as f64
    }
}

/// Concurrent per-agent stats collector.
#[derive(Default)]
pub struct AgentTracker {
    stats: DashMap<String, AgentStats>,
}

impl AgentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful attempt.
    pub fn record_success(&self, agent_id: &str, duration_ms: u64) {
        let mut entry = self.stats.entry(agent_id.to_string()).or_default();
        entry.invocations += 1;
        entry.successes += 1;
        entry.total_duration_ms += duration_ms;
    }

    /// Record a failed or timed-out attempt.
    pub fn record_failure(&self, agent_id: &str, error: &str) {
        let mut entry = self.stats.entry(agent_id.to_string()).or_default();
        entry.invocations += 1;
        entry.failures += 1;
        entry.last_error = Some(error.to_string());
    }

    /// Stats for one agent, if it has run.
    pub fn stats(&self, agent_id: &str) -> Option<AgentStats> {
        self.stats.get(agent_id).map(|s| s.clone())
    }

    /// Snapshot of all agents, sorted by id.
    pub fn snapshot(&self) -> BTreeMap<String, AgentStats> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
