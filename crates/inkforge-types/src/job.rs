//! Job and step state for workflow executions.
//!
//! A `Job` is one execution of a workflow against a specific input map. Its
//! durable form is `JobState`: metadata, the opaque input/output maps, and a
//! per-step `StepExecution` record. The status enums encode the lifecycle
//! state machines; invalid transitions are rejected at the type level via
//! [`JobStatus::can_transition_to`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque key/value map used for job inputs, step outputs, and agent I/O.
pub type ValueMap = HashMap<String, Value>;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
///
/// Legal transitions:
/// `pending -> running -> {paused <-> running} -> {completed|failed|cancelled}`,
/// `pending -> cancelled` (cancel before dequeue), and any terminal state
/// `-> archived` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Archived,
}

impl JobStatus {
    /// Whether the job has reached a terminal outcome (archived excluded --
    /// archival is a storage transition, not an outcome).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Cancelled) => {
                true
            }
            (Paused, Running) | (Paused, Cancelled) | (Paused, Failed) => true,
            (s, Archived) => s.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a single step within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Whether this step no longer needs scheduling.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

// ---------------------------------------------------------------------------
// StepExecution
// ---------------------------------------------------------------------------

/// Execution record for one step (one agent invocation) within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    /// Agent id this step dispatches to (unique within the plan).
    pub agent_id: String,
    /// Current step status.
    pub status: StepStatus,
    /// When the most recent attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step settled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Error message from the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Output map produced by the step (preserved for audit even after the
    /// merge into job outputs).
    #[serde(default)]
    pub output: ValueMap,
    /// Number of retries consumed (0 on the first attempt).
    #[serde(default)]
    pub retry_count: u32,
    /// Wall-clock duration of the last attempt in seconds.
    #[serde(default)]
    pub duration_seconds: f64,
}

impl StepExecution {
    /// A fresh pending record for the given agent.
    pub fn pending(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            output: ValueMap::new(),
            retry_count: 0,
            duration_seconds: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// JobMetadata
// ---------------------------------------------------------------------------

/// Audit entry recorded whenever runtime parameters are merged into a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamUpdate {
    /// When the merge was applied.
    pub at: DateTime<Utc>,
    /// The parameter keys that were merged.
    pub keys: Vec<String>,
}

/// Summary metadata for a job, cheap to list and serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Globally unique job id (UUIDv7, time-sortable).
    pub job_id: Uuid,
    /// Workflow this job executes.
    pub workflow_id: String,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// When a worker first picked the job up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last persistence timestamp.
    pub updated_at: DateTime<Utc>,
    /// Fraction of completed steps in [0, 1].
    #[serde(default)]
    pub progress: f64,
    /// The step currently executing, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Total steps in the compiled plan.
    #[serde(default)]
    pub total_steps: usize,
    /// Steps that completed successfully.
    #[serde(default)]
    pub completed_steps: usize,
    /// Steps that failed permanently.
    #[serde(default)]
    pub failed_steps: usize,
    /// Summary of the failure cause for failed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Opaque identifier propagated onto every event for external tracing.
    pub correlation_id: String,
    /// Audit trail of runtime parameter merges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub param_updates: Vec<ParamUpdate>,
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Complete durable state of a job execution.
///
/// Exactly one worker mutates a `JobState` at a time; the engine enforces
/// this by routing each job id through a single queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    /// Summary metadata.
    pub metadata: JobMetadata,
    /// The inputs the job was submitted with (plus later parameter merges).
    #[serde(default)]
    pub inputs: ValueMap,
    /// Outputs merged from all completed steps, last writer wins per key.
    #[serde(default)]
    pub outputs: ValueMap,
    /// Per-step execution records keyed by agent id.
    #[serde(default)]
    pub steps: HashMap<String, StepExecution>,
    /// Execution context: the serialized plan under `execution_plan` plus
    /// compiler metadata. Opaque to the store.
    #[serde(default)]
    pub context: ValueMap,
}

impl JobState {
    /// Recompute `progress`, `completed_steps` and `failed_steps` from the
    /// step records. Progress is completed over total; failed and skipped
    /// steps do not advance it.
    pub fn update_progress(&mut self) {
        let total = self.metadata.total_steps.max(1);
        self.metadata.completed_steps = self
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        self.metadata.failed_steps = self
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Failed)
            .count();
        self.metadata.progress = self.metadata.completed_steps as f64 / total as f64;
    }

    /// Get a step record by agent id.
    pub fn step(&self, agent_id: &str) -> Option<&StepExecution> {
        self.steps.get(agent_id)
    }

    /// Mark a step as running and stamp its start time.
    pub fn mark_step_started(&mut self, agent_id: &str) {
        if let Some(step) = self.steps.get_mut(agent_id) {
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
            step.error = None;
        }
        self.metadata.current_step = Some(agent_id.to_string());
    }

    /// Mark a step as completed, record its output, and merge it into the
    /// job-level outputs (last writer wins per key).
    pub fn mark_step_completed(&mut self, agent_id: &str, output: ValueMap) {
        if let Some(step) = self.steps.get_mut(agent_id) {
            let now = Utc::now();
            step.status = StepStatus::Completed;
            step.completed_at = Some(now);
            if let Some(started) = step.started_at {
                step.duration_seconds = (now - started).num_milliseconds() as f64 / 1000.0;
            }
            step.output = output.clone();
        }
        for (key, value) in output {
            self.outputs.insert(key, value);
        }
        self.metadata.current_step = None;
        self.update_progress();
    }

    /// Mark a step as permanently failed.
    pub fn mark_step_failed(&mut self, agent_id: &str, error: &str) {
        if let Some(step) = self.steps.get_mut(agent_id) {
            let now = Utc::now();
            step.status = StepStatus::Failed;
            step.completed_at = Some(now);
            if let Some(started) = step.started_at {
                step.duration_seconds = (now - started).num_milliseconds() as f64 / 1000.0;
            }
            step.error = Some(error.to_string());
        }
        self.metadata.current_step = None;
        self.update_progress();
    }

    /// Mark a step as skipped (condition false, missing optional agent, or
    /// denied approval).
    pub fn mark_step_skipped(&mut self, agent_id: &str) {
        if let Some(step) = self.steps.get_mut(agent_id) {
            step.status = StepStatus::Skipped;
            step.completed_at = Some(Utc::now());
        }
        self.update_progress();
    }

    /// Reset a step to pending for a retry attempt, bumping its retry count.
    pub fn reset_step_for_retry(&mut self, agent_id: &str) {
        if let Some(step) = self.steps.get_mut(agent_id) {
            step.status = StepStatus::Pending;
            step.retry_count += 1;
        }
    }

    /// Reset a step to pending without consuming a retry (pause/crash
    /// recovery of an in-flight attempt).
    pub fn reset_step_interrupted(&mut self, agent_id: &str) {
        if let Some(step) = self.steps.get_mut(agent_id) {
            step.status = StepStatus::Pending;
            step.started_at = None;
        }
        if self.metadata.current_step.as_deref() == Some(agent_id) {
            self.metadata.current_step = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
