//! Lifecycle events for jobs and steps.
//!
//! Every event carries the same envelope: the kind with its payload, the job
//! id, a correlation id for external tracing, and a timestamp. Events for a
//! given job are published in commit order (after the state change they
//! describe has been persisted).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One job or step lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// What happened, with its payload.
    #[serde(flatten)]
    pub kind: JobEventKind,
    /// The job this event belongs to.
    pub job_id: Uuid,
    /// Opaque tracing identifier propagated from submission.
    pub correlation_id: String,
    /// When the event was committed.
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    /// Build an event stamped with the current time.
    pub fn new(kind: JobEventKind, job_id: Uuid, correlation_id: impl Into<String>) -> Self {
        Self {
            kind,
            job_id,
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// The agent id for step-scoped events, `None` for job-scoped ones.
    pub fn agent_id(&self) -> Option<&str> {
        match &self.kind {
            JobEventKind::StepStarted { agent_id }
            | JobEventKind::StepCompleted { agent_id, .. }
            | JobEventKind::StepFailed { agent_id, .. }
            | JobEventKind::StepSkipped { agent_id } => Some(agent_id),
            _ => None,
        }
    }

    /// Whether this event marks the end of the job's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            JobEventKind::JobCompleted { .. }
                | JobEventKind::JobFailed { .. }
                | JobEventKind::JobCancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Event kind plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum JobEventKind {
    /// The job was accepted and enqueued.
    JobSubmitted { workflow_id: String },
    /// A worker picked the job up.
    JobStarted,
    /// The job was parked on a pause request or an approval gate.
    JobPaused { reason: String },
    /// The job was re-enqueued after a pause.
    JobResumed,
    /// All required steps completed.
    JobCompleted { completed_steps: usize },
    /// A required step failed permanently (or persistence gave out).
    JobFailed { error: String },
    /// The job was cancelled cooperatively.
    JobCancelled,

    /// A step attempt began.
    StepStarted { agent_id: String },
    /// A step settled successfully.
    StepCompleted { agent_id: String, duration_ms: u64 },
    /// A step attempt failed.
    StepFailed {
        agent_id: String,
        error: String,
        will_retry: bool,
    },
    /// A step was skipped (condition false, missing optional agent, or
    /// denied approval).
    StepSkipped { agent_id: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
