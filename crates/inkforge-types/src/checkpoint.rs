//! Named checkpoints: durable snapshots of job state at step boundaries.
//!
//! Two checkpoint models coexist. Implicit snapshots are just `state.json`
//! rewrites handled by the store; the types here describe the explicit,
//! human-visible checkpoints that support restore and approval gates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

/// Approval outcome for a gated checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// A durable, named snapshot of job state at a step boundary.
///
/// Checkpoints are append-only; deletion is explicit and bounded by the
/// retention policy of the checkpoint manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint id (UUIDv7).
    pub checkpoint_id: Uuid,
    /// The job this checkpoint belongs to.
    pub job_id: Uuid,
    /// The step boundary this snapshot was taken at.
    pub step_name: String,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Version of the workflow definition at snapshot time.
    pub workflow_version: String,
    /// Full serialized `JobState`.
    pub state_snapshot: Value,
    /// Whether progressing past this checkpoint requires approval.
    #[serde(default)]
    pub approval_required: bool,
    /// Approval outcome; `None` for ungated checkpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_status: Option<ApprovalStatus>,
}

impl Checkpoint {
    /// Summary view without the snapshot payload.
    pub fn metadata(&self) -> CheckpointMetadata {
        CheckpointMetadata {
            checkpoint_id: self.checkpoint_id,
            job_id: self.job_id,
            step_name: self.step_name.clone(),
            timestamp: self.timestamp,
            workflow_version: self.workflow_version.clone(),
            approval_required: self.approval_required,
            approval_status: self.approval_status,
        }
    }
}

/// Checkpoint listing entry: everything but the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub checkpoint_id: Uuid,
    pub job_id: Uuid,
    pub step_name: String,
    pub timestamp: DateTime<Utc>,
    pub workflow_version: String,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_status: Option<ApprovalStatus>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
