//! Checkpoint manager: explicit, named snapshots with approval gates.
//!
//! Wraps a [`JobStore`] with the checkpoint lifecycle: append-only saves at
//! step boundaries, descending listings, restore, explicit deletion, bounded
//! retention cleanup, and the approve/deny flow for gated steps. Implicit
//! restart snapshots are just `state.json` rewrites and never pass through
//! here.

use std::sync::Arc;

use chrono::Utc;
use inkforge_types::checkpoint::{ApprovalStatus, Checkpoint, CheckpointMetadata};
use inkforge_types::error::StoreError;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::store::JobStore;

/// Bounds on `cleanup(keep_last)`.
pub const MIN_RETAINED_CHECKPOINTS: usize = 1;
pub const MAX_RETAINED_CHECKPOINTS: usize = 100;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint store error: {0}")]
    Store(#[from] StoreError),

    #[error("checkpoint not found: {0}")]
    NotFound(Uuid),

    #[error("retention must be within {MIN_RETAINED_CHECKPOINTS}..={MAX_RETAINED_CHECKPOINTS}, got {0}")]
    InvalidRetention(usize),

    #[error("checkpoint {0} is not an approval gate")]
    NotGated(Uuid),

    #[error("checkpoint {0} approval already resolved")]
    AlreadyResolved(Uuid),
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Structured checkpoint lifecycle over any [`JobStore`].
pub struct CheckpointManager<S: JobStore> {
    store: Arc<S>,
}

impl<S: JobStore> CheckpointManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Append a checkpoint at a step boundary. Gated checkpoints start with
    /// `approval_status = pending`.
    pub async fn save(
        &self,
        job_id: Uuid,
        step_name: &str,
        state_snapshot: Value,
        workflow_version: &str,
        approval_required: bool,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint {
            checkpoint_id: Uuid::now_v7(),
            job_id,
            step_name: step_name.to_string(),
            timestamp: Utc::now(),
            workflow_version: workflow_version.to_string(),
            state_snapshot,
            approval_required,
            approval_status: approval_required.then_some(ApprovalStatus::Pending),
        };
        self.store.save_checkpoint(&checkpoint).await?;

        tracing::debug!(
            job_id = %job_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            step = step_name,
            gated = approval_required,
            "saved checkpoint"
        );
        Ok(checkpoint)
    }

    /// Checkpoint metadata for a job, newest first.
    pub async fn list(&self, job_id: Uuid) -> Result<Vec<CheckpointMetadata>, CheckpointError> {
        let checkpoints = self.store.list_checkpoints(job_id).await?;
        Ok(checkpoints.iter().map(Checkpoint::metadata).collect())
    }

    /// Load a full checkpoint.
    pub async fn get(
        &self,
        job_id: Uuid,
        checkpoint_id: Uuid,
    ) -> Result<Checkpoint, CheckpointError> {
        self.store
            .load_checkpoint(job_id, checkpoint_id)
            .await?
            .ok_or(CheckpointError::NotFound(checkpoint_id))
    }

    /// Return the state snapshot of a checkpoint. Callers decide whether to
    /// resume from it.
    pub async fn restore(
        &self,
        job_id: Uuid,
        checkpoint_id: Uuid,
    ) -> Result<Value, CheckpointError> {
        Ok(self.get(job_id, checkpoint_id).await?.state_snapshot)
    }

    /// Delete one checkpoint.
    pub async fn delete(
        &self,
        job_id: Uuid,
        checkpoint_id: Uuid,
    ) -> Result<(), CheckpointError> {
        if self.store.delete_checkpoint(job_id, checkpoint_id).await? {
            Ok(())
        } else {
            Err(CheckpointError::NotFound(checkpoint_id))
        }
    }

    /// Retain only the newest `keep_last` checkpoints of a job. Returns how
    /// many were deleted.
    pub async fn cleanup(&self, job_id: Uuid, keep_last: usize) -> Result<usize, CheckpointError> {
        if !(MIN_RETAINED_CHECKPOINTS..=MAX_RETAINED_CHECKPOINTS).contains(&keep_last) {
            return Err(CheckpointError::InvalidRetention(keep_last));
        }
        // Listings are newest first; everything past `keep_last` goes.
        let checkpoints = self.store.list_checkpoints(job_id).await?;
        let mut removed = 0;
        for stale in checkpoints.iter().skip(keep_last) {
            if self
                .store
                .delete_checkpoint(job_id, stale.checkpoint_id)
                .await?
            {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(job_id = %job_id, removed, keep_last, "checkpoint cleanup");
        }
        Ok(removed)
    }

    /// Resolve an approval gate. Returns the updated checkpoint.
    pub async fn approve(
        &self,
        job_id: Uuid,
        checkpoint_id: Uuid,
        approved: bool,
    ) -> Result<Checkpoint, CheckpointError> {
        let mut checkpoint = self.get(job_id, checkpoint_id).await?;
        if !checkpoint.approval_required {
            return Err(CheckpointError::NotGated(checkpoint_id));
        }
        if checkpoint.approval_status != Some(ApprovalStatus::Pending) {
            return Err(CheckpointError::AlreadyResolved(checkpoint_id));
        }
        checkpoint.approval_status = Some(if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        });
        self.store.save_checkpoint(&checkpoint).await?;

        tracing::info!(
            job_id = %job_id,
            checkpoint_id = %checkpoint_id,
            approved,
            step = checkpoint.step_name.as_str(),
            "approval resolved"
        );
        Ok(checkpoint)
    }

    /// The newest checkpoint recorded for a given step, if any.
    pub async fn latest_for_step(
        &self,
        job_id: Uuid,
        step_name: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let checkpoints = self.store.list_checkpoints(job_id).await?;
        Ok(checkpoints.into_iter().find(|c| c.step_name == step_name))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryJobStore;
    use serde_json::json;

    fn manager() -> CheckpointManager<MemoryJobStore> {
        CheckpointManager::new(Arc::new(MemoryJobStore::new()))
    }

    #[tokio::test]
    async fn save_restore_roundtrip() {
        let mgr = manager();
        let job_id = Uuid::now_v7();
        let snapshot = json!({"outputs": {"a": 1}});

        let cp = mgr
            .save(job_id, "after_a", snapshot.clone(), "1.0.0", false)
            .await
            .unwrap();
        assert!(cp.approval_status.is_none());

        let restored = mgr.restore(job_id, cp.checkpoint_id).await.unwrap();
        assert_eq!(restored, snapshot);
    }

    #[tokio::test]
    async fn list_is_descending_by_timestamp() {
        let mgr = manager();
        let job_id = Uuid::now_v7();
        for step in ["a", "b", "c"] {
            mgr.save(job_id, step, json!({}), "1.0.0", false)
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let listed = mgr.list(job_id).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].step_name, "c");
        assert_eq!(listed[2].step_name, "a");
        assert!(listed[0].timestamp >= listed[1].timestamp);
    }

    #[tokio::test]
    async fn cleanup_retains_newest_n() {
        let mgr = manager();
        let job_id = Uuid::now_v7();
        for i in 0..5 {
            mgr.save(job_id, &format!("step-{i}"), json!({}), "1.0.0", false)
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let removed = mgr.cleanup(job_id, 2).await.unwrap();
        assert_eq!(removed, 3);

        let remaining = mgr.list(job_id).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].step_name, "step-4");
        assert_eq!(remaining[1].step_name, "step-3");

        // Cleanup below the existing count is a no-op.
        assert_eq!(mgr.cleanup(job_id, 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cleanup_rejects_out_of_range_retention() {
        let mgr = manager();
        let job_id = Uuid::now_v7();
        assert!(matches!(
            mgr.cleanup(job_id, 0).await.unwrap_err(),
            CheckpointError::InvalidRetention(0)
        ));
        assert!(matches!(
            mgr.cleanup(job_id, 101).await.unwrap_err(),
            CheckpointError::InvalidRetention(101)
        ));
    }

    #[tokio::test]
    async fn missing_checkpoint_is_not_found() {
        let mgr = manager();
        let err = mgr.get(Uuid::now_v7(), Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }

    // -----------------------------------------------------------------------
    // Approval gates
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn gated_checkpoint_starts_pending_and_resolves_once() {
        let mgr = manager();
        let job_id = Uuid::now_v7();
        let cp = mgr
            .save(job_id, "review", json!({}), "1.0.0", true)
            .await
            .unwrap();
        assert_eq!(cp.approval_status, Some(ApprovalStatus::Pending));

        let resolved = mgr.approve(job_id, cp.checkpoint_id, true).await.unwrap();
        assert_eq!(resolved.approval_status, Some(ApprovalStatus::Approved));

        let err = mgr
            .approve(job_id, cp.checkpoint_id, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::AlreadyResolved(_)));
    }

    #[tokio::test]
    async fn denying_records_denied() {
        let mgr = manager();
        let job_id = Uuid::now_v7();
        let cp = mgr
            .save(job_id, "review", json!({}), "1.0.0", true)
            .await
            .unwrap();
        let resolved = mgr.approve(job_id, cp.checkpoint_id, false).await.unwrap();
        assert_eq!(resolved.approval_status, Some(ApprovalStatus::Denied));
    }

    #[tokio::test]
    async fn ungated_checkpoint_rejects_approval() {
        let mgr = manager();
        let job_id = Uuid::now_v7();
        let cp = mgr
            .save(job_id, "after_a", json!({}), "1.0.0", false)
            .await
            .unwrap();
        let err = mgr
            .approve(job_id, cp.checkpoint_id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::NotGated(_)));
    }

    #[tokio::test]
    async fn latest_for_step_finds_newest() {
        let mgr = manager();
        let job_id = Uuid::now_v7();
        mgr.save(job_id, "a", json!({"v": 1}), "1.0.0", false)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        mgr.save(job_id, "a", json!({"v": 2}), "1.0.0", false)
            .await
            .unwrap();

        let latest = mgr.latest_for_step(job_id, "a").await.unwrap().unwrap();
        assert_eq!(latest.state_snapshot, json!({"v": 2}));
        assert!(mgr.latest_for_step(job_id, "zzz").await.unwrap().is_none());
    }
}
