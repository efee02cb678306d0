//! Job store trait.
//!
//! Defines the persistence interface for job state, user-visible outputs,
//! log traces, archival, and checkpoint files. The production filesystem
//! implementation lives in `inkforge-infra`; [`memory::MemoryJobStore`] backs
//! tests and embedded use.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use std::collections::BTreeMap;

use inkforge_types::checkpoint::Checkpoint;
use inkforge_types::error::StoreError;
use inkforge_types::job::{JobMetadata, JobState, JobStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod memory;

pub use memory::MemoryJobStore;

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Size and count for one status bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBucket {
    pub count: usize,
    pub bytes: u64,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Buckets keyed by status name (`pending`, `running`, ... `archived`).
    pub per_status: BTreeMap<String, StatusBucket>,
    pub total_jobs: usize,
    pub total_bytes: u64,
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

/// Durable storage for jobs.
///
/// The store is process-local; exactly one engine owns it. `save` must be
/// crash-atomic (readers never observe a torn `state.json`) and must bump
/// `updated_at` on the state it persists.
pub trait JobStore: Send + Sync {
    // -- job state -----------------------------------------------------------

    /// Persist the full job state atomically, bumping `updated_at` in place.
    fn save(
        &self,
        state: &mut JobState,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Load a job's state; optionally look in the archive as well.
    fn load(
        &self,
        job_id: Uuid,
        include_archive: bool,
    ) -> impl std::future::Future<Output = Result<Option<JobState>, StoreError>> + Send;

    /// Remove a job (active or archived). Returns `true` if it existed.
    fn delete(
        &self,
        job_id: Uuid,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Move a terminal job into the archive tree, stamping `archived_at`.
    fn archive(
        &self,
        job_id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Move an archived job back into the active tree.
    fn unarchive(
        &self,
        job_id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// List job metadata, newest first, optionally filtered by status.
    fn list(
        &self,
        status: Option<JobStatus>,
        limit: Option<usize>,
        include_archive: bool,
    ) -> impl std::future::Future<Output = Result<Vec<JobMetadata>, StoreError>> + Send;

    /// Remove archived jobs older than `days`. Returns how many were removed.
    fn cleanup_old_archives(
        &self,
        days: i64,
    ) -> impl std::future::Future<Output = Result<usize, StoreError>> + Send;

    /// Counts and byte sizes per status bucket.
    fn stats(&self) -> impl std::future::Future<Output = Result<StoreStats, StoreError>> + Send;

    // -- artifacts & logs ----------------------------------------------------

    /// Write a user-visible artifact under the job's `outputs/` tree.
    fn save_output(
        &self,
        job_id: Uuid,
        name: &str,
        content: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Read a user-visible artifact.
    fn load_output(
        &self,
        job_id: Uuid,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Append one line to the job's human-readable trace log.
    fn append_log(
        &self,
        job_id: Uuid,
        line: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Read the job's full trace log, if any was written.
    fn read_log(
        &self,
        job_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<String>, StoreError>> + Send;

    // -- checkpoints ---------------------------------------------------------

    /// Persist a checkpoint file (append-only; replaces only the same id).
    fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Load a checkpoint by job and id.
    fn load_checkpoint(
        &self,
        job_id: Uuid,
        checkpoint_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, StoreError>> + Send;

    /// All checkpoints of a job. Corrupt files are skipped, not fatal.
    fn list_checkpoints(
        &self,
        job_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, StoreError>> + Send;

    /// Delete one checkpoint. Returns `true` if it existed.
    fn delete_checkpoint(
        &self,
        job_id: Uuid,
        checkpoint_id: Uuid,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Locate a checkpoint by id alone (scans active and archived jobs).
    fn find_checkpoint(
        &self,
        checkpoint_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, StoreError>> + Send;
}
