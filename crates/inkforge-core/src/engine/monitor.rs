//! Background job health monitor.
//!
//! Periodically samples the in-memory job map and flags jobs that claim to
//! be running but have not persisted progress within the stall window. The
//! monitor only observes and reports (tracing + job trace log); recovery
//! stays an operator decision via cancel or checkpoint restore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use inkforge_types::job::{JobState, JobStatus};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::store::JobStore;

use super::{EngineInner, JobEngine};

/// Default sampling interval.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Running jobs whose last persist is older than this are reported stalled.
pub const DEFAULT_STALL_AFTER_SECS: i64 = 600;

/// Jobs that look stuck: running, but silent past the stall window.
pub(crate) fn find_stalled(jobs: &HashMap<Uuid, JobState>, stall_after_secs: i64) -> Vec<Uuid> {
    let cutoff = Utc::now() - chrono::Duration::seconds(stall_after_secs);
    let mut stalled: Vec<Uuid> = jobs
        .values()
        .filter(|s| s.metadata.status == JobStatus::Running)
        .filter(|s| s.metadata.updated_at < cutoff)
        .map(|s| s.metadata.job_id)
        .collect();
    stalled.sort();
    stalled
}

async fn monitor_loop<S: JobStore>(
    inner: Arc<EngineInner<S>>,
    sample_interval: Duration,
    stall_after_secs: i64,
) {
    let mut ticker = tokio::time::interval(sample_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let stalled = {
            let jobs = inner.jobs.read().await;
            find_stalled(&jobs, stall_after_secs)
        };
        for job_id in stalled {
            tracing::warn!(
                job_id = %job_id,
                stall_after_secs,
                "job running without progress past the stall window"
            );
            inner
                .trace(
                    job_id,
                    &format!("health: no progress for over {stall_after_secs}s"),
                )
                .await;
        }
    }
}

impl<S: JobStore + 'static> JobEngine<S> {
    /// Spawn the health monitor. The task winds down with the engine's
    /// shutdown token; the handle is returned for callers that want to await
    /// or abort it directly.
    pub fn spawn_stall_monitor(
        &self,
        sample_interval: Duration,
        stall_after_secs: i64,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(monitor_loop(inner, sample_interval, stall_after_secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
