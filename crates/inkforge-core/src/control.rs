//! Realtime control plane: per-job pause/cancel/step signals and runtime
//! parameter injection.
//!
//! Each non-terminal job owns a [`JobControl`] record. The public API sets
//! flags; the execution loop polls them at its yield points (before each
//! dispatch, before each retry, and at least every [`CONTROL_POLL`] during a
//! long agent call), which is what bounds control latency to under two
//! seconds. Cancellation is always cooperative.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use inkforge_types::job::ValueMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Interval at which the executor re-checks control flags while an agent call
/// is in flight. Well under the two-second observation bound.
pub const CONTROL_POLL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Step mode
// ---------------------------------------------------------------------------

/// Single-shot stepping signal for interactive debugging. The executor blocks
/// after the next step transition until the mode is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    Into,
    Over,
    Out,
}

// ---------------------------------------------------------------------------
// JobControl
// ---------------------------------------------------------------------------

/// Control record for a single job.
pub struct JobControl {
    job_id: Uuid,
    pause: AtomicBool,
    cancel: CancellationToken,
    new_params: Mutex<Option<ValueMap>>,
    step_mode: Mutex<Option<StepMode>>,
    notify: Notify,
}

impl JobControl {
    fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            pause: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            new_params: Mutex::new(None),
            step_mode: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// The job this record controls.
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    // -- pause ---------------------------------------------------------------

    /// Request a cooperative pause.
    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Clear the pause flag (resume path).
    pub fn clear_pause(&self) {
        self.pause.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether a pause has been requested.
    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    // -- cancel --------------------------------------------------------------

    /// Request cooperative cancellation. Irreversible for this record.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
        self.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token observed by in-flight agent invocations.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    // -- runtime parameters --------------------------------------------------

    /// Stage parameters to merge at the job's next yield point. Later calls
    /// merge over earlier ones, last writer wins per key.
    pub fn set_params(&self, params: ValueMap) {
        let mut slot = self.new_params.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_mut() {
            Some(pending) => pending.extend(params),
            None => *slot = Some(params),
        }
        self.notify.notify_waiters();
    }

    /// Take staged parameters, leaving the slot empty.
    pub fn take_params(&self) -> Option<ValueMap> {
        self.new_params
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    // -- step mode -----------------------------------------------------------

    /// Arm the single-shot step signal.
    pub fn request_step(&self, mode: StepMode) {
        *self.step_mode.lock().unwrap_or_else(|e| e.into_inner()) = Some(mode);
        self.notify.notify_waiters();
    }

    /// Clear the step signal, releasing a blocked executor.
    pub fn clear_step(&self) {
        *self.step_mode.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.notify.notify_waiters();
    }

    /// Current step mode, if armed.
    pub fn step_mode(&self) -> Option<StepMode> {
        *self.step_mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until the step signal is cleared or the job is cancelled.
    pub async fn wait_step_cleared(&self) {
        loop {
            if self.step_mode().is_none() || self.cancel_requested() {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after registering interest so a clear between the
            // check and the await cannot be missed.
            if self.step_mode().is_none() || self.cancel_requested() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }
}

impl std::fmt::Debug for JobControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobControl")
            .field("job_id", &self.job_id)
            .field("pause", &self.pause_requested())
            .field("cancel", &self.cancel_requested())
            .field("step_mode", &self.step_mode())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// JobController
// ---------------------------------------------------------------------------

/// Owns the control records for every non-terminal job.
#[derive(Default)]
pub struct JobController {
    controls: DashMap<Uuid, Arc<JobControl>>,
}

impl JobController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return the existing) control record for a job.
    pub fn register(&self, job_id: Uuid) -> Arc<JobControl> {
        self.controls
            .entry(job_id)
            .or_insert_with(|| Arc::new(JobControl::new(job_id)))
            .clone()
    }

    /// Look up the control record for a job.
    pub fn get(&self, job_id: Uuid) -> Option<Arc<JobControl>> {
        self.controls.get(&job_id).map(|entry| Arc::clone(&entry))
    }

    /// Drop the control record once a job settles.
    pub fn remove(&self, job_id: Uuid) {
        self.controls.remove(&job_id);
    }

    /// Number of live control records.
    pub fn len(&self) -> usize {
        self.controls.len()
    }

    /// Whether no jobs are under control.
    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flags_start_clear() {
        let control = JobControl::new(Uuid::now_v7());
        assert!(!control.pause_requested());
        assert!(!control.cancel_requested());
        assert!(control.step_mode().is_none());
        assert!(control.take_params().is_none());
    }

    #[test]
    fn pause_set_and_clear() {
        let control = JobControl::new(Uuid::now_v7());
        control.request_pause();
        assert!(control.pause_requested());
        control.clear_pause();
        assert!(!control.pause_requested());
    }

    #[test]
    fn staged_params_merge_last_writer_wins() {
        let control = JobControl::new(Uuid::now_v7());
        control.set_params(ValueMap::from([
            ("tone".to_string(), json!("formal")),
            ("length".to_string(), json!(800)),
        ]));
        control.set_params(ValueMap::from([("tone".to_string(), json!("casual"))]));

        let params = control.take_params().unwrap();
        assert_eq!(params["tone"], json!("casual"));
        assert_eq!(params["length"], json!(800));
        assert!(control.take_params().is_none());
    }

    #[tokio::test]
    async fn wait_step_cleared_unblocks_on_clear() {
        let control = Arc::new(JobControl::new(Uuid::now_v7()));
        control.request_step(StepMode::Over);

        let waiter = Arc::clone(&control);
        let handle = tokio::spawn(async move { waiter.wait_step_cleared().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        control.clear_step();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should unblock")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_step_cleared_unblocks_on_cancel() {
        let control = Arc::new(JobControl::new(Uuid::now_v7()));
        control.request_step(StepMode::Into);

        let waiter = Arc::clone(&control);
        let handle = tokio::spawn(async move { waiter.wait_step_cleared().await });

        control.request_cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should unblock")
            .unwrap();
    }

    #[test]
    fn controller_register_is_idempotent() {
        let controller = JobController::new();
        let id = Uuid::now_v7();
        let a = controller.register(id);
        let b = controller.register(id);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(controller.len(), 1);

        controller.remove(id);
        assert!(controller.is_empty());
        assert!(controller.get(id).is_none());
    }
}
