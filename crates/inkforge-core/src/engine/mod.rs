//! Job execution engine: submission, scheduling, and realtime control.
//!
//! `JobEngine` composes the compiler, agent registry, store, checkpoint
//! manager, controller, and event bus into one explicitly constructed root --
//! there are no global singletons; tests build fresh engines. A fixed pool of
//! workers consumes a single FIFO queue of job ids; exactly one worker
//! executes a given job at a time because the id leaves the queue before work
//! begins and is only re-enqueued on explicit resume or restore.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use chrono::Utc;
use dashmap::DashSet;
use inkforge_types::config::EngineConfig;
use inkforge_types::error::StoreError;
use inkforge_types::event::{JobEvent, JobEventKind};
use inkforge_types::job::{JobMetadata, JobState, JobStatus, ParamUpdate, StepExecution, ValueMap};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::{CheckpointError, CheckpointManager};
use crate::compiler::{CompileError, WorkflowCompiler};
use crate::control::{JobController, StepMode};
use crate::event::EventBus;
use crate::registry::{AgentRegistry, AgentStats, AgentTracker};
use crate::store::JobStore;

pub mod artifact;
pub mod executor;
pub mod monitor;
pub mod step;

/// Consecutive persistence failures after which the engine stops accepting
/// new jobs rather than risk corrupting state.
pub const FATAL_PERSIST_FAILURES: u32 = 3;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Submission referenced a workflow that failed to compile.
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(#[from] CompileError),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("batch not found: '{0}'")]
    BatchNotFound(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(Uuid),

    /// A control operation was requested in an incompatible status. The
    /// request is rejected and state is unchanged.
    #[error("cannot {action} job {job_id} in status '{from}'")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        action: &'static str,
    },

    /// Persistence failed even after the retry.
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// The engine is draining after repeated persistence failures.
    #[error("engine is draining and not accepting new jobs")]
    Unavailable,

    #[error("job queue closed")]
    QueueClosed,

    /// A checkpoint snapshot could not be deserialized into job state.
    #[error("corrupt state snapshot: {0}")]
    Snapshot(String),
}

// ---------------------------------------------------------------------------
// Stats & batch types
// ---------------------------------------------------------------------------

/// Engine-level statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub total_jobs: usize,
    pub per_status: BTreeMap<String, usize>,
    pub worker_count: usize,
    pub draining: bool,
}

/// Result of a batch submission.
#[derive(Debug, Clone)]
pub struct BatchSubmission {
    /// Correlation id shared by every job in the batch.
    pub batch_id: String,
    pub job_ids: Vec<Uuid>,
}

/// Aggregate status of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatus {
    pub batch_id: String,
    pub total: usize,
    pub per_status: BTreeMap<String, usize>,
    /// True once every job in the batch is terminal.
    pub complete: bool,
}

// ---------------------------------------------------------------------------
// EngineInner
// ---------------------------------------------------------------------------

pub(crate) struct EngineInner<S: JobStore> {
    pub(crate) config: EngineConfig,
    pub(crate) compiler: Arc<WorkflowCompiler>,
    pub(crate) registry: Arc<AgentRegistry>,
    pub(crate) store: Arc<S>,
    pub(crate) checkpoints: CheckpointManager<S>,
    pub(crate) controller: JobController,
    pub(crate) tracker: AgentTracker,
    pub(crate) events: EventBus,
    /// In-memory view of every known job, guarded by a single lock.
    pub(crate) jobs: RwLock<HashMap<Uuid, JobState>>,
    queue_tx: mpsc::Sender<Uuid>,
    pub(crate) queue_rx: Mutex<mpsc::Receiver<Uuid>>,
    pub(crate) shutdown: CancellationToken,
    draining: AtomicBool,
    persist_failures: AtomicU32,
    /// Jobs force-deleted while a worker might still hold them; persists for
    /// these ids are dropped instead of resurrecting the state file.
    tombstones: DashSet<Uuid>,
}

impl<S: JobStore> EngineInner<S> {
    /// Persist job state: write-through to the store (retry once) and then
    /// refresh the in-memory map.
    pub(crate) async fn persist(&self, state: &mut JobState) -> Result<(), EngineError> {
        let job_id = state.metadata.job_id;
        if self.tombstones.contains(&job_id) {
            return Ok(());
        }

        if let Err(first) = self.store.save(state).await {
            tracing::warn!(job_id = %job_id, error = %first, "state persist failed, retrying once");
            if let Err(second) = self.store.save(state).await {
                let failures = self.persist_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= FATAL_PERSIST_FAILURES {
                    self.draining.store(true, Ordering::SeqCst);
                    tracing::error!(
                        failures,
                        "repeated persistence failures, draining: no new jobs accepted"
                    );
                }
                return Err(EngineError::Persistence(second.to_string()));
            }
        }
        self.persist_failures.store(0, Ordering::SeqCst);
        self.jobs.write().await.insert(job_id, state.clone());
        Ok(())
    }

    /// Publish an event in commit order (call after the matching persist).
    pub(crate) fn emit(&self, state: &JobState, kind: JobEventKind) {
        self.events.publish(JobEvent::new(
            kind,
            state.metadata.job_id,
            state.metadata.correlation_id.clone(),
        ));
    }

    /// Append a line to the job's human-readable trace. Best effort.
    pub(crate) async fn trace(&self, job_id: Uuid, line: &str) {
        let stamped = format!("[{}] {line}", Utc::now().to_rfc3339());
        if let Err(e) = self.store.append_log(job_id, &stamped).await {
            tracing::debug!(job_id = %job_id, error = %e, "job trace write failed");
        }
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub(crate) fn is_tombstoned(&self, job_id: Uuid) -> bool {
        self.tombstones.contains(&job_id)
    }

    async fn enqueue(&self, job_id: Uuid) -> Result<(), EngineError> {
        self.queue_tx
            .send(job_id)
            .await
            .map_err(|_| EngineError::QueueClosed)
    }

    async fn status_of(&self, job_id: Uuid) -> Result<JobStatus, EngineError> {
        if let Some(state) = self.jobs.read().await.get(&job_id) {
            return Ok(state.metadata.status);
        }
        let state = self
            .store
            .load(job_id, true)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;
        Ok(state.metadata.status)
    }
}

/// Legal-transition helper. Callers have already validated the action; this
/// is the final guard that keeps the state machine honest.
pub(crate) fn try_transition(
    state: &mut JobState,
    next: JobStatus,
    action: &'static str,
) -> Result<(), EngineError> {
    let from = state.metadata.status;
    if !from.can_transition_to(next) {
        return Err(EngineError::InvalidTransition {
            job_id: state.metadata.job_id,
            from,
            action,
        });
    }
    state.metadata.status = next;
    Ok(())
}

/// Merge runtime parameters into a job's inputs and record the audit entry.
pub(crate) fn merge_params(state: &mut JobState, params: ValueMap) {
    let mut keys: Vec<String> = params.keys().cloned().collect();
    keys.sort_unstable();
    tracing::info!(
        job_id = %state.metadata.job_id,
        keys = ?keys,
        "merging runtime parameters"
    );
    state.inputs.extend(params);
    state.metadata.param_updates.push(ParamUpdate {
        at: Utc::now(),
        keys,
    });
}

// ---------------------------------------------------------------------------
// JobEngine
// ---------------------------------------------------------------------------

/// The public face of the execution engine.
pub struct JobEngine<S: JobStore + 'static> {
    inner: Arc<EngineInner<S>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: JobStore + 'static> JobEngine<S> {
    /// Compose an engine from its collaborators.
    pub fn new(
        config: EngineConfig,
        compiler: Arc<WorkflowCompiler>,
        registry: Arc<AgentRegistry>,
        store: Arc<S>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let events = EventBus::new(config.event_capacity.max(1));
        let inner = Arc::new(EngineInner {
            checkpoints: CheckpointManager::new(Arc::clone(&store)),
            config,
            compiler,
            registry,
            store,
            controller: JobController::new(),
            tracker: AgentTracker::new(),
            events,
            jobs: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            shutdown: CancellationToken::new(),
            draining: AtomicBool::new(false),
            persist_failures: AtomicU32::new(0),
            tombstones: DashSet::new(),
        });
        Self {
            inner,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Idempotent: calling twice adds no workers.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.inner.config.max_concurrent_jobs.max(1) {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(executor::worker_loop(inner, worker_id)));
        }
        tracing::info!(workers = workers.len(), "job engine started");
    }

    /// Stop accepting queue work and wait for workers to wind down.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        tracing::info!("job engine stopped");
    }

    /// Reload persisted jobs after a restart. Pending jobs are re-enqueued;
    /// jobs interrupted mid-run revert to their last snapshot (completed
    /// steps are kept, in-flight attempts reset) and are re-enqueued; paused
    /// jobs stay parked until resumed. Returns how many jobs re-entered the
    /// queue.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let listed = self.inner.store.list(None, None, false).await?;
        let mut requeued = 0;
        for meta in listed {
            let Some(mut state) = self.inner.store.load(meta.job_id, false).await? else {
                continue;
            };
            match state.metadata.status {
                JobStatus::Pending => {
                    self.inner.controller.register(meta.job_id);
                    self.inner.jobs.write().await.insert(meta.job_id, state);
                    self.inner.enqueue(meta.job_id).await?;
                    requeued += 1;
                }
                JobStatus::Running => {
                    let in_flight: Vec<String> = state
                        .steps
                        .values()
                        .filter(|s| s.status == inkforge_types::job::StepStatus::Running)
                        .map(|s| s.agent_id.clone())
                        .collect();
                    for agent_id in in_flight {
                        state.reset_step_interrupted(&agent_id);
                    }
                    // Direct status rewrite: crash recovery sits outside the
                    // runtime state machine.
                    state.metadata.status = JobStatus::Pending;
                    self.inner.persist(&mut state).await?;
                    self.inner.controller.register(meta.job_id);
                    self.inner.trace(meta.job_id, "recovered after restart").await;
                    self.inner.enqueue(meta.job_id).await?;
                    requeued += 1;
                }
                JobStatus::Paused => {
                    self.inner.controller.register(meta.job_id);
                    self.inner.jobs.write().await.insert(meta.job_id, state);
                }
                _ => {
                    self.inner.jobs.write().await.insert(meta.job_id, state);
                }
            }
        }
        if requeued > 0 {
            tracing::info!(requeued, "recovered persisted jobs");
        }
        Ok(requeued)
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Compile, persist, and enqueue a new job. Fails with `InvalidWorkflow`
    /// if compilation fails; no job is created in that case.
    pub async fn submit(
        &self,
        workflow_id: &str,
        inputs: ValueMap,
        correlation_id: Option<String>,
    ) -> Result<Uuid, EngineError> {
        if self.inner.is_draining() {
            return Err(EngineError::Unavailable);
        }

        let plan = self.inner.compiler.compile(workflow_id)?;
        let definition = self
            .inner
            .compiler
            .definition(workflow_id)
            .ok_or_else(|| CompileError::WorkflowNotFound(workflow_id.to_string()))?;

        let job_id = Uuid::now_v7();
        let correlation_id = correlation_id.unwrap_or_else(|| job_id.to_string());
        let now = Utc::now();

        let steps: HashMap<String, StepExecution> = plan
            .steps
            .iter()
            .map(|s| (s.agent_id.clone(), StepExecution::pending(&s.agent_id)))
            .collect();

        let mut context = ValueMap::new();
        context.insert(
            "execution_plan".to_string(),
            serde_json::to_value(&plan).map_err(|e| EngineError::Snapshot(e.to_string()))?,
        );
        context.insert(
            "workflow_config".to_string(),
            serde_json::to_value(&definition.config)
                .map_err(|e| EngineError::Snapshot(e.to_string()))?,
        );
        context.insert("workflow_version".to_string(), json!(definition.version));

        let mut state = JobState {
            metadata: JobMetadata {
                job_id,
                workflow_id: workflow_id.to_string(),
                status: JobStatus::Pending,
                created_at: now,
                started_at: None,
                completed_at: None,
                updated_at: now,
                progress: 0.0,
                current_step: None,
                total_steps: plan.steps.len(),
                completed_steps: 0,
                failed_steps: 0,
                error_message: None,
                correlation_id,
                param_updates: vec![],
            },
            inputs,
            outputs: ValueMap::new(),
            steps,
            context,
        };

        self.inner.persist(&mut state).await?;
        self.inner.controller.register(job_id);
        self.inner.emit(
            &state,
            JobEventKind::JobSubmitted {
                workflow_id: workflow_id.to_string(),
            },
        );
        self.inner
            .trace(job_id, &format!("submitted workflow '{workflow_id}'"))
            .await;
        self.inner.enqueue(job_id).await?;

        tracing::info!(job_id = %job_id, workflow = workflow_id, "job submitted");
        Ok(job_id)
    }

    /// Submit one job per input map, all sharing a batch correlation id.
    pub async fn submit_batch(
        &self,
        workflow_id: &str,
        inputs_list: Vec<ValueMap>,
    ) -> Result<BatchSubmission, EngineError> {
        let batch_id = format!("batch-{}", Uuid::now_v7());
        let mut job_ids = Vec::with_capacity(inputs_list.len());
        for inputs in inputs_list {
            job_ids.push(
                self.submit(workflow_id, inputs, Some(batch_id.clone()))
                    .await?,
            );
        }
        Ok(BatchSubmission { batch_id, job_ids })
    }

    /// Aggregate status of every job sharing a batch correlation id.
    pub async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus, EngineError> {
        let jobs = self.inner.jobs.read().await;
        let members: Vec<&JobState> = jobs
            .values()
            .filter(|s| s.metadata.correlation_id == batch_id)
            .collect();
        if members.is_empty() {
            return Err(EngineError::BatchNotFound(batch_id.to_string()));
        }
        let mut per_status: BTreeMap<String, usize> = BTreeMap::new();
        for state in &members {
            *per_status
                .entry(state.metadata.status.to_string())
                .or_default() += 1;
        }
        Ok(BatchStatus {
            batch_id: batch_id.to_string(),
            total: members.len(),
            complete: members.iter().all(|s| s.metadata.status.is_terminal()),
            per_status,
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Metadata for one job (archived jobs included).
    pub async fn get_status(&self, job_id: Uuid) -> Result<JobMetadata, EngineError> {
        if let Some(state) = self.inner.jobs.read().await.get(&job_id) {
            return Ok(state.metadata.clone());
        }
        let state = self
            .inner
            .store
            .load(job_id, true)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;
        Ok(state.metadata.clone())
    }

    /// Full state for one job.
    pub async fn get_state(&self, job_id: Uuid) -> Result<JobState, EngineError> {
        if let Some(state) = self.inner.jobs.read().await.get(&job_id) {
            return Ok(state.clone());
        }
        self.inner
            .store
            .load(job_id, true)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    /// Known jobs ordered by creation time, newest first.
    pub async fn list(&self, status: Option<JobStatus>, limit: Option<usize>) -> Vec<JobMetadata> {
        let jobs = self.inner.jobs.read().await;
        let mut all: Vec<JobMetadata> = jobs
            .values()
            .map(|s| s.metadata.clone())
            .filter(|m| status.is_none_or(|st| m.status == st))
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            all.truncate(limit);
        }
        all
    }

    /// Engine statistics.
    pub async fn stats(&self) -> EngineStats {
        let jobs = self.inner.jobs.read().await;
        let mut per_status: BTreeMap<String, usize> = BTreeMap::new();
        for state in jobs.values() {
            *per_status
                .entry(state.metadata.status.to_string())
                .or_default() += 1;
        }
        EngineStats {
            total_jobs: jobs.len(),
            per_status,
            worker_count: self.inner.config.max_concurrent_jobs,
            draining: self.inner.is_draining(),
        }
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Request a cooperative pause. Only valid while running; the executor
    /// observes the flag within two seconds.
    pub async fn pause(&self, job_id: Uuid) -> Result<(), EngineError> {
        let status = self.inner.status_of(job_id).await?;
        if status != JobStatus::Running {
            return Err(EngineError::InvalidTransition {
                job_id,
                from: status,
                action: "pause",
            });
        }
        let control = self
            .inner
            .controller
            .get(job_id)
            .ok_or(EngineError::JobNotFound(job_id))?;
        control.request_pause();
        tracing::info!(job_id = %job_id, "pause requested");
        Ok(())
    }

    /// Resume a paused job: optional parameter merge, clear the pause flag,
    /// transition back to running, re-enqueue.
    pub async fn resume(&self, job_id: Uuid, params: Option<ValueMap>) -> Result<(), EngineError> {
        let mut jobs = self.inner.jobs.write().await;
        let state = jobs
            .get_mut(&job_id)
            .ok_or(EngineError::JobNotFound(job_id))?;
        if state.metadata.status != JobStatus::Paused {
            return Err(EngineError::InvalidTransition {
                job_id,
                from: state.metadata.status,
                action: "resume",
            });
        }
        let mut state = state.clone();
        drop(jobs);

        if let Some(params) = params {
            merge_params(&mut state, params);
        }
        try_transition(&mut state, JobStatus::Running, "resume")?;
        self.inner.persist(&mut state).await?;

        let control = self.inner.controller.register(job_id);
        control.clear_pause();

        self.inner.emit(&state, JobEventKind::JobResumed);
        self.inner.trace(job_id, "resumed").await;
        self.inner.enqueue(job_id).await?;
        tracing::info!(job_id = %job_id, "job resumed");
        Ok(())
    }

    /// Cancel a job from any non-terminal state. Pending and parked jobs are
    /// finalized immediately; running jobs observe the flag at their next
    /// yield point.
    pub async fn cancel(&self, job_id: Uuid) -> Result<(), EngineError> {
        let status = self.inner.status_of(job_id).await?;
        match status {
            JobStatus::Pending | JobStatus::Paused => {
                let mut jobs = self.inner.jobs.write().await;
                let Some(state) = jobs.get_mut(&job_id) else {
                    return Err(EngineError::JobNotFound(job_id));
                };
                let mut state = state.clone();
                drop(jobs);

                // Flag first so a worker that dequeues the id concurrently
                // drops it instead of starting.
                if let Some(control) = self.inner.controller.get(job_id) {
                    control.request_cancel();
                }
                if state.metadata.status == JobStatus::Running {
                    // A worker picked the job up between the status read and
                    // the lock; the flag above makes it finalize instead.
                    return Ok(());
                }
                try_transition(&mut state, JobStatus::Cancelled, "cancel")?;
                state.metadata.completed_at = Some(Utc::now());
                self.inner.persist(&mut state).await?;
                self.inner.emit(&state, JobEventKind::JobCancelled);
                self.inner.trace(job_id, "cancelled").await;
                self.inner.controller.remove(job_id);
                tracing::info!(job_id = %job_id, "job cancelled");
                Ok(())
            }
            JobStatus::Running => {
                let control = self
                    .inner
                    .controller
                    .get(job_id)
                    .ok_or(EngineError::JobNotFound(job_id))?;
                control.request_cancel();
                tracing::info!(job_id = %job_id, "cancel requested");
                Ok(())
            }
            _ => Err(EngineError::InvalidTransition {
                job_id,
                from: status,
                action: "cancel",
            }),
        }
    }

    /// Remove a job from memory and storage. Terminal states only unless
    /// `force` is set.
    pub async fn delete(&self, job_id: Uuid, force: bool) -> Result<(), EngineError> {
        let status = self.inner.status_of(job_id).await?;
        if !status.is_terminal() && status != JobStatus::Archived && !force {
            return Err(EngineError::InvalidTransition {
                job_id,
                from: status,
                action: "delete",
            });
        }
        if force && !status.is_terminal() {
            self.inner.tombstones.insert(job_id);
            if let Some(control) = self.inner.controller.get(job_id) {
                control.request_cancel();
            }
        }
        self.inner.jobs.write().await.remove(&job_id);
        self.inner.controller.remove(job_id);
        self.inner.store.delete(job_id).await?;
        tracing::info!(job_id = %job_id, force, "job deleted");
        Ok(())
    }

    /// Archive a terminal job: move it into the store's archive tree and
    /// drop it from the active in-memory view. Archived jobs never re-enter
    /// scheduling.
    pub async fn archive(&self, job_id: Uuid) -> Result<(), EngineError> {
        let status = self.inner.status_of(job_id).await?;
        if !status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                job_id,
                from: status,
                action: "archive",
            });
        }
        self.inner.store.archive(job_id).await?;
        self.inner.jobs.write().await.remove(&job_id);
        self.inner.controller.remove(job_id);
        tracing::info!(job_id = %job_id, "job archived");
        Ok(())
    }

    /// Merge runtime parameters into a job. Valid only while running or
    /// paused. Running jobs apply the merge at their next yield point; parked
    /// jobs are updated directly.
    pub async fn update_params(&self, job_id: Uuid, params: ValueMap) -> Result<(), EngineError> {
        let status = self.inner.status_of(job_id).await?;
        match status {
            JobStatus::Running => {
                let control = self
                    .inner
                    .controller
                    .get(job_id)
                    .ok_or(EngineError::JobNotFound(job_id))?;
                control.set_params(params);
                Ok(())
            }
            JobStatus::Paused => {
                let mut jobs = self.inner.jobs.write().await;
                let Some(state) = jobs.get_mut(&job_id) else {
                    return Err(EngineError::JobNotFound(job_id));
                };
                let mut state = state.clone();
                drop(jobs);
                merge_params(&mut state, params);
                self.inner.persist(&mut state).await?;
                Ok(())
            }
            _ => Err(EngineError::InvalidTransition {
                job_id,
                from: status,
                action: "update_params",
            }),
        }
    }

    /// Arm the single-shot step signal for a non-terminal job.
    pub async fn step_job(&self, job_id: Uuid, mode: StepMode) -> Result<(), EngineError> {
        let status = self.inner.status_of(job_id).await?;
        if status.is_terminal() || status == JobStatus::Archived {
            return Err(EngineError::InvalidTransition {
                job_id,
                from: status,
                action: "step",
            });
        }
        let control = self
            .inner
            .controller
            .get(job_id)
            .ok_or(EngineError::JobNotFound(job_id))?;
        control.request_step(mode);
        Ok(())
    }

    /// Clear the step signal, releasing a blocked executor.
    pub async fn clear_step(&self, job_id: Uuid) -> Result<(), EngineError> {
        let control = self
            .inner
            .controller
            .get(job_id)
            .ok_or(EngineError::JobNotFound(job_id))?;
        control.clear_step();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// The checkpoint manager, for list / get / delete / cleanup operations.
    pub fn checkpoints(&self) -> &CheckpointManager<S> {
        &self.inner.checkpoints
    }

    /// Replace a job's state with a checkpoint snapshot. With `resume`, the
    /// job transitions to pending and re-enters the queue; otherwise it is
    /// left parked for inspection.
    pub async fn restore_from_checkpoint(
        &self,
        checkpoint_id: Uuid,
        resume: bool,
    ) -> Result<Uuid, EngineError> {
        let checkpoint = self
            .inner
            .store
            .find_checkpoint(checkpoint_id)
            .await?
            .ok_or(EngineError::CheckpointNotFound(checkpoint_id))?;
        let job_id = checkpoint.job_id;

        let current = self.inner.status_of(job_id).await.ok();
        if let Some(from @ (JobStatus::Running | JobStatus::Archived)) = current {
            return Err(EngineError::InvalidTransition {
                job_id,
                from,
                action: "restore",
            });
        }

        let mut state: JobState = serde_json::from_value(checkpoint.state_snapshot)
            .map_err(|e| EngineError::Snapshot(e.to_string()))?;

        let in_flight: Vec<String> = state
            .steps
            .values()
            .filter(|s| s.status == inkforge_types::job::StepStatus::Running)
            .map(|s| s.agent_id.clone())
            .collect();
        for agent_id in in_flight {
            state.reset_step_interrupted(&agent_id);
        }
        state.metadata.completed_at = None;
        state.metadata.error_message = None;
        state.metadata.status = if resume {
            JobStatus::Pending
        } else {
            JobStatus::Paused
        };
        state.update_progress();

        self.inner.tombstones.remove(&job_id);
        self.inner.persist(&mut state).await?;
        self.inner.controller.remove(job_id);
        self.inner.controller.register(job_id);
        self.inner
            .trace(
                job_id,
                &format!(
                    "restored from checkpoint {checkpoint_id} at step '{}'",
                    checkpoint.step_name
                ),
            )
            .await;
        if resume {
            self.inner.enqueue(job_id).await?;
        }
        tracing::info!(job_id = %job_id, checkpoint_id = %checkpoint_id, resume, "restored from checkpoint");
        Ok(job_id)
    }

    /// Resolve an approval gate. Approval resumes the job; denial marks the
    /// gated step skipped and then resumes.
    pub async fn approve(
        &self,
        job_id: Uuid,
        checkpoint_id: Uuid,
        approved: bool,
    ) -> Result<(), EngineError> {
        let status = self.inner.status_of(job_id).await?;
        if status != JobStatus::Paused {
            return Err(EngineError::InvalidTransition {
                job_id,
                from: status,
                action: "approve",
            });
        }

        let checkpoint = self
            .inner
            .checkpoints
            .approve(job_id, checkpoint_id, approved)
            .await?;

        if !approved {
            let mut jobs = self.inner.jobs.write().await;
            if let Some(state) = jobs.get_mut(&job_id) {
                let mut state = state.clone();
                drop(jobs);
                state.mark_step_skipped(&checkpoint.step_name);
                self.inner.persist(&mut state).await?;
                self.inner.emit(
                    &state,
                    JobEventKind::StepSkipped {
                        agent_id: checkpoint.step_name.clone(),
                    },
                );
            }
        }

        self.resume(job_id, None).await
    }

    // -----------------------------------------------------------------------
    // Events & accessors
    // -----------------------------------------------------------------------

    /// Per-agent execution statistics, sorted by agent id.
    pub fn agent_stats(&self) -> BTreeMap<String, AgentStats> {
        self.inner.tracker.snapshot()
    }

    /// The job's human-readable trace log.
    pub async fn job_log(&self, job_id: Uuid) -> Result<String, EngineError> {
        self.inner
            .store
            .read_log(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    /// Subscribe to the lifecycle event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// The engine's event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Agent, StepYield};
    use inkforge_types::contract::McpContract;
    use inkforge_types::error::AgentError;
    use inkforge_types::job::StepStatus;
    use crate::store::MemoryJobStore;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    // -----------------------------------------------------------------------
    // Test agents
    // -----------------------------------------------------------------------

    fn contract(id: &str) -> McpContract {
        McpContract {
            id: id.to_string(),
            version: "1.0.0".to_string(),
            inputs: json!({"type": "object"}),
            outputs: json!({"type": "object"}),
            checkpoints: vec![],
            max_runtime_s: 60,
            confidence: 1.0,
            side_effects: vec![],
            description: None,
            mutable_params: vec![],
        }
    }

    /// Returns `{"ok": true, "<id>": "done"}` and counts invocations.
    struct OkAgent {
        contract: McpContract,
        runs: Arc<AtomicU32>,
    }

    impl Agent for OkAgent {
        fn contract(&self) -> &McpContract {
            &self.contract
        }

        async fn execute(
            &self,
            _input: ValueMap,
            _yield_point: StepYield,
        ) -> Result<ValueMap, AgentError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(ValueMap::from([
                ("ok".to_string(), json!(true)),
                (self.contract.id.clone(), json!("done")),
            ]))
        }
    }

    /// Always raises.
    struct FailingAgent {
        contract: McpContract,
        runs: Arc<AtomicU32>,
    }

    impl Agent for FailingAgent {
        fn contract(&self) -> &McpContract {
            &self.contract
        }

        async fn execute(
            &self,
            _input: ValueMap,
            _yield_point: StepYield,
        ) -> Result<ValueMap, AgentError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Err(AgentError::Execution("synthetic agent failure".to_string()))
        }
    }

    /// Sleeps long enough for control signals to land first.
    struct SleepyAgent {
        contract: McpContract,
        sleep: Duration,
    }

    impl Agent for SleepyAgent {
        fn contract(&self) -> &McpContract {
            &self.contract
        }

        async fn execute(
            &self,
            _input: ValueMap,
            _yield_point: StepYield,
        ) -> Result<ValueMap, AgentError> {
            tokio::time::sleep(self.sleep).await;
            Ok(ValueMap::from([("slept".to_string(), json!(true))]))
        }
    }

    // -----------------------------------------------------------------------
    // Harness
    // -----------------------------------------------------------------------

    struct Harness {
        engine: JobEngine<MemoryJobStore>,
        registry: Arc<AgentRegistry>,
        runs: HashMap<String, Arc<AtomicU32>>,
    }

    impl Harness {
        async fn new(workflows_yaml: &str) -> Self {
            let compiler = Arc::new(WorkflowCompiler::new());
            compiler.load_yaml_str(workflows_yaml).unwrap();
            let registry = Arc::new(AgentRegistry::new());
            let store = Arc::new(MemoryJobStore::new());
            let mut config = EngineConfig::default();
            config.max_concurrent_jobs = 2;
            let engine = JobEngine::new(config, compiler, Arc::clone(&registry), store);
            engine.start().await;
            Self {
                engine,
                registry,
                runs: HashMap::new(),
            }
        }

        fn ok_agent(&mut self, id: &str) {
            let runs = Arc::new(AtomicU32::new(0));
            self.runs.insert(id.to_string(), Arc::clone(&runs));
            self.registry
                .register(OkAgent {
                    contract: contract(id),
                    runs,
                })
                .unwrap();
        }

        fn failing_agent(&mut self, id: &str) {
            let runs = Arc::new(AtomicU32::new(0));
            self.runs.insert(id.to_string(), Arc::clone(&runs));
            self.registry
                .register(FailingAgent {
                    contract: contract(id),
                    runs,
                })
                .unwrap();
        }

        fn sleepy_agent(&mut self, id: &str, sleep: Duration) {
            self.registry
                .register(SleepyAgent {
                    contract: contract(id),
                    sleep,
                })
                .unwrap();
        }

        fn run_count(&self, id: &str) -> u32 {
            self.runs[id].load(Ordering::SeqCst)
        }

        async fn wait_status(&self, job_id: Uuid, status: JobStatus, within: Duration) -> JobMetadata {
            let deadline = tokio::time::Instant::now() + within;
            loop {
                let meta = self.engine.get_status(job_id).await.unwrap();
                if meta.status == status {
                    return meta;
                }
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "job {job_id} stuck in {:?}, wanted {status:?}",
                    meta.status
                );
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    async fn drain_events(
        rx: &mut broadcast::Receiver<JobEvent>,
        job_id: Uuid,
    ) -> Vec<JobEventKind> {
        let mut events = Vec::new();
        while let Ok(Ok(event)) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            if event.job_id == job_id {
                let terminal = event.is_terminal();
                events.push(event.kind);
                if terminal {
                    break;
                }
            }
        }
        events
    }

    const LINEAR: &str = r#"
workflows:
  linear:
    steps:
      a: {}
      b:
        depends_on: [a]
      c:
        depends_on: [b]
"#;

    // -----------------------------------------------------------------------
    // Scenario 1: linear workflow end to end
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn linear_workflow_completes_in_order() {
        let mut h = Harness::new(LINEAR).await;
        for id in ["a", "b", "c"] {
            h.ok_agent(id);
        }
        let mut rx = h.engine.subscribe();

        let job_id = h.engine.submit("linear", ValueMap::new(), None).await.unwrap();
        let meta = h.wait_status(job_id, JobStatus::Completed, Duration::from_secs(5)).await;

        assert_eq!(meta.completed_steps, 3);
        assert!((meta.progress - 1.0).abs() < f64::EPSILON);
        assert!(meta.completed_at.is_some());
        assert!(meta.started_at.is_some());

        let state = h.engine.get_state(job_id).await.unwrap();
        assert_eq!(state.outputs["ok"], json!(true));

        // Step order from the event stream.
        let events = drain_events(&mut rx, job_id).await;
        let started: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                JobEventKind::StepStarted { agent_id } => Some(agent_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["a", "b", "c"]);
        assert!(matches!(events.last(), Some(JobEventKind::JobCompleted { .. })));

        let agent_stats = h.engine.agent_stats();
        for id in ["a", "b", "c"] {
            assert_eq!(agent_stats[id].successes, 1);
            assert_eq!(agent_stats[id].failures, 0);
        }
    }

    // -----------------------------------------------------------------------
    // Scenario 2: diamond workflow with parallel groups
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn diamond_workflow_completes_all_steps() {
        let mut h = Harness::new(
            r#"
workflows:
  diamond:
    steps:
      a: {}
      b:
        depends_on: [a]
      c:
        depends_on: [a]
      d:
        depends_on: [b, c]
"#,
        )
        .await;
        for id in ["a", "b", "c", "d"] {
            h.ok_agent(id);
        }

        let job_id = h.engine.submit("diamond", ValueMap::new(), None).await.unwrap();
        let meta = h.wait_status(job_id, JobStatus::Completed, Duration::from_secs(5)).await;
        assert_eq!(meta.completed_steps, 4);

        let state = h.engine.get_state(job_id).await.unwrap();
        let plan: inkforge_types::plan::ExecutionPlan =
            serde_json::from_value(state.context["execution_plan"].clone()).unwrap();
        assert_eq!(
            plan.parallel_groups,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
        assert_eq!(plan.steps[0].agent_id, "a");
    }

    // -----------------------------------------------------------------------
    // Scenario 3: cyclic workflow never becomes a job
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn cyclic_workflow_rejected_at_submit() {
        let h = Harness::new(
            r#"
workflows:
  cyclic:
    steps:
      a:
        depends_on: [b]
      b:
        depends_on: [a]
"#,
        )
        .await;

        let err = h.engine.submit("cyclic", ValueMap::new(), None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidWorkflow(CompileError::CircularDependency { .. })
        ));
        assert!(h.engine.list(None, None).await.is_empty(), "no job created");
    }

    // -----------------------------------------------------------------------
    // Scenario 4: pause then cancel under a sleeping step
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn pause_then_cancel_sleeping_step() {
        let mut h = Harness::new(
            r#"
workflows:
  sleepy:
    steps:
      slow: {}
      after:
        depends_on: [slow]
"#,
        )
        .await;
        h.sleepy_agent("slow", Duration::from_secs(10));
        h.ok_agent("after");

        let job_id = h.engine.submit("sleepy", ValueMap::new(), None).await.unwrap();
        h.wait_status(job_id, JobStatus::Running, Duration::from_secs(2)).await;

        // Bounded control latency: paused observed within two seconds.
        h.engine.pause(job_id).await.unwrap();
        h.wait_status(job_id, JobStatus::Paused, Duration::from_secs(2)).await;

        h.engine.cancel(job_id).await.unwrap();
        let meta = h.wait_status(job_id, JobStatus::Cancelled, Duration::from_secs(2)).await;
        assert!(meta.completed_at.is_some());

        // No subsequent step ran.
        let state = h.engine.get_state(job_id).await.unwrap();
        assert_eq!(state.steps["after"].status, StepStatus::Pending);
        assert_eq!(h.run_count("after"), 0);
    }

    // -----------------------------------------------------------------------
    // Scenario 5: retry exhaustion
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn retry_exhaustion_fails_step_and_job() {
        let mut h = Harness::new(
            r#"
workflows:
  flaky:
    steps:
      boom:
        retries: 2
"#,
        )
        .await;
        h.failing_agent("boom");
        let mut rx = h.engine.subscribe();

        let job_id = h.engine.submit("flaky", ValueMap::new(), None).await.unwrap();
        let meta = h.wait_status(job_id, JobStatus::Failed, Duration::from_secs(5)).await;

        // Initial attempt plus two retries.
        assert_eq!(h.run_count("boom"), 3);
        assert!(meta.error_message.as_deref().unwrap().contains("synthetic agent failure"));

        let state = h.engine.get_state(job_id).await.unwrap();
        assert_eq!(state.steps["boom"].status, StepStatus::Failed);
        assert_eq!(state.steps["boom"].retry_count, 2);

        let events = drain_events(&mut rx, job_id).await;
        let failed: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
                JobEventKind::StepFailed { will_retry, .. } => Some(*will_retry),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![true, true, false]);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, JobEventKind::StepCompleted { .. })),
            "no StepCompleted for a step that always fails"
        );
    }

    // -----------------------------------------------------------------------
    // Scenario 6: checkpoint restore re-runs downstream steps
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn checkpoint_restore_re_runs_downstream_steps() {
        let mut h = Harness::new(LINEAR).await;
        for id in ["a", "b", "c"] {
            h.ok_agent(id);
        }

        let job_id = h.engine.submit("linear", ValueMap::new(), None).await.unwrap();
        h.wait_status(job_id, JobStatus::Completed, Duration::from_secs(5)).await;
        assert_eq!(h.run_count("a"), 1);

        // Boundary checkpoint written after step `a`.
        let checkpoints = h.engine.checkpoints().list(job_id).await.unwrap();
        let after_a = checkpoints
            .iter()
            .find(|c| c.step_name == "a")
            .expect("boundary checkpoint for step a");

        let restored = h
            .engine
            .restore_from_checkpoint(after_a.checkpoint_id, true)
            .await
            .unwrap();
        assert_eq!(restored, job_id);
        h.wait_status(job_id, JobStatus::Completed, Duration::from_secs(5)).await;

        // `a` ran once; `b` and `c` ran twice (original + re-run).
        assert_eq!(h.run_count("a"), 1);
        assert_eq!(h.run_count("b"), 2);
        assert_eq!(h.run_count("c"), 2);

        // Re-run values overwrote the originals in the merged outputs.
        let state = h.engine.get_state(job_id).await.unwrap();
        assert_eq!(state.outputs["b"], json!("done"));
        assert_eq!(state.outputs["c"], json!("done"));
    }

    // -----------------------------------------------------------------------
    // Control-plane properties
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn invalid_transitions_are_rejected_without_state_change() {
        let mut h = Harness::new(LINEAR).await;
        for id in ["a", "b", "c"] {
            h.ok_agent(id);
        }
        let job_id = h.engine.submit("linear", ValueMap::new(), None).await.unwrap();
        h.wait_status(job_id, JobStatus::Completed, Duration::from_secs(5)).await;

        // Terminal jobs reject every control action.
        assert!(matches!(
            h.engine.pause(job_id).await.unwrap_err(),
            EngineError::InvalidTransition { action: "pause", .. }
        ));
        assert!(matches!(
            h.engine.resume(job_id, None).await.unwrap_err(),
            EngineError::InvalidTransition { action: "resume", .. }
        ));
        assert!(matches!(
            h.engine.cancel(job_id).await.unwrap_err(),
            EngineError::InvalidTransition { action: "cancel", .. }
        ));
        assert!(matches!(
            h.engine
                .update_params(job_id, ValueMap::new())
                .await
                .unwrap_err(),
            EngineError::InvalidTransition { action: "update_params", .. }
        ));

        let meta = h.engine.get_status(job_id).await.unwrap();
        assert_eq!(meta.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn update_params_merges_and_audits_on_paused_job() {
        let mut h = Harness::new(
            r#"
workflows:
  sleepy:
    steps:
      slow: {}
"#,
        )
        .await;
        h.sleepy_agent("slow", Duration::from_secs(10));

        let job_id = h
            .engine
            .submit(
                "sleepy",
                ValueMap::from([("tone".to_string(), json!("formal"))]),
                None,
            )
            .await
            .unwrap();
        h.wait_status(job_id, JobStatus::Running, Duration::from_secs(2)).await;
        h.engine.pause(job_id).await.unwrap();
        h.wait_status(job_id, JobStatus::Paused, Duration::from_secs(2)).await;

        h.engine
            .update_params(job_id, ValueMap::from([("tone".to_string(), json!("casual"))]))
            .await
            .unwrap();

        let state = h.engine.get_state(job_id).await.unwrap();
        assert_eq!(state.inputs["tone"], json!("casual"));
        assert_eq!(state.metadata.param_updates.len(), 1);
        assert_eq!(state.metadata.param_updates[0].keys, vec!["tone"]);

        h.engine.cancel(job_id).await.unwrap();
    }

    #[tokio::test]
    async fn pause_resume_completes_the_plan() {
        let mut h = Harness::new(LINEAR).await;
        h.sleepy_agent("a", Duration::from_secs(3));
        h.ok_agent("b");
        h.ok_agent("c");

        let job_id = h.engine.submit("linear", ValueMap::new(), None).await.unwrap();
        h.wait_status(job_id, JobStatus::Running, Duration::from_secs(2)).await;
        h.engine.pause(job_id).await.unwrap();
        h.wait_status(job_id, JobStatus::Paused, Duration::from_secs(2)).await;

        h.engine.resume(job_id, None).await.unwrap();
        let meta = h.wait_status(job_id, JobStatus::Completed, Duration::from_secs(10)).await;
        assert_eq!(meta.completed_steps, 3);
    }

    #[tokio::test]
    async fn cancel_pending_job_without_execution() {
        let mut h = Harness::new(
            r#"
workflows:
  sleepy:
    steps:
      slow: {}
"#,
        )
        .await;
        h.sleepy_agent("slow", Duration::from_secs(5));

        // Saturate both workers so the third job stays queued.
        let j1 = h.engine.submit("sleepy", ValueMap::new(), None).await.unwrap();
        let j2 = h.engine.submit("sleepy", ValueMap::new(), None).await.unwrap();
        let queued = h.engine.submit("sleepy", ValueMap::new(), None).await.unwrap();

        h.engine.cancel(queued).await.unwrap();
        let meta = h.wait_status(queued, JobStatus::Cancelled, Duration::from_secs(2)).await;
        assert!(meta.started_at.is_none(), "cancelled before any worker start");

        h.engine.cancel(j1).await.unwrap();
        h.engine.cancel(j2).await.unwrap();
    }

    // -----------------------------------------------------------------------
    // Optional steps, conditions, continue_on_error
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn missing_optional_agent_is_skipped() {
        let mut h = Harness::new(
            r#"
workflows:
  with-optional:
    steps:
      a: {}
      extra:
        depends_on: [a]
        optional: true
      b:
        depends_on: [a]
"#,
        )
        .await;
        h.ok_agent("a");
        h.ok_agent("b");
        // `extra` is never registered.

        let job_id = h.engine.submit("with-optional", ValueMap::new(), None).await.unwrap();
        h.wait_status(job_id, JobStatus::Completed, Duration::from_secs(5)).await;

        let state = h.engine.get_state(job_id).await.unwrap();
        assert_eq!(state.steps["extra"].status, StepStatus::Skipped);
        assert_eq!(state.steps["b"].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn missing_required_agent_fails_the_job() {
        let mut h = Harness::new(
            r#"
workflows:
  broken:
    steps:
      ghost: {}
"#,
        )
        .await;

        let job_id = h.engine.submit("broken", ValueMap::new(), None).await.unwrap();
        let meta = h.wait_status(job_id, JobStatus::Failed, Duration::from_secs(5)).await;
        assert!(meta.error_message.as_deref().unwrap().contains("agent not found"));
    }

    #[tokio::test]
    async fn false_condition_skips_step() {
        let mut h = Harness::new(
            r#"
workflows:
  conditional:
    steps:
      a: {}
      gated:
        depends_on: [a]
        condition:
          type: if
          key: never_set
      c:
        depends_on: [a]
"#,
        )
        .await;
        h.ok_agent("a");
        h.ok_agent("gated");
        h.ok_agent("c");

        let job_id = h.engine.submit("conditional", ValueMap::new(), None).await.unwrap();
        h.wait_status(job_id, JobStatus::Completed, Duration::from_secs(5)).await;

        let state = h.engine.get_state(job_id).await.unwrap();
        assert_eq!(state.steps["gated"].status, StepStatus::Skipped);
        assert_eq!(h.run_count("gated"), 0);
        assert_eq!(h.run_count("c"), 1);
    }

    #[tokio::test]
    async fn continue_on_error_tolerates_required_failure() {
        let mut h = Harness::new(
            r#"
workflows:
  tolerant:
    config:
      continue_on_error: true
    steps:
      boom:
        retries: 0
      after:
        depends_on: [boom]
"#,
        )
        .await;
        h.failing_agent("boom");
        h.ok_agent("after");

        let job_id = h.engine.submit("tolerant", ValueMap::new(), None).await.unwrap();
        // The failed required step still fails the job at finalization, but
        // downstream work ran first.
        let meta = h.wait_status(job_id, JobStatus::Failed, Duration::from_secs(5)).await;
        assert_eq!(h.run_count("after"), 1);
        assert_eq!(meta.failed_steps, 1);
        assert_eq!(meta.completed_steps, 1);
    }

    // -----------------------------------------------------------------------
    // Fallback agents
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn fallback_agent_rescues_exhausted_step() {
        let mut h = Harness::new(
            r#"
workflows:
  resilient:
    steps:
      draft:
        retries: 1
        fallback_agent: draft-lite
"#,
        )
        .await;
        h.failing_agent("draft");
        h.ok_agent("draft-lite");
        let mut rx = h.engine.subscribe();

        let job_id = h.engine.submit("resilient", ValueMap::new(), None).await.unwrap();
        h.wait_status(job_id, JobStatus::Completed, Duration::from_secs(5)).await;

        assert_eq!(h.run_count("draft"), 2, "initial attempt plus one retry");
        assert_eq!(h.run_count("draft-lite"), 1);

        let state = h.engine.get_state(job_id).await.unwrap();
        assert_eq!(state.steps["draft"].status, StepStatus::Completed);
        assert_eq!(state.outputs["_fallback_agent"], json!("draft-lite"));

        // The last primary failure still announced a further attempt.
        let events = drain_events(&mut rx, job_id).await;
        let failed: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
                JobEventKind::StepFailed { will_retry, .. } => Some(*will_retry),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![true, true]);
    }

    #[tokio::test]
    async fn failing_fallback_fails_the_job_with_both_errors() {
        let mut h = Harness::new(
            r#"
workflows:
  resilient:
    steps:
      draft:
        retries: 0
        fallback_agent: draft-lite
"#,
        )
        .await;
        h.failing_agent("draft");
        h.failing_agent("draft-lite");

        let job_id = h.engine.submit("resilient", ValueMap::new(), None).await.unwrap();
        let meta = h.wait_status(job_id, JobStatus::Failed, Duration::from_secs(5)).await;
        let message = meta.error_message.unwrap();
        assert!(message.contains("synthetic agent failure"));
        assert!(message.contains("fallback 'draft-lite'"));
    }

    // -----------------------------------------------------------------------
    // Approval gates
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn approval_gate_pauses_then_approves() {
        let mut h = Harness::new(
            r#"
workflows:
  gated:
    steps:
      a: {}
      review:
        depends_on: [a]
        approval_required: true
      publish:
        depends_on: [review]
"#,
        )
        .await;
        for id in ["a", "review", "publish"] {
            h.ok_agent(id);
        }

        let job_id = h.engine.submit("gated", ValueMap::new(), None).await.unwrap();
        h.wait_status(job_id, JobStatus::Paused, Duration::from_secs(5)).await;

        let gate = h
            .engine
            .checkpoints()
            .latest_for_step(job_id, "review")
            .await
            .unwrap()
            .expect("gate checkpoint");
        assert!(gate.approval_required);

        h.engine.approve(job_id, gate.checkpoint_id, true).await.unwrap();
        h.wait_status(job_id, JobStatus::Completed, Duration::from_secs(5)).await;
        assert_eq!(h.run_count("review"), 1);
        assert_eq!(h.run_count("publish"), 1);
    }

    #[tokio::test]
    async fn approval_gate_denial_skips_step() {
        let mut h = Harness::new(
            r#"
workflows:
  gated:
    steps:
      a: {}
      review:
        depends_on: [a]
        approval_required: true
      publish:
        depends_on: [review]
"#,
        )
        .await;
        for id in ["a", "review", "publish"] {
            h.ok_agent(id);
        }

        let job_id = h.engine.submit("gated", ValueMap::new(), None).await.unwrap();
        h.wait_status(job_id, JobStatus::Paused, Duration::from_secs(5)).await;

        let gate = h
            .engine
            .checkpoints()
            .latest_for_step(job_id, "review")
            .await
            .unwrap()
            .unwrap();
        h.engine.approve(job_id, gate.checkpoint_id, false).await.unwrap();
        h.wait_status(job_id, JobStatus::Completed, Duration::from_secs(5)).await;

        let state = h.engine.get_state(job_id).await.unwrap();
        assert_eq!(state.steps["review"].status, StepStatus::Skipped);
        assert_eq!(h.run_count("review"), 0);
        assert_eq!(h.run_count("publish"), 1, "dependents of a skipped gate still run");
    }

    // -----------------------------------------------------------------------
    // Listings, stats, batches
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn list_orders_newest_first_and_filters() {
        let mut h = Harness::new(LINEAR).await;
        for id in ["a", "b", "c"] {
            h.ok_agent(id);
        }
        let first = h.engine.submit("linear", ValueMap::new(), None).await.unwrap();
        let second = h.engine.submit("linear", ValueMap::new(), None).await.unwrap();
        h.wait_status(first, JobStatus::Completed, Duration::from_secs(5)).await;
        h.wait_status(second, JobStatus::Completed, Duration::from_secs(5)).await;

        let all = h.engine.list(None, None).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].job_id, second, "newest first");

        assert_eq!(h.engine.list(Some(JobStatus::Failed), None).await.len(), 0);
        assert_eq!(h.engine.list(None, Some(1)).await.len(), 1);

        let stats = h.engine.stats().await;
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.per_status["completed"], 2);
        assert!(!stats.draining);
    }

    #[tokio::test]
    async fn batch_submission_shares_correlation() {
        let mut h = Harness::new(LINEAR).await;
        for id in ["a", "b", "c"] {
            h.ok_agent(id);
        }
        let batch = h
            .engine
            .submit_batch(
                "linear",
                vec![ValueMap::new(), ValueMap::new(), ValueMap::new()],
            )
            .await
            .unwrap();
        assert_eq!(batch.job_ids.len(), 3);

        for job_id in &batch.job_ids {
            h.wait_status(*job_id, JobStatus::Completed, Duration::from_secs(10)).await;
        }
        let status = h.engine.batch_status(&batch.batch_id).await.unwrap();
        assert_eq!(status.total, 3);
        assert!(status.complete);
        assert_eq!(status.per_status["completed"], 3);

        assert!(matches!(
            h.engine.batch_status("batch-missing").await.unwrap_err(),
            EngineError::BatchNotFound(_)
        ));
    }

    #[tokio::test]
    async fn completion_writes_final_artifact_and_log() {
        struct ContentAgent {
            contract: McpContract,
        }
        impl Agent for ContentAgent {
            fn contract(&self) -> &McpContract {
                &self.contract
            }
            async fn execute(
                &self,
                _input: ValueMap,
                _yield_point: StepYield,
            ) -> Result<ValueMap, AgentError> {
                Ok(ValueMap::from([(
                    "content".to_string(),
                    json!("# Rust Async\nbody"),
                )]))
            }
        }

        let h = Harness::new(
            r#"
workflows:
  render:
    steps:
      write: {}
"#,
        )
        .await;
        h.registry
            .register(ContentAgent {
                contract: contract("write"),
            })
            .unwrap();

        let job_id = h
            .engine
            .submit(
                "render",
                ValueMap::from([("topic".to_string(), json!("Rust Async"))]),
                None,
            )
            .await
            .unwrap();
        h.wait_status(job_id, JobStatus::Completed, Duration::from_secs(5)).await;

        let artifact = h
            .engine
            .store()
            .load_output(job_id, "Rust_Async.md")
            .await
            .unwrap()
            .expect("artifact written on completion");
        assert!(artifact.contains("# Rust Async"));

        let log = h.engine.job_log(job_id).await.unwrap();
        assert!(log.contains("job started"));
        assert!(log.contains("artifact written: Rust_Async.md"));
        assert!(log.contains("job completed"));
    }

    #[tokio::test]
    async fn unknown_workflow_submit_fails() {
        let h = Harness::new(LINEAR).await;
        let err = h.engine.submit("ghost", ValueMap::new(), None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidWorkflow(CompileError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn archive_requires_terminal_and_leaves_scheduling() {
        let mut h = Harness::new(LINEAR).await;
        for id in ["a", "b", "c"] {
            h.ok_agent(id);
        }
        let job_id = h.engine.submit("linear", ValueMap::new(), None).await.unwrap();

        h.wait_status(job_id, JobStatus::Completed, Duration::from_secs(5)).await;
        h.engine.archive(job_id).await.unwrap();

        // Gone from the active listing, still addressable through the store.
        assert!(h.engine.list(None, None).await.is_empty());
        let meta = h.engine.get_status(job_id).await.unwrap();
        assert_eq!(meta.status, JobStatus::Archived);

        // Archived jobs cannot be restored back into scheduling.
        let checkpoints = h.engine.checkpoints().list(job_id).await.unwrap();
        let err = h
            .engine
            .restore_from_checkpoint(checkpoints[0].checkpoint_id, true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { action: "restore", .. }
        ));
    }

    #[tokio::test]
    async fn delete_requires_terminal_unless_forced() {
        let mut h = Harness::new(
            r#"
workflows:
  sleepy:
    steps:
      slow: {}
"#,
        )
        .await;
        h.sleepy_agent("slow", Duration::from_secs(10));

        let job_id = h.engine.submit("sleepy", ValueMap::new(), None).await.unwrap();
        h.wait_status(job_id, JobStatus::Running, Duration::from_secs(2)).await;

        assert!(matches!(
            h.engine.delete(job_id, false).await.unwrap_err(),
            EngineError::InvalidTransition { action: "delete", .. }
        ));

        h.engine.delete(job_id, true).await.unwrap();
        assert!(matches!(
            h.engine.get_status(job_id).await.unwrap_err(),
            EngineError::JobNotFound(_)
        ));
    }
}
