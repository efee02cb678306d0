//! Per-job plan execution.
//!
//! Workers pull job ids off the shared FIFO queue and drive
//! [`EngineInner::execute_plan`]: pick the smallest-index runnable step,
//! honour control flags at every yield point, dispatch with timeout and
//! retry, persist after each transition, and emit events in commit order.
//! Intra-job dispatch is sequential; cross-job parallelism comes from the
//! worker pool.

use std::sync::Arc;

use chrono::Utc;
use inkforge_types::event::JobEventKind;
use inkforge_types::job::{JobState, JobStatus, StepStatus, ValueMap};
use inkforge_types::plan::{ExecutionPlan, ExecutionStep};
use inkforge_types::workflow::WorkflowConfig;
use serde_json::Value;
use tokio::time::Instant;

use crate::checkpoint::CheckpointError;
use crate::control::JobControl;
use crate::registry::validate_inputs;
use crate::store::JobStore;

use super::step::{AttemptOutcome, assemble_input, run_attempt};
use super::{EngineError, EngineInner, merge_params, try_transition};

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// One pool worker: dequeue a job id, execute it to its next parking point,
/// repeat until shutdown.
pub(crate) async fn worker_loop<S: JobStore + 'static>(inner: Arc<EngineInner<S>>, worker_id: usize) {
    tracing::debug!(worker_id, "worker started");
    loop {
        let job_id = {
            let mut rx = inner.queue_rx.lock().await;
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(job_id) => job_id,
                    None => break,
                },
            }
        };
        run_job(&inner, worker_id, job_id).await;
    }
    tracing::debug!(worker_id, "worker stopped");
}

async fn run_job<S: JobStore>(inner: &Arc<EngineInner<S>>, worker_id: usize, job_id: uuid::Uuid) {
    let Some(mut state) = inner.jobs.read().await.get(&job_id).cloned() else {
        tracing::warn!(job_id = %job_id, "dequeued unknown job");
        return;
    };
    if inner.is_tombstoned(job_id) {
        return;
    }

    match state.metadata.status {
        JobStatus::Pending => {
            if try_transition(&mut state, JobStatus::Running, "start").is_err() {
                return;
            }
            if state.metadata.started_at.is_none() {
                state.metadata.started_at = Some(Utc::now());
            }
            if let Err(e) = inner.persist(&mut state).await {
                tracing::error!(job_id = %job_id, error = %e, "failed to persist job start");
                fail_job_best_effort(inner, &mut state, "persistence failure at start").await;
                return;
            }
            inner.emit(&state, JobEventKind::JobStarted);
            inner.trace(job_id, "job started").await;
        }
        // A resumed job re-enters the loop already running.
        JobStatus::Running => {}
        status => {
            tracing::debug!(job_id = %job_id, %status, "skipping dequeued job");
            return;
        }
    }

    let plan: ExecutionPlan = match state
        .context
        .get("execution_plan")
        .cloned()
        .ok_or_else(|| "missing execution plan".to_string())
        .and_then(|v| serde_json::from_value(v).map_err(|e| e.to_string()))
    {
        Ok(plan) => plan,
        Err(e) => {
            fail_job_best_effort(inner, &mut state, &format!("corrupt execution plan: {e}")).await;
            return;
        }
    };
    let workflow_config: WorkflowConfig = state
        .context
        .get("workflow_config")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    let control = inner.controller.register(job_id);

    tracing::debug!(job_id = %job_id, worker_id, steps = plan.steps.len(), "executing plan");
    match inner
        .execute_plan(&mut state, &plan, &workflow_config, &control)
        .await
    {
        Ok(RunOutcome::Finished) | Ok(RunOutcome::Cancelled) => {}
        Ok(RunOutcome::Parked) => {
            tracing::debug!(job_id = %job_id, "job parked, worker released");
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "job execution error");
            fail_job_best_effort(inner, &mut state, &format!("persistence failure: {e}")).await;
        }
    }
}

/// Mark a job failed when persistence itself is unreliable: write what we
/// can, always emit the terminal event.
async fn fail_job_best_effort<S: JobStore>(
    inner: &Arc<EngineInner<S>>,
    state: &mut JobState,
    error: &str,
) {
    if let Some(current) = state.metadata.current_step.clone() {
        state.reset_step_interrupted(&current);
    }
    state.metadata.status = JobStatus::Failed;
    state.metadata.error_message = Some(error.to_string());
    state.metadata.completed_at = Some(Utc::now());
    if let Err(e) = inner.persist(state).await {
        tracing::error!(job_id = %state.metadata.job_id, error = %e, "terminal persist failed");
    }
    inner.emit(
        state,
        JobEventKind::JobFailed {
            error: error.to_string(),
        },
    );
    inner.controller.remove(state.metadata.job_id);
}

// ---------------------------------------------------------------------------
// Plan execution
// ---------------------------------------------------------------------------

/// How a single `execute_plan` call ended.
pub(crate) enum RunOutcome {
    /// The job reached a terminal state.
    Finished,
    /// The job was parked (pause or approval gate); the worker is released
    /// and the job re-enters the queue on resume.
    Parked,
    /// The job was cancelled cooperatively.
    Cancelled,
}

enum ControlDisposition {
    Continue,
    Parked,
    Cancelled,
}

impl<S: JobStore> EngineInner<S> {
    pub(crate) async fn execute_plan(
        &self,
        state: &mut JobState,
        plan: &ExecutionPlan,
        workflow_config: &WorkflowConfig,
        control: &Arc<JobControl>,
    ) -> Result<RunOutcome, EngineError> {
        let workflow_version = state
            .context
            .get("workflow_version")
            .and_then(Value::as_str)
            .unwrap_or("1.0.0")
            .to_string();

        'steps: loop {
            match self.check_control(state, control, "pause requested").await? {
                ControlDisposition::Cancelled => return Ok(RunOutcome::Cancelled),
                ControlDisposition::Parked => return Ok(RunOutcome::Parked),
                ControlDisposition::Continue => {}
            }

            let Some((step, condition_met)) = next_runnable(state, plan) else {
                break 'steps;
            };
            let step = step.clone();

            if !condition_met {
                state.mark_step_skipped(&step.agent_id);
                self.persist(state).await?;
                self.emit(
                    state,
                    JobEventKind::StepSkipped {
                        agent_id: step.agent_id.clone(),
                    },
                );
                self.trace(
                    state.metadata.job_id,
                    &format!("step '{}' skipped (condition false)", step.agent_id),
                )
                .await;
                continue 'steps;
            }

            if step.approval_required {
                match self
                    .resolve_approval_gate(state, &step, &workflow_version)
                    .await?
                {
                    GateDisposition::Proceed => {}
                    GateDisposition::Parked => return Ok(RunOutcome::Parked),
                    GateDisposition::Skipped => continue 'steps,
                }
            }

            // Resolve the agent; a missing optional agent skips, a missing
            // required agent fails the step (and, unless tolerated, the job).
            let Some(agent) = self.registry.get(&step.agent_id) else {
                if step.optional {
                    state.mark_step_skipped(&step.agent_id);
                    self.persist(state).await?;
                    self.emit(
                        state,
                        JobEventKind::StepSkipped {
                            agent_id: step.agent_id.clone(),
                        },
                    );
                    self.trace(
                        state.metadata.job_id,
                        &format!("step '{}' skipped (agent not registered)", step.agent_id),
                    )
                    .await;
                    continue 'steps;
                }
                let error = format!("agent not found: '{}'", step.agent_id);
                state.mark_step_failed(&step.agent_id, &error);
                self.persist(state).await?;
                self.emit(
                    state,
                    JobEventKind::StepFailed {
                        agent_id: step.agent_id.clone(),
                        error: error.clone(),
                        will_retry: false,
                    },
                );
                if workflow_config.continue_on_error {
                    continue 'steps;
                }
                self.fail_job(state, error).await;
                return Ok(RunOutcome::Finished);
            };

            // Attempt loop: initial run plus up to `max_retries` retries,
            // with a control check before every attempt.
            'attempts: loop {
                match self.check_control(state, control, "pause requested").await? {
                    ControlDisposition::Cancelled => return Ok(RunOutcome::Cancelled),
                    ControlDisposition::Parked => return Ok(RunOutcome::Parked),
                    ControlDisposition::Continue => {}
                }

                state.mark_step_started(&step.agent_id);
                self.persist(state).await?;
                self.emit(
                    state,
                    JobEventKind::StepStarted {
                        agent_id: step.agent_id.clone(),
                    },
                );

                let input = assemble_input(state, &step, workflow_config);
                let started = Instant::now();
                let outcome = match validate_inputs(agent.contract(), &input) {
                    Err(e) => AttemptOutcome::Failure(e.to_string()),
                    Ok(()) => run_attempt(&agent, control, &step, input).await,
                };
                let duration_ms = started.elapsed().as_millis() as u64;

                match &outcome {
                    AttemptOutcome::Failure(e) => self.tracker.record_failure(&step.agent_id, e),
                    AttemptOutcome::Success(_) => {
                        self.tracker.record_success(&step.agent_id, duration_ms)
                    }
                    _ => {}
                }

                match outcome {
                    AttemptOutcome::Success(output) => {
                        state.mark_step_completed(&step.agent_id, output);
                        self.persist(state).await?;
                        self.save_boundary_checkpoint(state, &step.agent_id, &workflow_version)
                            .await;
                        self.emit(
                            state,
                            JobEventKind::StepCompleted {
                                agent_id: step.agent_id.clone(),
                                duration_ms,
                            },
                        );
                        self.trace(
                            state.metadata.job_id,
                            &format!("step '{}' completed in {duration_ms}ms", step.agent_id),
                        )
                        .await;
                        break 'attempts;
                    }
                    AttemptOutcome::Cancelled => {
                        self.finalize_cancelled(state).await?;
                        return Ok(RunOutcome::Cancelled);
                    }
                    AttemptOutcome::PauseInterrupted => {
                        // The in-flight attempt is dropped; the step re-runs
                        // from pending after resume without consuming a retry.
                        state.reset_step_interrupted(&step.agent_id);
                        self.park(state, "pause requested during step").await?;
                        return Ok(RunOutcome::Parked);
                    }
                    AttemptOutcome::Failure(error) => {
                        let retry_count = state
                            .step(&step.agent_id)
                            .map(|s| s.retry_count)
                            .unwrap_or(0);
                        // After the retry budget, a declared fallback agent
                        // gets exactly one attempt before the step fails.
                        let fallback = (retry_count >= step.max_retries)
                            .then(|| step.fallback_agent.as_deref())
                            .flatten()
                            .and_then(|id| self.registry.get(id).map(|a| (id.to_string(), a)));

                        if retry_count < step.max_retries {
                            // Commit the retry transition, then announce it.
                            state.reset_step_for_retry(&step.agent_id);
                            self.persist(state).await?;
                            self.emit(
                                state,
                                JobEventKind::StepFailed {
                                    agent_id: step.agent_id.clone(),
                                    error: error.clone(),
                                    will_retry: true,
                                },
                            );
                            tracing::debug!(
                                job_id = %state.metadata.job_id,
                                step = step.agent_id.as_str(),
                                attempt = retry_count + 1,
                                "retrying step"
                            );
                            continue 'attempts;
                        }

                        if let Some((fallback_id, fallback_agent)) = fallback {
                            // The primary failure changes no persisted step
                            // state here; the fallback attempt follows as a
                            // further attempt of the same step.
                            self.emit(
                                state,
                                JobEventKind::StepFailed {
                                    agent_id: step.agent_id.clone(),
                                    error: error.clone(),
                                    will_retry: true,
                                },
                            );
                            match self
                                .run_fallback(state, &step, &fallback_id, &fallback_agent, workflow_config, control)
                                .await?
                            {
                                FallbackOutcome::Completed => {
                                    self.save_boundary_checkpoint(
                                        state,
                                        &step.agent_id,
                                        &workflow_version,
                                    )
                                    .await;
                                    break 'attempts;
                                }
                                FallbackOutcome::Cancelled => {
                                    self.finalize_cancelled(state).await?;
                                    return Ok(RunOutcome::Cancelled);
                                }
                                FallbackOutcome::Parked => return Ok(RunOutcome::Parked),
                                FallbackOutcome::Failed(fallback_error) => {
                                    let error = format!(
                                        "{error}; fallback '{fallback_id}' failed: {fallback_error}"
                                    );
                                    state.mark_step_failed(&step.agent_id, &error);
                                    self.persist(state).await?;
                                    self.emit(
                                        state,
                                        JobEventKind::StepFailed {
                                            agent_id: step.agent_id.clone(),
                                            error: error.clone(),
                                            will_retry: false,
                                        },
                                    );
                                    self.trace(
                                        state.metadata.job_id,
                                        &format!("step '{}' failed: {error}", step.agent_id),
                                    )
                                    .await;
                                    if step.optional || workflow_config.continue_on_error {
                                        break 'attempts;
                                    }
                                    self.fail_job(
                                        state,
                                        format!("step '{}' failed: {error}", step.agent_id),
                                    )
                                    .await;
                                    return Ok(RunOutcome::Finished);
                                }
                            }
                        }

                        state.mark_step_failed(&step.agent_id, &error);
                        self.persist(state).await?;
                        self.emit(
                            state,
                            JobEventKind::StepFailed {
                                agent_id: step.agent_id.clone(),
                                error: error.clone(),
                                will_retry: false,
                            },
                        );
                        self.trace(
                            state.metadata.job_id,
                            &format!("step '{}' failed: {error}", step.agent_id),
                        )
                        .await;
                        if step.optional || workflow_config.continue_on_error {
                            break 'attempts;
                        }
                        self.fail_job(state, format!("step '{}' failed: {error}", step.agent_id))
                            .await;
                        return Ok(RunOutcome::Finished);
                    }
                }
            }

            // Single-shot stepping: block after the transition until cleared.
            if control.step_mode().is_some() {
                control.wait_step_cleared().await;
                if control.cancel_requested() {
                    self.finalize_cancelled(state).await?;
                    return Ok(RunOutcome::Cancelled);
                }
            }
        }

        self.finalize(state, plan).await?;
        Ok(RunOutcome::Finished)
    }

    // -----------------------------------------------------------------------
    // Fallback dispatch
    // -----------------------------------------------------------------------

    /// Run the declared fallback agent once. The step record (and its
    /// eventual output) stays keyed by the primary agent id; the output is
    /// tagged with `_fallback_agent` for auditability.
    async fn run_fallback(
        &self,
        state: &mut JobState,
        step: &ExecutionStep,
        fallback_id: &str,
        fallback_agent: &Arc<crate::registry::BoxAgent>,
        workflow_config: &WorkflowConfig,
        control: &Arc<JobControl>,
    ) -> Result<FallbackOutcome, EngineError> {
        tracing::info!(
            job_id = %state.metadata.job_id,
            step = step.agent_id.as_str(),
            fallback = fallback_id,
            "dispatching fallback agent"
        );
        state.mark_step_started(&step.agent_id);
        self.persist(state).await?;
        self.emit(
            state,
            JobEventKind::StepStarted {
                agent_id: step.agent_id.clone(),
            },
        );

        let input = assemble_input(state, step, workflow_config);
        let started = Instant::now();
        let outcome = match validate_inputs(fallback_agent.contract(), &input) {
            Err(e) => AttemptOutcome::Failure(e.to_string()),
            Ok(()) => run_attempt(fallback_agent, control, step, input).await,
        };

        match &outcome {
            AttemptOutcome::Failure(e) => self.tracker.record_failure(fallback_id, e),
            AttemptOutcome::Success(_) => self
                .tracker
                .record_success(fallback_id, started.elapsed().as_millis() as u64),
            _ => {}
        }

        match outcome {
            AttemptOutcome::Success(mut output) => {
                output.insert(
                    "_fallback_agent".to_string(),
                    serde_json::json!(fallback_id),
                );
                state.mark_step_completed(&step.agent_id, output);
                self.persist(state).await?;
                self.emit(
                    state,
                    JobEventKind::StepCompleted {
                        agent_id: step.agent_id.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    },
                );
                self.trace(
                    state.metadata.job_id,
                    &format!(
                        "step '{}' completed via fallback '{fallback_id}'",
                        step.agent_id
                    ),
                )
                .await;
                Ok(FallbackOutcome::Completed)
            }
            AttemptOutcome::Cancelled => Ok(FallbackOutcome::Cancelled),
            AttemptOutcome::PauseInterrupted => {
                state.reset_step_interrupted(&step.agent_id);
                self.park(state, "pause requested during step").await?;
                Ok(FallbackOutcome::Parked)
            }
            AttemptOutcome::Failure(e) => Ok(FallbackOutcome::Failed(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Control handling
    // -----------------------------------------------------------------------

    async fn check_control(
        &self,
        state: &mut JobState,
        control: &Arc<JobControl>,
        pause_reason: &str,
    ) -> Result<ControlDisposition, EngineError> {
        if control.cancel_requested() {
            self.finalize_cancelled(state).await?;
            return Ok(ControlDisposition::Cancelled);
        }
        if let Some(params) = control.take_params() {
            merge_params(state, params);
            self.persist(state).await?;
        }
        if control.pause_requested() {
            self.park(state, pause_reason).await?;
            return Ok(ControlDisposition::Parked);
        }
        Ok(ControlDisposition::Continue)
    }

    /// Transition to paused, persist, release the worker.
    async fn park(&self, state: &mut JobState, reason: &str) -> Result<(), EngineError> {
        try_transition(state, JobStatus::Paused, "pause")?;
        self.persist(state).await?;
        self.emit(
            state,
            JobEventKind::JobPaused {
                reason: reason.to_string(),
            },
        );
        self.trace(state.metadata.job_id, &format!("paused: {reason}")).await;
        tracing::info!(job_id = %state.metadata.job_id, reason, "job paused");
        Ok(())
    }

    pub(crate) async fn finalize_cancelled(&self, state: &mut JobState) -> Result<(), EngineError> {
        if let Some(current) = state.metadata.current_step.clone() {
            state.reset_step_interrupted(&current);
        }
        try_transition(state, JobStatus::Cancelled, "cancel")?;
        state.metadata.completed_at = Some(Utc::now());
        self.persist(state).await?;
        self.emit(state, JobEventKind::JobCancelled);
        self.trace(state.metadata.job_id, "cancelled").await;
        self.controller.remove(state.metadata.job_id);
        tracing::info!(job_id = %state.metadata.job_id, "job cancelled");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Approval gates
    // -----------------------------------------------------------------------

    async fn resolve_approval_gate(
        &self,
        state: &mut JobState,
        step: &ExecutionStep,
        workflow_version: &str,
    ) -> Result<GateDisposition, EngineError> {
        use inkforge_types::checkpoint::ApprovalStatus;

        let job_id = state.metadata.job_id;
        let existing = self
            .checkpoints
            .latest_for_step(job_id, &step.agent_id)
            .await
            .map_err(engine_checkpoint_error)?;

        match existing.and_then(|c| c.approval_status) {
            Some(ApprovalStatus::Approved) => Ok(GateDisposition::Proceed),
            Some(ApprovalStatus::Denied) => {
                state.mark_step_skipped(&step.agent_id);
                self.persist(state).await?;
                self.emit(
                    state,
                    JobEventKind::StepSkipped {
                        agent_id: step.agent_id.clone(),
                    },
                );
                Ok(GateDisposition::Skipped)
            }
            Some(ApprovalStatus::Pending) => {
                // Resumed without a decision; park again.
                self.park(state, &format!("approval required for step '{}'", step.agent_id))
                    .await?;
                Ok(GateDisposition::Parked)
            }
            None => {
                let snapshot = serde_json::to_value(&*state)
                    .map_err(|e| EngineError::Snapshot(e.to_string()))?;
                self.checkpoints
                    .save(job_id, &step.agent_id, snapshot, workflow_version, true)
                    .await
                    .map_err(engine_checkpoint_error)?;
                self.park(state, &format!("approval required for step '{}'", step.agent_id))
                    .await?;
                Ok(GateDisposition::Parked)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    async fn save_boundary_checkpoint(
        &self,
        state: &JobState,
        step_name: &str,
        workflow_version: &str,
    ) {
        let snapshot = match serde_json::to_value(state) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(job_id = %state.metadata.job_id, error = %e, "snapshot serialization failed");
                return;
            }
        };
        if let Err(e) = self
            .checkpoints
            .save(state.metadata.job_id, step_name, snapshot, workflow_version, false)
            .await
        {
            tracing::warn!(
                job_id = %state.metadata.job_id,
                step = step_name,
                error = %e,
                "boundary checkpoint write failed"
            );
        }
    }

    async fn finalize(&self, state: &mut JobState, plan: &ExecutionPlan) -> Result<(), EngineError> {
        let failed_required: Option<String> = plan
            .steps
            .iter()
            .filter(|p| !p.optional)
            .filter_map(|p| state.step(&p.agent_id))
            .find(|s| s.status == StepStatus::Failed)
            .map(|s| {
                format!(
                    "step '{}' failed: {}",
                    s.agent_id,
                    s.error.as_deref().unwrap_or("unknown error")
                )
            });

        state.update_progress();
        match failed_required {
            Some(error) => {
                self.fail_job(state, error).await;
            }
            None => {
                try_transition(state, JobStatus::Completed, "complete")?;
                state.metadata.completed_at = Some(Utc::now());
                state.metadata.progress = 1.0;
                self.persist(state).await?;
                self.write_final_artifact(state).await;
                self.emit(
                    state,
                    JobEventKind::JobCompleted {
                        completed_steps: state.metadata.completed_steps,
                    },
                );
                self.trace(state.metadata.job_id, "job completed").await;
                self.controller.remove(state.metadata.job_id);
                tracing::info!(
                    job_id = %state.metadata.job_id,
                    steps = state.metadata.completed_steps,
                    "job completed"
                );
            }
        }
        Ok(())
    }

    /// Write the rendered output (if any) as a user-visible artifact. Best
    /// effort: a failed artifact write never fails the job.
    async fn write_final_artifact(&self, state: &JobState) {
        let Some(content) = super::artifact::extract_content(&state.outputs) else {
            return;
        };
        let name = format!("{}.md", super::artifact::artifact_file_name(&state.inputs));
        match self
            .store
            .save_output(state.metadata.job_id, &name, content)
            .await
        {
            Ok(()) => {
                self.trace(state.metadata.job_id, &format!("artifact written: {name}"))
                    .await;
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %state.metadata.job_id,
                    artifact = name.as_str(),
                    error = %e,
                    "artifact write failed"
                );
            }
        }
    }

    /// Terminal failure path. Persistence here is best effort: the failure is
    /// reported even if the final write is lost.
    pub(crate) async fn fail_job(&self, state: &mut JobState, error: String) {
        state.metadata.error_message = Some(error.clone());
        state.metadata.status = JobStatus::Failed;
        state.metadata.completed_at = Some(Utc::now());
        if let Err(e) = self.persist(state).await {
            tracing::error!(job_id = %state.metadata.job_id, error = %e, "terminal persist failed");
        }
        self.emit(state, JobEventKind::JobFailed { error: error.clone() });
        self.trace(state.metadata.job_id, &format!("job failed: {error}"))
            .await;
        self.controller.remove(state.metadata.job_id);
        tracing::warn!(job_id = %state.metadata.job_id, error = error.as_str(), "job failed");
    }
}

enum GateDisposition {
    Proceed,
    Parked,
    Skipped,
}

enum FallbackOutcome {
    Completed,
    Cancelled,
    Parked,
    Failed(String),
}

fn engine_checkpoint_error(e: CheckpointError) -> EngineError {
    EngineError::Checkpoint(e)
}

// ---------------------------------------------------------------------------
// Runnable selection
// ---------------------------------------------------------------------------

/// Find the smallest-index pending step whose dependencies are all settled,
/// and evaluate its condition against the merged input/output view.
fn next_runnable<'a>(state: &JobState, plan: &'a ExecutionPlan) -> Option<(&'a ExecutionStep, bool)> {
    for step in &plan.steps {
        let pending = state
            .step(&step.agent_id)
            .is_some_and(|r| r.status == StepStatus::Pending);
        if !pending {
            continue;
        }
        let deps_settled = step
            .dependencies
            .iter()
            .all(|dep| state.step(dep).is_some_and(|r| r.status.is_settled()));
        if !deps_settled {
            continue;
        }
        let condition_met = step.condition.as_ref().is_none_or(|condition| {
            let mut view: ValueMap = state.inputs.clone();
            view.extend(state.outputs.clone());
            condition.evaluate(&view)
        });
        return Some((step, condition_met));
    }
    None
}
