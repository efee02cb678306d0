//! Single step dispatch: input assembly and the bounded-latency attempt
//! runner.
//!
//! An attempt races the agent future against the step's wall-clock deadline,
//! the job's cancellation token, and a short control poll. Dropping the
//! future cancels the in-flight work, so cancel and pause are honoured well
//! inside the two-second control latency bound even when the agent never
//! yields.

use std::sync::Arc;
use std::time::Duration;

use inkforge_types::error::AgentError;
use inkforge_types::job::{JobState, ValueMap};
use inkforge_types::plan::ExecutionStep;
use inkforge_types::workflow::WorkflowConfig;
use serde_json::json;

use crate::control::{CONTROL_POLL, JobControl};
use crate::registry::{BoxAgent, StepYield};

// ---------------------------------------------------------------------------
// Input assembly
// ---------------------------------------------------------------------------

/// Build the uniform input map an agent sees: job inputs, then accumulated
/// outputs (later steps shadow earlier keys), then the workflow config under
/// `_config` and the synthetic identity keys.
pub(crate) fn assemble_input(
    state: &JobState,
    step: &ExecutionStep,
    workflow_config: &WorkflowConfig,
) -> ValueMap {
    let mut input = state.inputs.clone();
    input.extend(state.outputs.clone());
    input.insert(
        "_config".to_string(),
        serde_json::to_value(workflow_config).unwrap_or_else(|_| json!({})),
    );
    input.insert("_job_id".to_string(), json!(state.metadata.job_id));
    input.insert("_workflow_id".to_string(), json!(state.metadata.workflow_id));
    input.insert("_agent_id".to_string(), json!(step.agent_id));
    input
}

// ---------------------------------------------------------------------------
// Attempt runner
// ---------------------------------------------------------------------------

/// How one step attempt ended. Deadline overruns come back as `Failure`
/// carrying the timeout message; the in-flight invocation is dropped either
/// way, so timeouts retry like any other failure.
pub(crate) enum AttemptOutcome {
    Success(ValueMap),
    Failure(String),
    /// The job's cancel flag fired (or the agent observed it first).
    Cancelled,
    /// A pause request arrived mid-attempt; the invocation was dropped and
    /// the step re-runs after resume.
    PauseInterrupted,
}

pub(crate) async fn run_attempt(
    agent: &Arc<BoxAgent>,
    control: &Arc<JobControl>,
    step: &ExecutionStep,
    input: ValueMap,
) -> AttemptOutcome {
    let yield_point = StepYield::for_control(Arc::clone(control));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(step.timeout_secs);

    let fut = agent.execute(input, yield_point);
    tokio::pin!(fut);

    loop {
        tokio::select! {
            result = &mut fut => {
                return match result {
                    Ok(output) => AttemptOutcome::Success(output),
                    Err(AgentError::Cancelled) => AttemptOutcome::Cancelled,
                    Err(e) => AttemptOutcome::Failure(e.to_string()),
                };
            }
            _ = control.cancel_token().cancelled() => {
                return AttemptOutcome::Cancelled;
            }
            _ = tokio::time::sleep_until(deadline) => {
                return AttemptOutcome::Failure(format!(
                    "step timed out after {}s",
                    step.timeout_secs
                ));
            }
            _ = tokio::time::sleep(CONTROL_POLL) => {
                if control.pause_requested() {
                    return AttemptOutcome::PauseInterrupted;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
