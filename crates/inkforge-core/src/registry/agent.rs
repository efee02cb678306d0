//! The agent capability interface.
//!
//! An agent is the only thing the engine invokes: a synchronous-looking
//! `execute(input) -> output` over opaque maps, plus an optional
//! [`StepYield::checkpoint`] call that lets long-running agents yield to the
//! control plane mid-work.
//!
//! Dynamic dispatch follows the blanket-impl pattern:
//! 1. [`Agent`] uses native async fn in traits (RPITIT).
//! 2. [`AgentDyn`] is the object-safe mirror with boxed futures, blanket
//!    implemented for every `Agent`.
//! 3. [`BoxAgent`] wraps `Box<dyn AgentDyn>` for storage in the registry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use inkforge_types::contract::McpContract;
use inkforge_types::error::AgentError;
use inkforge_types::job::ValueMap;

use crate::control::JobControl;

// ---------------------------------------------------------------------------
// StepYield
// ---------------------------------------------------------------------------

/// Handle passed into every agent invocation.
///
/// Agents that run for a long time should call [`StepYield::checkpoint`] at
/// the named checkpoints their contract declares; each call is a cooperative
/// cancellation point, which is how the engine honours its two-second control
/// latency bound even inside agent code.
#[derive(Clone, Default)]
pub struct StepYield {
    control: Option<Arc<JobControl>>,
}

impl StepYield {
    /// A handle not wired to any job. Useful for exercising agents directly.
    pub fn detached() -> Self {
        Self { control: None }
    }

    /// Wire a handle to a job's control record.
    pub(crate) fn for_control(control: Arc<JobControl>) -> Self {
        Self {
            control: Some(control),
        }
    }

    /// Yield at a named checkpoint.
    ///
    /// Returns `Err(AgentError::Cancelled)` when the job has been cancelled;
    /// the agent should unwind promptly. Otherwise yields to the scheduler
    /// so the engine's control poll gets a chance to run.
    pub async fn checkpoint(&self, name: &str) -> Result<(), AgentError> {
        if let Some(control) = &self.control {
            if control.cancel_requested() {
                return Err(AgentError::Cancelled);
            }
            tracing::trace!(checkpoint = name, job_id = %control.job_id(), "agent checkpoint");
        }
        tokio::task::yield_now().await;
        Ok(())
    }

    /// Whether cancellation has been requested for the owning job.
    pub fn is_cancelled(&self) -> bool {
        self.control
            .as_ref()
            .is_some_and(|c| c.cancel_requested())
    }
}

// ---------------------------------------------------------------------------
// Agent trait
// ---------------------------------------------------------------------------

/// A capability invoked by the engine with an input map, producing an output
/// map. Agents may use their own concurrency internally; from the engine's
/// view the call is synchronous and bounded by the step timeout.
pub trait Agent: Send + Sync + 'static {
    /// The agent's self-describing contract.
    fn contract(&self) -> &McpContract;

    /// Execute against the assembled input map.
    fn execute(
        &self,
        input: ValueMap,
        yield_point: StepYield,
    ) -> impl Future<Output = Result<ValueMap, AgentError>> + Send;
}

// ---------------------------------------------------------------------------
// Object-safe mirror
// ---------------------------------------------------------------------------

/// Object-safe version of [`Agent`] with boxed futures.
///
/// Exists solely to enable dynamic dispatch; a blanket implementation covers
/// every `Agent`.
pub trait AgentDyn: Send + Sync {
    fn contract(&self) -> &McpContract;

    fn execute_boxed(
        &self,
        input: ValueMap,
        yield_point: StepYield,
    ) -> Pin<Box<dyn Future<Output = Result<ValueMap, AgentError>> + Send + '_>>;
}

impl<T: Agent> AgentDyn for T {
    fn contract(&self) -> &McpContract {
        Agent::contract(self)
    }

    fn execute_boxed(
        &self,
        input: ValueMap,
        yield_point: StepYield,
    ) -> Pin<Box<dyn Future<Output = Result<ValueMap, AgentError>> + Send + '_>> {
        Box::pin(self.execute(input, yield_point))
    }
}

// ---------------------------------------------------------------------------
// BoxAgent
// ---------------------------------------------------------------------------

/// Type-erased agent for storage in the registry.
pub struct BoxAgent {
    inner: Box<dyn AgentDyn>,
}

impl BoxAgent {
    /// Wrap a concrete agent.
    pub fn new<T: Agent>(agent: T) -> Self {
        Self {
            inner: Box::new(agent),
        }
    }

    /// The wrapped agent's contract.
    pub fn contract(&self) -> &McpContract {
        self.inner.contract()
    }

    /// Execute the wrapped agent.
    pub async fn execute(
        &self,
        input: ValueMap,
        yield_point: StepYield,
    ) -> Result<ValueMap, AgentError> {
        self.inner.execute_boxed(input, yield_point).await
    }
}

impl std::fmt::Debug for BoxAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgent")
            .field("id", &self.contract().id)
            .field("version", &self.contract().version)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoAgent {
        contract: McpContract,
    }

    impl EchoAgent {
        fn new() -> Self {
            Self {
                contract: McpContract {
                    id: "echo".to_string(),
                    version: "1.0.0".to_string(),
                    inputs: json!({"type": "object"}),
                    outputs: json!({"type": "object"}),
                    checkpoints: vec![],
                    max_runtime_s: 5,
                    confidence: 1.0,
                    side_effects: vec![],
                    description: None,
                    mutable_params: vec![],
                },
            }
        }
    }

    impl Agent for EchoAgent {
        fn contract(&self) -> &McpContract {
            &self.contract
        }

        async fn execute(
            &self,
            input: ValueMap,
            yield_point: StepYield,
        ) -> Result<ValueMap, AgentError> {
            yield_point.checkpoint("echoing").await?;
            Ok(input)
        }
    }

    #[tokio::test]
    async fn boxed_agent_dispatches() {
        let agent = BoxAgent::new(EchoAgent::new());
        assert_eq!(agent.contract().id, "echo");

        let input = ValueMap::from([("k".to_string(), json!("v"))]);
        let output = agent
            .execute(input.clone(), StepYield::detached())
            .await
            .unwrap();
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn detached_yield_is_never_cancelled() {
        let y = StepYield::detached();
        assert!(!y.is_cancelled());
        assert!(y.checkpoint("anything").await.is_ok());
    }

    #[test]
    fn debug_shows_contract_id() {
        let agent = BoxAgent::new(EchoAgent::new());
        let text = format!("{agent:?}");
        assert!(text.contains("echo"));
    }
}
