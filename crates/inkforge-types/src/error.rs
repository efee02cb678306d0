//! Shared error types used across crate boundaries.
//!
//! Module-local errors (compiler, engine, control, checkpoint, reload) live
//! next to the code that raises them in `inkforge-core` / `inkforge-infra`;
//! this module holds only the errors that cross the trait seams defined in
//! the core crate.

use thiserror::Error;
use uuid::Uuid;

/// Errors from job store operations (trait defined in `inkforge-core`,
/// implemented in `inkforge-infra`).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(Uuid),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("path escapes store root: {0}")]
    PathEscape(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Errors raised by agents through the capability interface.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent raised during execution.
    #[error("agent execution failed: {0}")]
    Execution(String),

    /// Inputs did not satisfy the agent's contract.
    #[error("invalid inputs: {0}")]
    InvalidInputs(String),

    /// The invocation was cancelled through its handle.
    #[error("agent invocation cancelled")]
    Cancelled,
}
