//! Engine configuration.
//!
//! `EngineConfig` is deserialized from `engine.toml` by the infra layer;
//! every field has a default so a missing or partial file still yields a
//! working engine. In-flight jobs keep the config captured at submission --
//! hot reload never mutates a running job's view.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default worker pool size.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default per-step wall-clock timeout in seconds.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Default retry budget per step.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of pool workers; bounds cross-job parallelism.
    pub max_concurrent_jobs: usize,
    /// Timeout applied to steps that do not declare their own.
    pub default_step_timeout_secs: u64,
    /// Retry budget applied to steps that do not declare their own.
    pub default_max_retries: u32,
    /// Capacity of the FIFO submission queue.
    pub queue_capacity: usize,
    /// Checkpoints retained per job by automatic cleanup (1..=100).
    pub checkpoint_retention: usize,
    /// Root directory for the file-backed job store.
    pub jobs_root: PathBuf,
    /// Broadcast capacity of the event bus.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_WORKER_COUNT,
            default_step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            default_max_retries: DEFAULT_MAX_RETRIES,
            queue_capacity: 256,
            checkpoint_retention: 20,
            jobs_root: PathBuf::from("./jobs"),
            event_capacity: 1024,
        }
    }
}
