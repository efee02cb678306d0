//! Input and output framing around a job.
//!
//! Before a job runs, [`input_resolver`] normalizes whatever the caller
//! provided (a topic, a file, a folder, a file list) into a uniform context
//! set, and [`context_merger`] folds that set into one size-capped document.
//! After the final step, [`aggregator`] merges agent outputs against a
//! template schema and [`completeness_gate`] validates the final artifact
//! before it is written out.

use thiserror::Error;

pub mod aggregator;
pub mod completeness_gate;
pub mod context_merger;
pub mod input_resolver;

pub use aggregator::{AggregatorReport, OutputAggregator, SectionRequirement, TemplateSchema};
pub use completeness_gate::CompletenessGate;
pub use context_merger::{ContextMerger, MergedContext};
pub use input_resolver::{ContextSet, InputResolver, InputSpec, SourceContext};

/// Errors from the input/output pipeline stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("io error: {0}")]
    Io(String),

    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("input too large: {path} is {size} bytes (max {max})")]
    InputTooLarge {
        path: String,
        size: u64,
        max: u64,
    },

    #[error("incomplete artifact: {0}")]
    Incomplete(String),

    #[error("empty artifact: {0}")]
    Empty(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Io(e.to_string())
    }
}
