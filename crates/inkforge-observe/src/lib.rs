//! Observability setup for Inkforge.

pub mod tracing_setup;
