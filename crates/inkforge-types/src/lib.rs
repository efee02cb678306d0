//! Shared domain types for the Inkforge job execution engine.
//!
//! This crate holds the canonical data model: workflow definitions, compiled
//! execution plans, job and step state, checkpoints, lifecycle events, agent
//! contracts, and engine configuration. It has no async or I/O dependencies;
//! everything here is plain data with serde round-trips.

pub mod checkpoint;
pub mod config;
pub mod contract;
pub mod error;
pub mod event;
pub mod job;
pub mod plan;
pub mod workflow;
