//! Infrastructure layer for the Inkforge engine.
//!
//! Implements the storage and configuration seams defined in
//! `inkforge-core`: the file-backed job store, the debounced hot-reload
//! monitor, and TOML config loading. Nothing here contains scheduling or
//! workflow logic.

pub mod config;
pub mod fs;
pub mod hot_reload;
pub mod workflows;
