//! Filesystem persistence.

pub mod job_store;
pub mod paths;

pub use job_store::FsJobStore;
pub use paths::safe_join;
