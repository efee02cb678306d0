//! Safe path joining.
//!
//! Every path the store builds from external input (job ids, artifact names,
//! checkpoint file names) goes through [`safe_join`], which rejects absolute
//! components and parent-directory traversal. The core never opens an
//! arbitrary path.

use std::path::{Component, Path, PathBuf};

use inkforge_types::error::StoreError;

/// Join `candidate` onto `base`, rejecting anything that could escape it.
///
/// Rejected: absolute paths, `..` components, and drive/root prefixes.
/// Plain `.` components are ignored.
pub fn safe_join(base: &Path, candidate: &str) -> Result<PathBuf, StoreError> {
    let candidate_path = Path::new(candidate);
    let mut joined = base.to_path_buf();

    for component in candidate_path.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::PathEscape(candidate.to_string()));
            }
        }
    }

    if candidate_path.components().next().is_none() {
        return Err(StoreError::PathEscape("empty path".to_string()));
    }

    Ok(joined)
}
