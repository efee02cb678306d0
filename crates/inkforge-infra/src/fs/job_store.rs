//! File-backed job store.
//!
//! Directory layout, mirrored under `archive/` for archived jobs:
//!
//! ```text
//! <root>/
//!   <job_id>/
//!     state.json          # full JobState
//!     outputs/<name>      # user-visible artifacts
//!     logs/job.log        # human-readable trace
//!     checkpoints/<id>.json
//!   archive/<job_id>/...
//! ```
//!
//! Every write of `state.json` and of checkpoint files goes to a temp file
//! in the same directory and is renamed into place, so readers never observe
//! a torn file; partial or corrupt files are rejected on load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use inkforge_core::store::{JobStore, StatusBucket, StoreStats};
use inkforge_types::checkpoint::Checkpoint;
use inkforge_types::error::StoreError;
use inkforge_types::job::{JobMetadata, JobState, JobStatus};
use serde_json::{Value, json};
use uuid::Uuid;

use super::paths::safe_join;

const STATE_FILE: &str = "state.json";
const ARCHIVE_DIR: &str = "archive";

/// Filesystem implementation of [`JobStore`].
pub struct FsJobStore {
    root: PathBuf,
}

impl FsJobStore {
    /// Open (and create) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(ARCHIVE_DIR)).await?;
        Ok(Self { root })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, job_id: Uuid, archived: bool) -> PathBuf {
        if archived {
            self.root.join(ARCHIVE_DIR).join(job_id.to_string())
        } else {
            self.root.join(job_id.to_string())
        }
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_state(path: &Path) -> Result<JobState, StoreError> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Where a job currently lives, if anywhere.
    async fn locate(&self, job_id: Uuid) -> Option<(PathBuf, bool)> {
        let active = self.job_dir(job_id, false);
        if tokio::fs::try_exists(active.join(STATE_FILE)).await.unwrap_or(false) {
            return Some((active, false));
        }
        let archived = self.job_dir(job_id, true);
        if tokio::fs::try_exists(archived.join(STATE_FILE)).await.unwrap_or(false) {
            return Some((archived, true));
        }
        None
    }

    async fn job_dirs(&self, archived: bool) -> Result<Vec<PathBuf>, StoreError> {
        let base = if archived {
            self.root.join(ARCHIVE_DIR)
        } else {
            self.root.clone()
        };
        let mut dirs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !archived
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n == ARCHIVE_DIR)
            {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Read only the metadata object out of a `state.json`.
    async fn read_metadata(dir: &Path) -> Option<JobMetadata> {
        let path = dir.join(STATE_FILE);
        let text = tokio::fs::read_to_string(&path).await.ok()?;
        let value: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping corrupt state file");
                return None;
            }
        };
        match serde_json::from_value(value.get("metadata")?.clone()) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping state with bad metadata");
                None
            }
        }
    }

    async fn dir_size(dir: &Path) -> u64 {
        let mut total = 0u64;
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&current).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if let Ok(meta) = entry.metadata().await {
                    total += meta.len();
                }
            }
        }
        total
    }

    async fn checkpoints_in(&self, dir: &Path) -> Result<Vec<Checkpoint>, StoreError> {
        let checkpoint_dir = dir.join("checkpoints");
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&checkpoint_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(text) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            match serde_json::from_str::<Checkpoint>(&text) {
                Ok(checkpoint) => found.push(checkpoint),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping corrupt checkpoint");
                }
            }
        }
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(found)
    }
}

impl JobStore for FsJobStore {
    async fn save(&self, state: &mut JobState) -> Result<(), StoreError> {
        state.metadata.updated_at = Utc::now();
        // An archived job keeps its state under archive/.
        let archived = matches!(
            self.locate(state.metadata.job_id).await,
            Some((_, true))
        );
        let dir = self.job_dir(state.metadata.job_id, archived);
        tokio::fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec_pretty(state)?;
        Self::write_atomic(&dir.join(STATE_FILE), &bytes).await
    }

    async fn load(&self, job_id: Uuid, include_archive: bool) -> Result<Option<JobState>, StoreError> {
        match self.locate(job_id).await {
            Some((dir, archived)) if !archived || include_archive => {
                Ok(Some(Self::read_state(&dir.join(STATE_FILE)).await?))
            }
            _ => Ok(None),
        }
    }

    async fn delete(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let Some((dir, _)) = self.locate(job_id).await else {
            return Ok(false);
        };
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(true)
    }

    async fn archive(&self, job_id: Uuid) -> Result<(), StoreError> {
        let Some((dir, archived)) = self.locate(job_id).await else {
            return Err(StoreError::JobNotFound(job_id));
        };
        if archived {
            return Ok(());
        }
        let mut state = Self::read_state(&dir.join(STATE_FILE)).await?;
        if !state.metadata.status.is_terminal() {
            return Err(StoreError::InvalidState(format!(
                "cannot archive job in status '{}'",
                state.metadata.status
            )));
        }

        state.context.insert(
            "pre_archive_status".to_string(),
            json!(state.metadata.status),
        );
        state.metadata.status = JobStatus::Archived;
        state
            .context
            .insert("archived_at".to_string(), json!(Utc::now().to_rfc3339()));

        let target = self.job_dir(job_id, true);
        tokio::fs::rename(&dir, &target).await?;
        let bytes = serde_json::to_vec_pretty(&state)?;
        Self::write_atomic(&target.join(STATE_FILE), &bytes).await
    }

    async fn unarchive(&self, job_id: Uuid) -> Result<(), StoreError> {
        let Some((dir, archived)) = self.locate(job_id).await else {
            return Err(StoreError::JobNotFound(job_id));
        };
        if !archived {
            return Ok(());
        }
        let mut state = Self::read_state(&dir.join(STATE_FILE)).await?;
        let status = state
            .context
            .remove("pre_archive_status")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(JobStatus::Completed);
        state.metadata.status = status;
        state.context.remove("archived_at");

        let target = self.job_dir(job_id, false);
        tokio::fs::rename(&dir, &target).await?;
        let bytes = serde_json::to_vec_pretty(&state)?;
        Self::write_atomic(&target.join(STATE_FILE), &bytes).await
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: Option<usize>,
        include_archive: bool,
    ) -> Result<Vec<JobMetadata>, StoreError> {
        let mut dirs = self.job_dirs(false).await?;
        if include_archive {
            dirs.extend(self.job_dirs(true).await?);
        }

        let mut all = Vec::with_capacity(dirs.len());
        for dir in &dirs {
            if let Some(meta) = Self::read_metadata(dir).await {
                if status.is_none_or(|st| meta.status == st) {
                    all.push(meta);
                }
            }
        }
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            all.truncate(limit);
        }
        Ok(all)
    }

    async fn cleanup_old_archives(&self, days: i64) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut removed = 0;
        for dir in self.job_dirs(true).await? {
            let Ok(state) = Self::read_state(&dir.join(STATE_FILE)).await else {
                continue;
            };
            let archived_at = state
                .context
                .get("archived_at")
                .and_then(Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(state.metadata.updated_at);
            if archived_at < cutoff {
                tokio::fs::remove_dir_all(&dir).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, days, "cleaned up old archives");
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut per_status: BTreeMap<String, StatusBucket> = BTreeMap::new();
        let mut total_jobs = 0;
        let mut total_bytes = 0;

        let mut dirs = self.job_dirs(false).await?;
        dirs.extend(self.job_dirs(true).await?);
        for dir in &dirs {
            let Some(meta) = Self::read_metadata(dir).await else {
                continue;
            };
            let bytes = Self::dir_size(dir).await;
            let bucket = per_status.entry(meta.status.to_string()).or_default();
            bucket.count += 1;
            bucket.bytes += bytes;
            total_jobs += 1;
            total_bytes += bytes;
        }

        Ok(StoreStats {
            per_status,
            total_jobs,
            total_bytes,
        })
    }

    async fn save_output(&self, job_id: Uuid, name: &str, content: &str) -> Result<(), StoreError> {
        let (dir, _) = self
            .locate(job_id)
            .await
            .ok_or(StoreError::JobNotFound(job_id))?;
        let outputs = dir.join("outputs");
        let path = safe_join(&outputs, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    async fn load_output(&self, job_id: Uuid, name: &str) -> Result<Option<String>, StoreError> {
        let Some((dir, _)) = self.locate(job_id).await else {
            return Ok(None);
        };
        let path = safe_join(&dir.join("outputs"), name)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_log(&self, job_id: Uuid, line: &str) -> Result<(), StoreError> {
        use tokio::io::AsyncWriteExt;

        let dir = match self.locate(job_id).await {
            Some((dir, _)) => dir,
            // Logs may be written before the first state save.
            None => self.job_dir(job_id, false),
        };
        let logs = dir.join("logs");
        tokio::fs::create_dir_all(&logs).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(logs.join("job.log"))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    async fn read_log(&self, job_id: Uuid) -> Result<Option<String>, StoreError> {
        let Some((dir, _)) = self.locate(job_id).await else {
            return Ok(None);
        };
        match tokio::fs::read_to_string(dir.join("logs").join("job.log")).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let dir = match self.locate(checkpoint.job_id).await {
            Some((dir, _)) => dir,
            None => self.job_dir(checkpoint.job_id, false),
        };
        let checkpoint_dir = dir.join("checkpoints");
        tokio::fs::create_dir_all(&checkpoint_dir).await?;
        let path = checkpoint_dir.join(format!("{}.json", checkpoint.checkpoint_id));
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        Self::write_atomic(&path, &bytes).await
    }

    async fn load_checkpoint(
        &self,
        job_id: Uuid,
        checkpoint_id: Uuid,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let Some((dir, _)) = self.locate(job_id).await else {
            return Ok(None);
        };
        let path = dir.join("checkpoints").join(format!("{checkpoint_id}.json"));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_checkpoints(&self, job_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        let Some((dir, _)) = self.locate(job_id).await else {
            return Ok(Vec::new());
        };
        self.checkpoints_in(&dir).await
    }

    async fn delete_checkpoint(&self, job_id: Uuid, checkpoint_id: Uuid) -> Result<bool, StoreError> {
        let Some((dir, _)) = self.locate(job_id).await else {
            return Ok(false);
        };
        let path = dir.join("checkpoints").join(format!("{checkpoint_id}.json"));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_checkpoint(&self, checkpoint_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        let mut dirs = self.job_dirs(false).await?;
        dirs.extend(self.job_dirs(true).await?);
        let file_name = format!("{checkpoint_id}.json");
        for dir in dirs {
            let path = dir.join("checkpoints").join(&file_name);
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => return Ok(Some(serde_json::from_str(&text)?)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
