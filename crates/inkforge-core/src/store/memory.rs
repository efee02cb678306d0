//! In-memory job store.
//!
//! Backs unit tests and embedded callers that do not need durability. The
//! behavior mirrors the filesystem store: archive moves, newest-first
//! listings, per-status stats (bytes = serialized state length).

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use inkforge_types::checkpoint::Checkpoint;
use inkforge_types::error::StoreError;
use inkforge_types::job::{JobMetadata, JobState, JobStatus};
use serde_json::json;
use uuid::Uuid;

use super::{JobStore, StatusBucket, StoreStats};

/// Non-durable store over concurrent maps.
#[derive(Default)]
pub struct MemoryJobStore {
    active: DashMap<Uuid, JobState>,
    archived: DashMap<Uuid, JobState>,
    outputs: DashMap<(Uuid, String), String>,
    logs: DashMap<Uuid, Vec<String>>,
    checkpoints: DashMap<Uuid, Vec<Checkpoint>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log lines recorded for a job (test observability).
    pub fn log_lines(&self, job_id: Uuid) -> Vec<String> {
        self.logs.get(&job_id).map(|l| l.clone()).unwrap_or_default()
    }
}

impl JobStore for MemoryJobStore {
    async fn save(&self, state: &mut JobState) -> Result<(), StoreError> {
        state.metadata.updated_at = Utc::now();
        self.active.insert(state.metadata.job_id, state.clone());
        Ok(())
    }

    async fn load(&self, job_id: Uuid, include_archive: bool) -> Result<Option<JobState>, StoreError> {
        if let Some(state) = self.active.get(&job_id) {
            return Ok(Some(state.clone()));
        }
        if include_archive {
            return Ok(self.archived.get(&job_id).map(|s| s.clone()));
        }
        Ok(None)
    }

    async fn delete(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let existed =
            self.active.remove(&job_id).is_some() | self.archived.remove(&job_id).is_some();
        self.checkpoints.remove(&job_id);
        self.logs.remove(&job_id);
        self.outputs.retain(|(id, _), _| *id != job_id);
        Ok(existed)
    }

    async fn archive(&self, job_id: Uuid) -> Result<(), StoreError> {
        let Some((_, mut state)) = self.active.remove(&job_id) else {
            return Err(StoreError::JobNotFound(job_id));
        };
        if !state.metadata.status.is_terminal() {
            let status = state.metadata.status;
            self.active.insert(job_id, state);
            return Err(StoreError::InvalidState(format!(
                "cannot archive job in status '{status}'"
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
        self.archived.insert(job_id, state);
        Ok(())
    }

    async fn unarchive(&self, job_id: Uuid) -> Result<(), StoreError> {
        let Some((_, mut state)) = self.archived.remove(&job_id) else {
            return Err(StoreError::JobNotFound(job_id));
        };
        // Restore the terminal status recorded before archival.
        let status = state
            .context
            .remove("pre_archive_status")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(JobStatus::Completed);
        state.metadata.status = status;
        state.context.remove("archived_at");
        self.active.insert(job_id, state);
        Ok(())
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: Option<usize>,
        include_archive: bool,
    ) -> Result<Vec<JobMetadata>, StoreError> {
        let mut all: Vec<JobMetadata> = self
            .active
            .iter()
            .map(|entry| entry.metadata.clone())
            .collect();
        if include_archive {
            all.extend(self.archived.iter().map(|entry| entry.metadata.clone()));
        }
        if let Some(status) = status {
            all.retain(|m| m.status == status);
        }
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            all.truncate(limit);
        }
        Ok(all)
    }

    async fn cleanup_old_archives(&self, days: i64) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - Duration::days(days);
        let stale: Vec<Uuid> = self
            .archived
            .iter()
            .filter(|entry| entry.metadata.updated_at < cutoff)
            .map(|entry| entry.metadata.job_id)
            .collect();
        for job_id in &stale {
            self.archived.remove(job_id);
            self.checkpoints.remove(job_id);
        }
        Ok(stale.len())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut per_status: BTreeMap<String, StatusBucket> = BTreeMap::new();
        let mut total_bytes = 0u64;
        let mut total_jobs = 0usize;

        for entry in self.active.iter().chain(self.archived.iter()) {
            let bytes = serde_json::to_vec(entry.value())?.len() as u64;
            let bucket = per_status
                .entry(entry.metadata.status.to_string())
                .or_default();
            bucket.count += 1;
            bucket.bytes += bytes;
            total_bytes += bytes;
            total_jobs += 1;
        }

        Ok(StoreStats {
            per_status,
            total_jobs,
            total_bytes,
        })
    }

    async fn save_output(&self, job_id: Uuid, name: &str, content: &str) -> Result<(), StoreError> {
        self.outputs
            .insert((job_id, name.to_string()), content.to_string());
        Ok(())
    }

    async fn load_output(&self, job_id: Uuid, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .outputs
            .get(&(job_id, name.to_string()))
            .map(|c| c.clone()))
    }

    async fn append_log(&self, job_id: Uuid, line: &str) -> Result<(), StoreError> {
        self.logs.entry(job_id).or_default().push(line.to_string());
        Ok(())
    }

    async fn read_log(&self, job_id: Uuid) -> Result<Option<String>, StoreError> {
        Ok(self.logs.get(&job_id).map(|lines| {
            let mut text = lines.join("\n");
            text.push('\n');
            text
        }))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut list = self.checkpoints.entry(checkpoint.job_id).or_default();
        match list
            .iter_mut()
            .find(|c| c.checkpoint_id == checkpoint.checkpoint_id)
        {
            Some(existing) => *existing = checkpoint.clone(),
            None => list.push(checkpoint.clone()),
        }
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        job_id: Uuid,
        checkpoint_id: Uuid,
    ) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.checkpoints.get(&job_id).and_then(|list| {
            list.iter()
                .find(|c| c.checkpoint_id == checkpoint_id)
                .cloned()
        }))
    }

    async fn list_checkpoints(&self, job_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        let mut list = self
            .checkpoints
            .get(&job_id)
            .map(|l| l.clone())
            .unwrap_or_default();
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(list)
    }

    async fn delete_checkpoint(
        &self,
        job_id: Uuid,
        checkpoint_id: Uuid,
    ) -> Result<bool, StoreError> {
        let Some(mut list) = self.checkpoints.get_mut(&job_id) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|c| c.checkpoint_id != checkpoint_id);
        Ok(list.len() < before)
    }

    async fn find_checkpoint(&self, checkpoint_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        for entry in self.checkpoints.iter() {
            if let Some(found) = entry
                .value()
                .iter()
                .find(|c| c.checkpoint_id == checkpoint_id)
            {
                return Ok(Some(found.clone()));
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use inkforge_types::job::{StepExecution, ValueMap};

    fn sample_state(status: JobStatus) -> JobState {
        let now = Utc::now();
        JobState {
            metadata: JobMetadata {
                job_id: Uuid::now_v7(),
                workflow_id: "wf".to_string(),
                status,
                created_at: now,
                started_at: None,
                completed_at: None,
                updated_at: now,
                progress: 0.0,
                current_step: None,
                total_steps: 1,
                completed_steps: 0,
                failed_steps: 0,
                error_message: None,
                correlation_id: "c".to_string(),
                param_updates: vec![],
            },
            inputs: ValueMap::new(),
            outputs: ValueMap::new(),
            steps: [("a".to_string(), StepExecution::pending("a"))].into(),
            context: ValueMap::new(),
        }
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let store = MemoryJobStore::new();
        let mut state = sample_state(JobStatus::Pending);
        store.save(&mut state).await.unwrap();

        let loaded = store
            .load(state.metadata.job_id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn archive_requires_terminal_status() {
        let store = MemoryJobStore::new();
        let mut state = sample_state(JobStatus::Running);
        store.save(&mut state).await.unwrap();

        let err = store.archive(state.metadata.job_id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));

        // Still loadable from the active tree.
        assert!(
            store
                .load(state.metadata.job_id, false)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn archive_moves_out_of_active_tree() {
        let store = MemoryJobStore::new();
        let mut state = sample_state(JobStatus::Completed);
        store.save(&mut state).await.unwrap();
        let id = state.metadata.job_id;

        store.archive(id).await.unwrap();
        assert!(store.load(id, false).await.unwrap().is_none());

        let archived = store.load(id, true).await.unwrap().unwrap();
        assert_eq!(archived.metadata.status, JobStatus::Archived);
        assert!(archived.context.contains_key("archived_at"));
    }

    #[tokio::test]
    async fn list_orders_newest_first_and_limits() {
        let store = MemoryJobStore::new();
        for _ in 0..3 {
            let mut state = sample_state(JobStatus::Pending);
            store.save(&mut state).await.unwrap();
        }
        let listed = store.list(None, Some(2), false).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].created_at >= listed[1].created_at);

        let completed = store
            .list(Some(JobStatus::Completed), None, false)
            .await
            .unwrap();
        assert!(completed.is_empty());
    }

    #[tokio::test]
    async fn stats_buckets_by_status() {
        let store = MemoryJobStore::new();
        let mut a = sample_state(JobStatus::Completed);
        let mut b = sample_state(JobStatus::Failed);
        store.save(&mut a).await.unwrap();
        store.save(&mut b).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.per_status["completed"].count, 1);
        assert_eq!(stats.per_status["failed"].count, 1);
        assert!(stats.total_bytes > 0);
    }

    #[tokio::test]
    async fn outputs_and_logs() {
        let store = MemoryJobStore::new();
        let id = Uuid::now_v7();
        store.save_output(id, "article.md", "# Title").await.unwrap();
        assert_eq!(
            store.load_output(id, "article.md").await.unwrap().unwrap(),
            "# Title"
        );
        assert!(store.load_output(id, "missing").await.unwrap().is_none());

        store.append_log(id, "started").await.unwrap();
        store.append_log(id, "finished").await.unwrap();
        assert_eq!(store.log_lines(id), vec!["started", "finished"]);
    }
}
