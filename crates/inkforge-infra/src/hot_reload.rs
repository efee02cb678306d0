//! Debounced, validated, rollback-capable configuration hot-reload.
//!
//! Watches a config directory with `notify-debouncer-mini` (one-second
//! debounce coalesces editor save bursts). On each settled change the file is
//! parsed and validated for its kind; invalid content is rejected without
//! touching the in-memory config. Valid content is applied snapshot-first:
//! if any registered reload callback fails, the previous config is restored.
//!
//! In-flight jobs are unaffected either way: they keep the config captured
//! at submission.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Debounce window for filesystem events.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the hot-reload monitor.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("watcher error: {0}")]
    Watcher(String),

    #[error("io error: {0}")]
    Io(String),

    /// The new content failed validation; the prior config is retained.
    #[error("validation failed for {path}: {reason}")]
    ValidationFailure { path: String, reason: String },

    /// A reload callback failed; the prior config was rolled back.
    #[error("reload callback failed: {0}")]
    CallbackFailure(String),

    #[error("unrecognized config file: {0}")]
    UnknownKind(String),
}

impl From<std::io::Error> for ReloadError {
    fn from(e: std::io::Error) -> Self {
        ReloadError::Io(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Config kinds
// ---------------------------------------------------------------------------

/// The configuration families the monitor understands, keyed by file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    Agents,
    Workflows,
    Models,
    Policies,
}

impl ConfigKind {
    /// Classify a path by its file name. Policy files live under a
    /// `policies/` directory; the rest are fixed file names.
    pub fn classify(path: &Path) -> Option<ConfigKind> {
        let name = path.file_name()?.to_str()?;
        match name {
            "agents.yaml" | "agents.yml" => Some(ConfigKind::Agents),
            "workflows.yaml" | "workflows.yml" => Some(ConfigKind::Workflows),
            "models.yaml" | "models.yml" => Some(ConfigKind::Models),
            _ => {
                let in_policies = path
                    .parent()
                    .and_then(|p| p.file_name())
                    .and_then(|d| d.to_str())
                    .is_some_and(|d| d == "policies");
                (in_policies && name.ends_with(".json")).then_some(ConfigKind::Policies)
            }
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ConfigKind::Agents => "agents",
            ConfigKind::Workflows => "workflows",
            ConfigKind::Models => "models",
            ConfigKind::Policies => "policies",
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Per-file reload counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadStats {
    pub total_reloads: u64,
    pub failed_reloads: u64,
}

impl ReloadStats {
    /// Fraction of successful reloads, 1.0 when none were attempted.
    pub fn success_rate(&self) -> f64 {
        if self.total_reloads == 0 {
            return 1.0;
        }
        (self.total_reloads - self.failed_reloads) as f64 / self.total_reloads as f64
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Callback invoked after a validated config is applied. Returning an error
/// rolls the config back.
pub type ReloadCallback = Box<dyn Fn(ConfigKind, &Value) -> Result<(), String> + Send + Sync>;

/// Hot-reload monitor over a config directory.
pub struct HotReloadMonitor {
    current: RwLock<HashMap<ConfigKind, Value>>,
    callbacks: Mutex<Vec<ReloadCallback>>,
    stats: Mutex<HashMap<PathBuf, ReloadStats>>,
    /// Keeps the debounced watcher alive; dropping it stops the watch.
    watcher: Mutex<Option<Debouncer<RecommendedWatcher>>>,
}

impl Default for HotReloadMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HotReloadMonitor {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            stats: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
        }
    }

    /// Register a reload callback. Callbacks must be fast and non-blocking;
    /// anything heavier should hand off to its own task.
    pub fn on_reload(&self, callback: ReloadCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    /// Current in-memory config for a kind.
    pub fn get_config(&self, kind: ConfigKind) -> Option<Value> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .cloned()
    }

    /// Reload counters for a watched file.
    pub fn stats_for(&self, path: &Path) -> ReloadStats {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .copied()
            .unwrap_or_default()
    }

    /// Start watching `config_dir` recursively. Settled changes are processed
    /// on a background task until the monitor is dropped.
    pub fn start(self: &Arc<Self>, config_dir: &Path) -> Result<(), ReloadError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

        let mut debouncer = new_debouncer(DEBOUNCE_WINDOW, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let paths: Vec<PathBuf> = events.into_iter().map(|e| e.path).collect();
                    let _ = tx.send(paths);
                }
                Err(e) => tracing::warn!(error = %e, "file watch error"),
            }
        })
        .map_err(|e| ReloadError::Watcher(e.to_string()))?;

        debouncer
            .watcher()
            .watch(config_dir, RecursiveMode::Recursive)
            .map_err(|e| ReloadError::Watcher(e.to_string()))?;
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(debouncer);

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(paths) = rx.recv().await {
                for path in paths {
                    if ConfigKind::classify(&path).is_none() {
                        continue;
                    }
                    if let Err(e) = monitor.reload_path(&path).await {
                        tracing::warn!(path = %path.display(), error = %e, "config reload rejected");
                    }
                }
            }
        });

        tracing::info!(dir = %config_dir.display(), "config hot-reload watching");
        Ok(())
    }

    /// Stop watching. Already-queued changes still apply.
    pub fn stop(&self) {
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Parse, validate, and apply one config file. Public so callers can
    /// force a reload without waiting for a filesystem event.
    pub async fn reload_path(&self, path: &Path) -> Result<(), ReloadError> {
        let kind = ConfigKind::classify(path)
            .ok_or_else(|| ReloadError::UnknownKind(path.display().to_string()))?;

        let outcome = self.try_reload(path, kind).await;
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let entry = stats.entry(path.to_path_buf()).or_default();
        entry.total_reloads += 1;
        if outcome.is_err() {
            entry.failed_reloads += 1;
        }
        outcome
    }

    async fn try_reload(&self, path: &Path, kind: ConfigKind) -> Result<(), ReloadError> {
        let text = tokio::fs::read_to_string(path).await?;
        let parsed = parse_and_validate(path, kind, &text)?;

        // Snapshot, apply, run callbacks, roll back on failure.
        let snapshot = {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            let snapshot = current.get(&kind).cloned();
            current.insert(kind, parsed.clone());
            snapshot
        };

        let callback_result = {
            let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            callbacks
                .iter()
                .try_for_each(|cb| cb(kind, &parsed))
        };

        if let Err(reason) = callback_result {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            match snapshot {
                Some(previous) => {
                    current.insert(kind, previous);
                }
                None => {
                    current.remove(&kind);
                }
            }
            tracing::warn!(
                path = %path.display(),
                kind = kind.as_str(),
                reason = reason.as_str(),
                "reload callback failed, rolled back"
            );
            return Err(ReloadError::CallbackFailure(reason));
        }

        tracing::info!(path = %path.display(), kind = kind.as_str(), "config reloaded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-kind validation
// ---------------------------------------------------------------------------

fn parse_and_validate(path: &Path, kind: ConfigKind, text: &str) -> Result<Value, ReloadError> {
    let reject = |reason: String| ReloadError::ValidationFailure {
        path: path.display().to_string(),
        reason,
    };

    let value: Value = match kind {
        ConfigKind::Policies => {
            serde_json::from_str(text).map_err(|e| reject(e.to_string()))?
        }
        _ => serde_yaml_ng::from_str(text).map_err(|e| reject(e.to_string()))?,
    };

    match kind {
        ConfigKind::Agents => {
            let agents = value
                .get("agents")
                .and_then(Value::as_object)
                .ok_or_else(|| reject("expected top-level 'agents' mapping".to_string()))?;
            for (id, spec) in agents {
                if !spec.is_object() {
                    return Err(reject(format!("agent '{id}' must be a mapping")));
                }
            }
        }
        ConfigKind::Workflows => {
            let workflows = value
                .get("workflows")
                .and_then(Value::as_object)
                .ok_or_else(|| reject("expected top-level 'workflows' mapping".to_string()))?;
            for (id, spec) in workflows {
                if spec.get("steps").and_then(Value::as_object).is_none() {
                    return Err(reject(format!("workflow '{id}' missing 'steps' mapping")));
                }
            }
        }
        ConfigKind::Models => {
            if !value.is_object() {
                return Err(reject("expected a mapping of model settings".to_string()));
            }
        }
        ConfigKind::Policies => {
            if !value.is_object() {
                return Err(reject("expected a policy object".to_string()));
            }
        }
    }

    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
