//! Workflow definition file loading and hot-reload wiring.
//!
//! Loads every workflow YAML file in a directory into a
//! [`WorkflowCompiler`], and bridges the hot-reload monitor to the compiler
//! so a validated `workflows.yaml` change refreshes the library in place.
//! Jobs already submitted keep the plan compiled at submission time.

use std::path::Path;
use std::sync::Arc;

use inkforge_core::compiler::{CompileError, WorkflowCompiler};

use crate::hot_reload::{ConfigKind, HotReloadMonitor};

/// Load all `*.yaml` / `*.yml` files under `dir` (non-recursive) into the
/// compiler. Returns the number of workflows loaded. A file that fails to
/// parse aborts the load; definitions loaded before it remain.
pub async fn load_workflows_dir(
    compiler: &WorkflowCompiler,
    dir: &Path,
) -> Result<usize, CompileError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| CompileError::Parse(format!("cannot read {}: {e}", dir.display())))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CompileError::Parse(e.to_string()))?
    {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if is_yaml {
            files.push(path);
        }
    }
    files.sort();

    let mut loaded = 0;
    for path in &files {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CompileError::Parse(format!("cannot read {}: {e}", path.display())))?;
        loaded += compiler.load_yaml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded workflow file");
    }

    tracing::info!(dir = %dir.display(), workflows = loaded, "workflow library loaded");
    Ok(loaded)
}

/// Register a reload callback that feeds validated `workflows.yaml` changes
/// back into the compiler. Invalid definitions reject the reload, which
/// rolls the monitor's config back and leaves the compiler untouched.
pub fn attach_workflow_reload(monitor: &HotReloadMonitor, compiler: Arc<WorkflowCompiler>) {
    monitor.on_reload(Box::new(move |kind, value| {
        if kind != ConfigKind::Workflows {
            return Ok(());
        }
        let yaml = serde_yaml_ng::to_string(value).map_err(|e| e.to_string())?;
        let count = compiler.load_yaml_str(&yaml).map_err(|e| e.to_string())?;
        tracing::info!(workflows = count, "workflow library hot-reloaded");
        Ok(())
    }));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PIPELINE: &str = r#"
workflows:
  article-pipeline:
    steps:
      research: {}
      draft:
        depends_on: [research]
"#;

    #[tokio::test]
    async fn loads_all_yaml_files_in_dir() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("content.yaml"), PIPELINE).await.unwrap();
        tokio::fs::write(
            tmp.path().join("misc.yml"),
            "workflows:\n  one-shot:\n    steps:\n      single: {}\n",
        )
        .await
        .unwrap();
        tokio::fs::write(tmp.path().join("notes.txt"), "ignored").await.unwrap();

        let compiler = WorkflowCompiler::new();
        let loaded = load_workflows_dir(&compiler, tmp.path()).await.unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(compiler.workflow_ids(), vec!["article-pipeline", "one-shot"]);
        assert!(compiler.compile("article-pipeline").is_ok());
    }

    #[tokio::test]
    async fn broken_file_surfaces_parse_error() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("bad.yaml"), "workflows: [nope").await.unwrap();

        let compiler = WorkflowCompiler::new();
        let err = load_workflows_dir(&compiler, tmp.path()).await.unwrap_err();
        assert!(matches!(err, CompileError::Parse(_)));
    }

    #[tokio::test]
    async fn reload_callback_refreshes_compiler() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("workflows.yaml");
        tokio::fs::write(&path, PIPELINE).await.unwrap();

        let compiler = Arc::new(WorkflowCompiler::new());
        let monitor = HotReloadMonitor::new();
        attach_workflow_reload(&monitor, Arc::clone(&compiler));

        monitor.reload_path(&path).await.unwrap();
        assert!(compiler.compile("article-pipeline").is_ok());

        // A new workflow appears after the file changes and reloads.
        tokio::fs::write(
            &path,
            format!("{PIPELINE}  nightly:\n    steps:\n      sweep: {{}}\n"),
        )
        .await
        .unwrap();
        monitor.reload_path(&path).await.unwrap();
        assert!(compiler.compile("nightly").is_ok());
    }

    #[tokio::test]
    async fn invalid_reload_leaves_compiler_untouched() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("workflows.yaml");
        tokio::fs::write(&path, PIPELINE).await.unwrap();

        let compiler = Arc::new(WorkflowCompiler::new());
        let monitor = HotReloadMonitor::new();
        attach_workflow_reload(&monitor, Arc::clone(&compiler));
        monitor.reload_path(&path).await.unwrap();

        // Structurally invalid: rejected by the monitor's own validation.
        tokio::fs::write(&path, "workflows:\n  broken: {}\n").await.unwrap();
        assert!(monitor.reload_path(&path).await.is_err());
        assert_eq!(compiler.workflow_ids(), vec!["article-pipeline"]);
        assert!(compiler.compile("article-pipeline").is_ok());
    }
}
