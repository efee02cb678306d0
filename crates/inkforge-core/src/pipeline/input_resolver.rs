//! Input resolution: normalize caller-provided inputs into a context set.
//!
//! Callers may hand the engine a bare topic string, a single file, a folder
//! of reference material, or an explicit file list. The resolver reads the
//! text sources (markdown and plain text), caps their size, and produces a
//! uniform [`ContextSet`] that downstream agents consume.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::PipelineError;

/// Largest single source file the resolver will read (1 MiB).
pub const MAX_SOURCE_BYTES: u64 = 1_048_576;

/// File extensions treated as readable text sources.
const TEXT_EXTENSIONS: [&str; 4] = ["md", "markdown", "txt", "rst"];

// ---------------------------------------------------------------------------
// Specs and results
// ---------------------------------------------------------------------------

/// What the caller provided as job input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSpec {
    /// A bare topic to generate content about.
    Topic { topic: String },
    /// A single source file.
    File { path: PathBuf },
    /// A folder of source files (non-recursive).
    Folder { path: PathBuf },
    /// An explicit list of source files.
    Files { paths: Vec<PathBuf> },
}

/// One named source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceContext {
    /// Display name (file stem or `topic`).
    pub name: String,
    /// Raw text content.
    pub content: String,
}

/// The normalized result: an optional topic plus zero or more source
/// contexts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub contexts: Vec<SourceContext>,
}

impl ContextSet {
    /// Total characters across all contexts.
    pub fn total_chars(&self) -> usize {
        self.contexts.iter().map(|c| c.content.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Stateless input resolver.
pub struct InputResolver;

impl InputResolver {
    /// Resolve an input spec into a context set.
    pub async fn resolve(spec: &InputSpec) -> Result<ContextSet, PipelineError> {
        match spec {
            InputSpec::Topic { topic } => {
                if topic.trim().is_empty() {
                    return Err(PipelineError::UnsupportedInput(
                        "topic must not be empty".to_string(),
                    ));
                }
                Ok(ContextSet {
                    topic: Some(topic.trim().to_string()),
                    contexts: vec![],
                })
            }
            InputSpec::File { path } => {
                let context = Self::read_source(path).await?;
                Ok(ContextSet {
                    topic: Some(context.name.clone()),
                    contexts: vec![context],
                })
            }
            InputSpec::Folder { path } => Self::resolve_folder(path).await,
            InputSpec::Files { paths } => {
                let mut contexts = Vec::with_capacity(paths.len());
                for path in paths {
                    contexts.push(Self::read_source(path).await?);
                }
                Ok(ContextSet {
                    topic: None,
                    contexts,
                })
            }
        }
    }

    async fn resolve_folder(path: &Path) -> Result<ContextSet, PipelineError> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let entry_path = entry.path();
            if entry.file_type().await?.is_file() && is_text_source(&entry_path) {
                files.push(entry_path);
            }
        }
        // Deterministic ordering regardless of directory iteration order.
        files.sort();

        let mut contexts = Vec::with_capacity(files.len());
        for file in &files {
            contexts.push(Self::read_source(file).await?);
        }
        Ok(ContextSet {
            topic: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            contexts,
        })
    }

    async fn read_source(path: &Path) -> Result<SourceContext, PipelineError> {
        if !is_text_source(path) {
            return Err(PipelineError::UnsupportedInput(format!(
                "not a text source: {}",
                path.display()
            )));
        }
        let meta = tokio::fs::metadata(path).await?;
        if meta.len() > MAX_SOURCE_BYTES {
            return Err(PipelineError::InputTooLarge {
                path: path.display().to_string(),
                size: meta.len(),
                max: MAX_SOURCE_BYTES,
            });
        }
        let content = tokio::fs::read_to_string(path).await?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(SourceContext { name, content })
    }
}

fn is_text_source(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .is_some_and(|e| TEXT_EXTENSIONS.contains(&e.as_str()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
