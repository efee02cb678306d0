//! Context merging: combine resolved source contexts into one agent-ready
//! document.
//!
//! Sits between the input resolver and job submission: a [`ContextSet`] with
//! several sources becomes a single labelled text block plus a source
//! manifest, with a hard size cap so one oversized source cannot starve the
//! rest.

use serde::{Deserialize, Serialize};

use super::input_resolver::ContextSet;

/// Default cap on the merged context, characters.
pub const DEFAULT_MERGE_LIMIT_CHARS: usize = 200_000;

// ---------------------------------------------------------------------------
// MergedContext
// ---------------------------------------------------------------------------

/// The combined context handed to agents as a single input value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedContext {
    /// Labelled, concatenated source text.
    pub text: String,
    /// Names of the sources that made it in, in order.
    pub sources: Vec<String>,
    /// Names of sources dropped or truncated by the size cap.
    pub truncated: Vec<String>,
    /// Topic carried over from resolution, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl MergedContext {
    /// Whether the cap forced anything out.
    pub fn is_complete(&self) -> bool {
        self.truncated.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ContextMerger
// ---------------------------------------------------------------------------

/// Merges context sets under a size budget. Sources are taken in order;
/// when the cap is hit the current source is truncated and the rest are
/// dropped, all recorded in the manifest.
pub struct ContextMerger {
    limit_chars: usize,
}

impl Default for ContextMerger {
    fn default() -> Self {
        Self {
            limit_chars: DEFAULT_MERGE_LIMIT_CHARS,
        }
    }
}

impl ContextMerger {
    pub fn new(limit_chars: usize) -> Self {
        Self {
            limit_chars: limit_chars.max(1),
        }
    }

    /// Merge a context set into one labelled document.
    pub fn merge(&self, set: &ContextSet) -> MergedContext {
        let mut text = String::new();
        let mut sources = Vec::new();
        let mut truncated = Vec::new();

        for context in &set.contexts {
            let header = format!("--- source: {} ---\n", context.name);
            let remaining = self.limit_chars.saturating_sub(text.len());

            if remaining <= header.len() {
                truncated.push(context.name.clone());
                continue;
            }

            text.push_str(&header);
            let budget = self.limit_chars - text.len();
            if context.content.len() > budget {
                text.push_str(&truncate_on_char_boundary(&context.content, budget));
                truncated.push(context.name.clone());
            } else {
                text.push_str(&context.content);
            }
            sources.push(context.name.clone());
            if !text.ends_with('\n') {
                text.push('\n');
            }
        }

        MergedContext {
            text,
            sources,
            truncated,
            topic: set.topic.clone(),
        }
    }
}

/// Truncate to at most `limit` bytes without splitting a UTF-8 character.
fn truncate_on_char_boundary(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
