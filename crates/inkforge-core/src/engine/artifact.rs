//! Final artifact extraction.
//!
//! On completion the engine looks for rendered content in the merged job
//! outputs and writes it as a user-visible artifact under the job's
//! `outputs/` tree. The file name derives from the job's topic input,
//! sanitized for the filesystem.

use inkforge_types::job::ValueMap;
use serde_json::Value;

/// Longest file stem derived from a topic.
const MAX_STEM_CHARS: usize = 50;

/// Stem used when no usable topic exists.
const DEFAULT_STEM: &str = "generated_content";

/// Rendered content from the merged outputs: the `content` key, falling back
/// to `markdown`.
pub(crate) fn extract_content(outputs: &ValueMap) -> Option<&str> {
    outputs
        .get("content")
        .and_then(Value::as_str)
        .or_else(|| outputs.get("markdown").and_then(Value::as_str))
}

/// File stem for the final artifact, from the `topic` input.
///
/// Accepts either a plain string topic or an object with a `title` field.
/// Everything but alphanumerics, `_` and `-` becomes `_`; the stem is capped
/// at [`MAX_STEM_CHARS`].
pub(crate) fn artifact_file_name(inputs: &ValueMap) -> String {
    let topic = match inputs.get("topic") {
        Some(Value::String(s)) => Some(s.as_str()),
        Some(Value::Object(o)) => o.get("title").and_then(Value::as_str),
        _ => None,
    };

    let stem: String = topic
        .unwrap_or("")
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_CHARS)
        .collect();

    if stem.chars().all(|c| c == '_') {
        DEFAULT_STEM.to_string()
    } else {
        stem
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
