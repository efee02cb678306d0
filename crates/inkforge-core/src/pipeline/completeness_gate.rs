//! Final artifact validation.
//!
//! The completeness gate is the last check before a generated document is
//! written out: frontmatter must be present and carry the required keys, the
//! required `##` sections must exist, and the body must not be empty.

use serde_json::{Value, json};

use super::PipelineError;

/// Validates finished markdown artifacts.
#[derive(Debug, Clone)]
pub struct CompletenessGate {
    /// Frontmatter keys that must be present (e.g. `title`).
    pub required_frontmatter_keys: Vec<String>,
    /// `##` section headings that must be present.
    pub required_sections: Vec<String>,
    /// Minimum body length in characters, frontmatter excluded.
    pub min_body_chars: usize,
}

impl Default for CompletenessGate {
    fn default() -> Self {
        Self {
            required_frontmatter_keys: vec!["title".to_string()],
            required_sections: vec![],
            min_body_chars: 1,
        }
    }
}

impl CompletenessGate {
    /// Extract YAML frontmatter delimited by `---` lines, if any.
    pub fn extract_frontmatter(content: &str) -> Option<Value> {
        let rest = content.strip_prefix("---")?;
        let end = rest.find("\n---")?;
        let yaml = &rest[..end];
        serde_yaml_ng::from_str(yaml).ok()
    }

    /// The document body with frontmatter stripped.
    fn body_of(content: &str) -> &str {
        if let Some(rest) = content.strip_prefix("---") {
            if let Some(end) = rest.find("\n---") {
                let after = &rest[end + 4..];
                return after.trim_start_matches('\n');
            }
        }
        content
    }

    fn validate_frontmatter(&self, content: &str) -> Vec<String> {
        let mut problems = Vec::new();
        if self.required_frontmatter_keys.is_empty() {
            return problems;
        }
        match Self::extract_frontmatter(content) {
            None => problems.push("missing frontmatter".to_string()),
            Some(frontmatter) => {
                for key in &self.required_frontmatter_keys {
                    if frontmatter.get(key).is_none() {
                        problems.push(format!("frontmatter missing key '{key}'"));
                    }
                }
            }
        }
        problems
    }

    fn validate_sections(&self, content: &str) -> Vec<String> {
        self.required_sections
            .iter()
            .filter(|heading| !content.contains(&format!("## {heading}")))
            .map(|heading| format!("missing section '{heading}'"))
            .collect()
    }

    /// Validate an artifact. Returns `(valid, problems)`.
    pub fn validate(&self, content: &str) -> (bool, Vec<String>) {
        let mut problems = Vec::new();

        let body = Self::body_of(content);
        if body.trim().len() < self.min_body_chars {
            problems.push("document body is empty".to_string());
        }
        problems.extend(self.validate_frontmatter(content));
        problems.extend(self.validate_sections(content));

        (problems.is_empty(), problems)
    }

    /// Validation result as a JSON diagnostics object, suitable for storing
    /// alongside the artifact.
    pub fn attach_diagnostics(&self, content: &str) -> Value {
        let (valid, problems) = self.validate(content);
        json!({
            "valid": valid,
            "problems": problems,
            "body_chars": Self::body_of(content).trim().len(),
            "has_frontmatter": Self::extract_frontmatter(content).is_some(),
        })
    }

    /// Error out on an invalid or empty artifact.
    pub fn fail_if_empty(&self, content: &str) -> Result<(), PipelineError> {
        let (valid, problems) = self.validate(content);
        if valid {
            Ok(())
        } else {
            Err(PipelineError::Empty(problems.join("; ")))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const COMPLETE: &str = "---\ntitle: Rust Async\nauthor: inkforge\n---\n\n\
# Rust Async\n\n## Overview\ntext\n\n## Details\nmore text\n";

    fn gate_with_sections() -> CompletenessGate {
        CompletenessGate {
            required_frontmatter_keys: vec!["title".to_string()],
            required_sections: vec!["Overview".to_string(), "Details".to_string()],
            min_body_chars: 1,
        }
    }

    #[test]
    fn complete_document_passes() {
        let gate = gate_with_sections();
        let (valid, problems) = gate.validate(COMPLETE);
        assert!(valid, "problems: {problems:?}");
        assert!(gate.fail_if_empty(COMPLETE).is_ok());
    }

    #[test]
    fn frontmatter_extraction() {
        let fm = CompletenessGate::extract_frontmatter(COMPLETE).unwrap();
        assert_eq!(fm["title"], "Rust Async");
        assert!(CompletenessGate::extract_frontmatter("# no frontmatter").is_none());
    }

    #[test]
    fn missing_frontmatter_reported() {
        let gate = CompletenessGate::default();
        let (valid, problems) = gate.validate("# Title\nbody\n");
        assert!(!valid);
        assert!(problems.iter().any(|p| p.contains("missing frontmatter")));
    }

    #[test]
    fn missing_frontmatter_key_reported() {
        let gate = CompletenessGate::default();
        let doc = "---\nauthor: someone\n---\nbody\n";
        let (valid, problems) = gate.validate(doc);
        assert!(!valid);
        assert!(problems.iter().any(|p| p.contains("'title'")));
    }

    #[test]
    fn missing_section_reported() {
        let gate = gate_with_sections();
        let doc = "---\ntitle: t\n---\n## Overview\nonly overview\n";
        let (valid, problems) = gate.validate(doc);
        assert!(!valid);
        assert!(problems.iter().any(|p| p.contains("'Details'")));
    }

    #[test]
    fn empty_body_reported() {
        let gate = CompletenessGate::default();
        let doc = "---\ntitle: t\n---\n\n";
        let (valid, problems) = gate.validate(doc);
        assert!(!valid);
        assert!(problems.iter().any(|p| p.contains("empty")));
    }

    #[test]
    fn diagnostics_shape() {
        let gate = gate_with_sections();
        let diag = gate.attach_diagnostics(COMPLETE);
        assert_eq!(diag["valid"], true);
        assert_eq!(diag["has_frontmatter"], true);
        assert!(diag["body_chars"].as_u64().unwrap() > 0);
        assert!(diag["problems"].as_array().unwrap().is_empty());
    }
}
