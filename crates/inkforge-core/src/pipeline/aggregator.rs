//! Output aggregation against a template schema.
//!
//! Agents each contribute a slice of the final artifact. The aggregator
//! collects those contributions, checks them against the template's section
//! requirements, and produces a report the completeness gate (and operators)
//! can act on.

use std::collections::HashMap;

use inkforge_types::job::ValueMap;
use serde::{Deserialize, Serialize};

use super::PipelineError;

// ---------------------------------------------------------------------------
// Template schema
// ---------------------------------------------------------------------------

/// One required section of the final artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionRequirement {
    /// Markdown heading text (matched against `## <heading>`).
    pub heading: String,
    /// Minimum content length in characters.
    #[serde(default)]
    pub min_chars: usize,
    /// Output key agents write this section under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
}

/// Sections a finished artifact must contain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateSchema {
    pub required_sections: Vec<SectionRequirement>,
}

impl TemplateSchema {
    /// Parse a schema from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, PipelineError> {
        serde_yaml_ng::from_str(yaml).map_err(|e| PipelineError::Io(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Result of an aggregation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorReport {
    pub complete: bool,
    pub agent_count: usize,
    pub missing_sections: Vec<String>,
    pub issues: Vec<String>,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Collects per-agent outputs and validates them against a template schema.
pub struct OutputAggregator {
    schema: TemplateSchema,
    outputs: HashMap<String, ValueMap>,
}

impl OutputAggregator {
    pub fn new(schema: TemplateSchema) -> Self {
        Self {
            schema,
            outputs: HashMap::new(),
        }
    }

    /// Record one agent's output map.
    pub fn add_agent_output(&mut self, agent_id: &str, output: ValueMap) {
        self.outputs.insert(agent_id.to_string(), output);
    }

    /// Merged view across all agents, last writer wins per key.
    pub fn merged(&self) -> ValueMap {
        let mut agents: Vec<&String> = self.outputs.keys().collect();
        agents.sort();
        let mut merged = ValueMap::new();
        for agent in agents {
            merged.extend(self.outputs[agent].clone());
        }
        merged
    }

    /// Check that every required section has a source contribution of
    /// sufficient length. Returns `(complete, missing_section_headings)`.
    pub fn validate_completeness(&self) -> (bool, Vec<String>) {
        let merged = self.merged();
        let mut missing = Vec::new();
        for section in &self.schema.required_sections {
            let key = section.source_key.as_deref().unwrap_or(&section.heading);
            let present = merged
                .get(key)
                .and_then(|v| v.as_str())
                .is_some_and(|text| text.len() >= section.min_chars);
            if !present {
                missing.push(section.heading.clone());
            }
        }
        (missing.is_empty(), missing)
    }

    /// Check the rendered artifact text for the required `##` headings.
    pub fn validate_content(&self, final_content: &str) -> Vec<String> {
        let mut issues = Vec::new();
        for section in &self.schema.required_sections {
            let heading = format!("## {}", section.heading);
            if !final_content.contains(&heading) {
                issues.push(format!("missing section heading '{heading}'"));
            }
        }
        issues
    }

    /// Produce the full report for a rendered artifact.
    pub fn generate_report(&self, final_content: &str) -> AggregatorReport {
        let (complete_sources, missing_sections) = self.validate_completeness();
        let issues = self.validate_content(final_content);
        AggregatorReport {
            complete: complete_sources && issues.is_empty(),
            agent_count: self.outputs.len(),
            missing_sections,
            issues,
        }
    }

    /// Error out when the artifact is incomplete.
    pub fn fail_if_incomplete(&self, final_content: &str) -> Result<AggregatorReport, PipelineError> {
        let report = self.generate_report(final_content);
        if report.complete {
            Ok(report)
        } else {
            Err(PipelineError::Incomplete(format!(
                "missing sections: [{}]; issues: [{}]",
                report.missing_sections.join(", "),
                report.issues.join("; ")
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
