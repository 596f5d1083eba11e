//! Workflow definition parsing and validation.
//!
//! Definitions are authored as YAML (or JSON, which YAML accepts) and
//! validated before they are stored. Validation is structural only: a
//! workflow may be registered with no steps, but it cannot be launched
//! until it has some.

use std::collections::HashSet;
use std::path::Path;

use promptchain_types::workflow::WorkflowDefinition;
use thiserror::Error;

/// Longest accepted workflow name, in characters.
pub const MAX_NAME_CHARS: usize = 255;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Load and validate a workflow definition file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is 1 to 255 characters and not blank
/// - All step IDs are non-empty and unique
/// - Every step names a model and has a prompt
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    let name_chars = def.name.chars().count();
    if name_chars > MAX_NAME_CHARS {
        return Err(WorkflowError::ValidationError(format!(
            "workflow name is {name_chars} characters; the limit is {MAX_NAME_CHARS}"
        )));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "step ID must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
        if step.model.trim().is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' has no model",
                step.id
            )));
        }
        if step.prompt.trim().is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' has an empty prompt",
                step.id
            )));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use promptchain_types::workflow::{ContextStrategy, CriterionCheck};

    const SAMPLE: &str = r#"
name: research-brief
description: Gather, structure, review
steps:
  - id: gather
    order_index: 1
    model: kimi-k2p5
    prompt: List five facts about Rust.
    criterion:
      type: contains_string
      value: "1."
      max_retries: 2
  - id: structure
    order_index: 2
    model: auto
    prompt: Turn the facts into a JSON array.
    context_strategy: truncate_chars
    criterion:
      type: valid_json
  - id: review
    order_index: 3
    model: kimi-k2p5
    prompt: Write a code sample using the facts.
    requires_approval: true
    criterion:
      type: has_code_block
      language: rust
"#;

    #[test]
    fn parse_sample_workflow() {
        let def = parse_workflow_yaml(SAMPLE).unwrap();
        assert_eq!(def.name, "research-brief");
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.steps[0].criterion.max_retries, 2);
        assert_eq!(def.steps[1].criterion.check, CriterionCheck::ValidJson);
        assert_eq!(def.steps[1].criterion.max_retries, 3);
        assert_eq!(def.steps[1].context_strategy, ContextStrategy::TruncateChars);
        assert!(def.steps[2].requires_approval);
    }

    #[test]
    fn empty_step_list_is_allowed() {
        let def = parse_workflow_yaml("name: shell\nsteps: []\n").unwrap();
        assert!(def.steps.is_empty());
    }

    #[test]
    fn name_may_contain_spaces_and_punctuation() {
        let def = parse_workflow_yaml("name: Customer review (v2)\nsteps: []\n").unwrap();
        assert_eq!(def.name, "Customer review (v2)");
    }

    #[test]
    fn rejects_blank_name() {
        let err = parse_workflow_yaml("name: '  '\nsteps: []\n").unwrap_err();
        assert!(matches!(err, WorkflowError::ValidationError(_)));
    }

    #[test]
    fn name_length_limit_counts_characters() {
        let at_limit = format!("name: {}\nsteps: []\n", "é".repeat(MAX_NAME_CHARS));
        assert!(parse_workflow_yaml(&at_limit).is_ok());

        let over = format!("name: {}\nsteps: []\n", "a".repeat(MAX_NAME_CHARS + 1));
        let err = parse_workflow_yaml(&over).unwrap_err();
        assert!(err.to_string().contains("256 characters"), "{err}");
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let yaml = r#"
name: dupes
steps:
  - {id: a, order_index: 1, model: m, prompt: p, criterion: {type: valid_json}}
  - {id: a, order_index: 2, model: m, prompt: p, criterion: {type: valid_json}}
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate step ID"));
    }

    #[test]
    fn rejects_unknown_criterion_type() {
        let yaml = r#"
name: odd
steps:
  - {id: a, order_index: 1, model: m, prompt: p, criterion: {type: sentiment}}
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }

    #[test]
    fn rejects_empty_prompt() {
        let yaml = r#"
name: blank
steps:
  - {id: a, order_index: 1, model: m, prompt: "  ", criterion: {type: valid_json}}
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("empty prompt"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brief.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let def = load_workflow_file(&path).unwrap();
        assert_eq!(def.steps.len(), 3);

        let missing = load_workflow_file(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(missing, WorkflowError::IoError(_)));
    }
}
