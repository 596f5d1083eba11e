//! Completion criteria evaluation.
//!
//! `evaluate` decides whether a model response satisfies a step's criterion.
//! It is pure: configuration mistakes (an uncompilable regex, an empty
//! substring) and unparseable responses come back as failed verdicts with a
//! classification, never as errors or panics. Identical inputs always yield
//! identical verdicts.

use promptchain_types::workflow::{CompletionCriterion, CriterionCheck, FailureType};
use regex::RegexBuilder;

/// Outcome of checking one response against one criterion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriterionVerdict {
    pub passed: bool,
    pub failure_type: Option<FailureType>,
    pub failure_reason: Option<String>,
}

impl CriterionVerdict {
    fn pass() -> Self {
        Self {
            passed: true,
            failure_type: None,
            failure_reason: None,
        }
    }

    fn fail(failure_type: FailureType, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            failure_type: Some(failure_type),
            failure_reason: Some(reason.into()),
        }
    }
}

/// Check `response` against `criterion`.
pub fn evaluate(criterion: &CompletionCriterion, response: &str) -> CriterionVerdict {
    match &criterion.check {
        CriterionCheck::ContainsString { value } => contains_string(value, response),
        CriterionCheck::Regex { pattern } => regex_match(pattern, response),
        CriterionCheck::HasCodeBlock { language } => has_code_block(language.as_deref(), response),
        CriterionCheck::ValidJson => valid_json(response),
    }
}

fn contains_string(value: &str, response: &str) -> CriterionVerdict {
    if value.is_empty() {
        return CriterionVerdict::fail(
            FailureType::InvalidConfig,
            "contains_string criterion has an empty value",
        );
    }
    if response.contains(value) {
        CriterionVerdict::pass()
    } else {
        CriterionVerdict::fail(
            FailureType::CriteriaFailed,
            format!("missing required substring: {value:?}"),
        )
    }
}

fn regex_match(pattern: &str, response: &str) -> CriterionVerdict {
    // `.` spans lines: model output is multi-line and patterns are written
    // against the whole response.
    let re = match RegexBuilder::new(pattern).dot_matches_new_line(true).build() {
        Ok(re) => re,
        Err(e) => {
            return CriterionVerdict::fail(
                FailureType::InvalidConfig,
                format!("invalid regex pattern {pattern:?}: {e}"),
            );
        }
    };
    if re.is_match(response) {
        CriterionVerdict::pass()
    } else {
        CriterionVerdict::fail(
            FailureType::CriteriaFailed,
            format!("response does not match pattern {pattern:?}"),
        )
    }
}

fn has_code_block(language: Option<&str>, response: &str) -> CriterionVerdict {
    let language = language.map(str::trim).filter(|l| !l.is_empty());
    let mut open: Option<&str> = None;
    let mut seen_languages: Vec<&str> = Vec::new();

    for line in response.lines() {
        let Some(rest) = line.trim_start().strip_prefix("```") else {
            continue;
        };
        match open {
            None => {
                // Opening fence: the first word of the info string is the language.
                open = Some(rest.split_whitespace().next().unwrap_or(""));
            }
            Some(tag) => {
                if !rest.trim().is_empty() {
                    // A fence with an info string cannot close a block.
                    continue;
                }
                match language {
                    None => return CriterionVerdict::pass(),
                    Some(wanted) if tag == wanted => return CriterionVerdict::pass(),
                    Some(_) => seen_languages.push(tag),
                }
                open = None;
            }
        }
    }

    let reason = match language {
        None => "response contains no fenced code block".to_string(),
        Some(wanted) if seen_languages.is_empty() => {
            format!("response contains no fenced code block tagged {wanted:?}")
        }
        Some(wanted) => format!(
            "response contains no fenced code block tagged {wanted:?} (found: {})",
            seen_languages
                .iter()
                .map(|l| if l.is_empty() { "untagged" } else { *l })
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    CriterionVerdict::fail(FailureType::CriteriaFailed, reason)
}

fn valid_json(response: &str) -> CriterionVerdict {
    match serde_json::from_str::<serde_json::Value>(response.trim()) {
        Ok(_) => CriterionVerdict::pass(),
        Err(e) => CriterionVerdict::fail(FailureType::ParseError, e.to_string()),
    }
}
