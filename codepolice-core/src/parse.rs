//! Strict validation boundary for LLM responses.
//!
//! The model is treated as non-deterministic and occasionally malformed:
//! nothing it returns is trusted until it has passed through an explicit
//! parse-then-validate step. Candidates that fail validation become
//! [`ParsedIssue::Dropped`] with a reason, never a defaulted [`Issue`] —
//! one bad object must not invalidate the valid objects around it.

use serde::Deserialize;
use tracing::warn;

use crate::issue::{FixProposal, Issue, IssueId, IssueType, Severity};

/// Error for a response that is malformed as a whole (not per-candidate).
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("response is not a JSON array")]
    NotAnArray,

    #[error("fix response missing required field: {0}")]
    MissingField(&'static str),

    #[error("fix response has invalid line range {start}..={end}")]
    InvalidRange { start: u32, end: u32 },
}

/// Tagged result of validating one candidate issue object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedIssue {
    Valid(Issue),
    Dropped { reason: String },
}

/// All candidates from one response, partitioned.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub issues: Vec<Issue>,
    pub dropped: Vec<String>,
}

/// Wire shape of one candidate issue. Everything is optional here so that a
/// missing field drops one candidate instead of failing the whole array.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIssue {
    severity: Option<String>,
    #[serde(rename = "type")]
    issue_type: Option<String>,
    file: Option<String>,
    line: Option<u32>,
    column: Option<u32>,
    description: Option<String>,
    suggestion: Option<String>,
    fixable: Option<bool>,
}

/// Parse an analyzer response into validated issues.
///
/// The response must be a JSON array of objects (a surrounding markdown code
/// fence is tolerated and stripped). Each object is validated independently;
/// `next_id` seeds the sequential issue ids so that ids stay unique across
/// chunked responses.
pub fn parse_issue_response(response: &str, next_id: u64) -> Result<ParseOutcome, ResponseError> {
    let value: serde_json::Value = serde_json::from_str(strip_code_fence(response))?;
    let candidates = value.as_array().ok_or(ResponseError::NotAnArray)?;

    let mut outcome = ParseOutcome::default();
    let mut id = next_id;
    for (index, candidate) in candidates.iter().enumerate() {
        match validate_candidate(candidate, IssueId(id)) {
            ParsedIssue::Valid(issue) => {
                outcome.issues.push(issue);
                id += 1;
            }
            ParsedIssue::Dropped { reason } => {
                warn!(candidate = index, %reason, "dropping invalid issue candidate");
                outcome.dropped.push(reason);
            }
        }
    }
    Ok(outcome)
}

fn validate_candidate(candidate: &serde_json::Value, id: IssueId) -> ParsedIssue {
    let raw: RawIssue = match serde_json::from_value(candidate.clone()) {
        Ok(raw) => raw,
        Err(e) => {
            return ParsedIssue::Dropped {
                reason: format!("not an issue object: {e}"),
            }
        }
    };

    macro_rules! require {
        ($field:ident) => {
            match raw.$field {
                Some(v) => v,
                None => {
                    return ParsedIssue::Dropped {
                        reason: format!("missing required field '{}'", stringify!($field)),
                    }
                }
            }
        };
    }

    let severity_str = require!(severity);
    let Some(severity) = Severity::parse(&severity_str) else {
        return ParsedIssue::Dropped {
            reason: format!("unknown severity '{severity_str}'"),
        };
    };

    let type_str = require!(issue_type);
    let Some(issue_type) = IssueType::parse(&type_str) else {
        return ParsedIssue::Dropped {
            reason: format!("unknown issue type '{type_str}'"),
        };
    };

    let file = require!(file);
    let line = require!(line);
    let description = require!(description);
    let fixable = require!(fixable);

    if line == 0 {
        return ParsedIssue::Dropped {
            reason: "line numbers are 1-based; got 0".to_string(),
        };
    }

    ParsedIssue::Valid(Issue {
        id,
        severity,
        issue_type,
        file,
        line,
        column: raw.column,
        description,
        suggestion: raw.suggestion,
        fixable,
    })
}

/// Wire shape of a fix response for a single issue.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFix {
    fixed_code: Option<String>,
    start_line: Option<u32>,
    end_line: Option<u32>,
    explanation: Option<String>,
}

/// Parse a fix response for one issue into a [`FixProposal`].
///
/// Unlike issue parsing there is no partial acceptance: a malformed fix
/// response fails, and the caller treats that issue as fixable-but-not-fixed.
pub fn parse_fix_response(
    response: &str,
    issue: &Issue,
    original_code: &str,
) -> Result<FixProposal, ResponseError> {
    let raw: RawFix = serde_json::from_str(strip_code_fence(response))?;

    let fixed_code = raw
        .fixed_code
        .ok_or(ResponseError::MissingField("fixedCode"))?;
    let start_line = raw
        .start_line
        .ok_or(ResponseError::MissingField("startLine"))?;
    let end_line = raw.end_line.ok_or(ResponseError::MissingField("endLine"))?;

    if start_line == 0 || end_line < start_line {
        return Err(ResponseError::InvalidRange {
            start: start_line,
            end: end_line,
        });
    }

    Ok(FixProposal {
        issue_id: issue.id,
        file: issue.file.clone(),
        original_code: original_code.to_string(),
        fixed_code,
        start_line,
        end_line,
        explanation: raw.explanation.unwrap_or_default(),
    })
}

/// Strip a surrounding markdown code fence, if present.
///
/// Models frequently wrap JSON in ```json ... ``` despite instructions.
fn strip_code_fence(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop a language tag on the opening fence line.
    match body.split_once('\n') {
        Some((first, tail)) if !first.trim().is_empty() && !first.trim().starts_with('[') => tail,
        _ => body,
    }
    .trim()
}
