//! Plan extraction from free-form model output.
//!
//! Models wrap JSON in prose or code fences. The parser locates the first
//! brace-balanced object (ignoring braces inside string literals), validates
//! it against the plan schema and deserializes it. Every failure is a distinct
//! [`PlanParseError`] variant so callers never mistake a bad plan for an empty
//! success.

use std::sync::OnceLock;

use serde_json::Value;
use thiserror::Error;

use super::wire::PlanSpec;

const PLAN_SCHEMA: &str = include_str!("../../schema/plan.schema.json");

/// Errors that can occur when parsing a plan response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanParseError {
    #[error("No JSON object found in model response")]
    NoJsonObject,

    #[error("JSON object starting at byte {start} is never closed")]
    UnbalancedJson { start: usize },

    #[error("Malformed plan JSON: {0}")]
    Malformed(String),

    #[error("Plan does not match wire format: {}", .0.join("; "))]
    SchemaViolation(Vec<String>),

    #[error("Plan contains no steps")]
    EmptyPlan,
}

/// Locate the first brace-balanced JSON object in `text`.
///
/// Braces inside string literals (including escaped quotes) do not count
/// toward the balance. If the object opened by the first `{` never closes,
/// later candidates are tried in order.
pub fn extract_json_object(text: &str) -> Option<&str> {
    locate_object(text).ok()
}

fn locate_object(text: &str) -> Result<&str, PlanParseError> {
    let bytes = text.as_bytes();
    let mut first_start = None;
    let mut from = 0;

    while let Some(offset) = text[from..].find('{') {
        let start = from + offset;
        first_start.get_or_insert(start);

        if let Some(len) = balanced_len(&bytes[start..]) {
            return Ok(&text[start..start + len]);
        }
        from = start + 1;
    }

    match first_start {
        Some(start) => Err(PlanParseError::UnbalancedJson { start }),
        None => Err(PlanParseError::NoJsonObject),
    }
}

/// Length of the balanced object at the start of `bytes`, which must begin
/// with `{`. Scans bytes: every delimiter is ASCII, so slicing at the returned
/// length always lands on a char boundary.
fn balanced_len(bytes: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }

    None
}

fn plan_validator() -> Result<&'static jsonschema::Validator, String> {
    static VALIDATOR: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

    VALIDATOR
        .get_or_init(|| {
            let schema: Value =
                serde_json::from_str(PLAN_SCHEMA).map_err(|e| format!("plan schema is not JSON: {}", e))?;
            jsonschema::options()
                .build(&schema)
                .map_err(|e| format!("plan schema does not compile: {}", e))
        })
        .as_ref()
        .map_err(Clone::clone)
}

/// Check a decoded object against the plan wire format.
///
/// Each violation is reported with the instance path it occurred at, e.g.
/// `"one" is not of type "integer" at /steps/0/stepNumber`.
pub fn validate_plan_schema(value: &Value) -> Result<(), Vec<String>> {
    let validator = plan_validator().map_err(|e| vec![e])?;
    let violations: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Parse a model response into a [`PlanSpec`].
pub fn parse_plan(text: &str) -> Result<PlanSpec, PlanParseError> {
    let object = locate_object(text)?;

    let value: Value =
        serde_json::from_str(object).map_err(|e| PlanParseError::Malformed(e.to_string()))?;

    validate_plan_schema(&value).map_err(PlanParseError::SchemaViolation)?;

    let spec: PlanSpec =
        serde_json::from_value(value).map_err(|e| PlanParseError::Malformed(e.to_string()))?;

    if spec.steps.is_empty() {
        return Err(PlanParseError::EmptyPlan);
    }

    tracing::debug!(steps = spec.steps.len(), "parsed plan response");
    Ok(spec)
}
