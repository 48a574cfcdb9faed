//! KS-041: Answer maps for pass 2.
//!
//! An answers payload is a JSON object mapping each collection key to its
//! resolved text. Non-string values are kept as their compact JSON form.

use crate::error::AiError;
use indexmap::IndexMap;
use serde_json::Value;
use std::path::Path;

/// Resolved text per collection key.
pub type Answers = IndexMap<String, String>;

/// Parse an answers payload. Parse failures are surfaced verbatim.
pub fn parse_answers(text: &str) -> Result<Answers, AiError> {
    let value: Value = serde_json::from_str(strip_code_fences(text))
        .map_err(|e| AiError::MalformedAnswers(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(AiError::MalformedAnswers(format!(
            "expected a JSON object, got {}",
            type_name(&value)
        )));
    };
    Ok(map
        .into_iter()
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, text)
        })
        .collect())
}

/// Read and parse an answers file.
pub fn load_answers(path: &Path) -> Result<Answers, AiError> {
    let text = std::fs::read_to_string(path).map_err(|e| AiError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    parse_answers(&text)
}

/// Every expected key must be answered. Extra keys are tolerated.
pub fn check_answers(answers: &Answers, expected: &[String]) -> Result<(), AiError> {
    let missing: Vec<String> = expected
        .iter()
        .filter(|k| !answers.contains_key(k.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(AiError::MissingKeys(missing));
    }
    for extra in answers.keys().filter(|k| !expected.contains(k)) {
        tracing::warn!(key = %extra, "ignoring answer for unknown AI key");
    }
    Ok(())
}

/// Strip a surrounding Markdown code fence (```json ... ```), if present.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
