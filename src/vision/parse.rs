//! Strict parsing of vision-model responses
//!
//! Model output is loosely formatted in practice: markdown fences,
//! trailing commas, smart quotes, prose around the JSON. The helpers here
//! normalize those away and then require an exact schema parse: anything
//! else is a `MalformedResponse` for the stage to handle with its single
//! corrective retry.

use crate::error::EngineError;
use serde::de::DeserializeOwned;

/// Strip markdown code fences from a response
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = if clean.ends_with("```") {
        clean.strip_suffix("```").unwrap_or(clean)
    } else {
        clean
    };
    clean.trim()
}

/// Extract a JSON fragment between matching delimiters
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Fix common JSON issues in model responses
fn fix_json_issues(json: &str) -> String {
    let mut fixed = json.to_string();

    // Remove trailing commas before ] or }
    fixed = fixed.replace(",]", "]");
    fixed = fixed.replace(",}", "}");

    // Smart quotes to regular quotes
    fixed = fixed.replace('\u{201C}', "\"");
    fixed = fixed.replace('\u{201D}', "\"");
    fixed = fixed.replace('\u{2018}', "'");
    fixed = fixed.replace('\u{2019}', "'");

    // Drop control characters that slip into transcribed text
    fixed = fixed
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    fixed
}

/// Parse a stage response into its expected shape.
///
/// Extracts the JSON object from surrounding noise, applies the common
/// fixes, and requires a full schema parse. Returns `MalformedResponse`
/// on any failure; the caller decides whether a corrective retry remains.
pub fn parse_stage_json<T: DeserializeOwned>(
    stage: &'static str,
    response: &str,
) -> Result<T, EngineError> {
    let clean = strip_markdown_fences(response);
    let json_str = extract_json_fragment(clean, '{', '}')
        .ok_or_else(|| EngineError::malformed(stage, "no JSON object found in response"))?;

    match serde_json::from_str(json_str) {
        Ok(parsed) => Ok(parsed),
        Err(initial_error) => {
            let fixed = fix_json_issues(json_str);
            serde_json::from_str(&fixed)
                .map_err(|_| EngineError::malformed(stage, initial_error.to_string()))
        }
    }
}
