//! Defensive parsing of structured completions.
//!
//! Models wrap JSON in markdown fences, prepend "Here is the result:" or
//! stop half way. Strict parsing is tried on the outermost `{...}` span;
//! the lenient extractors let a caller salvage individual fields.

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;

/// Strip markdown code fences and surrounding whitespace.
pub fn strip_fences(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// The outermost `{...}` span of `raw`, or the cleaned text if none.
pub fn json_object_span(raw: &str) -> &str {
    let cleaned = strip_fences(raw);
    match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if end > start => &cleaned[start..=end],
        _ => cleaned,
    }
}

/// Deserialize the first JSON object found in a completion.
pub fn parse_json_object<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let span = json_object_span(raw);
    serde_json::from_str::<T>(span).map_err(|e| anyhow!("invalid JSON object: {}", e))
}

/// Extract a JSON string field value by scanning for `"field":"value"`.
pub fn extract_json_string(json: &str, field: &str) -> Option<String> {
    let pattern = format!("\"{}\"", field);
    let pos = json.find(&pattern)?;
    let after_key = &json[pos + pattern.len()..];
    let after_colon = after_key.trim_start().strip_prefix(':')?;
    let trimmed = after_colon.trim_start();

    if !trimmed.starts_with('"') {
        return None;
    }

    // Find the closing quote, handling escaped quotes
    let content = &trimmed[1..];
    let mut escaped = false;
    for (i, ch) in content.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' if i > 0 => return Some(content[..i].to_string()),
            '"' => return None,
            _ => {}
        }
    }
    None
}

/// Extract a JSON number field by scanning for `"field": 0.8`.
pub fn extract_json_number(json: &str, field: &str) -> Option<f64> {
    let pattern = format!("\"{}\"", field);
    let pos = json.find(&pattern)?;
    let after_colon = json[pos + pattern.len()..].trim_start().strip_prefix(':')?;
    let number: String = after_colon
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    number.parse().ok()
}

/// Extract a JSON string array field by scanning for `"field":["v1","v2"]`.
pub fn extract_json_array(json: &str, field: &str) -> Option<Vec<String>> {
    let pattern = format!("\"{}\"", field);
    let pos = json.find(&pattern)?;
    let after_key = &json[pos + pattern.len()..];
    let after_colon = after_key.trim_start().strip_prefix(':')?.trim_start();

    if !after_colon.starts_with('[') {
        return None;
    }

    let bracket_end = after_colon.find(']')?;
    let arr_str = &after_colon[1..bracket_end];

    let items: Vec<String> = arr_str
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim().trim_matches('"');
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect();

    Some(items)
}
