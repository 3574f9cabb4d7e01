use serde_json::Value;

pub const MAX_SERIALIZED_LENGTH: usize = 4000;
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Bounds a trace payload by its serialized length in characters.
///
/// Payloads at or under the cap come back untouched. Larger ones are replaced
/// by a string holding the first [`MAX_SERIALIZED_LENGTH`] characters of their
/// JSON form followed by [`TRUNCATION_MARKER`].
pub fn cap_payload(value: Value) -> Value {
    let serialized = match serde_json::to_string(&value) {
        Ok(serialized) => serialized,
        Err(_) => {
            let fallback = format!("{value:?}");
            return Value::String(truncate(&fallback).unwrap_or(fallback));
        }
    };
    match truncate(&serialized) {
        Some(truncated) => Value::String(truncated),
        None => value,
    }
}

fn truncate(serialized: &str) -> Option<String> {
    let mut chars = serialized.char_indices();
    let (cut, _) = chars.nth(MAX_SERIALIZED_LENGTH)?;
    let mut truncated = serialized[..cut].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    Some(truncated)
}
