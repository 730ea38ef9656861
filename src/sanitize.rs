//! Encode a route's `data` payload for an inline JSON `<script>`.
//!
//! The payload comes from user render code and lands inside HTML, so the
//! serialized JSON must not be able to close the script element or open a
//! comment, and absurdly deep payloads are rejected.

use anyhow::{anyhow, Result};
use serde_json::Value;

/// Maximum nesting depth for embedded data
const MAX_DEPTH: usize = 64;

/// Element id of the embedded payload script.
pub const DATA_SCRIPT_ID: &str = "prerender-data";

fn check_depth(value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(anyhow!(
            "Prerender data nesting too deep (max {} levels)",
            MAX_DEPTH
        ));
    }
    match value {
        Value::Object(map) => map.values().try_for_each(|v| check_depth(v, depth + 1)),
        Value::Array(arr) => arr.iter().try_for_each(|v| check_depth(v, depth + 1)),
        _ => Ok(()),
    }
}

/// Serialize `value` as JSON that is safe between `<script>` tags.
///
/// # Errors
/// Returns an error if nesting depth exceeds MAX_DEPTH (64).
pub fn inline_json(value: &Value) -> Result<String> {
    check_depth(value, 0)?;
    let json = serde_json::to_string(value)?;
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        match ch {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            _ => out.push(ch),
        }
    }
    Ok(out)
}

/// The complete `<script type="application/json">` element for `value`.
pub fn data_script(value: &Value) -> Result<String> {
    Ok(format!(
        r#"<script type="application/json" id="{DATA_SCRIPT_ID}">{}</script>"#,
        inline_json(value)?
    ))
}
