//! Payload encoding for peer variable values

use serde_json::{Map, Value};

/// Plain-text rendering: strings go out unquoted, everything else as compact JSON
pub fn format_plain(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Single value wrapped in a JSON array, e.g. `[true]`
pub fn format_json(value: &Value) -> String {
    Value::Array(vec![value.clone()]).to_string()
}

/// JSON object mapping every key to its value; later duplicates win
pub fn format_json_object(keys: &[String], values: &[Value]) -> String {
    let mut object = Map::with_capacity(keys.len());
    for (key, value) in keys.iter().zip(values) {
        object.insert(key.clone(), value.clone());
    }
    Value::Object(object).to_string()
}
