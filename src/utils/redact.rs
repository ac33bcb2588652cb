use serde_json::Value as JsonValue;

/// Masks free-text and secret fields before a payload reaches the debug log.
/// Task descriptions, remarks and any credential material are replaced.
pub fn redact_sensitive_data(data: &JsonValue) -> JsonValue {
    redact_value(data)
}

fn redact_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut redacted_map = serde_json::Map::new();
            for (key, val) in map {
                let redacted_val = if is_sensitive_field(key) {
                    redact_string_value(val)
                } else {
                    redact_value(val)
                };
                redacted_map.insert(key.clone(), redacted_val);
            }
            JsonValue::Object(redacted_map)
        }
        JsonValue::Array(arr) => JsonValue::Array(arr.iter().map(redact_value).collect()),
        _ => value.clone(),
    }
}

fn is_sensitive_field(field_name: &str) -> bool {
    let lower = field_name.to_lowercase();
    matches!(
        lower.as_str(),
        "description"
            | "descriptions"
            | "remarks"
            | "hr_remarks"
            | "supervisor_remarks"
            | "content"
            | "inputs"
            | "prompt"
            | "api_key"
            | "api-key"
            | "secret"
            | "authorization"
    )
}

fn redact_string_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::String(s) if !s.is_empty() => JsonValue::String("[REDACTED]".to_string()),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(redact_string_value).collect()),
        _ => value.clone(),
    }
}
