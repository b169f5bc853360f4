use hubex_shared::error::ApiError;
use serde_json::Value;

pub const MAX_JSON_BYTES: usize = 16 * 1024;
pub const MAX_PAYLOAD_KEY_LENGTH: usize = 64;

fn serialized_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0)
}

/// Require a JSON object no larger than 16 KiB when serialized.
pub fn validate_json_object(value: &Value, label: &str) -> Result<(), ApiError> {
    if !value.is_object() {
        return Err(ApiError::unprocessable(
            "PAYLOAD_NOT_OBJECT",
            format!("{label} must be a JSON object"),
        ));
    }
    if serialized_len(value) > MAX_JSON_BYTES {
        return Err(ApiError::payload_too_large(
            "PAYLOAD_TOO_LARGE",
            format!("{label} too large"),
        ));
    }
    Ok(())
}

fn walk_keys(value: &Value) -> Result<(), ApiError> {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if key.len() > MAX_PAYLOAD_KEY_LENGTH {
                    return Err(ApiError::unprocessable(
                        "PAYLOAD_KEY_TOO_LONG",
                        "payload key too long",
                    ));
                }
                walk_keys(nested)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                walk_keys(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Telemetry payload rules: a JSON object, every key at any depth at most
/// 64 chars, total serialized size at most 16 KiB.
pub fn validate_telemetry_payload(payload: &Value) -> Result<(), ApiError> {
    if !payload.is_object() {
        return Err(ApiError::unprocessable(
            "PAYLOAD_NOT_OBJECT",
            "payload must be a JSON object",
        ));
    }
    walk_keys(payload)?;
    if serialized_len(payload) > MAX_JSON_BYTES {
        return Err(ApiError::payload_too_large(
            "PAYLOAD_TOO_LARGE",
            "payload too large",
        ));
    }
    Ok(())
}
