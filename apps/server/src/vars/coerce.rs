//! Type coercion and constraint checking for variable values.
//!
//! A value arrives as arbitrary JSON and is coerced to the definition's
//! `value_type`: strict booleans, numeric coercion from strings and
//! cross-numeric where lossless, and an opaque `json` arm preserved
//! verbatim.

use hubex_shared::error::ApiError;
use serde_json::Value;

use crate::models::VariableDefinition;

fn invalid_type(value_type: &str) -> ApiError {
    ApiError::unprocessable("VAR_INVALID_TYPE", format!("invalid {value_type} value"))
}

/// Coerce `value` to `value_type`. Null passes through unchanged so an
/// absent default stays absent.
pub fn validate_and_coerce(value: &Value, value_type: &str) -> Result<Value, ApiError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match value_type {
        "string" => match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(invalid_type("string")),
        },
        "int" => match value {
            Value::Bool(_) => Err(invalid_type("int")),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::from(i))
                } else if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                        Ok(Value::from(f as i64))
                    } else {
                        Err(invalid_type("int"))
                    }
                } else {
                    Err(invalid_type("int"))
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| invalid_type("int")),
            _ => Err(invalid_type("int")),
        },
        "float" => match value {
            Value::Bool(_) => Err(invalid_type("float")),
            Value::Number(n) => n.as_f64().map(Value::from).ok_or_else(|| invalid_type("float")),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| invalid_type("float")),
            _ => Err(invalid_type("float")),
        },
        "bool" => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(invalid_type("bool")),
            },
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "n" => Ok(Value::Bool(false)),
                _ => Err(invalid_type("bool")),
            },
            _ => Err(invalid_type("bool")),
        },
        "json" => Ok(value.clone()),
        _ => Err(ApiError::unprocessable(
            "VAR_INVALID_TYPE",
            "unsupported value type",
        )),
    }
}

/// The definition's constraints as the JSON object reported in views and
/// snapshot items, or None when unconstrained.
pub fn constraints_json(definition: &VariableDefinition) -> Option<Value> {
    let mut constraints = serde_json::Map::new();
    if let Some(min) = definition.min_value {
        constraints.insert("min".into(), Value::from(min));
    }
    if let Some(max) = definition.max_value {
        constraints.insert("max".into(), Value::from(max));
    }
    if let Some(enum_values) = definition.enum_list() {
        if !enum_values.is_empty() {
            constraints.insert("enum".into(), Value::from(enum_values));
        }
    }
    if let Some(regex) = &definition.regex {
        if !regex.is_empty() {
            constraints.insert("regex".into(), Value::String(regex.clone()));
        }
    }
    if let Some(unit) = &definition.unit {
        if !unit.is_empty() {
            constraints.insert("unit".into(), Value::String(unit.clone()));
        }
    }
    if constraints.is_empty() {
        None
    } else {
        Some(Value::Object(constraints))
    }
}

fn check_constraints(definition: &VariableDefinition, coerced: &Value) -> Result<(), ApiError> {
    if let Some(n) = coerced.as_f64() {
        if let Some(min) = definition.min_value {
            if n < min {
                return Err(ApiError::unprocessable(
                    "VAR_CONSTRAINT_VIOLATION",
                    "value below minimum",
                )
                .with_meta(serde_json::json!({ "min": min })));
            }
        }
        if let Some(max) = definition.max_value {
            if n > max {
                return Err(ApiError::unprocessable(
                    "VAR_CONSTRAINT_VIOLATION",
                    "value above maximum",
                )
                .with_meta(serde_json::json!({ "max": max })));
            }
        }
    }

    if let Some(s) = coerced.as_str() {
        if let Some(enum_values) = definition.enum_list() {
            if !enum_values.is_empty() && !enum_values.iter().any(|v| v == s) {
                return Err(ApiError::unprocessable(
                    "VAR_CONSTRAINT_VIOLATION",
                    "value not in enum",
                )
                .with_meta(serde_json::json!({ "enum": enum_values })));
            }
        }
        if let Some(pattern) = definition.regex.as_deref().filter(|p| !p.is_empty()) {
            // Full match, not search: the whole string must satisfy the
            // pattern.
            let anchored = format!("^(?:{pattern})$");
            let re = regex::Regex::new(&anchored).map_err(|_| {
                ApiError::unprocessable("VAR_CONSTRAINT_VIOLATION", "invalid regex constraint")
            })?;
            if !re.is_match(s) {
                return Err(ApiError::unprocessable(
                    "VAR_CONSTRAINT_VIOLATION",
                    "value does not match regex",
                )
                .with_meta(serde_json::json!({ "regex": pattern })));
            }
        }
    }

    Ok(())
}

/// Coerce per the definition's type, then apply min/max, enum, and regex
/// constraints.
pub fn validate_against_definition(
    definition: &VariableDefinition,
    value: &Value,
) -> Result<Value, ApiError> {
    let coerced = validate_and_coerce(value, &definition.value_type)?;
    check_constraints(definition, &coerced)?;
    Ok(coerced)
}

/// The stored value if present, else the definition default.
pub fn effective_value(
    definition: &VariableDefinition,
    stored: Option<&Value>,
) -> Option<Value> {
    match stored {
        Some(v) if !v.is_null() => Some(v.clone()),
        _ => definition.default_value.clone(),
    }
}

/// Secrets always mask to the literal `"***"` on observable paths.
pub fn mask_if_secret(definition: &VariableDefinition, value: Option<Value>) -> Option<Value> {
    if definition.is_secret && value.is_some() {
        Some(Value::String("***".into()))
    } else {
        value
    }
}
