//! Argument validation against a tool's parameter schema
//!
//! Checks a JSON-Schema subset: the argument object shape, required-field
//! presence, primitive type match for declared properties, and (in strict
//! mode) unknown fields. Nested schemas are not descended into.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::tool::ToolSchema;
use crate::error::{ErrorRecord, ToolFailure};

/// A single validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Field path (e.g., "args.url")
    pub field: String,

    /// Error message
    pub message: String,

    /// Error code
    pub code: Option<String>,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref code) = self.code {
            write!(f, "[{}] {}: {}", code, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Check `args` against `schema`, collecting every failure
pub fn validate_args(schema: &ToolSchema, args: &Value) -> Result<(), Vec<ValidationError>> {
    let parameters = &schema.parameters;
    let properties = parameters.get("properties").and_then(Value::as_object);
    let required = parameters
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();

    let args = match args {
        Value::Object(map) => map,
        Value::Null if required.is_empty() => return Ok(()),
        other => {
            return Err(vec![
                ValidationError::new(
                    "args",
                    format!("Expected an object, got {}", json_type_name(other)),
                )
                .with_code("type"),
            ]);
        }
    };

    let mut errors = Vec::new();

    for field in required {
        if args.get(field).is_none_or(Value::is_null) {
            errors.push(
                ValidationError::new(field, "Required field is missing").with_code("required"),
            );
        }
    }

    if let Some(properties) = properties {
        for (field, value) in args {
            match properties.get(field) {
                Some(property) => {
                    if let Some(expected) = property.get("type").and_then(Value::as_str) {
                        if !value.is_null() && !type_matches(expected, value) {
                            errors.push(
                                ValidationError::new(
                                    field.as_str(),
                                    format!(
                                        "Expected {}, got {}",
                                        expected,
                                        json_type_name(value)
                                    ),
                                )
                                .with_code("type"),
                            );
                        }
                    }
                }
                None if schema.strict => {
                    errors.push(
                        ValidationError::new(field.as_str(), "Unknown field")
                            .with_code("additional_property"),
                    );
                }
                None => {}
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Build the non-retryable error record for a failed validation
pub fn invalid_arguments(tool: &str, errors: &[ValidationError]) -> ErrorRecord {
    let details = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    ErrorRecord::tool(
        ToolFailure::InvalidArguments,
        tool,
        format!("Invalid arguments: {}", details),
    )
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
