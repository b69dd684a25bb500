//! Field-level schema validation and the pipeline's domain validators.
//!
//! This is the single namespaced `ValidationError` type used everywhere in
//! the crate: input-contract validation, key-criterion validation,
//! funnel-result validation, and ad-hoc LLM-output schema checks all produce
//! and consume this one enum rather than each layer declaring (and
//! potentially shadowing) its own.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Specification for a field expected in an LLM JSON-mode response or an
/// input document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            description: String::new(),
            required: true,
            default: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self.required = false;
        self
    }
}

/// Expected type of a field, used both for validation and for generating
/// prompt hints ("expected an integer").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    List(Box<FieldType>),
    Object(Vec<FieldSpec>),
    Enum(Vec<String>),
}

impl FieldType {
    pub fn list(inner: FieldType) -> Self {
        Self::List(Box::new(inner))
    }

    pub fn object(fields: Vec<FieldSpec>) -> Self {
        Self::Object(fields)
    }

    pub fn enum_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Enum(values.into_iter().map(Into::into).collect())
    }

    pub fn to_prompt_hint(&self) -> String {
        match self {
            Self::String => "string".to_string(),
            Self::Integer => "integer".to_string(),
            Self::Float => "number".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::List(inner) => format!("list of {}", inner.to_prompt_hint()),
            Self::Object(_) => "object".to_string(),
            Self::Enum(values) => format!("one of [{}]", values.join(", ")),
        }
    }
}

/// The single validation-error type shared by every validator in the crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum ValidationError {
    MissingField {
        field: String,
        expected_type: FieldType,
    },
    TypeMismatch {
        field: String,
        expected: FieldType,
        got: String,
        value_preview: String,
    },
    EnumInvalid {
        field: String,
        value: String,
        allowed: Vec<String>,
    },
    ConstraintViolated {
        field: String,
        constraint: String,
    },
    NestedError {
        path: String,
        error: Box<ValidationError>,
    },
    Custom(String),
}

impl ValidationError {
    pub fn missing_field(field: impl Into<String>, expected_type: FieldType) -> Self {
        Self::MissingField {
            field: field.into(),
            expected_type,
        }
    }

    pub fn type_mismatch(field: impl Into<String>, expected: FieldType, value: &Value) -> Self {
        Self::TypeMismatch {
            field: field.into(),
            expected,
            got: value_type_name(value),
            value_preview: truncate_preview(&value.to_string(), 100),
        }
    }

    pub fn enum_invalid(
        field: impl Into<String>,
        value: impl Into<String>,
        allowed: Vec<String>,
    ) -> Self {
        Self::EnumInvalid {
            field: field.into(),
            value: value.into(),
            allowed,
        }
    }

    pub fn constraint_violated(field: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self::ConstraintViolated {
            field: field.into(),
            constraint: constraint.into(),
        }
    }

    pub fn with_path(self, parent: impl Into<String>) -> Self {
        let parent = parent.into();
        match self {
            Self::NestedError { path, error } => Self::NestedError {
                path: format!("{parent}.{path}"),
                error,
            },
            other => Self::NestedError {
                path: parent,
                error: Box::new(other),
            },
        }
    }

    pub fn to_user_message(&self) -> String {
        match self {
            Self::MissingField {
                field,
                expected_type,
            } => format!(
                "missing required field '{field}' (expected {})",
                expected_type.to_prompt_hint()
            ),
            Self::TypeMismatch {
                field,
                expected,
                got,
                value_preview,
            } => format!(
                "field '{field}' has wrong type: expected {}, got {got} (value: {value_preview})",
                expected.to_prompt_hint()
            ),
            Self::EnumInvalid {
                field,
                value,
                allowed,
            } => format!(
                "field '{field}' has invalid value '{value}'; allowed values: {}",
                allowed.join(", ")
            ),
            Self::ConstraintViolated { field, constraint } => {
                format!("field '{field}' violates constraint: {constraint}")
            }
            Self::NestedError { path, error } => {
                format!("at '{path}': {}", error.to_user_message())
            }
            Self::Custom(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_user_message())
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a JSON object against a list of field specifications.
pub fn validate_fields(value: &Value, fields: &[FieldSpec]) -> ValidationResult {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => return Err(vec![ValidationError::Custom("expected an object".into())]),
    };

    let mut errors = Vec::new();
    for field in fields {
        match obj.get(&field.name) {
            Some(field_value) => {
                if let Err(e) = validate_value(field_value, &field.field_type, &field.name) {
                    errors.extend(e);
                }
            }
            None if field.required => {
                errors.push(ValidationError::missing_field(
                    &field.name,
                    field.field_type.clone(),
                ));
            }
            None => {}
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a single value against a field type.
pub fn validate_value(value: &Value, field_type: &FieldType, field_name: &str) -> ValidationResult {
    let mut errors = Vec::new();

    match field_type {
        FieldType::String => {
            if !value.is_string() {
                errors.push(ValidationError::type_mismatch(field_name, FieldType::String, value));
            }
        }
        FieldType::Integer => {
            let is_int = value.as_number().map(|n| n.is_i64() || n.is_u64()).unwrap_or(false);
            if !is_int {
                errors.push(ValidationError::type_mismatch(field_name, FieldType::Integer, value));
            }
        }
        FieldType::Float => {
            if !value.is_number() {
                errors.push(ValidationError::type_mismatch(field_name, FieldType::Float, value));
            }
        }
        FieldType::Boolean => {
            if !value.is_boolean() {
                errors.push(ValidationError::type_mismatch(field_name, FieldType::Boolean, value));
            }
        }
        FieldType::List(inner) => {
            if let Some(arr) = value.as_array() {
                for (i, item) in arr.iter().enumerate() {
                    let item_path = format!("{field_name}[{i}]");
                    if let Err(e) = validate_value(item, inner, &item_path) {
                        errors.extend(e);
                    }
                }
            } else {
                errors.push(ValidationError::type_mismatch(field_name, field_type.clone(), value));
            }
        }
        FieldType::Object(fields) => {
            if value.is_object() {
                if let Err(e) = validate_fields(value, fields) {
                    errors.extend(e.into_iter().map(|err| err.with_path(field_name)));
                }
            } else {
                errors.push(ValidationError::type_mismatch(field_name, field_type.clone(), value));
            }
        }
        FieldType::Enum(allowed) => {
            if let Some(s) = value.as_str() {
                if !allowed.iter().any(|a| a == s) {
                    errors.push(ValidationError::enum_invalid(field_name, s, allowed.clone()));
                }
            } else {
                errors.push(ValidationError::type_mismatch(field_name, field_type.clone(), value));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Apply default values to missing optional fields, returning a new object.
pub fn apply_defaults(value: &Value, fields: &[FieldSpec]) -> Value {
    let mut obj = match value.as_object() {
        Some(obj) => obj.clone(),
        None => return value.clone(),
    };

    for field in fields {
        if !obj.contains_key(&field.name) {
            if let Some(default) = &field.default {
                obj.insert(field.name.clone(), default.clone());
            }
        }
    }

    Value::Object(obj)
}

fn value_type_name(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "integer".to_string()
            } else {
                "number".to_string()
            }
        }
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

fn truncate_preview(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len])
    }
}

/// Operators permitted in generated SQL comparisons.
pub const VALID_OPERATORS: &[&str] = &["≥", "≤", "=", ">", "<", "≠", ">=", "<="];

pub fn validate_operator(op: &str) -> ValidationResult {
    if VALID_OPERATORS.contains(&op) {
        Ok(())
    } else {
        Err(vec![ValidationError::constraint_violated(
            "operator",
            format!("'{op}' is not one of the validated comparison operators"),
        )])
    }
}

/// Validate the raw input contract (`eligibility_criteria.json`): every
/// entry must have non-empty text; a missing `criterion_id` is
/// auto-generated and an unrecognized `criterion_type` defaults to
/// inclusion rather than being rejected.
pub fn validate_raw_criterion_text(index: usize, text: &str) -> ValidationResult {
    if text.trim().is_empty() {
        Err(vec![ValidationError::constraint_violated(
            format!("criteria[{index}].text"),
            "criterion text must not be empty".to_string(),
        )])
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_fields_success() {
        let fields = vec![
            FieldSpec::new("name", FieldType::String),
            FieldSpec::new("age", FieldType::Integer),
        ];
        let value = json!({"name": "Alice", "age": 30});
        assert!(validate_fields(&value, &fields).is_ok());
    }

    #[test]
    fn validate_fields_missing_required() {
        let fields = vec![FieldSpec::new("name", FieldType::String)];
        let value = json!({});
        let errors = validate_fields(&value, &fields).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ValidationError::MissingField { .. }));
    }

    #[test]
    fn validate_fields_optional_missing_is_ok() {
        let fields = vec![FieldSpec::new("age", FieldType::Integer).optional()];
        assert!(validate_fields(&json!({}), &fields).is_ok());
    }

    #[test]
    fn validate_enum_rejects_unknown_value() {
        let fields = vec![FieldSpec::new(
            "status",
            FieldType::enum_of(["active", "inactive"]),
        )];
        let result = validate_fields(&json!({"status": "bogus"}), &fields);
        assert!(matches!(
            result.unwrap_err()[0],
            ValidationError::EnumInvalid { .. }
        ));
    }

    #[test]
    fn validate_nested_object_prefixes_path() {
        let address_fields = vec![FieldSpec::new("city", FieldType::String)];
        let fields = vec![FieldSpec::new("address", FieldType::object(address_fields))];
        let result = validate_fields(&json!({"address": {}}), &fields);
        let errors = result.unwrap_err();
        assert!(errors[0].to_user_message().contains("address"));
    }

    #[test]
    fn apply_defaults_fills_missing_optional() {
        let fields = vec![FieldSpec::new("count", FieldType::Integer).with_default(json!(10))];
        let result = apply_defaults(&json!({}), &fields);
        assert_eq!(result["count"], 10);
    }

    #[test]
    fn operator_validation() {
        assert!(validate_operator("≥").is_ok());
        assert!(validate_operator(">=").is_ok());
        assert!(validate_operator("~=").is_err());
    }

    #[test]
    fn serialization_round_trip() {
        let error = ValidationError::type_mismatch("age", FieldType::Integer, &json!("not a number"));
        let json = serde_json::to_string(&error).unwrap();
        let deserialized: ValidationError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, deserialized);
    }
}
