//! Structural validation of inbound cloud payloads.
//!
//! A [`Schema`] maps field names to type specifiers. Validation walks the
//! payload and returns the first mismatch with a dotted field path, or the
//! payload itself on success. Unknown fields are preserved and passed through
//! to handlers untouched.
//!
//! Validation is pure: no side effects, no I/O.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// The closed set of types a schema field can require.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpec {
    String,
    Number,
    Boolean,
    /// ISO-8601 timestamp carried as a string. Parsed, not just string-checked.
    Date,
    List(Box<TypeSpec>),
    Optional(Box<TypeSpec>),
    Object(Schema),
}

impl TypeSpec {
    fn name(&self) -> String {
        match self {
            TypeSpec::String => "String".to_string(),
            TypeSpec::Number => "Number".to_string(),
            TypeSpec::Boolean => "Boolean".to_string(),
            TypeSpec::Date => "Date".to_string(),
            TypeSpec::List(inner) => format!("List({})", inner.name()),
            TypeSpec::Optional(inner) => format!("Optional({})", inner.name()),
            TypeSpec::Object(_) => "Object".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema(BTreeMap<String, TypeSpec>);

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, spec: TypeSpec) -> Self {
        self.0.insert(name.to_string(), spec);
        self
    }

    /// Merges `other` into this schema. Fields in `other` win on collision.
    pub fn extend(mut self, other: Schema) -> Self {
        self.0.extend(other.0);
        self
    }

    /// Validates `payload` against this schema, returning the payload (with
    /// unknown fields preserved) or the first mismatch found.
    pub fn validate(&self, payload: &Value) -> Result<Value, ValidationError> {
        let Value::Object(fields) = payload else {
            return Err(ValidationError {
                path: String::new(),
                expected: "Object".to_string(),
                actual: json_type_name(payload).to_string(),
            });
        };

        for (name, spec) in &self.0 {
            match fields.get(name) {
                None | Some(Value::Null) => {
                    if !matches!(spec, TypeSpec::Optional(_)) {
                        return Err(ValidationError {
                            path: name.clone(),
                            expected: spec.name(),
                            actual: "missing".to_string(),
                        });
                    }
                }
                Some(value) => check(spec, value, name)?,
            }
        }
        Ok(payload.clone())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("field `{path}`: expected {expected}, got {actual}")]
pub struct ValidationError {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

fn check(spec: &TypeSpec, value: &Value, path: &str) -> Result<(), ValidationError> {
    let mismatch = || ValidationError {
        path: path.to_string(),
        expected: spec.name(),
        actual: json_type_name(value).to_string(),
    };

    match spec {
        TypeSpec::String => value.is_string().then_some(()).ok_or_else(mismatch),
        TypeSpec::Number => value.is_number().then_some(()).ok_or_else(mismatch),
        TypeSpec::Boolean => value.is_boolean().then_some(()).ok_or_else(mismatch),
        TypeSpec::Date => {
            let Some(raw) = value.as_str() else {
                return Err(mismatch());
            };
            parse_iso8601(raw).map(|_| ()).ok_or_else(|| ValidationError {
                path: path.to_string(),
                expected: "Date".to_string(),
                actual: format!("unparsable timestamp `{raw}`"),
            })
        }
        TypeSpec::List(inner) => {
            let Some(items) = value.as_array() else {
                return Err(mismatch());
            };
            for (idx, item) in items.iter().enumerate() {
                check(inner, item, &format!("{path}.{idx}"))?;
            }
            Ok(())
        }
        TypeSpec::Optional(inner) => {
            if value.is_null() {
                Ok(())
            } else {
                check(inner, value, path)
            }
        }
        TypeSpec::Object(schema) => {
            let Value::Object(fields) = value else {
                return Err(mismatch());
            };
            for (name, field_spec) in &schema.0 {
                let nested = format!("{path}.{name}");
                match fields.get(name) {
                    None | Some(Value::Null) => {
                        if !matches!(field_spec, TypeSpec::Optional(_)) {
                            return Err(ValidationError {
                                path: nested,
                                expected: field_spec.name(),
                                actual: "missing".to_string(),
                            });
                        }
                    }
                    Some(field_value) => check(field_spec, field_value, &nested)?,
                }
            }
            Ok(())
        }
    }
}

fn parse_iso8601(raw: &str) -> Option<chrono::NaiveDateTime> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.naive_utc())
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "Boolean",
        Value::Number(_) => "Number",
        Value::String(_) => "String",
        Value::Array(_) => "List",
        Value::Object(_) => "Object",
    }
}

/// Fields shared by every cloud command.
pub fn base_message() -> Schema {
    Schema::new()
        .field("correlation_id", TypeSpec::Optional(Box::new(TypeSpec::Number)))
        .field("action", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field("requested_at", TypeSpec::Optional(Box::new(TypeSpec::Date)))
}

/// [`base_message`] plus the target device identifier.
pub fn base_device() -> Schema {
    base_message().field("device_id", TypeSpec::String)
}
