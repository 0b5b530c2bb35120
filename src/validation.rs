//! Per-table record validation used by bulk inserts.

use crate::types::Fields;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single field-level validation failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Checks a record before it is written.
pub trait RecordValidator: Send + Sync {
    /// Returns every problem found; empty means valid.
    fn validate(&self, fields: &Fields) -> Vec<FieldError>;
}

/// Requires a set of fields to be present and non-empty.
#[derive(Clone, Debug, Default)]
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl RecordValidator for RequiredFields {
    fn validate(&self, fields: &Fields) -> Vec<FieldError> {
        self.fields
            .iter()
            .filter_map(|name| match fields.get(name) {
                None | Some(Value::Null) => Some(FieldError::new(name, "is required")),
                Some(Value::String(s)) if s.trim().is_empty() => {
                    Some(FieldError::new(name, "must not be blank"))
                }
                _ => None,
            })
            .collect()
    }
}

/// Requires a numeric field to fall in an inclusive range when present.
#[derive(Clone, Debug)]
pub struct NumberRange {
    pub field: String,
    pub min: f64,
    pub max: f64,
}

impl RecordValidator for NumberRange {
    fn validate(&self, fields: &Fields) -> Vec<FieldError> {
        match fields.get(&self.field) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Number(n)) => match n.as_f64() {
                Some(v) if v >= self.min && v <= self.max => Vec::new(),
                _ => vec![FieldError::new(
                    &self.field,
                    format!("must be between {} and {}", self.min, self.max),
                )],
            },
            Some(_) => vec![FieldError::new(&self.field, "must be a number")],
        }
    }
}

/// Runs several validators and concatenates their findings.
#[derive(Default)]
pub struct AllOf(pub Vec<Box<dyn RecordValidator>>);

impl RecordValidator for AllOf {
    fn validate(&self, fields: &Fields) -> Vec<FieldError> {
        self.0.iter().flat_map(|v| v.validate(fields)).collect()
    }
}
