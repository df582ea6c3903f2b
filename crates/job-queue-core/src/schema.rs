//! Declarative payload schemas.
//!
//! Executors declare the fields their payload accepts; the schema then
//! resolves a raw payload by rejecting unknown fields, enforcing required
//! fields, applying defaults and checking value kinds and allowed values.

use crate::payload::kind_name;
use crate::{Payload, ValidationError};
use serde_json::Value;
use std::collections::BTreeMap;

/// JSON value kinds a field can be restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    /// Any number, integer or not
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ValueKind::Null => value.is_null(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Int => value.is_i64() || value.is_u64(),
            ValueKind::Float => value.is_f64(),
            ValueKind::Number => value.is_number(),
            ValueKind::String => value.is_string(),
            ValueKind::Array => value.is_array(),
            ValueKind::Object => value.is_object(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FieldSpec {
    required: bool,
    default: Option<Value>,
    kinds: Vec<ValueKind>,
    allowed: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct PayloadSchema {
    fields: BTreeMap<String, FieldSpec>,
    allow_extra: bool,
}

impl PayloadSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an optional field
    pub fn define(&mut self, field: &str) -> &mut Self {
        self.fields.entry(field.to_string()).or_default();
        self
    }

    /// Declare a field that must be present
    pub fn required(&mut self, field: &str) -> &mut Self {
        self.fields.entry(field.to_string()).or_default().required = true;
        self
    }

    /// Declare a field with a value used when it is absent
    pub fn default_value(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.fields.entry(field.to_string()).or_default().default = Some(value.into());
        self
    }

    pub fn allowed_kinds(&mut self, field: &str, kinds: &[ValueKind]) -> &mut Self {
        self.fields.entry(field.to_string()).or_default().kinds = kinds.to_vec();
        self
    }

    pub fn allowed_values<I, V>(&mut self, field: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.fields.entry(field.to_string()).or_default().allowed =
            values.into_iter().map(Into::into).collect();
        self
    }

    /// Accept fields that were never declared, passing them through untouched
    pub fn allow_extra_fields(&mut self) -> &mut Self {
        self.allow_extra = true;
        self
    }

    pub fn is_defined(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Validate a payload and fill in defaults.
    pub fn resolve(&self, mut payload: Payload) -> Result<Payload, ValidationError> {
        if !self.allow_extra {
            if let Some(field) = payload.keys().find(|key| !self.fields.contains_key(*key)) {
                return Err(ValidationError::UndefinedField(field.clone()));
            }
        }

        for (name, spec) in &self.fields {
            if !payload.contains_key(name) {
                match &spec.default {
                    Some(default) => {
                        payload.insert(name.clone(), default.clone());
                    }
                    None if spec.required => {
                        return Err(ValidationError::MissingField(name.clone()));
                    }
                    None => continue,
                }
            }

            let Some(value) = payload.get(name) else {
                continue;
            };

            if !spec.kinds.is_empty() && !spec.kinds.iter().any(|kind| kind.matches(value)) {
                return Err(ValidationError::InvalidKind {
                    field: name.clone(),
                    expected: spec
                        .kinds
                        .iter()
                        .map(ValueKind::name)
                        .collect::<Vec<_>>()
                        .join("|"),
                    actual: kind_name(value).to_string(),
                });
            }

            if !spec.allowed.is_empty() && !spec.allowed.contains(value) {
                return Err(ValidationError::ValueNotAllowed {
                    field: name.clone(),
                    value: value.to_string(),
                });
            }
        }

        Ok(payload)
    }
}
