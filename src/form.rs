//! Typed form schemas for human-input tasks
//!
//! A `FormConfig` is the concrete schema a UserInput/AdminInput task embeds
//! in its waiting state: a set of named fields with typed constraints.
//! `FormConfig::validate` checks a submitted payload against the schema and
//! returns the full list of violations (not just the first).

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Boolean,
    Date,
    Email,
    File,
    Select,
}

/// A single form field with its constraints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Allowed values for `Select` fields
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Inclusive bounds for `Number` fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Regex constraint for `Text` fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
            label: None,
            options: Vec::new(),
            min: None,
            max: None,
            pattern: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

/// Form schema: field name → spec. Serializes as a plain object so the
/// waiting task's `output_data.form_config.<field>` is directly addressable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormConfig {
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldSpec>,
}

impl FormConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Shorthand for a required text field
    pub fn text(self, name: impl Into<String>) -> Self {
        self.field(name, FieldSpec::new(FieldType::Text))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validate a submitted payload against this schema.
    ///
    /// Returns every violation found; an empty vector means the payload is
    /// acceptable. Unknown payload keys are rejected to keep the context
    /// free of unreviewed data.
    pub fn validate(&self, payload: &Map<String, Value>) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, spec) in &self.fields {
            match payload.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        errors.push(format!("missing required field: {name}"));
                    }
                }
                Some(value) => self.check_field(name, spec, value, &mut errors),
            }
        }

        for key in payload.keys() {
            if !self.fields.contains_key(key) {
                errors.push(format!("unknown field: {key}"));
            }
        }

        errors
    }

    fn check_field(&self, name: &str, spec: &FieldSpec, value: &Value, errors: &mut Vec<String>) {
        match spec.field_type {
            FieldType::Text | FieldType::File | FieldType::Date => {
                let Some(text) = value.as_str() else {
                    errors.push(format!("field '{name}' must be a string"));
                    return;
                };
                if let Some(pattern) = &spec.pattern {
                    match Regex::new(pattern) {
                        Ok(re) if !re.is_match(text) => {
                            errors.push(format!("field '{name}' does not match pattern {pattern}"));
                        }
                        Err(_) => errors.push(format!("field '{name}' has an invalid pattern")),
                        _ => {}
                    }
                }
            }
            FieldType::Email => {
                let valid = value
                    .as_str()
                    .is_some_and(|s| s.contains('@') && s.split('@').nth(1).is_some_and(|d| d.contains('.')));
                if !valid {
                    errors.push(format!("field '{name}' must be a valid email address"));
                }
            }
            FieldType::Number => {
                let Some(n) = value.as_f64() else {
                    errors.push(format!("field '{name}' must be a number"));
                    return;
                };
                if let Some(min) = spec.min {
                    if n < min {
                        errors.push(format!("field '{name}' below minimum {min}"));
                    }
                }
                if let Some(max) = spec.max {
                    if n > max {
                        errors.push(format!("field '{name}' above maximum {max}"));
                    }
                }
            }
            FieldType::Boolean => {
                if !value.is_boolean() {
                    errors.push(format!("field '{name}' must be a boolean"));
                }
            }
            FieldType::Select => {
                let valid = value
                    .as_str()
                    .is_some_and(|s| spec.options.iter().any(|o| o == s));
                if !valid {
                    errors.push(format!(
                        "field '{name}' must be one of: {}",
                        spec.options.join(", ")
                    ));
                }
            }
        }
    }
}
