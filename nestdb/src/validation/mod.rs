use crate::document::{get_field, set_field, type_name, values_equal, Document};
use crate::error::Result;
use crate::schema::{FieldRule, FieldType, Schema};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// One rule a document broke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

/// Every violation found in a document, in schema field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors {
    pub violations: Vec<Violation>,
}

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    /// Fields with at least one violation.
    pub fn fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = Vec::new();
        for v in &self.violations {
            if !fields.contains(&v.field.as_str()) {
                fields.push(&v.field);
            }
        }
        fields
    }

    fn add(&mut self, field: &str, message: String) {
        self.violations.push(Violation {
            field: field.to_string(),
            message,
        });
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Document validation failed:")?;
        for v in &self.violations {
            write!(f, "\n  - {}", v.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Fill in defaults for fields that are missing or null. Never overwrites.
pub fn apply_defaults(schema: &Schema, doc: &mut Document) -> Result<()> {
    for (name, rule) in schema.fields() {
        let Some(default) = &rule.default else {
            continue;
        };
        let has_value = get_field(doc, name).map(|v| !v.is_null()).unwrap_or(false);
        if !has_value {
            set_field(doc, name, default.produce())?;
        }
    }
    Ok(())
}

/// Apply trim/lowercase/uppercase to string fields that declare them.
pub fn apply_transforms(schema: &Schema, doc: &mut Document) -> Result<()> {
    for (name, rule) in schema.fields() {
        if !(rule.trim || rule.lowercase || rule.uppercase) {
            continue;
        }
        let Some(Value::String(s)) = get_field(doc, name) else {
            continue;
        };
        let mut text = if rule.trim { s.trim().to_string() } else { s.clone() };
        if rule.lowercase {
            text = text.to_lowercase();
        } else if rule.uppercase {
            text = text.to_uppercase();
        }
        if text != *s {
            set_field(doc, name, Value::String(text))?;
        }
    }
    Ok(())
}

/// Check every field rule and collect all violations.
pub fn validate_document(schema: &Schema, doc: &Document) -> ValidationErrors {
    let mut errors = ValidationErrors::default();
    for (name, rule) in schema.fields() {
        let value = get_field(doc, name).filter(|v| !is_missing(v));
        match value {
            None => {
                if rule.required.applies_to(doc) {
                    errors.add(name, format!("Required field '{name}' is missing"));
                }
            }
            Some(value) => check_value(name, rule, value, &mut errors),
        }
    }
    errors
}

/// Validate, turning any violations into an error.
pub fn ensure_valid(schema: &Schema, doc: &Document) -> Result<()> {
    let errors = validate_document(schema, doc);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.into())
    }
}

/// Defaults, transforms, then validation.
pub fn validate_and_prepare(schema: &Schema, doc: &mut Document) -> Result<()> {
    apply_defaults(schema, doc)?;
    apply_transforms(schema, doc)?;
    ensure_valid(schema, doc)
}

fn is_missing(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn check_value(name: &str, rule: &FieldRule, value: &Value, errors: &mut ValidationErrors) {
    if !rule.field_type.accepts(value) {
        let expected = match rule.field_type {
            FieldType::Date => "date (RFC 3339 or YYYY-MM-DD)",
            other => other.name(),
        };
        errors.add(
            name,
            format!("Field '{name}' expected {expected}, got {}", type_name(value)),
        );
        return;
    }

    if let Some(allowed) = &rule.enum_values {
        if !allowed.iter().any(|a| values_equal(a, value)) {
            let listed: Vec<String> = allowed.iter().map(Value::to_string).collect();
            errors.add(
                name,
                format!(
                    "Field '{name}' value {value} is not in enum: [{}]",
                    listed.join(", ")
                ),
            );
        }
    }

    if let Value::String(s) = value {
        let len = s.chars().count();
        if let Some(min) = rule.min_length {
            if len < min {
                errors.add(
                    name,
                    format!("Field '{name}' is shorter than the minimum length of {min}"),
                );
            }
        }
        if let Some(max) = rule.max_length {
            if len > max {
                errors.add(
                    name,
                    format!("Field '{name}' is longer than the maximum length of {max}"),
                );
            }
        }
        if let Some(pattern) = &rule.pattern {
            if !pattern.is_match(s) {
                errors.add(
                    name,
                    format!("Field '{name}' does not match pattern {}", pattern.as_str()),
                );
            }
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = rule.min {
            if n < min {
                errors.add(name, format!("Field '{name}' is less than the minimum of {min}"));
            }
        }
        if let Some(max) = rule.max {
            if n > max {
                errors.add(name, format!("Field '{name}' is more than the maximum of {max}"));
            }
        }
    }
}
