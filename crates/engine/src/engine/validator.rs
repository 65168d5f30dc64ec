//! Field-level validation for human-task submissions.

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::definition::{FieldSpec, FieldType};

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

/// Validate a full submission against the declared fields. Invalid if any
/// field is invalid; all per-field errors are collected. Inputs are never
/// mutated.
pub fn validate_fields(
    fields: &[FieldSpec],
    values: &HashMap<String, JsonValue>,
) -> ValidationResult {
    let mut errors = Vec::new();
    for field in fields {
        errors.extend(validate_field(field, values.get(&field.name)));
    }
    ValidationResult {
        is_valid: errors.is_empty(),
        errors,
    }
}

/// Validate one field. Returns human-readable errors prefixed by field name.
pub fn validate_field(field: &FieldSpec, value: Option<&JsonValue>) -> Vec<String> {
    let mut errors = Vec::new();

    if is_empty(value) {
        if field.required {
            errors.push(format!("{}: value is required", field.name));
        }
        // Optional fields accept empty values unconditionally.
        return errors;
    }
    let value = value.expect("checked non-empty above");

    match field.field_type {
        FieldType::Text => validate_text(field, value, &mut errors),
        FieldType::Number => validate_number(field, value, &mut errors),
        FieldType::Boolean => {
            if !value.is_boolean() {
                errors.push(format!("{}: value must be a boolean", field.name));
            }
        }
        FieldType::Select => validate_select(field, value, &mut errors),
        FieldType::Date => validate_date(field, value, &mut errors),
    }

    errors
}

fn is_empty(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn validate_text(field: &FieldSpec, value: &JsonValue, errors: &mut Vec<String>) {
    let Some(text) = value.as_str() else {
        errors.push(format!("{}: value must be text", field.name));
        return;
    };

    let length = text.chars().count() as f64;
    if let Some(min) = field.min {
        if length < min {
            errors.push(format!(
                "{}: must be at least {} characters",
                field.name, min
            ));
        }
    }
    if let Some(max) = field.max {
        if length > max {
            errors.push(format!("{}: must be at most {} characters", field.name, max));
        }
    }

    if let Some(pattern) = &field.pattern {
        match Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(text) {
                    let description = field
                        .pattern_description
                        .clone()
                        .unwrap_or_else(|| format!("must match pattern {}", pattern));
                    errors.push(format!("{}: {}", field.name, description));
                }
            }
            // A broken pattern is a definition defect, not a submission defect.
            Err(_) => errors.push(format!("{}: Invalid pattern configuration", field.name)),
        }
    }
}

fn validate_number(field: &FieldSpec, value: &JsonValue, errors: &mut Vec<String>) {
    let number = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.parse::<f64>().ok(),
        _ => None,
    };
    let Some(number) = number else {
        errors.push(format!("{}: value must be a number", field.name));
        return;
    };

    if let Some(min) = field.min {
        if number < min {
            errors.push(format!("{}: must be at least {}", field.name, min));
        }
    }
    if let Some(max) = field.max {
        if number > max {
            errors.push(format!("{}: must be at most {}", field.name, max));
        }
    }
}

fn validate_select(field: &FieldSpec, value: &JsonValue, errors: &mut Vec<String>) {
    let options = field.options.as_deref().unwrap_or(&[]);
    if !options.iter().any(|option| &option.value == value) {
        errors.push(format!(
            "{}: value is not one of the declared options",
            field.name
        ));
    }
}

fn validate_date(field: &FieldSpec, value: &JsonValue, errors: &mut Vec<String>) {
    let parseable = value.as_str().map_or(false, |s| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() || DateTime::parse_from_rfc3339(s).is_ok()
    });
    if !parseable {
        errors.push(format!("{}: value must be a calendar date", field.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str, field_type: FieldType) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            field_type,
            label: None,
            hint: None,
            placeholder: None,
            required: false,
            pattern: None,
            pattern_description: None,
            min: None,
            max: None,
            options: None,
            value: None,
        }
    }

    #[test]
    fn test_required_field_missing() {
        let mut spec = field("email", FieldType::Text);
        spec.required = true;

        let errors = validate_field(&spec, None);
        assert_eq!(errors, vec!["email: value is required"]);

        let errors = validate_field(&spec, Some(&json!("")));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_optional_field_accepts_empty() {
        let spec = field("note", FieldType::Text);
        assert!(validate_field(&spec, None).is_empty());
        assert!(validate_field(&spec, Some(&json!(""))).is_empty());
    }

    #[test]
    fn test_text_length_and_pattern() {
        let mut spec = field("code", FieldType::Text);
        spec.min = Some(2.0);
        spec.max = Some(4.0);
        spec.pattern = Some("^[A-Z]+$".to_string());

        assert!(validate_field(&spec, Some(&json!("ABC"))).is_empty());
        assert!(!validate_field(&spec, Some(&json!("A"))).is_empty());
        assert!(!validate_field(&spec, Some(&json!("ABCDE"))).is_empty());
        assert!(!validate_field(&spec, Some(&json!("abc"))).is_empty());
    }

    #[test]
    fn test_malformed_pattern_reports_configuration_error() {
        let mut spec = field("code", FieldType::Text);
        spec.pattern = Some("[unclosed".to_string());

        let errors = validate_field(&spec, Some(&json!("anything")));
        assert_eq!(errors, vec!["code: Invalid pattern configuration"]);
    }

    #[test]
    fn test_number_bounds() {
        let mut spec = field("age", FieldType::Number);
        spec.min = Some(18.0);
        spec.max = Some(99.0);

        assert!(validate_field(&spec, Some(&json!(42))).is_empty());
        assert!(validate_field(&spec, Some(&json!("42"))).is_empty());
        assert!(!validate_field(&spec, Some(&json!(7))).is_empty());
        assert!(!validate_field(&spec, Some(&json!("abc"))).is_empty());
    }

    #[test]
    fn test_boolean_requires_boolean() {
        let spec = field("accepted", FieldType::Boolean);
        assert!(validate_field(&spec, Some(&json!(true))).is_empty());
        assert!(!validate_field(&spec, Some(&json!("true"))).is_empty());
    }

    #[test]
    fn test_select_options() {
        let mut spec = field("tier", FieldType::Select);
        spec.options = Some(vec![
            crate::definition::FieldOption {
                value: json!("gold"),
                label: None,
            },
            crate::definition::FieldOption {
                value: json!("silver"),
                label: None,
            },
        ]);

        assert!(validate_field(&spec, Some(&json!("gold"))).is_empty());
        assert!(!validate_field(&spec, Some(&json!("bronze"))).is_empty());
    }

    #[test]
    fn test_date_parsing() {
        let spec = field("due", FieldType::Date);
        assert!(validate_field(&spec, Some(&json!("2026-08-26"))).is_empty());
        assert!(validate_field(&spec, Some(&json!("2026-08-26T10:00:00Z"))).is_empty());
        assert!(!validate_field(&spec, Some(&json!("yesterday"))).is_empty());
    }

    #[test]
    fn test_validate_fields_collects_all_errors() {
        let mut email = field("email", FieldType::Text);
        email.required = true;
        let mut age = field("age", FieldType::Number);
        age.min = Some(18.0);

        let mut values = HashMap::new();
        values.insert("age".to_string(), json!(10));

        let result = validate_fields(&[email, age], &values);
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors.iter().any(|e| e.starts_with("email:")));
        assert!(result.errors.iter().any(|e| e.starts_with("age:")));
    }
}
