//! Payload validation seam.
//!
//! The engine never interprets schemas itself; it hands `(schema, payload)`
//! pairs to whichever [`PayloadValidator`] the configuration supplies. The
//! built-in [`JsonTypeValidator`] covers the structural subset of JSON Schema
//! (`type`, `properties`, `required`, `items`) which is enough for message
//! shape checks; embedders with full JSON Schema needs plug in their own.

use serde_json::Value;

use crate::error::ValidationIssue;

pub trait PayloadValidator: Send + Sync {
    fn validate(&self, schema: &Value, payload: &Value) -> Result<(), Vec<ValidationIssue>>;
}

/// Validator that admits every payload. Useful when schemas are enforced
/// elsewhere or not at all.
pub struct AcceptAllValidator;

impl PayloadValidator for AcceptAllValidator {
    fn validate(&self, _schema: &Value, _payload: &Value) -> Result<(), Vec<ValidationIssue>> {
        Ok(())
    }
}

/// Structural validator: `type` (string or array of strings), `properties`,
/// `required`, `items`. Unknown schema keywords are ignored.
pub struct JsonTypeValidator;

impl PayloadValidator for JsonTypeValidator {
    fn validate(&self, schema: &Value, payload: &Value) -> Result<(), Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        check(schema, payload, "", &mut issues);
        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn check(schema: &Value, value: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        let matched = match expected {
            Value::String(t) => type_matches(t, value),
            Value::Array(types) => types
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(t, value)),
            _ => true,
        };
        if !matched {
            issues.push(ValidationIssue::new(
                path,
                format!("expected {expected}, got {}", type_name(value)),
            ));
            // A wrongly-typed value can't satisfy the keywords below.
            return;
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        if let Some(obj) = value.as_object() {
            for key in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(key) {
                    issues.push(ValidationIssue::new(
                        format!("{path}/{key}"),
                        "required property is missing",
                    ));
                }
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        if let Some(obj) = value.as_object() {
            for (key, subschema) in properties {
                if let Some(subvalue) = obj.get(key) {
                    check(subschema, subvalue, &format!("{path}/{key}"), issues);
                }
            }
        }
    }

    if let Some(items) = schema.get("items") {
        if let Some(array) = value.as_array() {
            for (index, item) in array.iter().enumerate() {
                check(items, item, &format!("{path}/{index}"), issues);
            }
        }
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(schema: Value, payload: Value) -> Result<(), Vec<ValidationIssue>> {
        JsonTypeValidator.validate(&schema, &payload)
    }

    #[test]
    fn accepts_matching_object() {
        let schema = json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": {"type": "string"},
                "count": {"type": "integer"}
            }
        });
        assert!(validate(schema, json!({"name": "x", "count": 3})).is_ok());
    }

    #[test]
    fn reports_type_mismatch_with_path() {
        let schema = json!({
            "type": "object",
            "properties": {"count": {"type": "integer"}}
        });
        let issues = validate(schema, json!({"count": "three"})).unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "/count");
    }

    #[test]
    fn reports_missing_required() {
        let schema = json!({"type": "object", "required": ["id"]});
        let issues = validate(schema, json!({})).unwrap_err();
        assert_eq!(issues[0].path, "/id");
    }

    #[test]
    fn integer_vs_number() {
        assert!(validate(json!({"type": "integer"}), json!(3)).is_ok());
        assert!(validate(json!({"type": "integer"}), json!(3.5)).is_err());
        assert!(validate(json!({"type": "number"}), json!(3.5)).is_ok());
    }

    #[test]
    fn type_unions() {
        let schema = json!({"type": ["string", "null"]});
        assert!(validate(schema.clone(), json!(null)).is_ok());
        assert!(validate(schema.clone(), json!("x")).is_ok());
        assert!(validate(schema, json!(1)).is_err());
    }

    #[test]
    fn array_items_checked_per_index() {
        let schema = json!({"type": "array", "items": {"type": "number"}});
        let issues = validate(schema, json!([1, "two", 3])).unwrap_err();
        assert_eq!(issues[0].path, "/1");
    }

    #[test]
    fn accept_all_never_complains() {
        let schema = json!({"type": "string"});
        assert!(AcceptAllValidator.validate(&schema, &json!(42)).is_ok());
    }
}
