//! Argument checks at the dispatch boundary
//!
//! Arguments arrive as loosely shaped JSON from the decision model. Before a
//! call reaches an adapter it is coerced into the shape the tool declares and
//! validated against the subset of JSON schema endpoints actually use:
//! `type`, `properties` and `required`, recursively for nested objects.

use sdk::types::ToolSpec;
use serde_json::{Map, Value};

/// Fit arguments to the tool's declared shape.
///
/// - `null` becomes `{}` for object schemas.
/// - A tool whose only property is `input` receives `{"input": args}` when
///   the caller passed the inner object directly.
pub fn coerce_arguments(spec: &ToolSpec, arguments: Value) -> Value {
    let arguments = match arguments {
        Value::Null if expects_object(&spec.input_schema) => Value::Object(Map::new()),
        other => other,
    };

    let props = spec.property_names();
    if props == ["input"] {
        let already_wrapped = arguments
            .as_object()
            .map(|m| m.len() == 1 && m.contains_key("input"))
            .unwrap_or(false);
        if !already_wrapped {
            let mut wrapped = Map::new();
            wrapped.insert("input".to_string(), arguments);
            return Value::Object(wrapped);
        }
    }

    arguments
}

/// Validate arguments against the tool's input schema
pub fn validate_arguments(spec: &ToolSpec, arguments: &Value) -> Result<(), String> {
    validate_value(&spec.input_schema, arguments, "arguments")
}

fn expects_object(schema: &Value) -> bool {
    match schema.get("type") {
        None => schema.get("properties").is_some(),
        Some(t) => type_names(t).contains(&"object"),
    }
}

fn type_names(t: &Value) -> Vec<&str> {
    match t {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(|v| v.as_str()).collect(),
        _ => Vec::new(),
    }
}

fn matches_type(name: &str, value: &Value) -> bool {
    match name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown keywords are not ours to enforce
        _ => true,
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn validate_value(schema: &Value, value: &Value, at: &str) -> Result<(), String> {
    if let Some(t) = schema.get("type") {
        let names = type_names(t);
        if !names.is_empty() && !names.iter().any(|n| matches_type(n, value)) {
            return Err(format!(
                "{} must be {}, got {}",
                at,
                names.join(" or "),
                describe(value)
            ));
        }
    }

    let Some(object) = value.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !object.contains_key(key) {
                return Err(format!("{} is missing required field '{}'", at, key));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, prop_schema) in properties {
            if let Some(field) = object.get(key) {
                validate_value(prop_schema, field, &format!("{}.{}", at, key))?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_spec() -> ToolSpec {
        ToolSpec::new(
            "search",
            "web search",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "max_results": {"type": "integer"}
                },
                "required": ["query"]
            }),
        )
    }

    fn wrapped_spec() -> ToolSpec {
        ToolSpec::new(
            "create_sheet",
            "create a sheet",
            json!({
                "type": "object",
                "properties": {
                    "input": {
                        "type": "object",
                        "properties": {"title": {"type": "string"}},
                        "required": ["title"]
                    }
                },
                "required": ["input"]
            }),
        )
    }

    #[test]
    fn test_valid_arguments_pass() {
        let args = json!({"query": "f1 standings", "max_results": 10});
        assert!(validate_arguments(&search_spec(), &args).is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        let err = validate_arguments(&search_spec(), &json!({"max_results": 3})).unwrap_err();
        assert!(err.contains("'query'"));
    }

    #[test]
    fn test_wrong_primitive_type() {
        let err =
            validate_arguments(&search_spec(), &json!({"query": "x", "max_results": "ten"}))
                .unwrap_err();
        assert!(err.contains("arguments.max_results must be integer"));
    }

    #[test]
    fn test_non_object_arguments_rejected() {
        assert!(validate_arguments(&search_spec(), &json!("just text")).is_err());
    }

    #[test]
    fn test_input_wrapping() {
        let spec = wrapped_spec();
        let coerced = coerce_arguments(&spec, json!({"title": "F1"}));
        assert_eq!(coerced, json!({"input": {"title": "F1"}}));
        assert!(validate_arguments(&spec, &coerced).is_ok());

        // Already wrapped stays as is
        let same = coerce_arguments(&spec, json!({"input": {"title": "F1"}}));
        assert_eq!(same, json!({"input": {"title": "F1"}}));
    }

    #[test]
    fn test_nested_validation() {
        let err = validate_arguments(&wrapped_spec(), &json!({"input": {}})).unwrap_err();
        assert!(err.contains("arguments.input is missing required field 'title'"));
    }

    #[test]
    fn test_null_becomes_empty_object() {
        let spec = ToolSpec::new("ping", "", json!({"type": "object"}));
        assert_eq!(coerce_arguments(&spec, Value::Null), json!({}));
    }

    #[test]
    fn test_nullable_union_type() {
        let spec = ToolSpec::new(
            "t",
            "",
            json!({"type": "object", "properties": {"cursor": {"type": ["string", "null"]}}}),
        );
        assert!(validate_arguments(&spec, &json!({"cursor": null})).is_ok());
        assert!(validate_arguments(&spec, &json!({"cursor": 3})).is_err());
    }
}
