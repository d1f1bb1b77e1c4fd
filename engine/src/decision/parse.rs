//! Plan-line parsing
//!
//! Models answer in one of these shapes:
//!
//! - `FUNCTION_CALL: tool|key=value|nested.key=value`
//! - `FINAL_ANSWER: text`
//! - `BATCH: [{"name": "...", "arguments": {...}}, ...]`
//! - a JSON object `{"function": "...", "arguments": {...}}` or
//!   `{"final_answer": "..."}`, bare or fenced
//!
//! Values in `FUNCTION_CALL` lines are read as JSON when they parse and as
//! plain strings otherwise.

use sdk::errors::EngineError;
use sdk::types::ToolCall;
use serde_json::{Map, Value};

use super::Decision;
use crate::llm::{extract_balanced, extract_json_object};

const FUNCTION_CALL: &str = "FUNCTION_CALL:";
const FINAL_ANSWER: &str = "FINAL_ANSWER:";
const BATCH: &str = "BATCH:";

/// Read a decision from a raw model reply
pub fn parse_decision(raw: &str) -> Result<Decision, EngineError> {
    for line in raw.lines() {
        let line = strip_line_noise(line);
        if let Some(rest) = line.strip_prefix(FUNCTION_CALL) {
            return parse_function_call(rest).map(Decision::ToolCall);
        }
        if let Some(rest) = line.strip_prefix(FINAL_ANSWER) {
            return Ok(Decision::FinalAnswer(clean_answer(rest)));
        }
        if let Some(rest) = line.strip_prefix(BATCH) {
            return parse_batch(rest.trim());
        }
    }

    if let Some(json) = extract_json_object(raw) {
        if let Some(decision) = decision_from_json(&json) {
            return Ok(decision);
        }
    }

    Err(EngineError::DecisionFailure(format!(
        "no FUNCTION_CALL or FINAL_ANSWER in model output: {}",
        raw.trim().chars().take(160).collect::<String>()
    )))
}

/// Drop list bullets and emphasis the model sometimes adds
fn strip_line_noise(line: &str) -> &str {
    line.trim()
        .trim_start_matches(['-', '*', '>', '`'])
        .trim_end_matches('`')
        .trim()
}

fn clean_answer(rest: &str) -> String {
    let answer = rest.trim();
    let answer = answer
        .strip_prefix('[')
        .and_then(|a| a.strip_suffix(']'))
        .unwrap_or(answer);
    answer.trim().to_string()
}

/// Parse the part after `FUNCTION_CALL:`
pub fn parse_function_call(spec: &str) -> Result<ToolCall, EngineError> {
    let parts = split_top_level(spec.trim(), '|');
    let mut parts = parts.into_iter();

    let name = parts.next().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(EngineError::DecisionFailure(
            "FUNCTION_CALL without a tool name".to_string(),
        ));
    }

    let mut arguments = Map::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let split = find_unquoted(part, '=').ok_or_else(|| {
            EngineError::DecisionFailure(format!("invalid parameter (no '='): {}", part))
        })?;
        let key = part[..split].trim();
        if key.is_empty() {
            return Err(EngineError::DecisionFailure(format!(
                "invalid parameter (empty name): {}",
                part
            )));
        }
        let value = parse_value(part[split + 1..].trim());
        insert_path(&mut arguments, key, value)?;
    }

    Ok(ToolCall::new(name, Value::Object(arguments)))
}

fn parse_batch(rest: &str) -> Result<Decision, EngineError> {
    let body = extract_balanced(rest, '[', ']').unwrap_or(rest);
    let items: Vec<Value> = serde_json::from_str(body)
        .map_err(|e| EngineError::DecisionFailure(format!("unreadable BATCH line: {}", e)))?;

    let mut calls = items
        .iter()
        .map(|item| {
            call_from_json(item).ok_or_else(|| {
                EngineError::DecisionFailure(format!("BATCH entry is not a tool call: {}", item))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    match calls.len() {
        0 => Err(EngineError::DecisionFailure("empty BATCH".to_string())),
        1 => Ok(Decision::ToolCall(calls.remove(0))),
        _ => Ok(Decision::Batch(calls)),
    }
}

fn decision_from_json(json: &Value) -> Option<Decision> {
    if let Some(answer) = json.get("final_answer").or_else(|| json.get("finalAnswer")) {
        let text = match answer {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Some(Decision::FinalAnswer(text));
    }
    if let Some(Value::Array(items)) = json.get("batch") {
        let calls: Option<Vec<ToolCall>> = items.iter().map(call_from_json).collect();
        return calls.filter(|c| !c.is_empty()).map(Decision::Batch);
    }
    if let Some(call) = json.get("tool_call").or_else(|| json.get("toolCall")) {
        return call_from_json(call).map(Decision::ToolCall);
    }
    call_from_json(json).map(Decision::ToolCall)
}

fn call_from_json(json: &Value) -> Option<ToolCall> {
    let name = ["function", "name", "tool"]
        .iter()
        .find_map(|k| json.get(*k).and_then(|v| v.as_str()))?;
    if name.trim().is_empty() {
        return None;
    }
    let arguments = match json.get("arguments") {
        // Some models send arguments as a JSON string
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::String(s.clone())),
        Some(other) => other.clone(),
        None => Value::Object(Map::new()),
    };
    Some(ToolCall::new(name.trim(), arguments))
}

/// JSON when it parses, else the text with one pair of outer quotes removed
fn parse_value(raw: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return value;
    }
    match raw {
        "True" => return Value::Bool(true),
        "False" => return Value::Bool(false),
        "None" => return Value::Null,
        _ => {}
    }
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 && bytes[0] == bytes[bytes.len() - 1] && matches!(bytes[0], b'"' | b'\'')
    {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    Value::String(raw.to_string())
}

/// Insert `value` at a dotted path such as `input.sheet_id`
fn insert_path(target: &mut Map<String, Value>, path: &str, value: Value) -> Result<(), EngineError> {
    let keys: Vec<&str> = path.split('.').map(str::trim).collect();
    if keys.iter().any(|k| k.is_empty()) {
        return Err(EngineError::DecisionFailure(format!(
            "invalid parameter path '{}'",
            path
        )));
    }

    let (last, parents) = match keys.split_last() {
        Some(split) => split,
        None => return Ok(()),
    };

    let mut current = target;
    for key in parents {
        let entry = current
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => {
                return Err(EngineError::DecisionFailure(format!(
                    "parameter '{}' is both a value and an object",
                    key
                )))
            }
        };
    }
    current.insert((*last).to_string(), value);
    Ok(())
}

/// Split on `sep` outside quotes and brackets
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escape_next = false;
    let mut start = 0;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match (quote, ch) {
            (Some(_), '\\') => escape_next = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(ch),
            (None, '[') | (None, '{') => depth += 1,
            (None, ']') | (None, '}') => depth -= 1,
            (None, c) if c == sep && depth <= 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Position of the first `target` outside quotes
fn find_unquoted(s: &str, target: char) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, ch) in s.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(ch),
            (None, c) if c == target => return Some(i),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(raw: &str) -> ToolCall {
        match parse_decision(raw).unwrap() {
            Decision::ToolCall(c) => c,
            other => panic!("expected tool call, got {:?}", other),
        }
    }

    #[test]
    fn test_function_call_line() {
        let c = call("FUNCTION_CALL: search|query=\"F1 standings top 10\"|max_results=5");
        assert_eq!(c.name, "search");
        assert_eq!(
            c.arguments,
            json!({"query": "F1 standings top 10", "max_results": 5})
        );
    }

    #[test]
    fn test_nested_keys_and_json_values() {
        let c = call(
            r#"FUNCTION_CALL: add_data_to_sheet|input.sheet_id="abc"|input.data=[["Rank","Team"],["1","A|B"]]"#,
        );
        assert_eq!(
            c.arguments,
            json!({"input": {"sheet_id": "abc", "data": [["Rank", "Team"], ["1", "A|B"]]}})
        );
    }

    #[test]
    fn test_unquoted_and_single_quoted_values() {
        let c = call("FUNCTION_CALL: send|to=someone@example.com|subject='Hi = there'|draft=True");
        assert_eq!(
            c.arguments,
            json!({"to": "someone@example.com", "subject": "Hi = there", "draft": true})
        );
    }

    #[test]
    fn test_call_without_arguments() {
        let c = call("FUNCTION_CALL: get_time");
        assert_eq!(c.arguments, json!({}));
    }

    #[test]
    fn test_first_plan_line_wins_over_prose() {
        let raw = "Thinking about it...\n- FINAL_ANSWER: [Sheet link: https://x.test/s]\nFUNCTION_CALL: search|q=1";
        assert_eq!(
            parse_decision(raw).unwrap(),
            Decision::FinalAnswer("Sheet link: https://x.test/s".to_string())
        );
    }

    #[test]
    fn test_json_forms() {
        let c = call("```json\n{\"function\": \"search\", \"arguments\": {\"query\": \"x\"}}\n```");
        assert_eq!(c.arguments, json!({"query": "x"}));

        let c = call(r#"{"name": "search", "arguments": "{\"query\": \"y\"}"}"#);
        assert_eq!(c.arguments, json!({"query": "y"}));

        assert_eq!(
            parse_decision(r#"{"final_answer": "done"}"#).unwrap(),
            Decision::FinalAnswer("done".to_string())
        );
    }

    #[test]
    fn test_batch_line() {
        let raw = r#"BATCH: [{"name": "a", "arguments": {}}, {"function": "b", "arguments": {"x": 1}}]"#;
        match parse_decision(raw).unwrap() {
            Decision::Batch(calls) => {
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[1].name, "b");
            }
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[test]
    fn test_single_entry_batch_is_a_call() {
        let raw = r#"BATCH: [{"name": "a"}]"#;
        assert!(matches!(parse_decision(raw).unwrap(), Decision::ToolCall(c) if c.name == "a"));
    }

    #[test]
    fn test_garbage_is_decision_failure() {
        assert!(matches!(
            parse_decision("I am not sure what to do"),
            Err(EngineError::DecisionFailure(_))
        ));
        assert!(parse_decision("FUNCTION_CALL: |a=1").is_err());
        assert!(parse_decision("FUNCTION_CALL: t|novalue").is_err());
        assert!(parse_decision("FUNCTION_CALL: t|a=1|a.b=2").is_err());
    }
}
