//! Stable identity for tool-call snapshots.
//!
//! A tool call is emitted many times while it accrues arguments and results. The
//! key derived here stays the same across those snapshots so both the server frame
//! emitter and the client reactor can collapse them.

use serde_json::{Map, Value};

use crate::types::ToolCall;

const RAW_ID_FIELDS: &[&str] = &["id", "callId", "call_id"];

/// Resolve the idempotency key of one tool-call snapshot.
///
/// Priority: explicit key, then the provider's raw call id, then `name` + arguments.
/// The fallback ignores `result`, so a call that only gained a result keeps its key.
pub fn resolve_key(tool_call: &ToolCall) -> String {
    if let Some(key) = &tool_call.idempotency_key {
        if !key.is_empty() {
            return key.clone();
        }
    }

    if let Some(raw_id) = raw_call_id(&tool_call.raw_tool_call) {
        return format!("raw:{}", raw_id);
    }

    let args_key = arguments_key(&tool_call.arguments);
    if args_key.is_empty() {
        format!("fallback:{}", tool_call.name)
    } else {
        format!("fallback:{}:{}", tool_call.name, args_key)
    }
}

fn raw_call_id(raw: &Value) -> Option<String> {
    let obj = raw.as_object()?;
    RAW_ID_FIELDS.iter().find_map(|field| match obj.get(*field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// String arguments are used as-is; structured ones are serialized with sorted keys.
fn arguments_key(arguments: &Value) -> String {
    match arguments {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => match serde_json::to_string(&canonicalize(other)) {
            Ok(s) => s,
            Err(_) => String::new(),
        },
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Parse a polymorphic tool-call `result` into a structured object.
///
/// Results arrive either already parsed or as JSON text. Anything that does not
/// end up as a JSON object yields `None`; this never fails.
pub fn parse_tool_call_result(result: &Value) -> Option<Map<String, Value>> {
    match result {
        Value::Object(map) => Some(map.clone()),
        Value::String(text) => match serde_json::from_str::<Value>(text.trim()) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}
