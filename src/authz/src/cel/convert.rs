//! Value conversion between request attributes and CEL values
//!
//! Attributes and function arguments/results travel as `serde_json::Value`;
//! the interpreter works on its own value type.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cel_interpreter::objects::{Key, Map, Value as CelValue};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Convert serde_json::Value to cel_interpreter::Value
pub fn json_to_cel(value: &JsonValue) -> CelValue {
    match value {
        JsonValue::Null => CelValue::Null,
        JsonValue::Bool(b) => CelValue::Bool(*b),
        JsonValue::Number(n) => number_to_cel(n),
        JsonValue::String(s) => CelValue::String(s.clone().into()),
        JsonValue::Array(items) => {
            let list: Vec<CelValue> = items.iter().map(json_to_cel).collect();
            CelValue::List(list.into())
        }
        JsonValue::Object(obj) => {
            let entries: HashMap<Key, CelValue> = obj
                .iter()
                .map(|(k, v)| (Key::from(k.clone()), json_to_cel(v)))
                .collect();
            CelValue::Map(Map { map: Arc::new(entries) })
        }
    }
}

fn number_to_cel(n: &serde_json::Number) -> CelValue {
    if let Some(i) = n.as_i64() {
        CelValue::Int(i)
    } else if let Some(u) = n.as_u64() {
        CelValue::UInt(u)
    } else if let Some(f) = n.as_f64() {
        CelValue::Float(f)
    } else {
        CelValue::Null
    }
}

/// Convert cel_interpreter::Value to serde_json::Value
pub fn cel_to_json(value: &CelValue) -> JsonValue {
    match value {
        CelValue::Null => JsonValue::Null,
        CelValue::Bool(b) => JsonValue::Bool(*b),
        CelValue::Int(i) => JsonValue::Number((*i).into()),
        CelValue::UInt(u) => JsonValue::Number((*u).into()),
        CelValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        CelValue::String(s) => JsonValue::String(s.to_string()),
        CelValue::Bytes(b) => JsonValue::String(STANDARD.encode(b.as_ref())),
        CelValue::List(list) => JsonValue::Array(list.iter().map(cel_to_json).collect()),
        CelValue::Map(map) => {
            let obj = map
                .map
                .iter()
                .map(|(k, v)| (key_to_string(k), cel_to_json(v)))
                .collect();
            JsonValue::Object(obj)
        }
        CelValue::Duration(_) | CelValue::Timestamp(_) | CelValue::Function(_, _) => {
            JsonValue::String(format!("{:?}", value))
        }
    }
}

fn key_to_string(key: &Key) -> String {
    match key {
        Key::String(s) => s.to_string(),
        Key::Int(i) => i.to_string(),
        Key::Uint(u) => u.to_string(),
        Key::Bool(b) => b.to_string(),
    }
}
