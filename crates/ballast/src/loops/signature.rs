//! Tool-call signatures.
//!
//! Two calls that mean the same thing must produce the same signature even
//! when the model emitted their argument keys in a different order. Arguments
//! are parsed, written back out with object keys sorted at every depth, and
//! prefixed with the tool name.

use serde_json::{Map, Value};
use std::fmt::Write;

/// Parse raw tool arguments into a value.
///
/// Missing, blank, `null`, and `undefined` arguments become `{}` so that a
/// call without arguments still has a stable signature. Text that is not
/// JSON is kept verbatim as a string.
pub fn parse_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "undefined" {
        return Value::Object(Map::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Null) => Value::Object(Map::new()),
        Ok(value) => value,
        Err(_) => Value::String(raw.to_string()),
    }
}

/// Deterministic JSON text for `value`: object keys sorted recursively,
/// arrays kept in positional order, no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Value::Null => out.push_str("null"),
    }
}

fn write_string(s: &str, out: &mut String) {
    // Serializing a plain string cannot fail.
    out.push_str(&serde_json::to_string(s).unwrap_or_default());
}

/// Signature of a call: `name:canonical-arguments`.
pub fn signature(tool_name: &str, arguments: &Value) -> String {
    format!("{tool_name}:{}", canonical_json(arguments))
}

/// Fraction of argument keys two calls agree on: keys with equal values over
/// all distinct keys. Non-object arguments overlap fully when equal and not
/// at all otherwise.
pub fn parameter_overlap(a: &Value, b: &Value) -> f64 {
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            let total = left
                .keys()
                .chain(right.keys().filter(|k| !left.contains_key(*k)))
                .count();
            if total == 0 {
                return 1.0;
            }
            let shared = left
                .iter()
                .filter(|(k, v)| right.get(*k).is_some_and(|other| values_equal(v, other)))
                .count();
            shared as f64 / total as f64
        }
        _ => {
            if values_equal(a, b) {
                1.0
            } else {
                0.0
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    canonical_json(a) == canonical_json(b)
}
