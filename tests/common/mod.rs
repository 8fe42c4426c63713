//! Shared helpers for integration tests

#![allow(dead_code)]

use ciborium::value::Value;

/// Encode a compact record `[format_id, args...]`
pub fn record(format_id: i64, args: Vec<Value>) -> Vec<u8> {
    let mut items = vec![Value::Integer(format_id.into())];
    items.extend(args);
    encode(&Value::Array(items))
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).expect("Failed to encode CBOR");
    bytes
}

pub fn int(v: i64) -> Value {
    Value::Integer(v.into())
}

pub fn wide(v: i64) -> Value {
    Value::Array(vec![int(v)])
}

pub fn float(v: f64) -> Value {
    Value::Float(v)
}

pub fn text(v: &str) -> Value {
    Value::Text(v.to_string())
}

pub fn as_text(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).expect("Decoded output was not UTF-8")
}
