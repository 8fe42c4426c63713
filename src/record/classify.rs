//! Mapping generic CBOR values onto [`TypedArgument`]s

use ciborium::value::Value;

use crate::decoder::{CompactLogDecodeError, DecodeResult};
use crate::record::TypedArgument;

/// Classify one argument value.
///
/// - integer: `Int32`, low 32 bits
/// - array holding exactly one integer: `Int64`, low 64 bits
/// - float: `Double`
/// - text: `StringRef`
///
/// Every other shape is rejected rather than guessed at.
pub fn classify(value: &Value) -> DecodeResult<TypedArgument> {
    match value {
        Value::Integer(int) => Ok(TypedArgument::Int32(i128::from(*int) as i32)),
        Value::Array(items) => match items.as_slice() {
            [Value::Integer(int)] => Ok(TypedArgument::Int64(i128::from(*int) as i64)),
            [inner] => Err(malformed(format!(
                "wrapped {} where a wide integer was expected",
                shape(inner)
            ))),
            _ => Err(malformed(format!(
                "array of {} elements where a wide integer was expected",
                items.len()
            ))),
        },
        Value::Float(float) => Ok(TypedArgument::Double(*float)),
        Value::Text(text) => Ok(TypedArgument::StringRef(text.clone())),
        other => Err(malformed(format!("unsupported {}", shape(other)))),
    }
}

fn malformed(message: String) -> CompactLogDecodeError {
    CompactLogDecodeError::MalformedRecordError(message)
}

/// Short name of a value's shape for error messages
pub(crate) fn shape(value: &Value) -> &'static str {
    match value {
        Value::Integer(_) => "integer",
        Value::Bytes(_) => "byte string",
        Value::Float(_) => "float",
        Value::Text(_) => "text",
        Value::Bool(_) => "bool",
        Value::Null => "null",
        Value::Tag(..) => "tagged value",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        _ => "value",
    }
}
