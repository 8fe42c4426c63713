//! Parsing a compact record from its CBOR encoding

use ciborium::value::Value;
use tracing::trace;

use crate::decoder::{CompactLogDecodeError, DecodeResult};
use crate::record::classify::{classify, shape};
use crate::record::CompactRecord;

/// Unpack one compact record.
///
/// Only the first complete CBOR item is read; trailing bytes are ignored.
pub fn unpack(raw: &[u8]) -> DecodeResult<CompactRecord> {
    let value: Value = ciborium::de::from_reader(raw).map_err(|e| {
        CompactLogDecodeError::MalformedRecordError(format!("invalid CBOR: {:?}", e))
    })?;

    check_keys(&value)?;

    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(CompactLogDecodeError::MalformedRecordError(format!(
                "expected an array, found {}",
                shape(&other)
            )))
        }
    };

    let (head, rest) = items.split_first().ok_or_else(|| {
        CompactLogDecodeError::MalformedRecordError("empty record".to_string())
    })?;

    let format_id = match head {
        Value::Integer(int) => i64::try_from(*int).map_err(|_| {
            CompactLogDecodeError::MalformedRecordError(format!(
                "format id {} out of range",
                i128::from(*int)
            ))
        })?,
        other => {
            return Err(CompactLogDecodeError::MalformedRecordError(format!(
                "format id must be an integer, found {}",
                shape(other)
            )))
        }
    };

    let arguments = rest
        .iter()
        .enumerate()
        .map(|(position, value)| {
            classify(value).map_err(|e| match e {
                CompactLogDecodeError::MalformedRecordError(message) => {
                    CompactLogDecodeError::MalformedRecordError(format!(
                        "argument {}: {}",
                        position, message
                    ))
                }
                other => other,
            })
        })
        .collect::<DecodeResult<Vec<_>>>()?;

    trace!(format_id, arguments = arguments.len(), "Unpacked record");

    Ok(CompactRecord {
        format_id,
        arguments,
    })
}

/// Walk the tree and check every map key.
fn check_keys(value: &Value) -> DecodeResult<()> {
    match value {
        Value::Array(items) => items.iter().try_for_each(check_keys),
        Value::Map(entries) => entries.iter().try_for_each(|(key, value)| {
            check_key(key)?;
            check_keys(key)?;
            check_keys(value)
        }),
        Value::Tag(_, inner) => check_keys(inner),
        _ => Ok(()),
    }
}

/// Arrays and maps can never be hashed. Used as a bare key they make the
/// record malformed; behind a tag they are reported with the outermost tag.
fn check_key(key: &Value) -> DecodeResult<()> {
    let mut inner = key;
    while let Value::Tag(_, tagged) = inner {
        inner = &**tagged;
    }
    if !matches!(inner, Value::Array(_) | Value::Map(_)) {
        return Ok(());
    }

    match key {
        Value::Tag(tag, _) => Err(CompactLogDecodeError::UnhashableTagError { tag: *tag }),
        other => Err(CompactLogDecodeError::MalformedRecordError(format!(
            "map key must be hashable, found {}",
            shape(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TypedArgument;

    fn encode(value: &Value) -> Vec<u8> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(value, &mut bytes).unwrap();
        bytes
    }

    fn int(v: i128) -> Value {
        Value::Integer(v.try_into().unwrap())
    }

    #[test]
    fn test_unpack_basic_record() {
        let bytes = encode(&Value::Array(vec![int(10), int(11)]));
        let record = unpack(&bytes).unwrap();
        assert_eq!(record.format_id, 10);
        assert_eq!(record.arguments, vec![TypedArgument::Int32(11)]);
    }

    #[test]
    fn test_unpack_known_bytes() {
        // [10, 11]
        let record = unpack(&[0x82, 0x0A, 0x0B]).unwrap();
        assert_eq!(record.format_id, 10);
        assert_eq!(record.arguments, vec![TypedArgument::Int32(11)]);
    }

    #[test]
    fn test_unpack_mixed_arguments() {
        let bytes = encode(&Value::Array(vec![
            int(7),
            int(1),
            Value::Array(vec![int(1 << 40)]),
            Value::Float(0.5),
            Value::Text("dev".into()),
        ]));
        let record = unpack(&bytes).unwrap();
        assert_eq!(
            record.arguments,
            vec![
                TypedArgument::Int32(1),
                TypedArgument::Int64(1 << 40),
                TypedArgument::Double(0.5),
                TypedArgument::StringRef("dev".into()),
            ]
        );
    }

    #[test]
    fn test_format_id_only() {
        let record = unpack(&encode(&Value::Array(vec![int(3)]))).unwrap();
        assert_eq!(record.format_id, 3);
        assert!(record.arguments.is_empty());
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut bytes = encode(&Value::Array(vec![int(1), int(2)]));
        bytes.extend_from_slice(&[0xFF, 0x00]);
        assert_eq!(unpack(&bytes).unwrap().format_id, 1);
    }

    #[test]
    fn test_malformed_records() {
        let cases = [
            vec![],
            vec![0xFF],
            encode(&int(5)),
            encode(&Value::Text("x".into())),
            encode(&Value::Array(vec![])),
            encode(&Value::Array(vec![Value::Text("id".into()), int(1)])),
            encode(&Value::Array(vec![int(u64::MAX as i128)])),
            encode(&Value::Array(vec![int(1), Value::Null])),
        ];

        for bytes in cases {
            let result = unpack(&bytes);
            assert!(
                matches!(result, Err(CompactLogDecodeError::MalformedRecordError(_))),
                "{bytes:02x?}: {result:?}"
            );
        }
    }

    #[test]
    fn test_error_names_argument_position() {
        let bytes = encode(&Value::Array(vec![int(1), int(2), Value::Bool(false)]));
        match unpack(&bytes) {
            Err(CompactLogDecodeError::MalformedRecordError(message)) => {
                assert!(message.contains("argument 1"), "{message}");
                assert!(message.contains("bool"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_container_key_anywhere_is_malformed() {
        let map = Value::Map(vec![(Value::Array(vec![int(1)]), int(2))]);
        let bytes = encode(&Value::Array(vec![int(1), Value::Array(vec![map])]));
        match unpack(&bytes) {
            Err(CompactLogDecodeError::MalformedRecordError(message)) => {
                assert!(message.contains("hashable"), "{message}");
                assert!(message.contains("array"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unhashable_tagged_key() {
        let key = Value::Tag(1000, Box::new(Value::Map(vec![])));
        let bytes = encode(&Value::Map(vec![(key, int(0))]));
        assert!(matches!(
            unpack(&bytes),
            Err(CompactLogDecodeError::UnhashableTagError { tag: 1000 })
        ));
    }

    #[test]
    fn test_nested_tags_report_outermost() {
        let inner = Value::Tag(1001, Box::new(Value::Array(vec![])));
        let key = Value::Tag(1000, Box::new(inner));
        let map = Value::Map(vec![(key, int(0))]);
        let bytes = encode(&Value::Array(vec![int(1), map]));
        assert!(matches!(
            unpack(&bytes),
            Err(CompactLogDecodeError::UnhashableTagError { tag: 1000 })
        ));
    }

    #[test]
    fn test_tagged_scalar_key_is_hashable() {
        let key = Value::Tag(1000, Box::new(int(3)));
        let map = Value::Map(vec![(key, int(0))]);
        let bytes = encode(&Value::Array(vec![int(1), map]));
        // The key passes; the map argument itself is what gets rejected
        match unpack(&bytes) {
            Err(CompactLogDecodeError::MalformedRecordError(message)) => {
                assert!(message.contains("argument 0"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_hashable_keys_fall_through_to_shape_check() {
        let bytes = encode(&Value::Map(vec![(Value::Text("k".into()), int(0))]));
        assert!(matches!(
            unpack(&bytes),
            Err(CompactLogDecodeError::MalformedRecordError(_))
        ));
    }
}
