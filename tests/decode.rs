//! End-to-end decoding of compact records

mod common;

use common::*;
use compact_log_decoder::{CompactLogDecodeError, CompactLogDecoder, DEFAULT_MAX_RESULT_LEN};

#[test]
fn decodes_integer_record() {
    let mut decoder = CompactLogDecoder::new().expect("Failed to create decoder");
    let output = decoder
        .decode("An Integer Format String: %d", &record(10, vec![int(11)]))
        .expect("Decode failed");

    assert_eq!(output, b"An Integer Format String: 11");
}

#[test]
fn decodes_mixed_record() {
    let mut decoder = CompactLogDecoder::new().unwrap();
    let bytes = record(
        2,
        vec![
            text("eth0"),
            int(3),
            wide(-9_000_000_000),
            float(0.5),
        ],
    );

    let output = decoder
        .decode("%s: link %d, %lld bytes, load %.2f", &bytes)
        .unwrap();
    assert_eq!(as_text(output), "eth0: link 3, -9000000000 bytes, load 0.50");
}

#[test]
fn wide_value_after_int_is_read_from_aligned_slot() {
    let mut decoder = CompactLogDecoder::new().unwrap();

    let output = decoder
        .decode("%d %lld", &record(1, vec![int(1), wide(2)]))
        .unwrap();
    assert_eq!(output, b"1 2");

    let output = decoder
        .decode("%d %f", &record(1, vec![int(-1), float(1.25)]))
        .unwrap();
    assert_eq!(output, b"-1 1.250000");
}

#[test]
fn record_without_arguments() {
    let mut decoder = CompactLogDecoder::new().unwrap();
    let output = decoder.decode("boot complete", &record(0, vec![])).unwrap();
    assert_eq!(output, b"boot complete");
}

#[test]
fn integer_argument_keeps_low_bits() {
    let mut decoder = CompactLogDecoder::new().unwrap();
    let output = decoder
        .decode("%d %u", &record(0, vec![int(0xFFFF_FFFF), int(0x1_0000_0002)]))
        .unwrap();
    assert_eq!(output, b"-1 2");
}

#[test]
fn output_truncated_to_limit() {
    let mut decoder = CompactLogDecoder::new().unwrap();
    let bytes = record(0, vec![text("abcdefghij")]);

    let output = decoder.decode_with_limit("%s", &bytes, 4).unwrap();
    assert_eq!(output, b"abc");

    let output = decoder.decode_with_limit("%s", &bytes, 1).unwrap();
    assert!(output.is_empty());

    let output = decoder.decode_with_limit("%s", &bytes, 0).unwrap();
    assert!(output.is_empty());

    assert_eq!(decoder.live_allocations().unwrap(), 0);
}

#[test]
fn long_output_limited_by_default() {
    let mut decoder = CompactLogDecoder::new().unwrap();
    let output = decoder
        .decode("%1000d", &record(0, vec![int(7)]))
        .unwrap();

    assert_eq!(output.len(), DEFAULT_MAX_RESULT_LEN - 1);
    assert!(output.iter().all(|&b| b == b' '));
}

#[test]
fn fresh_decoders_agree() {
    let bytes = record(5, vec![text("a"), wide(1 << 40), float(-2.5), int(9)]);
    let format = "%s|%lld|%g|%x";

    let first = CompactLogDecoder::new().unwrap().decode(format, &bytes).unwrap();
    let second = CompactLogDecoder::new().unwrap().decode(format, &bytes).unwrap();

    assert_eq!(first, second);
    assert_eq!(as_text(first), "a|1099511627776|-2.5|9");
}

#[test]
fn repeated_decodes_on_one_decoder() {
    let mut decoder = CompactLogDecoder::new().unwrap();
    for i in 0..200 {
        let output = decoder
            .decode("tick %d %s", &record(1, vec![int(i), text("ok")]))
            .unwrap();
        assert_eq!(as_text(output), format!("tick {} ok", i));
    }
    assert_eq!(decoder.live_allocations().unwrap(), 0);
}

#[test]
fn malformed_record_rejected_before_sandbox() {
    let mut decoder = CompactLogDecoder::new().unwrap();

    let result = decoder.decode("%d", &encode(&int(4)));
    assert!(matches!(
        result,
        Err(CompactLogDecodeError::MalformedRecordError(_))
    ));

    let result = decoder.decode("%d", &[0xA1]);
    assert!(matches!(
        result,
        Err(CompactLogDecodeError::MalformedRecordError(_))
    ));

    assert_eq!(decoder.allocations_requested(), 0);
    assert_eq!(decoder.live_allocations().unwrap(), 0);
}

#[test]
fn unhashable_key_rejected() {
    use ciborium::value::Value;

    let mut decoder = CompactLogDecoder::new().unwrap();
    let key = Value::Tag(1000, Box::new(Value::Array(vec![])));
    let map = Value::Map(vec![(key, int(1))]);
    let bytes = encode(&Value::Array(vec![int(1), map]));

    let result = decoder.decode("%d", &bytes);
    assert!(matches!(
        result,
        Err(CompactLogDecodeError::UnhashableTagError { tag: 1000 })
    ));

    let map = Value::Map(vec![(Value::Array(vec![]), int(1))]);
    let result = decoder.decode("%d", &encode(&Value::Array(vec![int(1), map])));
    assert!(matches!(
        result,
        Err(CompactLogDecodeError::MalformedRecordError(_))
    ));

    assert_eq!(decoder.allocations_requested(), 0);
    assert_eq!(decoder.live_allocations().unwrap(), 0);
}
