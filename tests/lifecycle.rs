//! Allocation bookkeeping and fault isolation

mod common;

use common::*;
use compact_log_decoder::wasm::engine::SandboxImage;
use compact_log_decoder::{
    CompactLogDecodeError, CompactLogDecoder, EngineConfig, TypedArgument,
};
use proptest::prelude::*;

fn assert_render_fault(result: Result<Vec<u8>, CompactLogDecodeError>) {
    assert!(
        matches!(result, Err(CompactLogDecodeError::RenderFaultError(_))),
        "expected a render fault, got {result:?}"
    );
}

#[test]
fn unsupported_conversions_fault() {
    let mut decoder = CompactLogDecoder::new().unwrap();

    for format in ["%n", "%a", "%y", "trailing %", "%lln"] {
        let result = decoder.decode_from_arguments(format, &[TypedArgument::Int32(0)]);
        assert_render_fault(result);
        assert_eq!(decoder.live_allocations().unwrap(), 0, "{format:?}");
    }
}

#[test]
fn wild_pointer_faults() {
    let mut decoder = CompactLogDecoder::new().unwrap();
    let result = decoder.decode("%s", &record(0, vec![int(i32::MAX as i64)]));

    assert_render_fault(result);
    assert_eq!(decoder.live_allocations().unwrap(), 0);
}

#[test]
fn decoder_usable_after_fault() {
    let mut decoder = CompactLogDecoder::new().unwrap();

    assert_render_fault(decoder.decode("%n", &record(0, vec![int(1)])));
    let output = decoder
        .decode("value %d", &record(0, vec![int(1)]))
        .unwrap();
    assert_eq!(output, b"value 1");
}

#[test]
fn fuel_exhaustion_faults() {
    let config = EngineConfig::default().with_force_jit(true).with_fuel(2_000);
    let image = SandboxImage::load(&config).unwrap();
    let mut decoder = CompactLogDecoder::with_image(&image).unwrap();

    let format = "x".repeat(2_000);
    let result = decoder.decode_from_arguments_with_limit(&format, &[], 4_096);

    assert_render_fault(result);
    assert_eq!(decoder.live_allocations().unwrap(), 0);
}

#[test]
fn oversized_limit_fails_cleanly() {
    let mut decoder = CompactLogDecoder::new().unwrap();
    let result =
        decoder.decode_from_arguments_with_limit("%d", &[TypedArgument::Int32(1)], 1 << 30);

    assert!(matches!(
        result,
        Err(CompactLogDecodeError::AllocationError { .. })
    ));
    assert_eq!(decoder.live_allocations().unwrap(), 0);
}

#[test]
fn large_results_grow_memory() {
    let mut decoder = CompactLogDecoder::new().unwrap();
    let output = decoder
        .decode_from_arguments_with_limit("%200000d", &[TypedArgument::Int32(1)], 300_000)
        .unwrap();

    assert_eq!(output.len(), 200_000);
    assert_eq!(output.last(), Some(&b'1'));
    assert_eq!(decoder.live_allocations().unwrap(), 0);
}

#[test]
fn zero_allocations_for_malformed_input() {
    let mut decoder = CompactLogDecoder::new().unwrap();

    for bytes in [vec![], encode(&text("not a record")), encode(&float(1.0))] {
        let result = decoder.decode("%d", &bytes);
        assert!(matches!(
            result,
            Err(CompactLogDecodeError::MalformedRecordError(_))
        ));
    }
    assert_eq!(decoder.allocations_requested(), 0);

    // A warm decoder stays untouched as well
    decoder.decode("%d", &record(1, vec![int(2)])).unwrap();
    let before = decoder.allocations_requested();
    assert!(decoder.decode("%d", &encode(&float(1.0))).is_err());
    assert_eq!(decoder.allocations_requested(), before);
    assert_eq!(decoder.live_allocations().unwrap(), 0);
}

fn argument() -> impl Strategy<Value = (TypedArgument, &'static str)> {
    prop_oneof![
        any::<i32>().prop_map(|v| (TypedArgument::Int32(v), "%d")),
        any::<i64>().prop_map(|v| (TypedArgument::Int64(v), "%lld")),
        (-1e12f64..1e12).prop_map(|v| (TypedArgument::Double(v), "%g")),
        "[a-z ]{0,16}".prop_map(|v| (TypedArgument::StringRef(v), "%s")),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_no_leaks(arguments in prop::collection::vec(argument(), 0..10), limit in 0usize..96) {
        let mut decoder = CompactLogDecoder::new().unwrap();
        let format: Vec<&str> = arguments.iter().map(|(_, conversion)| *conversion).collect();
        let arguments: Vec<TypedArgument> = arguments.into_iter().map(|(arg, _)| arg).collect();

        let output = decoder
            .decode_from_arguments_with_limit(&format.join(","), &arguments, limit)
            .unwrap();

        prop_assert!(output.len() < limit.max(1));
        prop_assert_eq!(decoder.live_allocations().unwrap(), 0);
    }
}
