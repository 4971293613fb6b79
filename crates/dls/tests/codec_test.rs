//! Property-based tests for the block codecs and level selection.
//!
//! The table of fixed level selections lives with `optimal_level`.
//!
//! Every stream is encoded block by block and decoded the way the chunk
//! reader does it: values withheld by a lapped codec are collected from the
//! next record or the flush record.

use dls::reader::optimal_level;
use dls::store::codec::{self, Codec};
use dls::store::ByteOrder;
use dls::Format;
use proptest::prelude::*;

/// Encodes `values` in blocks of `block` and decodes them again.
fn roundtrip(format: Format, values: &[f64], block: usize) -> Vec<f64> {
    let mut encoder: Box<dyn Codec<f64>> = codec::create(&format, ByteOrder::LittleEndian).unwrap();
    let records: Vec<(Vec<u8>, usize)> = values
        .chunks(block)
        .map(|chunk| (encoder.compress(chunk).unwrap(), chunk.len()))
        .collect();
    let flush = encoder.flush_compress().unwrap();

    let mut decoder: Box<dyn Codec<f64>> = codec::create(&format, ByteOrder::LittleEndian).unwrap();
    let mut out = Vec::with_capacity(values.len());
    for (payload, count) in &records {
        let decoded = decoder.decompress(payload, *count).unwrap();
        out.extend(decoded.carried);
        out.extend(decoded.values);
    }
    if let Some(flush) = flush {
        out.extend(decoder.flush_decompress(&flush).unwrap());
    }
    assert!(!decoder.has_pending());
    out
}

/// Strategy for sample streams with occasional jumps.
fn stream_strategy() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-1000.0f64..1000.0, 1..600)
}

proptest! {
    /// Test that zlib blocks decode to the exact input.
    #[test]
    fn test_zlib_is_exact(values in stream_strategy(), block in 1usize..100) {
        let out = roundtrip(Format::Zlib, &values, block);
        prop_assert_eq!(out, values);
    }

    /// Test that quantized blocks stay within the configured accuracy.
    #[test]
    fn test_quant_within_accuracy(
        values in stream_strategy(),
        block in 1usize..100,
        accuracy in 0.001f64..10.0,
    ) {
        let out = roundtrip(Format::Quant { accuracy }, &values, block);
        prop_assert_eq!(out.len(), values.len());
        for (a, b) in values.iter().zip(&out) {
            prop_assert!((a - b).abs() <= accuracy, "{} vs {}", a, b);
        }
    }

    /// Test that the lapped transform stays within the configured accuracy
    /// across record boundaries.
    #[test]
    fn test_mdct_within_accuracy(
        values in stream_strategy(),
        block in 1usize..200,
        exponent in 4u32..=10,
        accuracy in 0.001f64..1.0,
    ) {
        let format = Format::Mdct { block_size: 1 << exponent, accuracy };
        let out = roundtrip(format, &values, block);
        prop_assert_eq!(out.len(), values.len());
        for (a, b) in values.iter().zip(&out) {
            prop_assert!((a - b).abs() <= accuracy, "{} vs {}", a, b);
        }
    }

    /// Test that the chosen level yields at least `min_values` values and the
    /// next coarser one fewer.
    #[test]
    fn test_level_matches_min_values(
        frequency in 0.1f64..10_000.0,
        seconds in 1u64..1_000_000,
        reduction in 2u32..20,
        min_values in 1u32..100_000,
    ) {
        let level = optimal_level(frequency, seconds * 1_000_000, reduction, min_values);
        let values_at = |l: u32| frequency * seconds as f64 / f64::from(reduction).powi(l as i32);
        let total = values_at(0);
        if total >= f64::from(min_values) * f64::from(reduction) {
            prop_assert!(values_at(level) >= f64::from(min_values) * (1.0 - 1e-9));
        } else {
            prop_assert_eq!(level, 0);
        }
        prop_assert!(values_at(level + 1) < f64::from(min_values) * (1.0 + 1e-9));
    }
}
