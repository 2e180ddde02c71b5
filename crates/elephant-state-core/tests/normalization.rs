// crates/elephant-state-core/tests/normalization.rs
// ============================================================================
// Module: Normalization Tests
// Description: Bucket mapping, shard index, error hashing, and cursor envelopes.
// ============================================================================
//! ## Overview
//! Property and example checks for the pure helpers every backend shares.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use elephant_state_core::Bucket;
use elephant_state_core::SHARD_COUNT;
use elephant_state_core::compute_shard_index;
use elephant_state_core::core::cursor::decode_aggregate_cursor;
use elephant_state_core::core::cursor::decode_error_cursor;
use elephant_state_core::core::cursor::encode_aggregate_cursor;
use elephant_state_core::core::cursor::encode_error_cursor;
use elephant_state_core::core::cursor::initial_shard_positions;
use elephant_state_core::core::shard::shard_key;
use elephant_state_core::create_error_hash;
use elephant_state_core::get_bucket_count_attribute;
use elephant_state_core::normalize_step_status_to_bucket;
use proptest::prelude::*;

// ============================================================================
// SECTION: Buckets
// ============================================================================

/// Each bucket names its own counter attribute.
#[test]
fn test_bucket_count_attributes() {
    assert_eq!(get_bucket_count_attribute(Bucket::InProgress), "inProgressCount");
    assert_eq!(get_bucket_count_attribute(Bucket::Failed), "failedCount");
    assert_eq!(get_bucket_count_attribute(Bucket::Succeeded), "succeededCount");
}

proptest! {
    /// Only the two terminal labels leave the in-progress bucket.
    #[test]
    fn prop_bucket_mapping_is_total(raw in ".{0,24}") {
        let bucket = normalize_step_status_to_bucket(&raw);
        match raw.trim() {
            "SUCCEEDED" => prop_assert_eq!(bucket, Bucket::Succeeded),
            "FAILED" => prop_assert_eq!(bucket, Bucket::Failed),
            _ => prop_assert_eq!(bucket, Bucket::InProgress),
        }
    }

    /// Shard index is deterministic and in range.
    #[test]
    fn prop_shard_index_is_stable_and_bounded(county in "[a-z_]{1,20}", group in "[a-z0-9-]{0,12}") {
        let key = shard_key(&county, &group);
        let first = compute_shard_index(&key);
        prop_assert!(first < SHARD_COUNT);
        prop_assert_eq!(first, compute_shard_index(&key));
    }
}

/// Realistic county names use most shards.
#[test]
fn test_shards_spread_over_realistic_keys() {
    let mut used = [false; 16];
    for index in 0..200 {
        let shard = compute_shard_index(&shard_key(&format!("county_{index}"), "not-set"));
        used[usize::try_from(shard).unwrap()] = true;
    }
    assert!(used.iter().filter(|hit| **hit).count() >= 14);
}

// ============================================================================
// SECTION: Error Hashes
// ============================================================================

/// Error hashes are stable hex digests of the triple.
#[test]
fn test_error_hash_identity() {
    let first = create_error_hash("missing field X", "$.a", "broward");
    let second = create_error_hash("missing field X", "$.a", "broward");
    assert_eq!(first, second);
    assert_eq!(first.as_str().len(), 64);
    assert_ne!(first, create_error_hash("missing field X", "$.b", "broward"));
    assert_ne!(first, create_error_hash("missing field Y", "$.a", "broward"));
}

// ============================================================================
// SECTION: Cursors
// ============================================================================

/// Aggregate cursors keep per-shard positions and drop completed shards.
#[test]
fn test_aggregate_cursor_keeps_positions() {
    let mut positions = initial_shard_positions();
    positions.insert(3, Some("[\"a\",\"b\",\"c\",\"d\"]".to_string()));
    positions.remove(&7);
    let cursor = encode_aggregate_cursor(&positions).unwrap().unwrap();
    let decoded = decode_aggregate_cursor(&cursor).unwrap();
    assert_eq!(decoded, positions);
    assert!(!decoded.contains_key(&7));

    assert!(encode_aggregate_cursor(&std::collections::BTreeMap::new()).unwrap().is_none());
}

/// Envelopes with the wrong version, kind, or shard are rejected.
#[test]
fn test_cursor_envelope_rejections() {
    let bad_version = STANDARD.encode(r#"{"kind":"aggregates","positions":{"0":""},"v":2}"#);
    assert!(decode_aggregate_cursor(&bad_version).is_err());
    let bad_shard = STANDARD.encode(r#"{"kind":"aggregates","positions":{"16":""},"v":1}"#);
    assert!(decode_aggregate_cursor(&bad_shard).is_err());
    let empty = STANDARD.encode(r#"{"kind":"aggregates","positions":{},"v":1}"#);
    assert!(decode_aggregate_cursor(&empty).is_err());
    assert!(decode_aggregate_cursor("not base64!").is_err());

    let error_cursor = encode_error_cursor("{\"totalCount\":3,\"hash\":\"ab\"}").unwrap();
    assert!(decode_aggregate_cursor(&error_cursor).is_err());
    assert_eq!(decode_error_cursor(&error_cursor).unwrap(), "{\"totalCount\":3,\"hash\":\"ab\"}");
}
