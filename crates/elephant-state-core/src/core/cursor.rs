// crates/elephant-state-core/src/core/cursor.rs
// ============================================================================
// Module: Pagination Cursors
// Description: Versioned, backend-agnostic envelope for continuation tokens.
// Purpose: Keep the external cursor contract stable across storage engines.
// Dependencies: base64, serde, serde_jcs
// ============================================================================

//! ## Overview
//! Callers only ever see opaque base64 strings. Inside is a canonical JSON
//! envelope carrying a version, the listing kind, and the backend's native
//! continuation tokens. For cross-shard scans the envelope records one
//! position per shard that still has work; shards absent from the envelope
//! are complete and are never queried again.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::hashing::canonical_json_bytes;
use crate::core::shard::SHARD_COUNT;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Current cursor envelope version.
pub const CURSOR_VERSION: u32 = 1;
/// Maximum accepted encoded cursor length.
const MAX_CURSOR_BYTES: usize = 64 * 1024;
/// Position key used by single-partition listings.
const SINGLE_POSITION_KEY: &str = "0";

// ============================================================================
// SECTION: Types
// ============================================================================

/// Cursor decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    /// Cursor is malformed, from another listing, or from an unknown version.
    #[error("invalid cursor: {0}")]
    Invalid(String),
}

/// Listing a cursor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorKind {
    /// Cross-shard step aggregate scan.
    Aggregates,
    /// Error record listing.
    Errors,
}

/// Serialized cursor envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorEnvelope {
    /// Envelope version.
    v: u32,
    /// Listing kind.
    kind: CursorKind,
    /// Backend-native continuation tokens keyed by position.
    positions: BTreeMap<String, String>,
}

/// Per-shard resume positions. `None` means "start of shard".
pub type ShardPositions = BTreeMap<u32, Option<String>>;

// ============================================================================
// SECTION: Aggregate Cursors
// ============================================================================

/// Returns positions that start every shard from the beginning.
#[must_use]
pub fn initial_shard_positions() -> ShardPositions {
    (0..SHARD_COUNT).map(|shard| (shard, None)).collect()
}

/// Encodes pending shard positions; returns `None` when every shard is done.
///
/// # Errors
///
/// Returns [`CursorError`] when the envelope cannot be serialized.
pub fn encode_aggregate_cursor(positions: &ShardPositions) -> Result<Option<String>, CursorError> {
    if positions.is_empty() {
        return Ok(None);
    }
    let positions = positions
        .iter()
        .map(|(shard, token)| (shard.to_string(), token.clone().unwrap_or_default()))
        .collect();
    encode_envelope(&CursorEnvelope {
        v: CURSOR_VERSION,
        kind: CursorKind::Aggregates,
        positions,
    })
    .map(Some)
}

/// Decodes an aggregate scan cursor into shard positions.
///
/// # Errors
///
/// Returns [`CursorError`] for malformed cursors or out-of-range shards.
pub fn decode_aggregate_cursor(cursor: &str) -> Result<ShardPositions, CursorError> {
    let envelope = decode_envelope(cursor, CursorKind::Aggregates)?;
    if envelope.positions.is_empty() {
        return Err(CursorError::Invalid("aggregate cursor has no pending shards".to_string()));
    }
    let mut positions = ShardPositions::new();
    for (shard, token) in envelope.positions {
        let shard: u32 = shard
            .parse()
            .map_err(|_| CursorError::Invalid(format!("shard index '{shard}' is not numeric")))?;
        if shard >= SHARD_COUNT {
            return Err(CursorError::Invalid(format!("shard index {shard} out of range")));
        }
        positions.insert(shard, if token.is_empty() { None } else { Some(token) });
    }
    Ok(positions)
}

// ============================================================================
// SECTION: Single-Partition Cursors
// ============================================================================

/// Encodes a single backend continuation token for an error listing.
///
/// # Errors
///
/// Returns [`CursorError`] when the envelope cannot be serialized.
pub fn encode_error_cursor(token: &str) -> Result<String, CursorError> {
    let mut positions = BTreeMap::new();
    positions.insert(SINGLE_POSITION_KEY.to_string(), token.to_string());
    encode_envelope(&CursorEnvelope {
        v: CURSOR_VERSION,
        kind: CursorKind::Errors,
        positions,
    })
}

/// Decodes an error listing cursor into the backend continuation token.
///
/// # Errors
///
/// Returns [`CursorError`] when the cursor is malformed or of another kind.
pub fn decode_error_cursor(cursor: &str) -> Result<String, CursorError> {
    let mut envelope = decode_envelope(cursor, CursorKind::Errors)?;
    envelope
        .positions
        .remove(SINGLE_POSITION_KEY)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| CursorError::Invalid("error cursor missing position".to_string()))
}

// ============================================================================
// SECTION: Envelope Helpers
// ============================================================================

/// Serializes and base64-encodes an envelope.
fn encode_envelope(envelope: &CursorEnvelope) -> Result<String, CursorError> {
    let bytes =
        canonical_json_bytes(envelope).map_err(|err| CursorError::Invalid(err.to_string()))?;
    Ok(BASE64.encode(bytes))
}

/// Decodes and validates an envelope of the expected kind.
fn decode_envelope(cursor: &str, expected: CursorKind) -> Result<CursorEnvelope, CursorError> {
    if cursor.len() > MAX_CURSOR_BYTES {
        return Err(CursorError::Invalid("cursor exceeds size limit".to_string()));
    }
    let bytes = BASE64
        .decode(cursor.trim())
        .map_err(|_| CursorError::Invalid("cursor is not base64".to_string()))?;
    let envelope: CursorEnvelope = serde_json::from_slice(&bytes)
        .map_err(|_| CursorError::Invalid("cursor payload is not a cursor envelope".to_string()))?;
    if envelope.v != CURSOR_VERSION {
        return Err(CursorError::Invalid(format!("unsupported cursor version {}", envelope.v)));
    }
    if envelope.kind != expected {
        return Err(CursorError::Invalid("cursor belongs to a different listing".to_string()));
    }
    Ok(envelope)
}
