// crates/elephant-state-core/src/core/shard.rs
// ============================================================================
// Module: Shard Assignment
// Description: Deterministic hash sharding for the aggregate query index.
// Purpose: Spread full-fleet aggregate scans over a fixed set of partitions.
// Dependencies: crate::core::hashing
// ============================================================================

//! ## Overview
//! Aggregates are assigned to one of [`SHARD_COUNT`] shards at write time by
//! hashing `county#dataGroupLabel`. All aggregates for one county and data
//! group therefore share a shard, and a full scan is one bounded query per
//! shard. The hash is SHA-256 based so the assignment is identical on every
//! platform and release.

// ============================================================================
// SECTION: Imports
// ============================================================================

use crate::core::hashing::sha256_digest;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Fixed number of aggregate index shards.
pub const SHARD_COUNT: u32 = 16;

// ============================================================================
// SECTION: Shard Helpers
// ============================================================================

/// Maps a string key to a shard in `[0, SHARD_COUNT)`.
#[must_use]
pub fn compute_shard_index(key: &str) -> u32 {
    let digest = sha256_digest(key.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % SHARD_COUNT
}

/// Builds the shard key for a county and normalized data-group label.
#[must_use]
pub fn shard_key(county: &str, data_group_label: &str) -> String {
    format!("{county}#{data_group_label}")
}

/// Returns the shard that holds aggregates for a county and data group.
#[must_use]
pub fn shard_for(county: &str, data_group_label: &str) -> u32 {
    compute_shard_index(&shard_key(county, data_group_label))
}

/// Iterates every shard index.
pub fn all_shards() -> impl Iterator<Item = u32> {
    0..SHARD_COUNT
}
