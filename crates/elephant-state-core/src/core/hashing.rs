// crates/elephant-state-core/src/core/hashing.rs
// ============================================================================
// Module: Content Hashing
// Description: RFC 8785 canonical JSON hashing and error identity hashes.
// Purpose: Give identical error reports the same identity across executions.
// Dependencies: serde, serde_jcs, sha2
// ============================================================================

//! ## Overview
//! Error records are content-addressed. The identity of an error is the
//! SHA-256 digest of the canonical JSON encoding of its normalized
//! `(message, path, county)` triple, so the hash never depends on which
//! execution observed the error, on field ordering, or on the process that
//! computed it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

use crate::core::identifiers::ErrorHash;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when computing canonical hashes.
#[derive(Debug, Error)]
pub enum HashError {
    /// JSON canonicalization failed.
    #[error("failed to canonicalize json: {0}")]
    Canonicalization(String),
}

// ============================================================================
// SECTION: Hashing Helpers
// ============================================================================

/// Returns canonical JSON bytes for a serializable value using RFC 8785.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn canonical_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    serde_jcs::to_vec(value).map_err(|err| HashError::Canonicalization(err.to_string()))
}

/// Hashes raw bytes with SHA-256 and returns lowercase hex.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

/// Hashes raw bytes with SHA-256 and returns the raw digest.
#[must_use]
pub fn sha256_digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

// ============================================================================
// SECTION: Error Identity
// ============================================================================

/// Canonical hash input for an error identity.
#[derive(Serialize)]
struct ErrorIdentity<'a> {
    /// County the error was observed in.
    county: &'a str,
    /// Normalized error message.
    message: &'a str,
    /// Normalized JSON path.
    path: &'a str,
}

/// Computes the stable content hash for an error triple.
///
/// Inputs are expected to be normalized already; the hash is the only
/// identity an error record has.
#[must_use]
pub fn create_error_hash(message: &str, path: &str, county: &str) -> ErrorHash {
    let identity = ErrorIdentity {
        county,
        message,
        path,
    };
    // Plain string fields always canonicalize; the fallback keeps the
    // function total without changing the digest for valid input.
    let bytes = canonical_json_bytes(&identity)
        .unwrap_or_else(|_| format!("{county}\u{0}{message}\u{0}{path}").into_bytes());
    ErrorHash::new(sha256_hex(&bytes))
}

// ============================================================================
// SECTION: Hex Encoding
// ============================================================================

/// Encodes bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
