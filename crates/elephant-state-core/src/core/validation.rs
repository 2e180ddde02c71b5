// crates/elephant-state-core/src/core/validation.rs
// ============================================================================
// Module: Inbound Validation
// Description: Field-level checks applied before any write is attempted.
// Purpose: Reject malformed payloads at the boundary with precise messages.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! Inbound notifications and error reports are untrusted. These helpers trim
//! fields, enforce non-emptiness, and bound sizes so that nothing malformed
//! ever reaches a store.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum length of identifier-like fields (ids, county, phase, step).
pub const MAX_FIELD_BYTES: usize = 512;
/// Maximum length of a task token.
pub const MAX_TASK_TOKEN_BYTES: usize = 4096;
/// Maximum length of an error message.
pub const MAX_ERROR_MESSAGE_BYTES: usize = 8 * 1024;
/// Maximum number of error rows in one report.
pub const MAX_ERROR_ROWS: usize = 10_000;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Malformed inbound payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation error: {0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    /// Builds a validation error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Trims a required field and checks it is non-empty and bounded.
///
/// # Errors
///
/// Returns [`ValidationError`] when the field is blank or too long.
pub fn require_field(field: &str, value: &str, max_bytes: usize) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(format!("{field} must be non-empty")));
    }
    if trimmed.len() > max_bytes {
        return Err(ValidationError::new(format!("{field} exceeds {max_bytes} bytes")));
    }
    Ok(trimmed.to_string())
}

/// Trims an optional field; blank values become `None`.
///
/// # Errors
///
/// Returns [`ValidationError`] when the field is too long.
pub fn optional_field(
    field: &str,
    value: Option<&str>,
    max_bytes: usize,
) -> Result<Option<String>, ValidationError> {
    match value.map(str::trim) {
        Some(trimmed) if !trimmed.is_empty() => {
            if trimmed.len() > max_bytes {
                return Err(ValidationError::new(format!("{field} exceeds {max_bytes} bytes")));
            }
            Ok(Some(trimmed.to_string()))
        }
        _ => Ok(None),
    }
}

/// Collapses runs of whitespace into single spaces and trims the ends.
#[must_use]
pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
