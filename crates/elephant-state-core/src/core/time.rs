// crates/elephant-state-core/src/core/time.rs
// ============================================================================
// Module: Workflow Timestamps
// Description: UTC timestamps with RFC 3339 wire form and nanosecond ordering.
// Purpose: Give event-time fencing a total order independent of string layout.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! Inbound event times are ISO-8601 / RFC 3339 strings that may use any
//! offset or fractional precision. [`UtcTimestamp`] normalizes them to UTC so
//! that comparisons (and the nanosecond column the durable store fences on)
//! never depend on how the producer formatted the string.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use thiserror::Error;
use time::OffsetDateTime;
use time::UtcOffset;
use time::format_description::well_known::Rfc3339;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Timestamp parsing and conversion errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    /// Input is not a valid RFC 3339 timestamp.
    #[error("invalid timestamp {value:?}: {reason}")]
    Parse {
        /// Raw input value.
        value: String,
        /// Parser failure description.
        reason: String,
    },
    /// Timestamp cannot be represented as signed 64-bit epoch nanoseconds.
    #[error("timestamp out of range: {0}")]
    OutOfRange(String),
}

// ============================================================================
// SECTION: Timestamp
// ============================================================================

/// UTC timestamp with RFC 3339 serialization.
///
/// # Invariants
/// - The wrapped value is always at UTC offset.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcTimestamp(OffsetDateTime);

impl UtcTimestamp {
    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }

    /// Parses an RFC 3339 timestamp and normalizes it to UTC.
    ///
    /// # Errors
    ///
    /// Returns [`TimestampError::Parse`] when the input is malformed.
    pub fn parse(value: &str) -> Result<Self, TimestampError> {
        let parsed =
            OffsetDateTime::parse(value.trim(), &Rfc3339).map_err(|err| TimestampError::Parse {
                value: value.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Self::from_offset_datetime(parsed))
    }

    /// Wraps an arbitrary offset datetime, converting it to UTC.
    #[must_use]
    pub fn from_offset_datetime(value: OffsetDateTime) -> Self {
        Self(value.to_offset(UtcOffset::UTC))
    }

    /// Builds a timestamp from signed epoch nanoseconds.
    ///
    /// # Errors
    ///
    /// Returns [`TimestampError::OutOfRange`] when the value is not representable.
    pub fn from_unix_nanos(nanos: i64) -> Result<Self, TimestampError> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
            .map(Self)
            .map_err(|err| TimestampError::OutOfRange(err.to_string()))
    }

    /// Returns signed epoch nanoseconds.
    ///
    /// # Errors
    ///
    /// Returns [`TimestampError::OutOfRange`] for instants beyond year 2262.
    pub fn unix_nanos(&self) -> Result<i64, TimestampError> {
        i64::try_from(self.0.unix_timestamp_nanos())
            .map_err(|_| TimestampError::OutOfRange(self.to_rfc3339()))
    }

    /// Returns the canonical RFC 3339 representation.
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        self.0.format(&Rfc3339).unwrap_or_else(|_| self.0.unix_timestamp().to_string())
    }

    /// Returns the underlying datetime.
    #[must_use]
    pub const fn as_offset_datetime(&self) -> OffsetDateTime {
        self.0
    }
}

impl fmt::Debug for UtcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UtcTimestamp({})", self.to_rfc3339())
    }
}

impl fmt::Display for UtcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl Serialize for UtcTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for UtcTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
