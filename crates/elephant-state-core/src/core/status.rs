// crates/elephant-state-core/src/core/status.rs
// ============================================================================
// Module: Status Vocabulary
// Description: Bucket classification, data-group normalization, error status.
// Purpose: Collapse open-ended upstream vocabularies into closed enums.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Upstream producers report a raw status from a vocabulary that grows over
//! time. Aggregation only ever groups by the three [`Bucket`] values, so the
//! mapping from raw status to bucket is total: anything that is not an exact
//! `SUCCEEDED` or `FAILED` counts as in progress.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Sentinel data-group label used when the producer omits one.
pub const DATA_GROUP_NOT_SET: &str = "not-set";

// ============================================================================
// SECTION: Buckets
// ============================================================================

/// Coarse execution status used as the aggregate grouping dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Bucket {
    /// Execution is running, scheduled, parked, or in any unknown state.
    InProgress,
    /// Execution failed.
    Failed,
    /// Execution succeeded.
    Succeeded,
}

impl Bucket {
    /// All buckets in counter order.
    pub const ALL: [Self; 3] = [Self::InProgress, Self::Failed, Self::Succeeded];

    /// Returns the stable wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Failed => "FAILED",
            Self::Succeeded => "SUCCEEDED",
        }
    }

    /// Parses a stored bucket label.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "IN_PROGRESS" => Some(Self::InProgress),
            "FAILED" => Some(Self::Failed),
            "SUCCEEDED" => Some(Self::Succeeded),
            _ => None,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a raw step status onto its aggregate bucket.
///
/// Only exact `SUCCEEDED` and `FAILED` leave the in-progress bucket; every
/// other value (`IN_PROGRESS`, `SCHEDULED`, `PARKED`, future additions) is
/// in progress.
#[must_use]
pub fn normalize_step_status_to_bucket(raw_status: &str) -> Bucket {
    match raw_status.trim() {
        "SUCCEEDED" => Bucket::Succeeded,
        "FAILED" => Bucket::Failed,
        _ => Bucket::InProgress,
    }
}

/// Trims a data-group label, collapsing empty or missing labels to
/// [`DATA_GROUP_NOT_SET`].
#[must_use]
pub fn normalize_data_group_label(label: Option<&str>) -> String {
    match label.map(str::trim) {
        Some(trimmed) if !trimmed.is_empty() => trimmed.to_string(),
        _ => DATA_GROUP_NOT_SET.to_string(),
    }
}

/// Returns the counter attribute name that tracks the given bucket.
#[must_use]
pub const fn get_bucket_count_attribute(bucket: Bucket) -> &'static str {
    match bucket {
        Bucket::InProgress => "inProgressCount",
        Bucket::Failed => "failedCount",
        Bucket::Succeeded => "succeededCount",
    }
}

// ============================================================================
// SECTION: Error Status
// ============================================================================

/// Lifecycle status of a deduplicated error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorStatus {
    /// Error observed and not yet addressed.
    Failed,
    /// Candidate fix published, awaiting confirmation.
    MaybeSolved,
    /// Fix confirmed by a later successful observation.
    Solved,
    /// Repair attempts exhausted.
    MaybeUnrecoverable,
}

impl ErrorStatus {
    /// Returns the stable wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Failed => "failed",
            Self::MaybeSolved => "maybeSolved",
            Self::Solved => "solved",
            Self::MaybeUnrecoverable => "maybeUnrecoverable",
        }
    }

    /// Returns true when the error still needs a repair attempt.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "failed" => Ok(Self::Failed),
            "maybeSolved" => Ok(Self::MaybeSolved),
            "solved" => Ok(Self::Solved),
            "maybeUnrecoverable" => Ok(Self::MaybeUnrecoverable),
            other => Err(format!("unknown error status: {other}")),
        }
    }
}

// ============================================================================
// SECTION: Sort Order
// ============================================================================

/// Ranking direction for error-count selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Highest unique-error count first.
    #[default]
    Most,
    /// Lowest unique-error count first.
    Least,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "most" => Ok(Self::Most),
            "least" => Ok(Self::Least),
            other => Err(format!("unknown sort order: {other}")),
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
