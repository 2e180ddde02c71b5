// crates/elephant-state-core/src/core/error_record.rs
// ============================================================================
// Module: Error Records
// Description: Deduplicated error catalogue, execution links, and rollups.
// Purpose: Track which distinct validation errors recur and where.
// Dependencies: serde, serde_json, crate::core
// ============================================================================

//! ## Overview
//! Error reports arrive as rows of `{error_message, error_path,
//! data_group_cid}`. Rows are normalized, hashed with their county into an
//! [`ErrorHash`], and merged so that one report contributes one
//! [`ErrorOccurrence`] per distinct error. Stores turn occurrences into
//! [`ErrorRecord`] upserts and [`ExecutionErrorLink`] upserts;
//! [`FailedExecutionItem`] is the derived per-execution rollup.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::core::hashing::create_error_hash;
use crate::core::identifiers::ErrorHash;
use crate::core::identifiers::ExecutionId;
use crate::core::status::ErrorStatus;
use crate::core::time::UtcTimestamp;
use crate::core::validation::MAX_ERROR_MESSAGE_BYTES;
use crate::core::validation::MAX_ERROR_ROWS;
use crate::core::validation::MAX_FIELD_BYTES;
use crate::core::validation::ValidationError;
use crate::core::validation::collapse_whitespace;
use crate::core::validation::optional_field;
use crate::core::validation::require_field;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Error type used when a message carries no classification prefix.
pub const DEFAULT_ERROR_TYPE: &str = "validation";
/// Maximum length of a classification prefix.
const MAX_ERROR_TYPE_BYTES: usize = 64;

// ============================================================================
// SECTION: Inbound Rows
// ============================================================================

/// One row of an error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRow {
    /// Error message.
    pub error_message: String,
    /// JSON path the error refers to.
    #[serde(default)]
    pub error_path: String,
    /// Optional data-group content identifier.
    #[serde(default)]
    pub data_group_cid: Option<String>,
}

/// Error report for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Owning execution.
    pub execution_id: String,
    /// County the execution processes.
    pub county: String,
    /// Optional idempotency token for redelivered reports.
    #[serde(default)]
    pub report_id: Option<String>,
    /// Error rows.
    #[serde(alias = "errors")]
    pub rows: Vec<ErrorRow>,
}

// ============================================================================
// SECTION: Stored Records
// ============================================================================

/// Deduplicated, content-addressed error record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Content hash (error code).
    #[serde(alias = "hash")]
    pub error_code: ErrorHash,
    /// Classification prefix.
    pub error_type: String,
    /// Sum of occurrences ever linked to this error.
    pub total_count: u64,
    /// Lifecycle status.
    pub error_status: ErrorStatus,
    /// Most recent execution that reported the error.
    pub latest_execution_id: ExecutionId,
    /// Opaque error details.
    pub error_details: Value,
    /// Creation time.
    pub created_at: UtcTimestamp,
    /// Last update time.
    pub updated_at: UtcTimestamp,
}

/// Association between one execution and one error record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionErrorLink {
    /// Execution identifier.
    pub execution_id: ExecutionId,
    /// Error record hash.
    pub error_code: ErrorHash,
    /// Occurrences within this execution.
    pub occurrences: u64,
    /// Link status.
    pub status: ErrorStatus,
    /// Opaque error details from the latest report.
    pub error_details: Value,
    /// County name.
    pub county: String,
    /// Creation time.
    pub created_at: UtcTimestamp,
    /// Last update time.
    pub updated_at: UtcTimestamp,
}

/// Link joined with the record-level fields it rolls up against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedError {
    /// The execution link.
    #[serde(flatten)]
    pub link: ExecutionErrorLink,
    /// Record classification prefix.
    pub error_type: String,
    /// Record lifecycle status.
    pub error_status: ErrorStatus,
    /// Record total count across executions.
    pub total_count: u64,
}

// ============================================================================
// SECTION: Normalized Batches
// ============================================================================

/// One distinct error within a report, with its per-report count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorOccurrence {
    /// Content hash.
    pub hash: ErrorHash,
    /// Classification prefix.
    pub error_type: String,
    /// Number of identical rows in the report.
    pub occurrences: u64,
    /// Details payload stored on the record and link.
    pub details: Value,
}

/// Normalized, merged error report ready for a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBatch {
    /// Owning execution.
    pub execution_id: ExecutionId,
    /// County name.
    pub county: String,
    /// Optional idempotency token.
    pub idempotency_key: Option<String>,
    /// Distinct errors, ordered by hash.
    pub occurrences: Vec<ErrorOccurrence>,
    /// Time the batch was processed.
    pub observed_at: UtcTimestamp,
}

impl ErrorBatch {
    /// Validates and merges report rows into a batch.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when ids are blank, a row has no message,
    /// or the report is oversized.
    pub fn from_rows(
        execution_id: &str,
        county: &str,
        idempotency_key: Option<&str>,
        rows: &[ErrorRow],
        observed_at: UtcTimestamp,
    ) -> Result<Self, ValidationError> {
        let execution_id = require_field("executionId", execution_id, MAX_FIELD_BYTES)?;
        let county = require_field("county", county, MAX_FIELD_BYTES)?;
        let idempotency_key = optional_field("reportId", idempotency_key, MAX_FIELD_BYTES)?;
        if rows.len() > MAX_ERROR_ROWS {
            return Err(ValidationError::new(format!(
                "error report exceeds {MAX_ERROR_ROWS} rows"
            )));
        }
        let mut merged: BTreeMap<ErrorHash, ErrorOccurrence> = BTreeMap::new();
        for (index, row) in rows.iter().enumerate() {
            let message = collapse_whitespace(&row.error_message);
            if message.is_empty() {
                return Err(ValidationError::new(format!("errors[{index}].error_message is empty")));
            }
            if message.len() > MAX_ERROR_MESSAGE_BYTES {
                return Err(ValidationError::new(format!(
                    "errors[{index}].error_message exceeds {MAX_ERROR_MESSAGE_BYTES} bytes"
                )));
            }
            let path = row.error_path.trim().to_string();
            let cid = optional_field(
                "data_group_cid",
                row.data_group_cid.as_deref(),
                MAX_FIELD_BYTES,
            )?;
            let hash = create_error_hash(&message, &path, &county);
            if let Some(existing) = merged.get_mut(&hash) {
                existing.occurrences += 1;
                continue;
            }
            let details = error_details(&message, &path, &county, cid.as_deref());
            merged.insert(
                hash.clone(),
                ErrorOccurrence {
                    hash,
                    error_type: classify_error_type(&message),
                    occurrences: 1,
                    details,
                },
            );
        }
        Ok(Self {
            execution_id: ExecutionId::new(execution_id),
            county,
            idempotency_key,
            occurrences: merged.into_values().collect(),
            observed_at,
        })
    }

    /// Returns the summed occurrence count of the batch.
    #[must_use]
    pub fn total_occurrences(&self) -> u64 {
        self.occurrences.iter().map(|occurrence| occurrence.occurrences).sum()
    }
}

/// Derives the classification prefix of a normalized message.
///
/// `"SchemaError: missing field"` classifies as `SchemaError`; messages with
/// no identifier-shaped prefix classify as [`DEFAULT_ERROR_TYPE`].
#[must_use]
pub fn classify_error_type(message: &str) -> String {
    let Some((prefix, _)) = message.split_once(':') else {
        return DEFAULT_ERROR_TYPE.to_string();
    };
    let prefix = prefix.trim();
    let valid = !prefix.is_empty()
        && prefix.len() <= MAX_ERROR_TYPE_BYTES
        && prefix.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
    if valid { prefix.to_string() } else { DEFAULT_ERROR_TYPE.to_string() }
}

/// Builds the opaque details payload for an error.
fn error_details(message: &str, path: &str, county: &str, cid: Option<&str>) -> Value {
    let mut details = Map::new();
    details.insert("errorMessage".to_string(), Value::String(message.to_string()));
    details.insert("errorPath".to_string(), Value::String(path.to_string()));
    details.insert("county".to_string(), Value::String(county.to_string()));
    if let Some(cid) = cid {
        details.insert("dataGroupCid".to_string(), Value::String(cid.to_string()));
    }
    Value::Object(details)
}

// ============================================================================
// SECTION: Failed Execution Rollup
// ============================================================================

/// Per-execution error rollup used to pick repair candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedExecutionItem {
    /// Execution identifier.
    pub execution_id: ExecutionId,
    /// Dominant error type (most occurrences, ties broken by name).
    pub error_type: String,
    /// Distinct errors linked to the execution.
    pub unique_error_count: u64,
    /// Distinct linked errors whose record is still `failed`.
    pub open_error_count: u64,
    /// Summed occurrences across links.
    pub total_occurrences: u64,
    /// Callback token when the execution state carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_token: Option<String>,
    /// Rolled-up error status.
    pub status: ErrorStatus,
}

impl FailedExecutionItem {
    /// Computes the rollup from an execution's linked errors.
    ///
    /// When `error_type` is set only links whose record type starts with it
    /// are counted. Returns `None` when no link qualifies.
    #[must_use]
    pub fn from_links(
        execution_id: &ExecutionId,
        links: &[LinkedError],
        error_type: Option<&str>,
        task_token: Option<String>,
    ) -> Option<Self> {
        let selected: Vec<&LinkedError> = links
            .iter()
            .filter(|linked| error_type.is_none_or(|prefix| linked.error_type.starts_with(prefix)))
            .collect();
        if selected.is_empty() {
            return None;
        }
        let mut per_type: BTreeMap<&str, u64> = BTreeMap::new();
        for linked in &selected {
            *per_type.entry(linked.error_type.as_str()).or_default() += linked.link.occurrences;
        }
        let dominant = per_type
            .iter()
            .fold(None::<(&str, u64)>, |best, (name, count)| match best {
                Some((_, best_count)) if best_count >= *count => best,
                _ => Some((name, *count)),
            })
            .map_or_else(|| DEFAULT_ERROR_TYPE.to_string(), |(name, _)| name.to_string());
        let unique = u64::try_from(selected.len()).unwrap_or(u64::MAX);
        let open = u64::try_from(
            selected.iter().filter(|linked| linked.error_status.is_open()).count(),
        )
        .unwrap_or(u64::MAX);
        let total = selected.iter().map(|linked| linked.link.occurrences).sum();
        Some(Self {
            execution_id: execution_id.clone(),
            error_type: dominant,
            unique_error_count: unique,
            open_error_count: open,
            total_occurrences: total,
            task_token,
            status: rollup_status(&selected),
        })
    }
}

/// Rolls link statuses up into one execution-level status.
fn rollup_status(selected: &[&LinkedError]) -> ErrorStatus {
    let has = |status: ErrorStatus| selected.iter().any(|linked| linked.error_status == status);
    if has(ErrorStatus::Failed) {
        ErrorStatus::Failed
    } else if has(ErrorStatus::MaybeUnrecoverable) {
        ErrorStatus::MaybeUnrecoverable
    } else if has(ErrorStatus::MaybeSolved) {
        ErrorStatus::MaybeSolved
    } else {
        ErrorStatus::Solved
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
