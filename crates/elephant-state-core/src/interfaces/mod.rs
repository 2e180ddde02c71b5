// crates/elephant-state-core/src/interfaces/mod.rs
// ============================================================================
// Module: Store Interfaces
// Description: Backend-agnostic contracts for state, aggregate, and error stores.
// Purpose: Define the surfaces the ingest and query services are built on.
// Dependencies: serde, serde_json, thiserror, crate::core
// ============================================================================

//! ## Overview
//! Every backend implements three traits. [`ExecutionStateStore`] owns the
//! fenced upsert and must commit the state write and both counter deltas as
//! one atomic unit. [`AggregateIndex`] serves partition-scoped aggregate
//! reads. [`ErrorRecordStore`] owns the deduplicated error catalogue and its
//! execution links. Fencing rejections are results, never errors.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::ErrorBatch;
use crate::core::ErrorHash;
use crate::core::ErrorRecord;
use crate::core::ErrorStatus;
use crate::core::ExecutionId;
use crate::core::ExecutionState;
use crate::core::ExecutionUpdate;
use crate::core::LinkedError;
use crate::core::SortOrder;
use crate::core::StepAggregate;
use crate::core::StepKey;
use crate::core::UtcTimestamp;

// ============================================================================
// SECTION: Idempotency Ledger
// ============================================================================

/// Ledger scope for notification event ids.
pub const EVENT_TOKEN_SCOPE: &str = "execution_event";
/// Ledger scope for error report idempotency keys.
pub const REPORT_TOKEN_SCOPE: &str = "error_report";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Store errors.
///
/// # Invariants
/// - A returned error means nothing from the failed call is visible.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Store I/O error.
    #[error("workflow store io error: {0}")]
    Io(String),
    /// Stored data failed an integrity check.
    #[error("workflow store corruption: {0}")]
    Corrupt(String),
    /// Stored schema version is incompatible.
    #[error("workflow store version mismatch: {0}")]
    VersionMismatch(String),
    /// Request or stored data is invalid.
    #[error("workflow store invalid data: {0}")]
    Invalid(String),
    /// A concurrent writer won a conditional write; re-read for fresh state.
    #[error("workflow store transaction conflict: {0}")]
    Conflict(String),
    /// Transient unavailability; retry with backoff.
    #[error("workflow store unavailable: {0}")]
    Unavailable(String),
    /// Backend reported an error.
    #[error("workflow store error: {0}")]
    Store(String),
}

impl StoreError {
    /// Returns true when the caller should retry with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

// ============================================================================
// SECTION: Execution State Store
// ============================================================================

/// Why an update was skipped without writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Event time is not strictly newer than the stored event time.
    StaleEvent,
    /// Event id was already applied.
    DuplicateEvent,
}

/// Effect of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum UpsertOutcome {
    /// First notification for the execution; one counter incremented.
    Created,
    /// Same step key and bucket; no counter change.
    Updated,
    /// Step key or bucket changed; old counter decremented, new incremented.
    Moved,
    /// No writes of any kind.
    Skipped(SkipReason),
}

impl UpsertOutcome {
    /// Returns a stable label for logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Moved => "moved",
            Self::Skipped(SkipReason::StaleEvent) => "skipped_stale",
            Self::Skipped(SkipReason::DuplicateEvent) => "skipped_duplicate",
        }
    }
}

/// Result of a fenced upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertResult {
    /// What the upsert did.
    pub outcome: UpsertOutcome,
    /// State before the call (`None` for new executions).
    pub previous_state: Option<ExecutionState>,
    /// State after the call (`None` when skipped).
    pub new_state: Option<ExecutionState>,
}

impl UpsertResult {
    /// Builds a skipped result carrying the current stored state.
    #[must_use]
    pub const fn skipped(reason: SkipReason, current: Option<ExecutionState>) -> Self {
        Self {
            outcome: UpsertOutcome::Skipped(reason),
            previous_state: current,
            new_state: None,
        }
    }

    /// Returns true when the update was fenced or deduplicated.
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        matches!(self.outcome, UpsertOutcome::Skipped(_))
    }
}

/// Result of deleting an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    /// Whether an execution state row existed and was removed.
    pub deleted: bool,
    /// Number of execution-error links removed.
    pub links_removed: u64,
    /// State that was removed.
    pub previous_state: Option<ExecutionState>,
}

/// Execution state persistence with event-time fencing.
pub trait ExecutionStateStore {
    /// Loads the current state of an execution.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn load_execution(&self, execution_id: &ExecutionId)
    -> Result<Option<ExecutionState>, StoreError>;

    /// Applies a fenced upsert and the matching counter deltas atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the transaction fails; nothing is applied.
    fn upsert_execution(&self, update: &ExecutionUpdate) -> Result<UpsertResult, StoreError>;

    /// Removes an execution, its error links, and its counter contribution,
    /// stamping the released aggregate with `at`. Error record totals are
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the transaction fails; nothing is applied.
    fn delete_execution(
        &self,
        execution_id: &ExecutionId,
        at: UtcTimestamp,
    ) -> Result<DeleteOutcome, StoreError>;
}

// ============================================================================
// SECTION: Aggregate Index
// ============================================================================

/// One bounded page from a single shard.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShardPage {
    /// Aggregates in key order.
    pub items: Vec<StepAggregate>,
    /// Backend-native continuation token when the shard has more rows.
    pub next_token: Option<String>,
}

/// Partition-scoped step aggregate reads.
pub trait AggregateIndex {
    /// Loads one aggregate by key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn load_step_aggregate(&self, key: &StepKey) -> Result<Option<StepAggregate>, StoreError>;

    /// Reads up to `limit` aggregates from one shard after a continuation token.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails or the token is malformed.
    fn query_shard(
        &self,
        shard: u32,
        after: Option<&str>,
        limit: usize,
    ) -> Result<ShardPage, StoreError>;

    /// Reads every aggregate for one county and data group, optionally
    /// narrowed to phases starting with `phase_prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn query_county(
        &self,
        county: &str,
        data_group_label: &str,
        phase_prefix: Option<&str>,
    ) -> Result<Vec<StepAggregate>, StoreError>;
}

// ============================================================================
// SECTION: Error Record Store
// ============================================================================

/// Result of recording an error batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorIngestOutcome {
    /// Batch idempotency token was already applied; nothing written.
    pub skipped: bool,
    /// Error records created.
    pub records_created: u64,
    /// Error records incremented.
    pub records_updated: u64,
    /// Execution links created.
    pub links_created: u64,
    /// Execution links incremented.
    pub links_updated: u64,
}

/// Error listing filter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorFilter {
    /// Keep records whose type starts with this prefix.
    pub error_type: Option<String>,
    /// Keep records in this status.
    pub status: Option<ErrorStatus>,
}

impl ErrorFilter {
    /// Returns true when a record passes the filter.
    #[must_use]
    pub fn matches(&self, record: &ErrorRecord) -> bool {
        self.error_type.as_deref().is_none_or(|prefix| record.error_type.starts_with(prefix))
            && self.status.is_none_or(|status| record.error_status == status)
    }
}

/// One page of error records.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorRecordPage {
    /// Records ordered by total count descending, then hash.
    pub items: Vec<ErrorRecord>,
    /// Backend-native continuation token when more records exist.
    pub next_token: Option<String>,
}

/// Bulk error status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Target records.
    pub hashes: Vec<ErrorHash>,
    /// New status.
    pub to: ErrorStatus,
    /// When set, only records currently in this status change.
    pub only_from: Option<ErrorStatus>,
    /// Time of the change.
    pub at: UtcTimestamp,
}

/// Deduplicated error catalogue and execution links.
pub trait ErrorRecordStore {
    /// Upserts every error in the batch and its execution link atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the transaction fails; nothing is applied.
    fn record_errors(&self, batch: &ErrorBatch) -> Result<ErrorIngestOutcome, StoreError>;

    /// Loads one error record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn load_error(&self, hash: &ErrorHash) -> Result<Option<ErrorRecord>, StoreError>;

    /// Lists an execution's links joined with their records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn list_execution_errors(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<LinkedError>, StoreError>;

    /// Applies a bulk status change to records and their links; returns the
    /// number of records changed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the transaction fails; nothing is applied.
    fn set_error_status(&self, change: &StatusChange) -> Result<u64, StoreError>;

    /// Lists records by total count descending.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails or the token is malformed.
    fn list_errors(
        &self,
        filter: &ErrorFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<ErrorRecordPage, StoreError>;

    /// Returns the execution ranked first by distinct linked errors (ties by
    /// execution id), counting only errors whose type starts with `error_type`.
    /// Only executions with at least one such error still `failed` are
    /// candidates.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    fn rank_execution_by_error_count(
        &self,
        order: SortOrder,
        error_type: Option<&str>,
    ) -> Result<Option<ExecutionId>, StoreError>;
}

/// Full backend: every store interface, shareable across threads.
pub trait WorkflowStore:
    ExecutionStateStore + AggregateIndex + ErrorRecordStore + Send + Sync
{
}

impl<T> WorkflowStore for T where
    T: ExecutionStateStore + AggregateIndex + ErrorRecordStore + Send + Sync
{
}

// ============================================================================
// SECTION: Continuation Tokens
// ============================================================================

/// Continuation token for shard scans: the last key returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StepKeyToken(String, String, String, String);

/// Encodes the last key of a shard page as a continuation token.
#[must_use]
pub fn step_key_token(key: &StepKey) -> String {
    let token = StepKeyToken(
        key.county.clone(),
        key.data_group_label.clone(),
        key.phase.clone(),
        key.step.clone(),
    );
    serde_json::to_string(&token).unwrap_or_default()
}

/// Parses a shard scan continuation token.
///
/// # Errors
///
/// Returns [`StoreError::Invalid`] when the token is malformed.
pub fn parse_step_key_token(token: &str) -> Result<StepKey, StoreError> {
    let StepKeyToken(county, data_group_label, phase, step) = serde_json::from_str(token)
        .map_err(|_| StoreError::Invalid("malformed shard continuation token".to_string()))?;
    Ok(StepKey {
        county,
        data_group_label,
        phase,
        step,
    })
}

/// Continuation token for error listings: the last (count, hash) returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorListToken {
    /// Total count of the last record.
    pub total_count: u64,
    /// Hash of the last record.
    pub hash: String,
}

impl ErrorListToken {
    /// Builds the token for the last record of a page.
    #[must_use]
    pub fn for_record(record: &ErrorRecord) -> Self {
        Self {
            total_count: record.total_count,
            hash: record.error_code.as_str().to_string(),
        }
    }

    /// Encodes the token.
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parses a token.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] when the token is malformed.
    pub fn parse(token: &str) -> Result<Self, StoreError> {
        serde_json::from_str(token)
            .map_err(|_| StoreError::Invalid("malformed error list token".to_string()))
    }

    /// Returns true when `record` sorts strictly after this token.
    #[must_use]
    pub fn precedes(&self, record: &ErrorRecord) -> bool {
        record.total_count < self.total_count
            || (record.total_count == self.total_count
                && record.error_code.as_str() > self.hash.as_str())
    }
}
