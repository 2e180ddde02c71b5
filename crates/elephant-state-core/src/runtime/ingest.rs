// crates/elephant-state-core/src/runtime/ingest.rs
// ============================================================================
// Module: Workflow Ingestor
// Description: Write-side service for notifications, error reports, and cleanup.
// Purpose: Validate payloads, then drive fenced upserts and error ingestion.
// Dependencies: thiserror, tracing, crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! [`WorkflowIngestor`] is the only write path. Every payload is fully
//! validated before the first store call, so a [`ValidationError`] never
//! leaves partial state behind. Fencing skips are returned as outcomes, not
//! errors. Store faults propagate unchanged after being logged once here.
//!
//! Security posture: notifications and reports are untrusted input.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::core::Bucket;
use crate::core::ErrorBatch;
use crate::core::ErrorHash;
use crate::core::ErrorReport;
use crate::core::ErrorStatus;
use crate::core::ExecutionId;
use crate::core::ExecutionUpdate;
use crate::core::UtcTimestamp;
use crate::core::ValidationError;
use crate::core::WorkflowEvent;
use crate::interfaces::DeleteOutcome;
use crate::interfaces::ErrorIngestOutcome;
use crate::interfaces::SkipReason;
use crate::interfaces::StatusChange;
use crate::interfaces::StoreError;
use crate::interfaces::UpsertOutcome;
use crate::interfaces::UpsertResult;
use crate::interfaces::WorkflowStore;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum number of hashes accepted by one status change.
pub const MAX_STATUS_CHANGE_HASHES: usize = 1_000;
/// Length of a hex-encoded SHA-256 error hash.
const ERROR_HASH_HEX_LEN: usize = 64;

// ============================================================================
// SECTION: Clock
// ============================================================================

/// Source of processing timestamps.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> UtcTimestamp;
}

/// Wall-clock time source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UtcTimestamp {
        UtcTimestamp::now()
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Write-side failures.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Payload rejected before any write.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Store failed; nothing from the failed call is visible.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Returns true when the caller should redrive with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Store(err) => err.is_retryable(),
        }
    }
}

// ============================================================================
// SECTION: Outcomes
// ============================================================================

/// Result of applying one workflow notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOutcome {
    /// Fenced upsert result.
    pub upsert: UpsertResult,
    /// Error ingestion for `detail.errors`, when the event was accepted or
    /// redelivered and carried any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorIngestOutcome>,
    /// Error records confirmed solved by this successful observation.
    pub errors_resolved: u64,
}

/// Result of ingesting one error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOutcome {
    /// Owning execution.
    pub execution_id: ExecutionId,
    /// Distinct errors in the report after merging duplicate rows.
    pub distinct_errors: u64,
    /// Rows in the report.
    pub occurrences: u64,
    /// Store-level effect.
    pub ingest: ErrorIngestOutcome,
}

// ============================================================================
// SECTION: Ingestor
// ============================================================================

/// Write-side service over a workflow store.
#[derive(Debug, Clone)]
pub struct WorkflowIngestor<S, C = SystemClock> {
    /// Backing store.
    store: S,
    /// Timestamp source.
    clock: C,
}

impl<S: WorkflowStore> WorkflowIngestor<S> {
    /// Creates an ingestor using wall-clock time.
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self::with_clock(store, SystemClock)
    }
}

impl<S: WorkflowStore, C: Clock> WorkflowIngestor<S, C> {
    /// Creates an ingestor with an explicit clock.
    #[must_use]
    pub const fn with_clock(store: S, clock: C) -> Self {
        Self {
            store,
            clock,
        }
    }

    /// Returns the backing store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Applies a workflow notification.
    ///
    /// When accepted, errors carried in `detail.errors` are ingested keyed by
    /// the event id, and a move into the succeeded bucket confirms any of the
    /// execution's `maybeSolved` errors as `solved`. A redelivered event id
    /// replays both steps so a failed attempt can be redriven.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Validation`] for malformed notifications and
    /// [`IngestError::Store`] when the store fails.
    pub fn apply_event(&self, event: &WorkflowEvent) -> Result<EventOutcome, IngestError> {
        let received_at = self.clock.now();
        let update = ExecutionUpdate::from_event(event, received_at)?;
        let batch = if event.detail.errors.is_empty() {
            None
        } else {
            let key = format!("event:{}", update.event_id);
            Some(ErrorBatch::from_rows(
                update.execution_id.as_str(),
                &update.step_key.county,
                Some(&key),
                &event.detail.errors,
                received_at,
            )?)
        };

        let upsert = self.store.upsert_execution(&update).inspect_err(|err| {
            warn!(
                execution_id = %update.execution_id,
                event_id = %update.event_id,
                error = %err,
                "workflow event upsert failed"
            );
        })?;
        info!(
            execution_id = %update.execution_id,
            event_id = %update.event_id,
            outcome = upsert.outcome.label(),
            bucket = update.bucket.as_str(),
            "applied workflow event"
        );
        let redelivered = upsert.outcome == UpsertOutcome::Skipped(SkipReason::DuplicateEvent);
        if upsert.is_skipped() && !redelivered {
            return Ok(EventOutcome {
                upsert,
                errors: None,
                errors_resolved: 0,
            });
        }

        // A redelivery completes follow-up writes an earlier attempt may have
        // lost. The batch is keyed by event id and the promotion only moves
        // `maybeSolved` records, so replaying both is a no-op once applied.
        let errors = match &batch {
            Some(batch) => Some(self.record_batch(batch)?),
            None => None,
        };
        let entered_success = if redelivered {
            update.bucket == Bucket::Succeeded
                && upsert.previous_state.as_ref().is_some_and(|current| {
                    current.bucket == Bucket::Succeeded && current.last_event_time == update.event_time
                })
        } else {
            update.bucket == Bucket::Succeeded
                && upsert.previous_state.as_ref().is_none_or(|prev| prev.bucket != Bucket::Succeeded)
        };
        let errors_resolved =
            if entered_success { self.confirm_solved(&update.execution_id, received_at)? } else { 0 };
        Ok(EventOutcome {
            upsert,
            errors,
            errors_resolved,
        })
    }

    /// Ingests an error report for one execution.
    ///
    /// Every observed error moves back to `failed`.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Validation`] for malformed reports and
    /// [`IngestError::Store`] when the store fails.
    pub fn ingest_error_report(&self, report: &ErrorReport) -> Result<ReportOutcome, IngestError> {
        if report.rows.is_empty() {
            return Err(ValidationError::new("error report has no rows").into());
        }
        let batch = ErrorBatch::from_rows(
            &report.execution_id,
            &report.county,
            report.report_id.as_deref(),
            &report.rows,
            self.clock.now(),
        )?;
        let ingest = self.record_batch(&batch)?;
        Ok(ReportOutcome {
            execution_id: batch.execution_id.clone(),
            distinct_errors: u64::try_from(batch.occurrences.len()).unwrap_or(u64::MAX),
            occurrences: batch.total_occurrences(),
            ingest,
        })
    }

    /// Marks errors as `maybeSolved` after a candidate fix is published.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] when hashes are malformed or the store fails.
    pub fn mark_errors_as_maybe_solved(&self, hashes: &[ErrorHash]) -> Result<u64, IngestError> {
        self.change_status(hashes, ErrorStatus::MaybeSolved)
    }

    /// Marks errors as `solved`.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] when hashes are malformed or the store fails.
    pub fn mark_errors_solved(&self, hashes: &[ErrorHash]) -> Result<u64, IngestError> {
        self.change_status(hashes, ErrorStatus::Solved)
    }

    /// Marks errors as `maybeUnrecoverable` once repair attempts are exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] when hashes are malformed or the store fails.
    pub fn mark_errors_unrecoverable(&self, hashes: &[ErrorHash]) -> Result<u64, IngestError> {
        self.change_status(hashes, ErrorStatus::MaybeUnrecoverable)
    }

    /// Deletes a resolved execution with its links and counter contribution.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Store`] when the store fails.
    pub fn delete_execution(&self, execution_id: &ExecutionId) -> Result<DeleteOutcome, IngestError> {
        let at = self.clock.now();
        let outcome = self.store.delete_execution(execution_id, at).inspect_err(|err| {
            warn!(execution_id = %execution_id, error = %err, "execution delete failed");
        })?;
        info!(
            execution_id = %execution_id,
            deleted = outcome.deleted,
            links_removed = outcome.links_removed,
            "deleted execution"
        );
        Ok(outcome)
    }

    /// Records a batch and logs the effect.
    fn record_batch(&self, batch: &ErrorBatch) -> Result<ErrorIngestOutcome, IngestError> {
        let outcome = self.store.record_errors(batch).inspect_err(|err| {
            warn!(execution_id = %batch.execution_id, error = %err, "error batch failed");
        })?;
        info!(
            execution_id = %batch.execution_id,
            skipped = outcome.skipped,
            records_created = outcome.records_created,
            records_updated = outcome.records_updated,
            "recorded error batch"
        );
        Ok(outcome)
    }

    /// Promotes an execution's `maybeSolved` errors to `solved`.
    fn confirm_solved(
        &self,
        execution_id: &ExecutionId,
        at: UtcTimestamp,
    ) -> Result<u64, IngestError> {
        let hashes: Vec<ErrorHash> = self
            .store
            .list_execution_errors(execution_id)?
            .into_iter()
            .filter(|linked| linked.error_status == ErrorStatus::MaybeSolved)
            .map(|linked| linked.link.error_code)
            .collect();
        if hashes.is_empty() {
            return Ok(0);
        }
        let change = StatusChange {
            hashes,
            to: ErrorStatus::Solved,
            only_from: Some(ErrorStatus::MaybeSolved),
            at,
        };
        let changed = self.store.set_error_status(&change)?;
        info!(execution_id = %execution_id, changed, "confirmed errors solved");
        Ok(changed)
    }

    /// Validates hashes and applies an unconditional status change.
    fn change_status(&self, hashes: &[ErrorHash], to: ErrorStatus) -> Result<u64, IngestError> {
        validate_hashes(hashes)?;
        let change = StatusChange {
            hashes: hashes.to_vec(),
            to,
            only_from: None,
            at: self.clock.now(),
        };
        let changed = self.store.set_error_status(&change).inspect_err(|err| {
            warn!(status = to.as_str(), error = %err, "error status change failed");
        })?;
        info!(status = to.as_str(), requested = hashes.len(), changed, "changed error status");
        Ok(changed)
    }
}

/// Checks that hashes are non-empty, bounded, and hex-encoded SHA-256.
fn validate_hashes(hashes: &[ErrorHash]) -> Result<(), ValidationError> {
    if hashes.is_empty() {
        return Err(ValidationError::new("at least one error hash is required"));
    }
    if hashes.len() > MAX_STATUS_CHANGE_HASHES {
        return Err(ValidationError::new(format!(
            "at most {MAX_STATUS_CHANGE_HASHES} error hashes per change"
        )));
    }
    for hash in hashes {
        let value = hash.as_str();
        if value.len() != ERROR_HASH_HEX_LEN
            || !value.bytes().all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(ValidationError::new(format!("malformed error hash: {value}")));
        }
    }
    Ok(())
}
