// crates/elephant-state-core/tests/error_records.rs
// ============================================================================
// Module: Error Record Tests
// Description: Deduplication, status lifecycle, and repair ranking.
// ============================================================================
//! ## Overview
//! Validates that identical errors collapse into one record across
//! executions and that the status lifecycle follows observations.

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

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use elephant_state_core::AggregateIndex;
use elephant_state_core::DeleteOutcome;
use elephant_state_core::ErrorBatch;
use elephant_state_core::ErrorFilter;
use elephant_state_core::ErrorHash;
use elephant_state_core::ErrorIngestOutcome;
use elephant_state_core::ErrorRecord;
use elephant_state_core::ErrorRecordPage;
use elephant_state_core::ErrorRecordStore;
use elephant_state_core::ErrorReport;
use elephant_state_core::ErrorRow;
use elephant_state_core::ErrorStatus;
use elephant_state_core::ExecutionId;
use elephant_state_core::ExecutionRankRequest;
use elephant_state_core::ExecutionState;
use elephant_state_core::ExecutionStateStore;
use elephant_state_core::ExecutionUpdate;
use elephant_state_core::InMemoryWorkflowStore;
use elephant_state_core::IngestError;
use elephant_state_core::LinkedError;
use elephant_state_core::ShardPage;
use elephant_state_core::SkipReason;
use elephant_state_core::SortOrder;
use elephant_state_core::StatusChange;
use elephant_state_core::StepAggregate;
use elephant_state_core::StepKey;
use elephant_state_core::StoreError;
use elephant_state_core::UpsertOutcome;
use elephant_state_core::UpsertResult;
use elephant_state_core::UtcTimestamp;
use elephant_state_core::WorkflowEvent;
use elephant_state_core::WorkflowEventDetail;
use elephant_state_core::WorkflowIngestor;
use elephant_state_core::WorkflowQueryService;
use elephant_state_core::create_error_hash;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn row(message: &str, path: &str) -> ErrorRow {
    ErrorRow {
        error_message: message.to_string(),
        error_path: path.to_string(),
        data_group_cid: None,
    }
}

fn report(execution: &str, county: &str, rows: Vec<ErrorRow>) -> ErrorReport {
    ErrorReport {
        execution_id: execution.to_string(),
        county: county.to_string(),
        report_id: None,
        rows,
    }
}

fn event(execution: &str, event_id: &str, status: &str, time: &str) -> WorkflowEvent {
    WorkflowEvent {
        event_id: event_id.to_string(),
        event_time: time.to_string(),
        detail: WorkflowEventDetail {
            execution_id: execution.to_string(),
            county: "broward".to_string(),
            data_group_label: Some("seed".to_string()),
            status: status.to_string(),
            phase: "validate".to_string(),
            step: "schema".to_string(),
            task_token: Some("token-1".to_string()),
            errors: Vec::new(),
        },
    }
}


/// Store wrapper that fails the next error writes with a throttling fault.
#[derive(Default)]
struct ThrottledErrorStore {
    inner: InMemoryWorkflowStore,
    record_failures: AtomicU32,
    status_failures: AtomicU32,
}

impl ThrottledErrorStore {
    fn take(counter: &AtomicU32) -> Result<(), StoreError> {
        if counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1)).is_ok() {
            return Err(StoreError::Unavailable("throttled".to_string()));
        }
        Ok(())
    }
}

impl ExecutionStateStore for ThrottledErrorStore {
    fn load_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionState>, StoreError> {
        self.inner.load_execution(id)
    }

    fn upsert_execution(&self, update: &ExecutionUpdate) -> Result<UpsertResult, StoreError> {
        self.inner.upsert_execution(update)
    }

    fn delete_execution(&self, id: &ExecutionId, at: UtcTimestamp) -> Result<DeleteOutcome, StoreError> {
        self.inner.delete_execution(id, at)
    }
}

impl AggregateIndex for ThrottledErrorStore {
    fn load_step_aggregate(&self, key: &StepKey) -> Result<Option<StepAggregate>, StoreError> {
        self.inner.load_step_aggregate(key)
    }

    fn query_shard(&self, shard: u32, after: Option<&str>, limit: usize) -> Result<ShardPage, StoreError> {
        self.inner.query_shard(shard, after, limit)
    }

    fn query_county(
        &self,
        county: &str,
        data_group_label: &str,
        phase_prefix: Option<&str>,
    ) -> Result<Vec<StepAggregate>, StoreError> {
        self.inner.query_county(county, data_group_label, phase_prefix)
    }
}

impl ErrorRecordStore for ThrottledErrorStore {
    fn record_errors(&self, batch: &ErrorBatch) -> Result<ErrorIngestOutcome, StoreError> {
        Self::take(&self.record_failures)?;
        self.inner.record_errors(batch)
    }

    fn load_error(&self, hash: &ErrorHash) -> Result<Option<ErrorRecord>, StoreError> {
        self.inner.load_error(hash)
    }

    fn list_execution_errors(&self, id: &ExecutionId) -> Result<Vec<LinkedError>, StoreError> {
        self.inner.list_execution_errors(id)
    }

    fn set_error_status(&self, change: &StatusChange) -> Result<u64, StoreError> {
        Self::take(&self.status_failures)?;
        self.inner.set_error_status(change)
    }

    fn list_errors(
        &self,
        filter: &ErrorFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<ErrorRecordPage, StoreError> {
        self.inner.list_errors(filter, after, limit)
    }

    fn rank_execution_by_error_count(
        &self,
        order: SortOrder,
        error_type: Option<&str>,
    ) -> Result<Option<ExecutionId>, StoreError> {
        self.inner.rank_execution_by_error_count(order, error_type)
    }
}

// ============================================================================
// SECTION: Deduplication
// ============================================================================

/// The same error from two executions is one record with two links.
#[test]
fn test_identical_errors_share_one_record() {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    ingestor.ingest_error_report(&report("E2", "broward", vec![row("missing field X", "$.a")])).unwrap();
    ingestor.ingest_error_report(&report("E3", "broward", vec![row("missing field X", "$.a")])).unwrap();

    let hash = create_error_hash("missing field X", "$.a", "broward");
    let record = ingestor.store().load_error(&hash).unwrap().unwrap();
    assert_eq!(record.total_count, 2);
    assert_eq!(record.error_status, ErrorStatus::Failed);
    assert_eq!(record.latest_execution_id, ExecutionId::new("E3"));
    for execution in ["E2", "E3"] {
        let links = ingestor.store().list_execution_errors(&ExecutionId::new(execution)).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].link.occurrences, 1);
        assert_eq!(links[0].total_count, 2);
    }

    ingestor.mark_errors_as_maybe_solved(std::slice::from_ref(&hash)).unwrap();
    let record = ingestor.store().load_error(&hash).unwrap().unwrap();
    assert_eq!(record.error_status, ErrorStatus::MaybeSolved);
}

/// County is part of identity; whitespace in messages is not.
#[test]
fn test_identity_normalizes_whitespace_and_keeps_county() {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    let outcome = ingestor
        .ingest_error_report(&report(
            "E1",
            "broward",
            vec![row("missing   field X ", " $.a"), row("missing field X", "$.a")],
        ))
        .unwrap();
    assert_eq!(outcome.distinct_errors, 1);
    assert_eq!(outcome.occurrences, 2);
    ingestor.ingest_error_report(&report("E1", "miami_dade", vec![row("missing field X", "$.a")])).unwrap();

    let broward = create_error_hash("missing field X", "$.a", "broward");
    let miami = create_error_hash("missing field X", "$.a", "miami_dade");
    assert_ne!(broward, miami);
    let links = ingestor.store().list_execution_errors(&ExecutionId::new("E1")).unwrap();
    assert_eq!(links.len(), 2);
    let broward_link = links.iter().find(|linked| linked.link.error_code == broward).unwrap();
    assert_eq!(broward_link.link.occurrences, 2);
}

/// A report redelivered with the same id is skipped.
#[test]
fn test_report_id_makes_ingestion_idempotent() {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    let mut first = report("E1", "broward", vec![row("SchemaError: bad date", "$.sale.date")]);
    first.report_id = Some("report-7".to_string());
    ingestor.ingest_error_report(&first).unwrap();
    let again = ingestor.ingest_error_report(&first).unwrap();
    assert!(again.ingest.skipped);

    let hash = create_error_hash("SchemaError: bad date", "$.sale.date", "broward");
    let record = ingestor.store().load_error(&hash).unwrap().unwrap();
    assert_eq!(record.total_count, 1);
    assert_eq!(record.error_type, "SchemaError");
}

/// Empty reports and malformed hashes are validation errors.
#[test]
fn test_invalid_error_payloads_are_rejected() {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    assert!(matches!(
        ingestor.ingest_error_report(&report("E1", "broward", Vec::new())),
        Err(IngestError::Validation(_))
    ));
    assert!(matches!(
        ingestor.ingest_error_report(&report("E1", "broward", vec![row("   ", "$.a")])),
        Err(IngestError::Validation(_))
    ));
    assert!(matches!(
        ingestor.mark_errors_solved(&[ErrorHash::new("not-a-hash")]),
        Err(IngestError::Validation(_))
    ));
    assert!(matches!(ingestor.mark_errors_solved(&[]), Err(IngestError::Validation(_))));
}

// ============================================================================
// SECTION: Status Lifecycle
// ============================================================================

/// A failing observation reopens a maybe-solved error.
#[test]
fn test_recurrence_returns_error_to_failed() {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    ingestor.ingest_error_report(&report("E1", "broward", vec![row("missing field X", "$.a")])).unwrap();
    let hash = create_error_hash("missing field X", "$.a", "broward");
    ingestor.mark_errors_as_maybe_solved(std::slice::from_ref(&hash)).unwrap();

    ingestor.ingest_error_report(&report("E9", "broward", vec![row("missing field X", "$.a")])).unwrap();
    let record = ingestor.store().load_error(&hash).unwrap().unwrap();
    assert_eq!(record.error_status, ErrorStatus::Failed);
    assert_eq!(record.total_count, 2);
}

/// Success of an execution confirms its maybe-solved errors.
#[test]
fn test_success_confirms_maybe_solved_errors() {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    let mut failing = event("E1", "evt-1", "FAILED", "2025-01-01T00:00:01Z");
    failing.detail.errors = vec![row("missing field X", "$.a")];
    let outcome = ingestor.apply_event(&failing).unwrap();
    assert_eq!(outcome.errors.unwrap().records_created, 1);

    let hash = create_error_hash("missing field X", "$.a", "broward");
    ingestor.mark_errors_as_maybe_solved(std::slice::from_ref(&hash)).unwrap();
    let done = ingestor.apply_event(&event("E1", "evt-2", "SUCCEEDED", "2025-01-01T00:00:02Z")).unwrap();
    assert_eq!(done.errors_resolved, 1);

    let record = ingestor.store().load_error(&hash).unwrap().unwrap();
    assert_eq!(record.error_status, ErrorStatus::Solved);
    let links = ingestor.store().list_execution_errors(&ExecutionId::new("E1")).unwrap();
    assert_eq!(links[0].link.status, ErrorStatus::Solved);
}

/// Redelivering an event whose error batch failed records the errors once.
#[test]
fn test_redelivered_event_completes_error_batch() {
    let store = ThrottledErrorStore::default();
    store.record_failures.store(1, Ordering::SeqCst);
    let ingestor = WorkflowIngestor::new(store);
    let mut failing = event("E1", "evt-1", "FAILED", "2025-01-01T00:00:01Z");
    failing.detail.errors = vec![row("missing field X", "$.a")];

    let first = ingestor.apply_event(&failing).unwrap_err();
    assert!(first.is_retryable());
    assert!(ingestor.store().load_execution(&ExecutionId::new("E1")).unwrap().is_some());

    let redrive = ingestor.apply_event(&failing).unwrap();
    assert_eq!(redrive.upsert.outcome, UpsertOutcome::Skipped(SkipReason::DuplicateEvent));
    assert_eq!(redrive.errors.unwrap().links_created, 1);
    let again = ingestor.apply_event(&failing).unwrap();
    assert!(again.errors.unwrap().skipped);

    let links = ingestor.store().list_execution_errors(&ExecutionId::new("E1")).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].link.occurrences, 1);
    let hash = create_error_hash("missing field X", "$.a", "broward");
    assert_eq!(ingestor.store().load_error(&hash).unwrap().unwrap().total_count, 1);
}

/// Redelivering a success whose promotion failed confirms the errors.
#[test]
fn test_redelivered_success_completes_promotion() {
    let ingestor = WorkflowIngestor::new(ThrottledErrorStore::default());
    let mut failing = event("E1", "evt-1", "FAILED", "2025-01-01T00:00:01Z");
    failing.detail.errors = vec![row("missing field X", "$.a")];
    ingestor.apply_event(&failing).unwrap();
    let hash = create_error_hash("missing field X", "$.a", "broward");
    ingestor.mark_errors_as_maybe_solved(std::slice::from_ref(&hash)).unwrap();

    ingestor.store().status_failures.store(1, Ordering::SeqCst);
    let success = event("E1", "evt-2", "SUCCEEDED", "2025-01-01T00:00:02Z");
    assert!(ingestor.apply_event(&success).unwrap_err().is_retryable());
    let record = ingestor.store().load_error(&hash).unwrap().unwrap();
    assert_eq!(record.error_status, ErrorStatus::MaybeSolved);

    let redrive = ingestor.apply_event(&success).unwrap();
    assert_eq!(redrive.upsert.outcome, UpsertOutcome::Skipped(SkipReason::DuplicateEvent));
    assert_eq!(redrive.errors_resolved, 1);
    let record = ingestor.store().load_error(&hash).unwrap().unwrap();
    assert_eq!(record.error_status, ErrorStatus::Solved);
}

/// A redelivered old success does not promote errors after a later failure.
#[test]
fn test_redelivered_success_after_newer_event_does_not_promote() {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    let success = event("E1", "evt-1", "SUCCEEDED", "2025-01-01T00:00:01Z");
    ingestor.apply_event(&success).unwrap();
    let mut failing = event("E1", "evt-2", "FAILED", "2025-01-01T00:00:02Z");
    failing.detail.errors = vec![row("missing field X", "$.a")];
    ingestor.apply_event(&failing).unwrap();
    let hash = create_error_hash("missing field X", "$.a", "broward");
    ingestor.mark_errors_as_maybe_solved(std::slice::from_ref(&hash)).unwrap();

    let redrive = ingestor.apply_event(&success).unwrap();
    assert_eq!(redrive.errors_resolved, 0);
    let record = ingestor.store().load_error(&hash).unwrap().unwrap();
    assert_eq!(record.error_status, ErrorStatus::MaybeSolved);
}

/// Errors carried by a fenced event are not ingested.
#[test]
fn test_stale_event_errors_are_ignored() {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    ingestor.apply_event(&event("E1", "evt-1", "FAILED", "2025-01-01T00:00:05Z")).unwrap();
    let mut stale = event("E1", "evt-0", "FAILED", "2025-01-01T00:00:04Z");
    stale.detail.errors = vec![row("missing field X", "$.a")];
    let outcome = ingestor.apply_event(&stale).unwrap();
    assert!(outcome.upsert.is_skipped());
    assert!(outcome.errors.is_none());
    let hash = create_error_hash("missing field X", "$.a", "broward");
    assert!(ingestor.store().load_error(&hash).unwrap().is_none());
}

/// Deleting an execution removes links but keeps record totals.
#[test]
fn test_delete_keeps_error_totals() {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    ingestor.apply_event(&event("E1", "evt-1", "FAILED", "2025-01-01T00:00:01Z")).unwrap();
    ingestor.ingest_error_report(&report("E1", "broward", vec![row("missing field X", "$.a")])).unwrap();

    let outcome = ingestor.delete_execution(&ExecutionId::new("E1")).unwrap();
    assert_eq!(outcome.links_removed, 1);
    assert!(ingestor.store().list_execution_errors(&ExecutionId::new("E1")).unwrap().is_empty());
    let hash = create_error_hash("missing field X", "$.a", "broward");
    assert_eq!(ingestor.store().load_error(&hash).unwrap().unwrap().total_count, 1);
}

// ============================================================================
// SECTION: Ranking
// ============================================================================

/// Ranking counts distinct errors and honors the type prefix.
#[test]
fn test_rank_by_unique_error_count() {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    ingestor
        .ingest_error_report(&report(
            "E1",
            "broward",
            vec![row("a", "$.a"), row("b", "$.b"), row("c", "$.c")],
        ))
        .unwrap();
    ingestor
        .ingest_error_report(&report(
            "E2",
            "broward",
            vec![row("SchemaError: x", "$.x"), row("SchemaError: x", "$.x")],
        ))
        .unwrap();
    ingestor.ingest_error_report(&report("E3", "broward", vec![row("d", "$.d")])).unwrap();
    let store = ingestor.store();

    assert_eq!(store.rank_execution_by_error_count(SortOrder::Most, None).unwrap(), Some(ExecutionId::new("E1")));
    assert_eq!(store.rank_execution_by_error_count(SortOrder::Least, None).unwrap(), Some(ExecutionId::new("E2")));
    assert_eq!(
        store.rank_execution_by_error_count(SortOrder::Most, Some("Schema")).unwrap(),
        Some(ExecutionId::new("E2"))
    );
    assert_eq!(store.rank_execution_by_error_count(SortOrder::Most, Some("Parse")).unwrap(), None);
}

/// Executions whose errors are all resolved are not repair candidates.
#[test]
fn test_rank_skips_resolved_executions() {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    let mut resolved = event("E1", "evt-1", "FAILED", "2025-01-01T00:00:01Z");
    resolved.detail.errors = vec![row("a", "$.a"), row("b", "$.b")];
    ingestor.apply_event(&resolved).unwrap();
    let hashes = [create_error_hash("a", "$.a", "broward"), create_error_hash("b", "$.b", "broward")];
    ingestor.mark_errors_as_maybe_solved(&hashes).unwrap();
    let done = ingestor.apply_event(&event("E1", "evt-2", "SUCCEEDED", "2025-01-01T00:00:02Z")).unwrap();
    assert_eq!(done.errors_resolved, 2);
    ingestor.ingest_error_report(&report("E2", "broward", vec![row("c", "$.c")])).unwrap();

    let store = ingestor.store();
    for order in [SortOrder::Most, SortOrder::Least] {
        assert_eq!(store.rank_execution_by_error_count(order, None).unwrap(), Some(ExecutionId::new("E2")));
    }
    let service = WorkflowQueryService::new(store.clone());
    let picked = service
        .execution_by_error_count(&ExecutionRankRequest {
            sort_order: SortOrder::Most,
            error_type: None,
        })
        .unwrap()
        .unwrap();
    assert_eq!(picked.failure.execution_id, ExecutionId::new("E2"));
    assert_eq!(picked.failure.open_error_count, 1);

    ingestor.mark_errors_solved(&[create_error_hash("c", "$.c", "broward")]).unwrap();
    assert_eq!(store.rank_execution_by_error_count(SortOrder::Most, None).unwrap(), None);
}
