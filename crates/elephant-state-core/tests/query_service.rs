// crates/elephant-state-core/tests/query_service.rs
// ============================================================================
// Module: Query Service Tests
// Description: Sharded scans, county reads, error listings, and ranking views.
// ============================================================================
//! ## Overview
//! Exercises the read side over the in-memory store, including a wrapper
//! store that fails one shard to check partial-failure cursors.

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

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use elephant_state_core::AggregateIndex;
use elephant_state_core::CountyAggregateRequest;
use elephant_state_core::DeleteOutcome;
use elephant_state_core::ErrorBatch;
use elephant_state_core::ErrorFilter;
use elephant_state_core::ErrorHash;
use elephant_state_core::ErrorIngestOutcome;
use elephant_state_core::ErrorListRequest;
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
use elephant_state_core::LinkedError;
use elephant_state_core::PageLimits;
use elephant_state_core::QueryError;
use elephant_state_core::ShardPage;
use elephant_state_core::SortOrder;
use elephant_state_core::StatusChange;
use elephant_state_core::StepAggregate;
use elephant_state_core::StepKey;
use elephant_state_core::StoreError;
use elephant_state_core::UpsertResult;
use elephant_state_core::UtcTimestamp;
use elephant_state_core::WorkflowEvent;
use elephant_state_core::WorkflowEventDetail;
use elephant_state_core::WorkflowIngestor;
use elephant_state_core::WorkflowQueryService;
use elephant_state_core::core::cursor::encode_aggregate_cursor;
use elephant_state_core::core::cursor::initial_shard_positions;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn event(execution: &str, county: &str, step: &str, status: &str) -> WorkflowEvent {
    WorkflowEvent {
        event_id: format!("{execution}-{step}-{status}"),
        event_time: "2025-03-01T12:00:00Z".to_string(),
        detail: WorkflowEventDetail {
            execution_id: execution.to_string(),
            county: county.to_string(),
            data_group_label: None,
            status: status.to_string(),
            phase: "prepare".to_string(),
            step: step.to_string(),
            task_token: None,
            errors: Vec::new(),
        },
    }
}

/// Seeds one execution per (county, step) across many counties.
fn seeded_store(counties: usize) -> InMemoryWorkflowStore {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    for index in 0..counties {
        let county = format!("county_{index}");
        for step in ["download", "transform"] {
            let execution = format!("E-{index}-{step}");
            ingestor.apply_event(&event(&execution, &county, step, "IN_PROGRESS")).unwrap();
        }
    }
    ingestor.store().clone()
}

fn key_set(items: &[StepAggregate]) -> BTreeSet<StepKey> {
    items.iter().map(StepAggregate::step_key).collect()
}

// ============================================================================
// SECTION: Sharded Scans
// ============================================================================

/// Paging through every shard returns each aggregate exactly once.
#[test]
fn test_full_scan_pages_cover_every_aggregate_once() {
    let store = seeded_store(40);
    let service = WorkflowQueryService::new(store);
    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0;
    loop {
        let page = service.query_all_step_aggregates(cursor.as_deref(), Some(10)).unwrap();
        assert_eq!(page.failed_shards, 0);
        seen.extend(page.items);
        pages += 1;
        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
        assert!(pages < 100, "scan did not terminate");
    }
    assert_eq!(seen.len(), 80);
    assert_eq!(key_set(&seen).len(), 80);
    assert!(pages > 1);
}

/// Store wrapper that fails every query against one shard.
struct FailingShardStore {
    inner: InMemoryWorkflowStore,
    shard: u32,
    failing: AtomicBool,
}

impl ExecutionStateStore for FailingShardStore {
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

impl AggregateIndex for FailingShardStore {
    fn load_step_aggregate(&self, key: &StepKey) -> Result<Option<StepAggregate>, StoreError> {
        self.inner.load_step_aggregate(key)
    }

    fn query_shard(&self, shard: u32, after: Option<&str>, limit: usize) -> Result<ShardPage, StoreError> {
        if shard == self.shard && self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("throttled".to_string()));
        }
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

impl ErrorRecordStore for FailingShardStore {
    fn record_errors(&self, batch: &ErrorBatch) -> Result<ErrorIngestOutcome, StoreError> {
        self.inner.record_errors(batch)
    }

    fn load_error(&self, hash: &ErrorHash) -> Result<Option<ErrorRecord>, StoreError> {
        self.inner.load_error(hash)
    }

    fn list_execution_errors(&self, id: &ExecutionId) -> Result<Vec<LinkedError>, StoreError> {
        self.inner.list_execution_errors(id)
    }

    fn set_error_status(&self, change: &StatusChange) -> Result<u64, StoreError> {
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

/// A failing shard is reported and resumed alone on the next call.
#[test]
fn test_failed_shard_keeps_its_cursor() {
    let inner = seeded_store(40);
    let total = inner.query_county("county_0", "not-set", None).unwrap().len();
    assert_eq!(total, 2);
    let failing_shard = StepKey::new("county_0", None, "prepare", "download").shard();
    let store = FailingShardStore {
        inner,
        shard: failing_shard,
        failing: AtomicBool::new(true),
    };
    let service = WorkflowQueryService::new(store);

    let first = service.query_all_step_aggregates(None, Some(1_000)).unwrap();
    assert_eq!(first.failed_shards, 1);
    assert!(first.items.iter().all(|item| item.step_key().shard() != failing_shard));
    let cursor = first.cursor.unwrap();

    service.store().failing.store(false, Ordering::SeqCst);
    let second = service.query_all_step_aggregates(Some(&cursor), Some(1_000)).unwrap();
    assert_eq!(second.failed_shards, 0);
    assert!(second.cursor.is_none());
    assert!(!second.items.is_empty());
    assert!(second.items.iter().all(|item| item.step_key().shard() == failing_shard));
    assert_eq!(first.items.len() + second.items.len(), 80);
}

/// Malformed cursors and zero limits are validation errors.
#[test]
fn test_bad_cursor_and_limit_are_rejected() {
    let service = WorkflowQueryService::new(InMemoryWorkflowStore::new());
    assert!(matches!(
        service.query_all_step_aggregates(Some("%%%"), None),
        Err(QueryError::Validation(_))
    ));
    assert!(matches!(service.query_all_step_aggregates(None, Some(0)), Err(QueryError::Validation(_))));
    assert!(PageLimits::new(10, 5_000).is_err());
    assert!(PageLimits::new(50, 20).is_err());
}

// ============================================================================
// SECTION: County and Fleet Reads
// ============================================================================

/// County reads are scoped to one data group and narrowed by phase prefix.
#[test]
fn test_county_query_filters_by_phase_prefix() {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    ingestor.apply_event(&event("E1", "palm_beach", "download", "IN_PROGRESS")).unwrap();
    let mut other_phase = event("E2", "palm_beach", "upload", "FAILED");
    other_phase.detail.phase = "publish".to_string();
    ingestor.apply_event(&other_phase).unwrap();
    let mut grouped = event("E3", "palm_beach", "download", "FAILED");
    grouped.detail.data_group_label = Some("seed".to_string());
    ingestor.apply_event(&grouped).unwrap();
    let service = WorkflowQueryService::new(ingestor.store().clone());

    let all = service
        .query_step_aggregates_for_county(&CountyAggregateRequest {
            county: "palm_beach".to_string(),
            ..CountyAggregateRequest::default()
        })
        .unwrap();
    assert_eq!(all.len(), 2);
    let prepared = service
        .query_step_aggregates_for_county(&CountyAggregateRequest {
            county: "palm_beach".to_string(),
            data_group_label: None,
            phase: Some("prep".to_string()),
        })
        .unwrap();
    assert_eq!(prepared.len(), 1);
    assert_eq!(prepared[0].step, "download");
    assert!(service.query_step_aggregates_for_county(&CountyAggregateRequest::default()).is_err());
}

/// Fleet totals sum every county per phase and step.
#[test]
fn test_fleet_totals_sum_all_shards() {
    let service = WorkflowQueryService::new(seeded_store(25));
    let totals = service.fleet_totals().unwrap();
    assert_eq!(totals.len(), 2);
    for total in totals {
        assert_eq!(total.in_progress_count, 25);
        assert_eq!(total.failed_count + total.succeeded_count, 0);
    }
}

// ============================================================================
// SECTION: Error Reads
// ============================================================================

fn report(execution: &str, messages: &[&str]) -> ErrorReport {
    ErrorReport {
        execution_id: execution.to_string(),
        county: "broward".to_string(),
        report_id: None,
        rows: messages
            .iter()
            .map(|message| ErrorRow {
                error_message: (*message).to_string(),
                error_path: "$.a".to_string(),
                data_group_cid: None,
            })
            .collect(),
    }
}

/// Error listings page by count descending and honor filters.
#[test]
fn test_error_listing_pages_by_count() {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    ingestor.ingest_error_report(&report("E1", &["a", "b", "b", "c", "c", "c"])).unwrap();
    ingestor.ingest_error_report(&report("E2", &["ParseError: d"])).unwrap();
    let service = WorkflowQueryService::new(ingestor.store().clone());

    let first = service
        .list_errors(&ErrorListRequest {
            limit: Some(2),
            ..ErrorListRequest::default()
        })
        .unwrap();
    let counts: Vec<u64> = first.items.iter().map(|record| record.total_count).collect();
    assert_eq!(counts, vec![3, 2]);
    let second = service
        .list_errors(&ErrorListRequest {
            cursor: first.cursor.clone(),
            limit: Some(2),
            ..ErrorListRequest::default()
        })
        .unwrap();
    assert_eq!(second.items.len(), 2);
    assert!(second.cursor.is_none());

    let parse = service
        .list_errors(&ErrorListRequest {
            error_type: Some("Parse".to_string()),
            status: Some(ErrorStatus::Failed),
            ..ErrorListRequest::default()
        })
        .unwrap();
    assert_eq!(parse.items.len(), 1);
    assert_eq!(parse.items[0].error_type, "ParseError");

    let aggregate_cursor = encode_aggregate_cursor(&initial_shard_positions()).unwrap();
    let wrong_kind = service.list_errors(&ErrorListRequest {
        cursor: aggregate_cursor,
        ..ErrorListRequest::default()
    });
    assert!(matches!(wrong_kind, Err(QueryError::Validation(_))));
}

/// The repair view carries the rollup and the execution summary.
#[test]
fn test_execution_by_error_count_builds_rollup() {
    let ingestor = WorkflowIngestor::new(InMemoryWorkflowStore::new());
    let mut failing = event("E1", "broward", "schema", "FAILED");
    failing.detail.task_token = Some("resume-me".to_string());
    ingestor.apply_event(&failing).unwrap();
    ingestor
        .ingest_error_report(&report("E1", &["SchemaError: x", "SchemaError: x", "y"]))
        .unwrap();
    ingestor.ingest_error_report(&report("E2", &["z"])).unwrap();
    let service = WorkflowQueryService::new(ingestor.store().clone());

    let summary = service
        .execution_by_error_count(&ExecutionRankRequest::default())
        .unwrap()
        .unwrap();
    assert_eq!(summary.failure.execution_id, ExecutionId::new("E1"));
    assert_eq!(summary.failure.unique_error_count, 2);
    assert_eq!(summary.failure.total_occurrences, 3);
    assert_eq!(summary.failure.error_type, "SchemaError");
    assert_eq!(summary.failure.open_error_count, 2);
    assert_eq!(summary.failure.task_token.as_deref(), Some("resume-me"));
    assert_eq!(summary.execution.unwrap().raw_status, "FAILED");

    let least = service
        .execution_by_error_count(&ExecutionRankRequest {
            sort_order: SortOrder::Least,
            error_type: None,
        })
        .unwrap()
        .unwrap();
    assert_eq!(least.failure.execution_id, ExecutionId::new("E2"));
    assert!(least.execution.is_none());
}
