// crates/elephant-state-core/tests/execution_state.rs
// ============================================================================
// Module: Execution State Tests
// Description: Fenced upserts, counter moves, idempotence, and cleanup.
// ============================================================================
//! ## Overview
//! Drives the in-memory store through the ingestor and checks that every
//! execution is counted in exactly one bucket after any event sequence.

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

use std::collections::BTreeMap;

use elephant_state_core::AggregateIndex;
use elephant_state_core::Bucket;
use elephant_state_core::Clock;
use elephant_state_core::ExecutionId;
use elephant_state_core::ExecutionStateStore;
use elephant_state_core::InMemoryWorkflowStore;
use elephant_state_core::IngestError;
use elephant_state_core::SkipReason;
use elephant_state_core::StepAggregate;
use elephant_state_core::StepKey;
use elephant_state_core::UpsertOutcome;
use elephant_state_core::UtcTimestamp;
use elephant_state_core::WorkflowEvent;
use elephant_state_core::WorkflowEventDetail;
use elephant_state_core::WorkflowIngestor;
use elephant_state_core::core::shard::all_shards;
use proptest::prelude::*;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Clock pinned to one instant.
#[derive(Clone, Copy)]
struct FixedClock(UtcTimestamp);

impl Clock for FixedClock {
    fn now(&self) -> UtcTimestamp {
        self.0
    }
}

fn ingestor() -> WorkflowIngestor<InMemoryWorkflowStore, FixedClock> {
    let now = UtcTimestamp::parse("2025-06-01T00:00:00Z").unwrap();
    WorkflowIngestor::with_clock(InMemoryWorkflowStore::new(), FixedClock(now))
}

fn event_at(execution: &str, event_id: &str, status: &str, step: &str, second: i64) -> WorkflowEvent {
    let time = UtcTimestamp::from_unix_nanos(1_735_689_600_000_000_000 + second * 1_000_000_000)
        .unwrap();
    WorkflowEvent {
        event_id: event_id.to_string(),
        event_time: time.to_rfc3339(),
        detail: WorkflowEventDetail {
            execution_id: execution.to_string(),
            county: "palm_beach".to_string(),
            data_group_label: None,
            status: status.to_string(),
            phase: "prepare".to_string(),
            step: step.to_string(),
            task_token: None,
            errors: Vec::new(),
        },
    }
}

fn download_key() -> StepKey {
    StepKey::new("palm_beach", None, "prepare", "download")
}

fn all_aggregates(store: &InMemoryWorkflowStore) -> Vec<elephant_state_core::StepAggregate> {
    let mut items = Vec::new();
    for shard in all_shards() {
        items.extend(store.query_shard(shard, None, 1_000).unwrap().items);
    }
    items
}

// ============================================================================
// SECTION: Scenarios
// ============================================================================

/// First notification creates state and one in-progress count.
#[test]
fn test_first_event_creates_state_and_counter() {
    let ingestor = ingestor();
    let outcome = ingestor.apply_event(&event_at("E1", "evt-1", "IN_PROGRESS", "download", 1)).unwrap();

    assert_eq!(outcome.upsert.outcome, UpsertOutcome::Created);
    assert!(outcome.upsert.previous_state.is_none());
    let state = ingestor.store().load_execution(&ExecutionId::new("E1")).unwrap().unwrap();
    assert_eq!(state.bucket, Bucket::InProgress);
    assert_eq!(state.data_group_label, "not-set");
    assert_eq!(state.version, 1);
    let aggregate = ingestor.store().load_step_aggregate(&download_key()).unwrap().unwrap();
    assert_eq!(aggregate.in_progress_count, 1);
    assert_eq!(aggregate.total(), 1);
}

/// A newer success moves the count between buckets of the same key.
#[test]
fn test_success_moves_count_between_buckets() {
    let ingestor = ingestor();
    ingestor.apply_event(&event_at("E1", "evt-1", "IN_PROGRESS", "download", 1)).unwrap();
    let outcome = ingestor.apply_event(&event_at("E1", "evt-2", "SUCCEEDED", "download", 2)).unwrap();

    assert_eq!(outcome.upsert.outcome, UpsertOutcome::Moved);
    let aggregate = ingestor.store().load_step_aggregate(&download_key()).unwrap().unwrap();
    assert_eq!(aggregate.in_progress_count, 0);
    assert_eq!(aggregate.succeeded_count, 1);
    let state = ingestor.store().load_execution(&ExecutionId::new("E1")).unwrap().unwrap();
    assert_eq!(state.bucket, Bucket::Succeeded);
    assert_eq!(state.version, 2);
}

/// Redelivery of an applied event is skipped without writes.
#[test]
fn test_redelivered_event_is_skipped() {
    let ingestor = ingestor();
    ingestor.apply_event(&event_at("E1", "evt-1", "IN_PROGRESS", "download", 1)).unwrap();
    let done = event_at("E1", "evt-2", "SUCCEEDED", "download", 2);
    ingestor.apply_event(&done).unwrap();
    let before = ingestor.store().load_execution(&ExecutionId::new("E1")).unwrap();

    let outcome = ingestor.apply_event(&done).unwrap();

    assert_eq!(outcome.upsert.outcome, UpsertOutcome::Skipped(SkipReason::DuplicateEvent));
    assert!(outcome.upsert.new_state.is_none());
    assert_eq!(ingestor.store().load_execution(&ExecutionId::new("E1")).unwrap(), before);
    let aggregate = ingestor.store().load_step_aggregate(&download_key()).unwrap().unwrap();
    assert_eq!((aggregate.in_progress_count, aggregate.succeeded_count), (0, 1));
}

/// A different event id at the stored time is fenced as stale.
#[test]
fn test_equal_event_time_is_fenced() {
    let ingestor = ingestor();
    ingestor.apply_event(&event_at("E1", "evt-1", "IN_PROGRESS", "download", 5)).unwrap();
    let outcome = ingestor.apply_event(&event_at("E1", "evt-x", "FAILED", "download", 5)).unwrap();
    assert_eq!(outcome.upsert.outcome, UpsertOutcome::Skipped(SkipReason::StaleEvent));

    let late = ingestor.apply_event(&event_at("E1", "evt-y", "FAILED", "download", 4)).unwrap();
    assert!(late.upsert.is_skipped());
    let aggregate = ingestor.store().load_step_aggregate(&download_key()).unwrap().unwrap();
    assert_eq!((aggregate.in_progress_count, aggregate.failed_count), (1, 0));
}

/// Moving to another step decrements the old key and increments the new one.
#[test]
fn test_step_change_moves_between_keys() {
    let ingestor = ingestor();
    ingestor.apply_event(&event_at("E1", "evt-1", "SUCCEEDED", "download", 1)).unwrap();
    ingestor.apply_event(&event_at("E1", "evt-2", "SCHEDULED", "transform", 2)).unwrap();

    let old = ingestor.store().load_step_aggregate(&download_key()).unwrap().unwrap();
    assert_eq!(old.total(), 0);
    let new_key = StepKey::new("palm_beach", Some(" "), "prepare", "transform");
    let new = ingestor.store().load_step_aggregate(&new_key).unwrap().unwrap();
    assert_eq!(new.in_progress_count, 1);
}

/// Raw status changes within one bucket leave counters alone.
#[test]
fn test_refresh_keeps_counters() {
    let ingestor = ingestor();
    ingestor.apply_event(&event_at("E1", "evt-1", "IN_PROGRESS", "download", 1)).unwrap();
    let outcome = ingestor.apply_event(&event_at("E1", "evt-2", "PARKED", "download", 2)).unwrap();
    assert_eq!(outcome.upsert.outcome, UpsertOutcome::Updated);
    let state = outcome.upsert.new_state.unwrap();
    assert_eq!(state.raw_status, "PARKED");
    let aggregate = ingestor.store().load_step_aggregate(&download_key()).unwrap().unwrap();
    assert_eq!(aggregate.in_progress_count, 1);
}

/// Malformed notifications are rejected before any write.
#[test]
fn test_invalid_event_writes_nothing() {
    let ingestor = ingestor();
    let mut bad_time = event_at("E1", "evt-1", "IN_PROGRESS", "download", 1);
    bad_time.event_time = "yesterday".to_string();
    assert!(matches!(ingestor.apply_event(&bad_time), Err(IngestError::Validation(_))));

    let blank_step = event_at("E1", "evt-1", "IN_PROGRESS", "  ", 1);
    assert!(matches!(ingestor.apply_event(&blank_step), Err(IngestError::Validation(_))));

    assert!(ingestor.store().load_execution(&ExecutionId::new("E1")).unwrap().is_none());
    assert!(all_aggregates(ingestor.store()).is_empty());
}

/// Deleting an execution removes its count at clock time and blocks
/// resurrection by redelivery.
#[test]
fn test_delete_removes_counter_contribution() {
    let ingestor = ingestor();
    let first = event_at("E1", "evt-1", "FAILED", "download", 1);
    ingestor.apply_event(&first).unwrap();
    let outcome = ingestor.delete_execution(&ExecutionId::new("E1")).unwrap();
    assert!(outcome.deleted);

    let aggregate = ingestor.store().load_step_aggregate(&download_key()).unwrap().unwrap();
    assert_eq!(aggregate.total(), 0);
    assert_eq!(aggregate.updated_at, UtcTimestamp::parse("2025-06-01T00:00:00Z").unwrap());
    let redelivered = ingestor.apply_event(&first).unwrap();
    assert_eq!(redelivered.upsert.outcome, UpsertOutcome::Skipped(SkipReason::DuplicateEvent));

    let missing = ingestor.delete_execution(&ExecutionId::new("E404")).unwrap();
    assert!(!missing.deleted);
}

/// Aggregate totals saturate instead of overflowing.
#[test]
fn test_aggregate_total_saturates() {
    let mut aggregate =
        StepAggregate::empty(&download_key(), UtcTimestamp::parse("2025-06-01T00:00:00Z").unwrap());
    aggregate.in_progress_count = u64::MAX;
    aggregate.failed_count = 2;
    aggregate.succeeded_count = 1;
    assert_eq!(aggregate.total(), u64::MAX);
}

// ============================================================================
// SECTION: Properties
// ============================================================================

fn status_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["IN_PROGRESS", "SCHEDULED", "PARKED", "FAILED", "SUCCEEDED"])
}

fn step_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["download", "transform", "upload"])
}

proptest! {
    /// Counters always equal the number of executions reporting each key and bucket.
    #[test]
    fn prop_counters_match_state_rows(
        events in prop::collection::vec(
            (0_u8..4, status_strategy(), step_strategy(), 0_i64..20, 0_u8..3),
            1..60,
        )
    ) {
        let ingestor = ingestor();
        let mut all = Vec::new();
        for (index, (execution, status, step, second, redeliver)) in events.iter().enumerate() {
            let event = event_at(&format!("E{execution}"), &format!("evt-{index}"), status, step, *second);
            ingestor.apply_event(&event).unwrap();
            all.push(event);
            if *redeliver == 0 {
                let again = all[index / 2].clone();
                ingestor.apply_event(&again).unwrap();
            }
        }

        let mut expected: BTreeMap<(StepKey, Bucket), u64> = BTreeMap::new();
        for execution in 0_u8..4 {
            if let Some(state) =
                ingestor.store().load_execution(&ExecutionId::new(format!("E{execution}"))).unwrap()
            {
                *expected.entry((state.step_key(), state.bucket)).or_default() += 1;
            }
        }
        for aggregate in all_aggregates(ingestor.store()) {
            for bucket in Bucket::ALL {
                let want = expected.get(&(aggregate.step_key(), bucket)).copied().unwrap_or(0);
                prop_assert_eq!(aggregate.count(bucket), want);
            }
        }
    }

    /// Applying the same event twice equals applying it once.
    #[test]
    fn prop_event_application_is_idempotent(
        status in status_strategy(),
        step in step_strategy(),
        second in 0_i64..100,
    ) {
        let once = ingestor();
        let twice = ingestor();
        let event = event_at("E1", "evt-1", status, step, second);
        once.apply_event(&event).unwrap();
        twice.apply_event(&event).unwrap();
        twice.apply_event(&event).unwrap();

        let id = ExecutionId::new("E1");
        prop_assert_eq!(
            once.store().load_execution(&id).unwrap(),
            twice.store().load_execution(&id).unwrap()
        );
        prop_assert_eq!(all_aggregates(once.store()), all_aggregates(twice.store()));
    }
}
