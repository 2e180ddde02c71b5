// crates/elephant-state-core/src/runtime/store.rs
// ============================================================================
// Module: In-Memory Workflow Store
// Description: Reference backend for every store interface.
// Purpose: Provide a deterministic store for tests and local runs.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! [`InMemoryWorkflowStore`] keeps all tables behind a single mutex, so each
//! call is one atomic unit. Every fallible check runs before the first
//! mutation, which gives the same all-or-nothing visibility as a database
//! transaction. It is not intended for production use.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::core::Bucket;
use crate::core::ErrorBatch;
use crate::core::ErrorHash;
use crate::core::ErrorRecord;
use crate::core::ErrorStatus;
use crate::core::ExecutionErrorLink;
use crate::core::ExecutionId;
use crate::core::ExecutionState;
use crate::core::ExecutionUpdate;
use crate::core::LinkedError;
use crate::core::SortOrder;
use crate::core::StepAggregate;
use crate::core::StepKey;
use crate::core::UtcTimestamp;
use crate::interfaces::AggregateIndex;
use crate::interfaces::DeleteOutcome;
use crate::interfaces::EVENT_TOKEN_SCOPE;
use crate::interfaces::ErrorFilter;
use crate::interfaces::ErrorIngestOutcome;
use crate::interfaces::ErrorListToken;
use crate::interfaces::ErrorRecordPage;
use crate::interfaces::ErrorRecordStore;
use crate::interfaces::ExecutionStateStore;
use crate::interfaces::REPORT_TOKEN_SCOPE;
use crate::interfaces::ShardPage;
use crate::interfaces::SkipReason;
use crate::interfaces::StatusChange;
use crate::interfaces::StoreError;
use crate::interfaces::UpsertResult;
use crate::interfaces::WorkflowStore;
use crate::interfaces::parse_step_key_token;
use crate::interfaces::step_key_token;
use crate::runtime::transition::TransitionPlan;
use crate::runtime::transition::plan_transition;

// ============================================================================
// SECTION: In-Memory Store
// ============================================================================

/// Tables held by the in-memory store.
#[derive(Debug, Default)]
struct Tables {
    /// Execution snapshots by id.
    executions: BTreeMap<ExecutionId, ExecutionState>,
    /// Step aggregates in key order.
    aggregates: BTreeMap<StepKey, StepAggregate>,
    /// Processed idempotency tokens as `(scope, token)`.
    processed: BTreeSet<(String, String)>,
    /// Error records by hash.
    errors: BTreeMap<ErrorHash, ErrorRecord>,
    /// Execution-error links by `(execution, hash)`.
    links: BTreeMap<(ExecutionId, ErrorHash), ExecutionErrorLink>,
}

impl Tables {
    /// Returns true when a token was already applied in a scope.
    fn is_processed(&self, scope: &str, token: &str) -> bool {
        self.processed.contains(&(scope.to_string(), token.to_string()))
    }

    /// Verifies a counter can be decremented without going negative.
    fn check_decrement(&self, key: &StepKey, bucket: Bucket) -> Result<(), StoreError> {
        match self.aggregates.get(key) {
            Some(aggregate) if aggregate.count(bucket) > 0 => Ok(()),
            _ => Err(StoreError::Corrupt(format!(
                "step aggregate {}#{}#{}#{} has no {bucket} count to move",
                key.county, key.data_group_label, key.phase, key.step
            ))),
        }
    }

    /// Decrements a counter previously verified by [`Self::check_decrement`].
    fn decrement(&mut self, key: &StepKey, bucket: Bucket, at: UtcTimestamp) {
        if let Some(aggregate) = self.aggregates.get_mut(key) {
            let counter = aggregate.count_mut(bucket);
            *counter = counter.saturating_sub(1);
            aggregate.updated_at = at;
        }
    }

    /// Increments a counter, creating the aggregate when absent.
    fn increment(&mut self, key: &StepKey, bucket: Bucket, at: UtcTimestamp) {
        let aggregate =
            self.aggregates.entry(key.clone()).or_insert_with(|| StepAggregate::empty(key, at));
        *aggregate.count_mut(bucket) += 1;
        aggregate.updated_at = at;
    }

    /// Joins a link with its record.
    fn linked(&self, link: &ExecutionErrorLink) -> LinkedError {
        let record = self.errors.get(&link.error_code);
        LinkedError {
            link: link.clone(),
            error_type: record.map(|record| record.error_type.clone()).unwrap_or_default(),
            error_status: record.map_or(link.status, |record| record.error_status),
            total_count: record.map_or(0, |record| record.total_count),
        }
    }
}

/// In-memory workflow store for tests and local runs.
#[derive(Debug, Default, Clone)]
pub struct InMemoryWorkflowStore {
    /// Tables protected by a single mutex.
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryWorkflowStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
        }
    }

    /// Locks the tables.
    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Store("workflow store mutex poisoned".to_string()))
    }
}

impl ExecutionStateStore for InMemoryWorkflowStore {
    fn load_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionState>, StoreError> {
        Ok(self.lock()?.executions.get(execution_id).cloned())
    }

    fn upsert_execution(&self, update: &ExecutionUpdate) -> Result<UpsertResult, StoreError> {
        let mut tables = self.lock()?;
        let current = tables.executions.get(&update.execution_id).cloned();
        if tables.is_processed(EVENT_TOKEN_SCOPE, update.event_id.as_str()) {
            return Ok(UpsertResult::skipped(SkipReason::DuplicateEvent, current));
        }
        let plan = plan_transition(current.as_ref(), update);
        let at = update.received_at;
        match &plan {
            TransitionPlan::Skip(reason) => return Ok(UpsertResult::skipped(*reason, current)),
            TransitionPlan::Create { increment, .. } => {
                tables.increment(&increment.0, increment.1, at);
            }
            TransitionPlan::Refresh { .. } => {}
            TransitionPlan::Move { decrement, increment, .. } => {
                tables.check_decrement(&decrement.0, decrement.1)?;
                tables.decrement(&decrement.0, decrement.1, at);
                tables.increment(&increment.0, increment.1, at);
            }
        }
        let outcome = plan.outcome();
        let new_state = plan.state().cloned();
        if let Some(state) = &new_state {
            tables.executions.insert(state.execution_id.clone(), state.clone());
        }
        tables
            .processed
            .insert((EVENT_TOKEN_SCOPE.to_string(), update.event_id.as_str().to_string()));
        drop(tables);
        Ok(UpsertResult {
            outcome,
            previous_state: current,
            new_state,
        })
    }

    fn delete_execution(
        &self,
        execution_id: &ExecutionId,
        at: UtcTimestamp,
    ) -> Result<DeleteOutcome, StoreError> {
        let mut tables = self.lock()?;
        let previous = tables.executions.get(execution_id).cloned();
        if let Some(state) = &previous {
            tables.check_decrement(&state.step_key(), state.bucket)?;
            tables.decrement(&state.step_key(), state.bucket, at);
            tables.executions.remove(execution_id);
        }
        let before = tables.links.len();
        tables.links.retain(|(owner, _), _| owner != execution_id);
        let links_removed = u64::try_from(before - tables.links.len()).unwrap_or(u64::MAX);
        drop(tables);
        Ok(DeleteOutcome {
            deleted: previous.is_some(),
            links_removed,
            previous_state: previous,
        })
    }
}

impl AggregateIndex for InMemoryWorkflowStore {
    fn load_step_aggregate(&self, key: &StepKey) -> Result<Option<StepAggregate>, StoreError> {
        Ok(self.lock()?.aggregates.get(key).cloned())
    }

    fn query_shard(
        &self,
        shard: u32,
        after: Option<&str>,
        limit: usize,
    ) -> Result<ShardPage, StoreError> {
        if limit == 0 {
            return Err(StoreError::Invalid("shard query limit must be positive".to_string()));
        }
        let lower = match after {
            Some(token) => Bound::Excluded(parse_step_key_token(token)?),
            None => Bound::Unbounded,
        };
        let tables = self.lock()?;
        let mut items: Vec<StepAggregate> = tables
            .aggregates
            .range((lower, Bound::Unbounded))
            .filter(|(key, _)| key.shard() == shard)
            .take(limit + 1)
            .map(|(_, aggregate)| aggregate.clone())
            .collect();
        drop(tables);
        let next_token = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|last| step_key_token(&last.step_key()))
        } else {
            None
        };
        Ok(ShardPage { items, next_token })
    }

    fn query_county(
        &self,
        county: &str,
        data_group_label: &str,
        phase_prefix: Option<&str>,
    ) -> Result<Vec<StepAggregate>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .aggregates
            .values()
            .filter(|aggregate| {
                aggregate.county == county
                    && aggregate.data_group_label == data_group_label
                    && phase_prefix.is_none_or(|prefix| aggregate.phase.starts_with(prefix))
            })
            .cloned()
            .collect())
    }
}

impl ErrorRecordStore for InMemoryWorkflowStore {
    fn record_errors(&self, batch: &ErrorBatch) -> Result<ErrorIngestOutcome, StoreError> {
        let mut tables = self.lock()?;
        if let Some(key) = &batch.idempotency_key
            && tables.is_processed(REPORT_TOKEN_SCOPE, key)
        {
            return Ok(ErrorIngestOutcome {
                skipped: true,
                ..ErrorIngestOutcome::default()
            });
        }
        let at = batch.observed_at;
        let mut outcome = ErrorIngestOutcome::default();
        for occurrence in &batch.occurrences {
            if let Some(record) = tables.errors.get_mut(&occurrence.hash) {
                record.total_count += occurrence.occurrences;
                record.latest_execution_id = batch.execution_id.clone();
                record.error_status = ErrorStatus::Failed;
                record.updated_at = at;
                outcome.records_updated += 1;
            } else {
                tables.errors.insert(
                    occurrence.hash.clone(),
                    ErrorRecord {
                        error_code: occurrence.hash.clone(),
                        error_type: occurrence.error_type.clone(),
                        total_count: occurrence.occurrences,
                        error_status: ErrorStatus::Failed,
                        latest_execution_id: batch.execution_id.clone(),
                        error_details: occurrence.details.clone(),
                        created_at: at,
                        updated_at: at,
                    },
                );
                outcome.records_created += 1;
            }
            let link_key = (batch.execution_id.clone(), occurrence.hash.clone());
            if let Some(link) = tables.links.get_mut(&link_key) {
                link.occurrences += occurrence.occurrences;
                link.status = ErrorStatus::Failed;
                link.error_details = occurrence.details.clone();
                link.updated_at = at;
                outcome.links_updated += 1;
            } else {
                tables.links.insert(
                    link_key,
                    ExecutionErrorLink {
                        execution_id: batch.execution_id.clone(),
                        error_code: occurrence.hash.clone(),
                        occurrences: occurrence.occurrences,
                        status: ErrorStatus::Failed,
                        error_details: occurrence.details.clone(),
                        county: batch.county.clone(),
                        created_at: at,
                        updated_at: at,
                    },
                );
                outcome.links_created += 1;
            }
        }
        if let Some(key) = &batch.idempotency_key {
            tables.processed.insert((REPORT_TOKEN_SCOPE.to_string(), key.clone()));
        }
        drop(tables);
        Ok(outcome)
    }

    fn load_error(&self, hash: &ErrorHash) -> Result<Option<ErrorRecord>, StoreError> {
        Ok(self.lock()?.errors.get(hash).cloned())
    }

    fn list_execution_errors(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<LinkedError>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .links
            .iter()
            .filter(|((owner, _), _)| owner == execution_id)
            .map(|(_, link)| tables.linked(link))
            .collect())
    }

    fn set_error_status(&self, change: &StatusChange) -> Result<u64, StoreError> {
        let mut tables = self.lock()?;
        let targets: BTreeSet<&ErrorHash> = change.hashes.iter().collect();
        let mut changed = 0_u64;
        for hash in &targets {
            let Some(record) = tables.errors.get_mut(*hash) else {
                continue;
            };
            if change.only_from.is_some_and(|from| record.error_status != from)
                || record.error_status == change.to
            {
                continue;
            }
            record.error_status = change.to;
            record.updated_at = change.at;
            changed += 1;
        }
        for link in tables.links.values_mut() {
            if targets.contains(&link.error_code)
                && change.only_from.is_none_or(|from| link.status == from)
                && link.status != change.to
            {
                link.status = change.to;
                link.updated_at = change.at;
            }
        }
        drop(tables);
        Ok(changed)
    }

    fn list_errors(
        &self,
        filter: &ErrorFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<ErrorRecordPage, StoreError> {
        if limit == 0 {
            return Err(StoreError::Invalid("error list limit must be positive".to_string()));
        }
        let after = after.map(ErrorListToken::parse).transpose()?;
        let mut records: Vec<ErrorRecord> = {
            let tables = self.lock()?;
            tables.errors.values().filter(|record| filter.matches(record)).cloned().collect()
        };
        records.sort_by(|a, b| {
            b.total_count.cmp(&a.total_count).then_with(|| a.error_code.cmp(&b.error_code))
        });
        let mut items: Vec<ErrorRecord> = records
            .into_iter()
            .filter(|record| after.as_ref().is_none_or(|token| token.precedes(record)))
            .take(limit + 1)
            .collect();
        let next_token = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|last| ErrorListToken::for_record(last).encode())
        } else {
            None
        };
        Ok(ErrorRecordPage { items, next_token })
    }

    fn rank_execution_by_error_count(
        &self,
        order: SortOrder,
        error_type: Option<&str>,
    ) -> Result<Option<ExecutionId>, StoreError> {
        let tables = self.lock()?;
        let mut tallies: BTreeMap<&ExecutionId, (u64, u64)> = BTreeMap::new();
        for ((owner, hash), _) in &tables.links {
            let Some(record) = tables.errors.get(hash) else { continue };
            if error_type.is_some_and(|prefix| !record.error_type.starts_with(prefix)) {
                continue;
            }
            let (unique, open) = tallies.entry(owner).or_default();
            *unique += 1;
            if record.error_status.is_open() {
                *open += 1;
            }
        }
        // Resolved executions are not repair candidates.
        let candidates = tallies
            .into_iter()
            .filter(|(_, (_, open))| *open > 0)
            .map(|(id, (unique, _))| (id, unique));
        // Ascending id order makes the first extreme win ties.
        let ranked = candidates.fold(None::<(&ExecutionId, u64)>, |best, (id, count)| {
            match best {
                Some((_, best_count))
                    if (order == SortOrder::Most && best_count >= count)
                        || (order == SortOrder::Least && best_count <= count) =>
                {
                    best
                }
                _ => Some((id, count)),
            }
        });
        Ok(ranked.map(|(id, _)| id.clone()))
    }
}

// ============================================================================
// SECTION: Shared Store Wrapper
// ============================================================================

/// Shared workflow store backed by an `Arc` trait object.
#[derive(Clone)]
pub struct SharedWorkflowStore {
    /// Inner store implementation.
    inner: Arc<dyn WorkflowStore>,
}

impl SharedWorkflowStore {
    /// Wraps a workflow store in a shared, clonable wrapper.
    #[must_use]
    pub fn from_store(store: impl WorkflowStore + 'static) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Wraps an existing shared store.
    #[must_use]
    pub const fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            inner: store,
        }
    }
}

impl ExecutionStateStore for SharedWorkflowStore {
    fn load_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionState>, StoreError> {
        self.inner.load_execution(execution_id)
    }

    fn upsert_execution(&self, update: &ExecutionUpdate) -> Result<UpsertResult, StoreError> {
        self.inner.upsert_execution(update)
    }

    fn delete_execution(
        &self,
        execution_id: &ExecutionId,
        at: UtcTimestamp,
    ) -> Result<DeleteOutcome, StoreError> {
        self.inner.delete_execution(execution_id, at)
    }
}

impl AggregateIndex for SharedWorkflowStore {
    fn load_step_aggregate(&self, key: &StepKey) -> Result<Option<StepAggregate>, StoreError> {
        self.inner.load_step_aggregate(key)
    }

    fn query_shard(
        &self,
        shard: u32,
        after: Option<&str>,
        limit: usize,
    ) -> Result<ShardPage, StoreError> {
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

impl ErrorRecordStore for SharedWorkflowStore {
    fn record_errors(&self, batch: &ErrorBatch) -> Result<ErrorIngestOutcome, StoreError> {
        self.inner.record_errors(batch)
    }

    fn load_error(&self, hash: &ErrorHash) -> Result<Option<ErrorRecord>, StoreError> {
        self.inner.load_error(hash)
    }

    fn list_execution_errors(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<LinkedError>, StoreError> {
        self.inner.list_execution_errors(execution_id)
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
