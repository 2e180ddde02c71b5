// crates/elephant-state-core/src/runtime/query.rs
// ============================================================================
// Module: Workflow Query Service
// Description: Read-side API for dashboards and repair tooling.
// Purpose: Compose aggregate scans, error listings, and repair ranking.
// Dependencies: serde, thiserror, tracing, crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! Full-fleet aggregate scans fan out one bounded query per pending shard on
//! scoped threads and merge the pages. The returned cursor records each
//! shard's own continuation, so a failed shard is retried alone on the next
//! call while completed shards are never re-read. Responses carry business
//! fields only; shard numbers and backend tokens stay inside the cursor.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::thread;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

use crate::core::Bucket;
use crate::core::CursorError;
use crate::core::ErrorRecord;
use crate::core::ErrorStatus;
use crate::core::ExecutionId;
use crate::core::ExecutionState;
use crate::core::FailedExecutionItem;
use crate::core::LinkedError;
use crate::core::SortOrder;
use crate::core::StepAggregate;
use crate::core::UtcTimestamp;
use crate::core::ValidationError;
use crate::core::cursor::decode_aggregate_cursor;
use crate::core::cursor::decode_error_cursor;
use crate::core::cursor::encode_aggregate_cursor;
use crate::core::cursor::encode_error_cursor;
use crate::core::cursor::initial_shard_positions;
use crate::core::normalize_data_group_label;
use crate::core::shard::all_shards;
use crate::core::validation::MAX_FIELD_BYTES;
use crate::core::validation::optional_field;
use crate::core::validation::require_field;
use crate::interfaces::ErrorFilter;
use crate::interfaces::ShardPage;
use crate::interfaces::StoreError;
use crate::interfaces::WorkflowStore;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Default page size.
pub const DEFAULT_PAGE_LIMIT: usize = 100;
/// Hard ceiling on any page size.
pub const MAX_PAGE_LIMIT: usize = 1_000;

/// Page size policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    /// Limit used when the caller gives none.
    default_limit: usize,
    /// Largest limit honored; larger requests are capped.
    max_limit: usize,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_PAGE_LIMIT,
            max_limit: MAX_PAGE_LIMIT,
        }
    }
}

impl PageLimits {
    /// Builds a page policy.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] unless `1 <= default <= max <= 1000`.
    pub fn new(default_limit: usize, max_limit: usize) -> Result<Self, ValidationError> {
        if max_limit == 0 || max_limit > MAX_PAGE_LIMIT {
            return Err(ValidationError::new(format!(
                "max page limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }
        if default_limit == 0 || default_limit > max_limit {
            return Err(ValidationError::new(
                "default page limit must be between 1 and the max page limit",
            ));
        }
        Ok(Self {
            default_limit,
            max_limit,
        })
    }

    /// Returns the default limit.
    #[must_use]
    pub const fn default_limit(&self) -> usize {
        self.default_limit
    }

    /// Returns the max limit.
    #[must_use]
    pub const fn max_limit(&self) -> usize {
        self.max_limit
    }

    /// Resolves a requested limit.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the request is zero.
    pub fn resolve(&self, requested: Option<usize>) -> Result<usize, ValidationError> {
        match requested {
            None => Ok(self.default_limit),
            Some(0) => Err(ValidationError::new("limit must be greater than zero")),
            Some(limit) => Ok(limit.min(self.max_limit)),
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Read-side failures.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Request or cursor rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CursorError> for QueryError {
    fn from(err: CursorError) -> Self {
        Self::Validation(ValidationError::new(err.to_string()))
    }
}

// ============================================================================
// SECTION: Requests and Views
// ============================================================================

/// Business-field view of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    /// Execution identifier.
    pub execution_id: ExecutionId,
    /// County name.
    pub county: String,
    /// Data-group label.
    pub data_group_label: String,
    /// Phase label.
    pub phase: String,
    /// Step label.
    pub step: String,
    /// Aggregate bucket.
    pub status: Bucket,
    /// Raw upstream status.
    pub raw_status: String,
    /// Callback token when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_token: Option<String>,
    /// Event time of the last accepted notification.
    pub last_event_time: UtcTimestamp,
    /// Creation time.
    pub created_at: UtcTimestamp,
    /// Last update time.
    pub updated_at: UtcTimestamp,
}

impl From<ExecutionState> for ExecutionSummary {
    fn from(state: ExecutionState) -> Self {
        Self {
            execution_id: state.execution_id,
            county: state.county,
            data_group_label: state.data_group_label,
            phase: state.phase,
            step: state.step,
            status: state.bucket,
            raw_status: state.raw_status,
            task_token: state.task_token,
            last_event_time: state.last_event_time,
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }
}

/// Repair-candidate selection request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRankRequest {
    /// Rank direction.
    #[serde(default)]
    pub sort_order: SortOrder,
    /// Optional error-type prefix filter.
    #[serde(default)]
    pub error_type: Option<String>,
}

/// Selected repair candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionErrorSummary {
    /// Execution state, when the execution is still tracked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSummary>,
    /// Error rollup.
    pub failure: FailedExecutionItem,
    /// Linked errors counted by the rollup.
    pub errors: Vec<LinkedError>,
}

/// Single county aggregate request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CountyAggregateRequest {
    /// County name.
    pub county: String,
    /// Data-group label; missing or blank means the unset sentinel.
    pub data_group_label: Option<String>,
    /// Optional phase prefix.
    pub phase: Option<String>,
}

/// One page of a full-fleet aggregate scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatePage {
    /// Aggregates from every shard read in this call.
    pub items: Vec<StepAggregate>,
    /// Resume cursor; absent once every shard is exhausted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Number of shards that failed and will be retried from the cursor.
    pub failed_shards: u32,
}

/// Fleet-wide counters for one phase and step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStepTotal {
    /// Phase label.
    pub phase: String,
    /// Step label.
    pub step: String,
    /// Executions in progress.
    pub in_progress_count: u64,
    /// Executions failed.
    pub failed_count: u64,
    /// Executions succeeded.
    pub succeeded_count: u64,
}

/// Error listing request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorListRequest {
    /// Error-type prefix filter.
    pub error_type: Option<String>,
    /// Status filter.
    pub status: Option<ErrorStatus>,
    /// Resume cursor.
    pub cursor: Option<String>,
    /// Requested page size.
    pub limit: Option<usize>,
}

/// One page of error records.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPage {
    /// Records by total count descending.
    pub items: Vec<ErrorRecord>,
    /// Resume cursor when more records exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

// ============================================================================
// SECTION: Query Service
// ============================================================================

/// Read-side service over a workflow store.
#[derive(Debug, Clone)]
pub struct WorkflowQueryService<S> {
    /// Backing store.
    store: S,
    /// Page size policy.
    limits: PageLimits,
}

impl<S: WorkflowStore> WorkflowQueryService<S> {
    /// Creates a query service with default page limits.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_limits(store, PageLimits::default())
    }

    /// Creates a query service with explicit page limits.
    #[must_use]
    pub const fn with_limits(store: S, limits: PageLimits) -> Self {
        Self {
            store,
            limits,
        }
    }

    /// Returns the backing store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Returns the page size policy.
    #[must_use]
    pub const fn limits(&self) -> PageLimits {
        self.limits
    }

    /// Returns the execution ranked first by distinct error count, with its
    /// rollup and linked errors.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] when the filter is malformed or the store fails.
    pub fn execution_by_error_count(
        &self,
        request: &ExecutionRankRequest,
    ) -> Result<Option<ExecutionErrorSummary>, QueryError> {
        let error_type = optional_field("errorType", request.error_type.as_deref(), MAX_FIELD_BYTES)?;
        let error_type = error_type.as_deref();
        let Some(execution_id) =
            self.store.rank_execution_by_error_count(request.sort_order, error_type)?
        else {
            return Ok(None);
        };
        let links: Vec<LinkedError> = self
            .store
            .list_execution_errors(&execution_id)?
            .into_iter()
            .filter(|linked| error_type.is_none_or(|prefix| linked.error_type.starts_with(prefix)))
            .collect();
        let state = self.store.load_execution(&execution_id)?;
        let task_token = state.as_ref().and_then(|state| state.task_token.clone());
        let Some(failure) = FailedExecutionItem::from_links(&execution_id, &links, None, task_token)
        else {
            return Ok(None);
        };
        Ok(Some(ExecutionErrorSummary {
            execution: state.map(ExecutionSummary::from),
            failure,
            errors: links,
        }))
    }

    /// Reads one page of a full-fleet aggregate scan.
    ///
    /// Each pending shard is queried in parallel with a limit of
    /// `ceil(limit / pending shards)`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Validation`] for malformed cursors or limits.
    /// Shard failures are reported in the page instead.
    pub fn query_all_step_aggregates(
        &self,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<AggregatePage, QueryError> {
        let limit = self.limits.resolve(limit)?;
        let pending = match cursor {
            Some(cursor) => decode_aggregate_cursor(cursor)?,
            None => initial_shard_positions(),
        };
        let per_shard = limit.div_ceil(pending.len().max(1));
        let results = self.fan_out(&pending, per_shard);

        let mut items = Vec::new();
        let mut next = BTreeMap::new();
        let mut failed_shards = 0_u32;
        for (shard, result) in results {
            match result {
                Ok(page) => {
                    items.extend(page.items);
                    if let Some(token) = page.next_token {
                        next.insert(shard, Some(token));
                    }
                }
                Err(err) => {
                    warn!(shard, error = %err, "aggregate shard query failed");
                    failed_shards += 1;
                    next.insert(shard, pending.get(&shard).cloned().flatten());
                }
            }
        }
        debug!(items = items.len(), pending = next.len(), failed_shards, "aggregate scan page");
        Ok(AggregatePage {
            items,
            cursor: encode_aggregate_cursor(&next)?,
            failed_shards,
        })
    }

    /// Reads every aggregate for one county and data group.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] when the county is blank or the store fails.
    pub fn query_step_aggregates_for_county(
        &self,
        request: &CountyAggregateRequest,
    ) -> Result<Vec<StepAggregate>, QueryError> {
        let county = require_field("county", &request.county, MAX_FIELD_BYTES)?;
        let data_group_label = normalize_data_group_label(request.data_group_label.as_deref());
        let phase = optional_field("phase", request.phase.as_deref(), MAX_FIELD_BYTES)?;
        Ok(self.store.query_county(&county, &data_group_label, phase.as_deref())?)
    }

    /// Sums every aggregate in the fleet per phase and step.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Store`] when any shard read fails.
    pub fn fleet_totals(&self) -> Result<Vec<FleetStepTotal>, QueryError> {
        let mut totals: BTreeMap<(String, String), FleetStepTotal> = BTreeMap::new();
        for shard in all_shards() {
            let mut after: Option<String> = None;
            loop {
                let page = self.store.query_shard(shard, after.as_deref(), self.limits.max_limit)?;
                for aggregate in page.items {
                    let total = totals
                        .entry((aggregate.phase.clone(), aggregate.step.clone()))
                        .or_insert_with(|| FleetStepTotal {
                            phase: aggregate.phase.clone(),
                            step: aggregate.step.clone(),
                            in_progress_count: 0,
                            failed_count: 0,
                            succeeded_count: 0,
                        });
                    total.in_progress_count += aggregate.in_progress_count;
                    total.failed_count += aggregate.failed_count;
                    total.succeeded_count += aggregate.succeeded_count;
                }
                match page.next_token {
                    Some(token) => after = Some(token),
                    None => break,
                }
            }
        }
        Ok(totals.into_values().collect())
    }

    /// Lists error records by total count.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] for malformed cursors or when the store fails.
    pub fn list_errors(&self, request: &ErrorListRequest) -> Result<ErrorPage, QueryError> {
        let limit = self.limits.resolve(request.limit)?;
        let filter = ErrorFilter {
            error_type: optional_field("errorType", request.error_type.as_deref(), MAX_FIELD_BYTES)?,
            status: request.status,
        };
        let after = request.cursor.as_deref().map(decode_error_cursor).transpose()?;
        let page = self.store.list_errors(&filter, after.as_deref(), limit)?;
        let cursor = page.next_token.as_deref().map(encode_error_cursor).transpose()?;
        Ok(ErrorPage {
            items: page.items,
            cursor,
        })
    }

    /// Returns the business-field view of one execution.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Store`] when the store fails.
    pub fn execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionSummary>, QueryError> {
        Ok(self.store.load_execution(execution_id)?.map(ExecutionSummary::from))
    }

    /// Queries every pending shard on its own scoped thread.
    fn fan_out(
        &self,
        pending: &BTreeMap<u32, Option<String>>,
        per_shard: usize,
    ) -> Vec<(u32, Result<ShardPage, StoreError>)> {
        let store = &self.store;
        thread::scope(|scope| {
            let handles: Vec<_> = pending
                .iter()
                .map(|(shard, token)| {
                    let shard = *shard;
                    let handle = scope
                        .spawn(move || store.query_shard(shard, token.as_deref(), per_shard));
                    (shard, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(shard, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(StoreError::Store(format!("shard {shard} query panicked")))
                    });
                    (shard, result)
                })
                .collect()
        })
    }
}
