// crates/elephant-state-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Workflow Store
// Description: Durable workflow store backed by SQLite WAL.
// Purpose: Persist execution state, step counters, and error records atomically.
// Dependencies: elephant-state-core, rusqlite, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! This module implements every workflow store interface on `SQLite`. Writes
//! open an `IMMEDIATE` transaction, take the planner's decision, and apply it
//! with conditional statements: the state update carries
//! `last_event_time_ns < :new`, and counter decrements carry `count > 0`.
//! Any mismatch rolls the whole transaction back. Timestamps are stored as
//! unix nanoseconds. Security posture: database contents are untrusted and
//! every row is validated on load.

// ============================================================================//
// SECTION: Imports
// ============================================================================//

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use elephant_state_core::AggregateIndex;
use elephant_state_core::Bucket;
use elephant_state_core::DeleteOutcome;
use elephant_state_core::ErrorBatch;
use elephant_state_core::ErrorFilter;
use elephant_state_core::ErrorHash;
use elephant_state_core::ErrorIngestOutcome;
use elephant_state_core::ErrorRecord;
use elephant_state_core::ErrorRecordPage;
use elephant_state_core::ErrorRecordStore;
use elephant_state_core::ErrorStatus;
use elephant_state_core::ExecutionErrorLink;
use elephant_state_core::ExecutionId;
use elephant_state_core::ExecutionState;
use elephant_state_core::ExecutionStateStore;
use elephant_state_core::ExecutionUpdate;
use elephant_state_core::LinkedError;
use elephant_state_core::ShardPage;
use elephant_state_core::SkipReason;
use elephant_state_core::SortOrder;
use elephant_state_core::StatusChange;
use elephant_state_core::StepAggregate;
use elephant_state_core::StepKey;
use elephant_state_core::StoreError;
use elephant_state_core::UpsertResult;
use elephant_state_core::UtcTimestamp;
use elephant_state_core::interfaces::EVENT_TOKEN_SCOPE;
use elephant_state_core::interfaces::ErrorListToken;
use elephant_state_core::interfaces::REPORT_TOKEN_SCOPE;
use elephant_state_core::interfaces::parse_step_key_token;
use elephant_state_core::interfaces::step_key_token;
use elephant_state_core::runtime::TransitionPlan;
use elephant_state_core::runtime::plan_transition;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::Transaction;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

// ============================================================================//
// SECTION: Constants
// ============================================================================//

/// `SQLite` schema version for the store.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;

/// Columns selected for execution rows.
const EXECUTION_COLUMNS: &str = "execution_id, county, data_group_label, phase, step, bucket, \
                                 raw_status, task_token, last_event_time_ns, created_at_ns, \
                                 updated_at_ns, version";
/// Columns selected for aggregate rows.
const AGGREGATE_COLUMNS: &str = "county, data_group_label, phase, step, in_progress_count, \
                                 failed_count, succeeded_count, updated_at_ns";
/// Columns selected for error record rows.
const ERROR_COLUMNS: &str = "error_hash, error_type, total_count, error_status, \
                             latest_execution_id, error_details, created_at_ns, updated_at_ns";

/// Schema for a fresh database.
const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS executions (
        execution_id TEXT PRIMARY KEY,
        county TEXT NOT NULL,
        data_group_label TEXT NOT NULL,
        phase TEXT NOT NULL,
        step TEXT NOT NULL,
        bucket TEXT NOT NULL,
        raw_status TEXT NOT NULL,
        task_token TEXT,
        last_event_time_ns INTEGER NOT NULL,
        created_at_ns INTEGER NOT NULL,
        updated_at_ns INTEGER NOT NULL,
        version INTEGER NOT NULL CHECK (version >= 1)
    );
    CREATE TABLE IF NOT EXISTS step_aggregates (
        county TEXT NOT NULL,
        data_group_label TEXT NOT NULL,
        phase TEXT NOT NULL,
        step TEXT NOT NULL,
        shard INTEGER NOT NULL,
        in_progress_count INTEGER NOT NULL DEFAULT 0 CHECK (in_progress_count >= 0),
        failed_count INTEGER NOT NULL DEFAULT 0 CHECK (failed_count >= 0),
        succeeded_count INTEGER NOT NULL DEFAULT 0 CHECK (succeeded_count >= 0),
        updated_at_ns INTEGER NOT NULL,
        PRIMARY KEY (county, data_group_label, phase, step)
    );
    CREATE INDEX IF NOT EXISTS idx_step_aggregates_shard
        ON step_aggregates (shard, county, data_group_label, phase, step);
    CREATE TABLE IF NOT EXISTS processed_tokens (
        scope TEXT NOT NULL,
        token TEXT NOT NULL,
        processed_at_ns INTEGER NOT NULL,
        PRIMARY KEY (scope, token)
    );
    CREATE TABLE IF NOT EXISTS error_records (
        error_hash TEXT PRIMARY KEY,
        error_type TEXT NOT NULL,
        total_count INTEGER NOT NULL CHECK (total_count >= 0),
        error_status TEXT NOT NULL,
        latest_execution_id TEXT NOT NULL,
        error_details TEXT NOT NULL,
        created_at_ns INTEGER NOT NULL,
        updated_at_ns INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_error_records_total
        ON error_records (total_count DESC, error_hash);
    CREATE TABLE IF NOT EXISTS execution_error_links (
        execution_id TEXT NOT NULL,
        error_hash TEXT NOT NULL,
        occurrences INTEGER NOT NULL CHECK (occurrences >= 0),
        status TEXT NOT NULL,
        error_details TEXT NOT NULL,
        county TEXT NOT NULL,
        created_at_ns INTEGER NOT NULL,
        updated_at_ns INTEGER NOT NULL,
        PRIMARY KEY (execution_id, error_hash)
    );
    CREATE INDEX IF NOT EXISTS idx_execution_error_links_hash
        ON execution_error_links (error_hash);
";

// ============================================================================//
// SECTION: Config
// ============================================================================//

/// `SQLite` journal mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteStoreMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteStoreMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` workflow store.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteStoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl SqliteStoreConfig {
    /// Builds a config with default pragmas for a database path.
    #[must_use]
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteStoreMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================//
// SECTION: Errors
// ============================================================================//

/// `SQLite` store errors.
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// Store I/O error.
    #[error("sqlite store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("sqlite store db error: {0}")]
    Db(String),
    /// Database is busy or locked by another writer.
    #[error("sqlite store busy: {0}")]
    Busy(String),
    /// Store corruption or broken invariant.
    #[error("sqlite store corruption: {0}")]
    Corrupt(String),
    /// Store schema version mismatch.
    #[error("sqlite store version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid store data or request.
    #[error("sqlite store invalid data: {0}")]
    Invalid(String),
    /// A conditional write lost to a concurrent writer.
    #[error("sqlite store conflict: {0}")]
    Conflict(String),
}

impl From<rusqlite::Error> for SqliteStoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Self::Busy(err.to_string())
            }
            _ => Self::Db(err.to_string()),
        }
    }
}

impl From<SqliteStoreError> for StoreError {
    fn from(error: SqliteStoreError) -> Self {
        match error {
            SqliteStoreError::Io(message) => Self::Io(message),
            SqliteStoreError::Db(message) => Self::Store(message),
            SqliteStoreError::Busy(message) => Self::Unavailable(message),
            SqliteStoreError::Corrupt(message) => Self::Corrupt(message),
            SqliteStoreError::VersionMismatch(message) => Self::VersionMismatch(message),
            SqliteStoreError::Invalid(message) => Self::Invalid(message),
            SqliteStoreError::Conflict(message) => Self::Conflict(message),
        }
    }
}

// ============================================================================//
// SECTION: Store
// ============================================================================//

/// `SQLite`-backed workflow store with WAL support.
#[derive(Clone)]
pub struct SqliteWorkflowStore {
    /// Store configuration.
    config: SqliteStoreConfig,
    /// Shared `SQLite` connection guarded by a mutex.
    connection: Arc<Mutex<Connection>>,
}

impl SqliteWorkflowStore {
    /// Opens an `SQLite`-backed workflow store.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the database cannot be opened or
    /// initialized.
    pub fn new(config: SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        validate_store_path(&config.path)?;
        ensure_parent_dir(&config.path)?;
        let mut connection = open_connection(&config)?;
        initialize_schema(&mut connection)?;
        debug!(path = %config.path.display(), "opened sqlite workflow store");
        Ok(Self {
            config,
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Returns the store configuration.
    #[must_use]
    pub const fn config(&self) -> &SqliteStoreConfig {
        &self.config
    }

    /// Locks the shared connection.
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SqliteStoreError> {
        self.connection.lock().map_err(|_| SqliteStoreError::Db("mutex poisoned".to_string()))
    }

    /// Runs a closure inside an `IMMEDIATE` transaction and commits on success.
    fn write<T>(
        &self,
        apply: impl FnOnce(&Transaction<'_>) -> Result<T, SqliteStoreError>,
    ) -> Result<T, SqliteStoreError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = apply(&tx)?;
        tx.commit()?;
        drop(guard);
        Ok(value)
    }

    /// Runs a closure against the connection without a write transaction.
    fn read<T>(
        &self,
        apply: impl FnOnce(&Connection) -> Result<T, SqliteStoreError>,
    ) -> Result<T, SqliteStoreError> {
        let guard = self.lock()?;
        let value = apply(&guard)?;
        drop(guard);
        Ok(value)
    }

    /// Applies a fenced upsert and its counter deltas in one transaction.
    fn upsert_state(&self, update: &ExecutionUpdate) -> Result<UpsertResult, SqliteStoreError> {
        self.write(|tx| {
            let current = select_execution(tx, &update.execution_id)?;
            if is_processed(tx, EVENT_TOKEN_SCOPE, update.event_id.as_str())? {
                return Ok(UpsertResult::skipped(SkipReason::DuplicateEvent, current));
            }
            let plan = plan_transition(current.as_ref(), update);
            let at = nanos(update.received_at)?;
            let applied = match &plan {
                TransitionPlan::Skip(reason) => {
                    return Ok(UpsertResult::skipped(*reason, current));
                }
                TransitionPlan::Create { state, increment } => {
                    let inserted = insert_execution(tx, state)?;
                    if inserted {
                        increment_counter(tx, &increment.0, increment.1, at)?;
                    }
                    inserted
                }
                TransitionPlan::Refresh { state } => {
                    update_execution(tx, state, nanos(update.event_time)?)?
                }
                TransitionPlan::Move { state, decrement, increment } => {
                    let updated = update_execution(tx, state, nanos(update.event_time)?)?;
                    if updated {
                        decrement_counter(tx, &decrement.0, decrement.1, at)?;
                        increment_counter(tx, &increment.0, increment.1, at)?;
                    }
                    updated
                }
            };
            if !applied {
                // The conditional write lost; nothing else was touched.
                return Ok(UpsertResult::skipped(SkipReason::StaleEvent, current));
            }
            mark_processed(tx, EVENT_TOKEN_SCOPE, update.event_id.as_str(), at)?;
            Ok(UpsertResult {
                outcome: plan.outcome(),
                previous_state: current,
                new_state: plan.state().cloned(),
            })
        })
    }

    /// Removes an execution, its links, and its counter contribution.
    fn delete_state(
        &self,
        execution_id: &ExecutionId,
        at: UtcTimestamp,
    ) -> Result<DeleteOutcome, SqliteStoreError> {
        let at = nanos(at)?;
        self.write(|tx| {
            let previous = select_execution(tx, execution_id)?;
            if let Some(state) = &previous {
                decrement_counter(tx, &state.step_key(), state.bucket, at)?;
                tx.execute(
                    "DELETE FROM executions WHERE execution_id = ?1",
                    params![execution_id.as_str()],
                )?;
            }
            let links_removed = tx.execute(
                "DELETE FROM execution_error_links WHERE execution_id = ?1",
                params![execution_id.as_str()],
            )?;
            Ok(DeleteOutcome {
                deleted: previous.is_some(),
                links_removed: u64::try_from(links_removed).unwrap_or(u64::MAX),
                previous_state: previous,
            })
        })
    }

    /// Upserts error records and links for a batch in one transaction.
    fn record_batch(&self, batch: &ErrorBatch) -> Result<ErrorIngestOutcome, SqliteStoreError> {
        self.write(|tx| {
            if let Some(key) = &batch.idempotency_key
                && is_processed(tx, REPORT_TOKEN_SCOPE, key)?
            {
                return Ok(ErrorIngestOutcome {
                    skipped: true,
                    ..ErrorIngestOutcome::default()
                });
            }
            let at = nanos(batch.observed_at)?;
            let failed = ErrorStatus::Failed.as_str();
            let mut outcome = ErrorIngestOutcome::default();
            for occurrence in &batch.occurrences {
                let count = to_i64(occurrence.occurrences, "occurrences")?;
                let details = serde_json::to_string(&occurrence.details)
                    .map_err(|err| SqliteStoreError::Invalid(err.to_string()))?;
                let updated = tx.execute(
                    "UPDATE error_records SET total_count = total_count + ?2, \
                     latest_execution_id = ?3, error_status = ?4, updated_at_ns = ?5 \
                     WHERE error_hash = ?1",
                    params![occurrence.hash.as_str(), count, batch.execution_id.as_str(), failed, at],
                )?;
                if updated == 0 {
                    tx.execute(
                        "INSERT INTO error_records (error_hash, error_type, total_count, \
                         error_status, latest_execution_id, error_details, created_at_ns, \
                         updated_at_ns) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                        params![
                            occurrence.hash.as_str(),
                            occurrence.error_type,
                            count,
                            failed,
                            batch.execution_id.as_str(),
                            details,
                            at
                        ],
                    )?;
                    outcome.records_created += 1;
                } else {
                    outcome.records_updated += 1;
                }
                let linked = tx.execute(
                    "UPDATE execution_error_links SET occurrences = occurrences + ?3, \
                     status = ?4, error_details = ?5, updated_at_ns = ?6 \
                     WHERE execution_id = ?1 AND error_hash = ?2",
                    params![
                        batch.execution_id.as_str(),
                        occurrence.hash.as_str(),
                        count,
                        failed,
                        details,
                        at
                    ],
                )?;
                if linked == 0 {
                    tx.execute(
                        "INSERT INTO execution_error_links (execution_id, error_hash, \
                         occurrences, status, error_details, county, created_at_ns, \
                         updated_at_ns) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                        params![
                            batch.execution_id.as_str(),
                            occurrence.hash.as_str(),
                            count,
                            failed,
                            details,
                            batch.county,
                            at
                        ],
                    )?;
                    outcome.links_created += 1;
                } else {
                    outcome.links_updated += 1;
                }
            }
            if let Some(key) = &batch.idempotency_key {
                mark_processed(tx, REPORT_TOKEN_SCOPE, key, at)?;
            }
            Ok(outcome)
        })
    }

    /// Applies a bulk status change to records and links.
    fn change_status(&self, change: &StatusChange) -> Result<u64, SqliteStoreError> {
        let at = nanos(change.at)?;
        let to = change.to.as_str();
        let from = change.only_from.map(ErrorStatus::as_str);
        let hashes: BTreeSet<&str> = change.hashes.iter().map(ErrorHash::as_str).collect();
        self.write(|tx| {
            let mut changed = 0_u64;
            for hash in &hashes {
                let rows = tx.execute(
                    "UPDATE error_records SET error_status = ?2, updated_at_ns = ?3 \
                     WHERE error_hash = ?1 AND error_status != ?2 \
                     AND (?4 IS NULL OR error_status = ?4)",
                    params![hash, to, at, from],
                )?;
                changed += u64::try_from(rows).unwrap_or(u64::MAX);
                tx.execute(
                    "UPDATE execution_error_links SET status = ?2, updated_at_ns = ?3 \
                     WHERE error_hash = ?1 AND status != ?2 AND (?4 IS NULL OR status = ?4)",
                    params![hash, to, at, from],
                )?;
            }
            Ok(changed)
        })
    }

    /// Reads one page of a shard in key order.
    fn shard_page(
        &self,
        shard: u32,
        after: Option<&str>,
        limit: usize,
    ) -> Result<ShardPage, SqliteStoreError> {
        if limit == 0 {
            return Err(SqliteStoreError::Invalid("shard query limit must be positive".to_string()));
        }
        let after = after.map(parse_step_key_token).transpose().map_err(invalid)?;
        let fetch = to_i64_usize(limit.saturating_add(1))?;
        let (county, group, phase, step) = match &after {
            Some(key) => (
                Some(key.county.as_str()),
                Some(key.data_group_label.as_str()),
                Some(key.phase.as_str()),
                Some(key.step.as_str()),
            ),
            None => (None, None, None, None),
        };
        let mut items = self.read(|connection| {
            let mut statement = connection.prepare(&format!(
                "SELECT {AGGREGATE_COLUMNS} FROM step_aggregates WHERE shard = ?1 \
                 AND (?2 IS NULL OR (county, data_group_label, phase, step) > (?2, ?3, ?4, ?5)) \
                 ORDER BY county, data_group_label, phase, step LIMIT ?6"
            ))?;
            let rows = statement
                .query_map(params![shard, county, group, phase, step, fetch], AggregateRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(AggregateRow::into_aggregate).collect::<Result<Vec<_>, _>>()
        })?;
        let next_token = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|last| step_key_token(&last.step_key()))
        } else {
            None
        };
        Ok(ShardPage { items, next_token })
    }

    /// Reads one page of error records by total count.
    fn error_page(
        &self,
        filter: &ErrorFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<ErrorRecordPage, SqliteStoreError> {
        if limit == 0 {
            return Err(SqliteStoreError::Invalid("error list limit must be positive".to_string()));
        }
        let after = after.map(ErrorListToken::parse).transpose().map_err(invalid)?;
        let after_count = after.as_ref().map(|token| to_i64(token.total_count, "totalCount")).transpose()?;
        let after_hash = after.as_ref().map(|token| token.hash.as_str());
        let fetch = to_i64_usize(limit.saturating_add(1))?;
        let error_type = filter.error_type.as_deref();
        let status = filter.status.map(ErrorStatus::as_str);
        let mut items = self.read(|connection| {
            let mut statement = connection.prepare(&format!(
                "SELECT {ERROR_COLUMNS} FROM error_records \
                 WHERE (?1 IS NULL OR substr(error_type, 1, length(?1)) = ?1) \
                 AND (?2 IS NULL OR error_status = ?2) \
                 AND (?3 IS NULL OR total_count < ?3 OR (total_count = ?3 AND error_hash > ?4)) \
                 ORDER BY total_count DESC, error_hash ASC LIMIT ?5"
            ))?;
            let rows = statement
                .query_map(params![error_type, status, after_count, after_hash, fetch], ErrorRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(ErrorRow::into_record).collect::<Result<Vec<_>, _>>()
        })?;
        let next_token = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|last| ErrorListToken::for_record(last).encode())
        } else {
            None
        };
        Ok(ErrorRecordPage { items, next_token })
    }

    /// Ranks executions with at least one open error by distinct linked errors.
    fn ranked_execution(
        &self,
        order: SortOrder,
        error_type: Option<&str>,
    ) -> Result<Option<ExecutionId>, SqliteStoreError> {
        let direction = match order {
            SortOrder::Most => "DESC",
            SortOrder::Least => "ASC",
        };
        self.read(|connection| {
            let id: Option<String> = connection
                .query_row(
                    &format!(
                        "SELECT l.execution_id, COUNT(*) AS unique_errors \
                         FROM execution_error_links l \
                         JOIN error_records r ON r.error_hash = l.error_hash \
                         WHERE (?1 IS NULL OR substr(r.error_type, 1, length(?1)) = ?1) \
                         GROUP BY l.execution_id \
                         HAVING SUM(r.error_status = ?2) > 0 \
                         ORDER BY unique_errors {direction}, l.execution_id ASC LIMIT 1"
                    ),
                    params![error_type, ErrorStatus::Failed.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id.map(ExecutionId::new))
        })
    }
}

// ============================================================================//
// SECTION: Interface Implementations
// ============================================================================//

impl ExecutionStateStore for SqliteWorkflowStore {
    fn load_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionState>, StoreError> {
        self.read(|connection| select_execution(connection, execution_id)).map_err(StoreError::from)
    }

    fn upsert_execution(&self, update: &ExecutionUpdate) -> Result<UpsertResult, StoreError> {
        self.upsert_state(update).map_err(StoreError::from)
    }

    fn delete_execution(
        &self,
        execution_id: &ExecutionId,
        at: UtcTimestamp,
    ) -> Result<DeleteOutcome, StoreError> {
        self.delete_state(execution_id, at).map_err(StoreError::from)
    }
}

impl AggregateIndex for SqliteWorkflowStore {
    fn load_step_aggregate(&self, key: &StepKey) -> Result<Option<StepAggregate>, StoreError> {
        self.read(|connection| {
            let row = connection
                .query_row(
                    &format!(
                        "SELECT {AGGREGATE_COLUMNS} FROM step_aggregates WHERE county = ?1 \
                         AND data_group_label = ?2 AND phase = ?3 AND step = ?4"
                    ),
                    params![key.county, key.data_group_label, key.phase, key.step],
                    AggregateRow::read,
                )
                .optional()?;
            row.map(AggregateRow::into_aggregate).transpose()
        })
        .map_err(StoreError::from)
    }

    fn query_shard(
        &self,
        shard: u32,
        after: Option<&str>,
        limit: usize,
    ) -> Result<ShardPage, StoreError> {
        self.shard_page(shard, after, limit).map_err(StoreError::from)
    }

    fn query_county(
        &self,
        county: &str,
        data_group_label: &str,
        phase_prefix: Option<&str>,
    ) -> Result<Vec<StepAggregate>, StoreError> {
        self.read(|connection| {
            let mut statement = connection.prepare(&format!(
                "SELECT {AGGREGATE_COLUMNS} FROM step_aggregates WHERE county = ?1 \
                 AND data_group_label = ?2 \
                 AND (?3 IS NULL OR substr(phase, 1, length(?3)) = ?3) \
                 ORDER BY phase, step"
            ))?;
            let rows = statement
                .query_map(params![county, data_group_label, phase_prefix], AggregateRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(AggregateRow::into_aggregate).collect()
        })
        .map_err(StoreError::from)
    }
}

impl ErrorRecordStore for SqliteWorkflowStore {
    fn record_errors(&self, batch: &ErrorBatch) -> Result<ErrorIngestOutcome, StoreError> {
        self.record_batch(batch).map_err(StoreError::from)
    }

    fn load_error(&self, hash: &ErrorHash) -> Result<Option<ErrorRecord>, StoreError> {
        self.read(|connection| {
            let row = connection
                .query_row(
                    &format!("SELECT {ERROR_COLUMNS} FROM error_records WHERE error_hash = ?1"),
                    params![hash.as_str()],
                    ErrorRow::read,
                )
                .optional()?;
            row.map(ErrorRow::into_record).transpose()
        })
        .map_err(StoreError::from)
    }

    fn list_execution_errors(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<LinkedError>, StoreError> {
        self.read(|connection| {
            let mut statement = connection.prepare(
                "SELECT l.execution_id, l.error_hash, l.occurrences, l.status, l.error_details, \
                 l.county, l.created_at_ns, l.updated_at_ns, r.error_type, r.error_status, \
                 r.total_count \
                 FROM execution_error_links l \
                 JOIN error_records r ON r.error_hash = l.error_hash \
                 WHERE l.execution_id = ?1 ORDER BY l.error_hash",
            )?;
            let rows = statement
                .query_map(params![execution_id.as_str()], LinkRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(LinkRow::into_linked).collect()
        })
        .map_err(StoreError::from)
    }

    fn set_error_status(&self, change: &StatusChange) -> Result<u64, StoreError> {
        self.change_status(change).map_err(StoreError::from)
    }

    fn list_errors(
        &self,
        filter: &ErrorFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<ErrorRecordPage, StoreError> {
        self.error_page(filter, after, limit).map_err(StoreError::from)
    }

    fn rank_execution_by_error_count(
        &self,
        order: SortOrder,
        error_type: Option<&str>,
    ) -> Result<Option<ExecutionId>, StoreError> {
        self.ranked_execution(order, error_type).map_err(StoreError::from)
    }
}

// ============================================================================//
// SECTION: Row Mapping
// ============================================================================//

/// Raw execution row.
struct ExecutionRow {
    /// Execution identifier.
    execution_id: String,
    /// County.
    county: String,
    /// Data-group label.
    data_group_label: String,
    /// Phase.
    phase: String,
    /// Step.
    step: String,
    /// Bucket label.
    bucket: String,
    /// Raw status.
    raw_status: String,
    /// Optional task token.
    task_token: Option<String>,
    /// Fencing time.
    last_event_time_ns: i64,
    /// Creation time.
    created_at_ns: i64,
    /// Update time.
    updated_at_ns: i64,
    /// Write version.
    version: i64,
}

impl ExecutionRow {
    /// Reads the row in [`EXECUTION_COLUMNS`] order.
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            execution_id: row.get(0)?,
            county: row.get(1)?,
            data_group_label: row.get(2)?,
            phase: row.get(3)?,
            step: row.get(4)?,
            bucket: row.get(5)?,
            raw_status: row.get(6)?,
            task_token: row.get(7)?,
            last_event_time_ns: row.get(8)?,
            created_at_ns: row.get(9)?,
            updated_at_ns: row.get(10)?,
            version: row.get(11)?,
        })
    }

    /// Validates the row into an execution snapshot.
    fn into_state(self) -> Result<ExecutionState, SqliteStoreError> {
        let bucket = Bucket::from_label(&self.bucket).ok_or_else(|| {
            SqliteStoreError::Corrupt(format!(
                "unknown bucket {} for execution {}",
                self.bucket, self.execution_id
            ))
        })?;
        let version = u64::try_from(self.version)
            .ok()
            .filter(|version| *version >= 1)
            .ok_or_else(|| {
                SqliteStoreError::Corrupt(format!("invalid version for execution {}", self.execution_id))
            })?;
        Ok(ExecutionState {
            execution_id: ExecutionId::new(self.execution_id),
            county: self.county,
            data_group_label: self.data_group_label,
            phase: self.phase,
            step: self.step,
            bucket,
            raw_status: self.raw_status,
            task_token: self.task_token,
            last_event_time: timestamp(self.last_event_time_ns)?,
            created_at: timestamp(self.created_at_ns)?,
            updated_at: timestamp(self.updated_at_ns)?,
            version,
        })
    }
}

/// Raw aggregate row.
struct AggregateRow {
    /// Aggregate key.
    key: StepKey,
    /// Bucket counters in `Bucket::ALL` order.
    counts: [i64; 3],
    /// Update time.
    updated_at_ns: i64,
}

impl AggregateRow {
    /// Reads the row in [`AGGREGATE_COLUMNS`] order.
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: StepKey {
                county: row.get(0)?,
                data_group_label: row.get(1)?,
                phase: row.get(2)?,
                step: row.get(3)?,
            },
            counts: [row.get(4)?, row.get(5)?, row.get(6)?],
            updated_at_ns: row.get(7)?,
        })
    }

    /// Validates the row into an aggregate.
    fn into_aggregate(self) -> Result<StepAggregate, SqliteStoreError> {
        let mut aggregate = StepAggregate::empty(&self.key, timestamp(self.updated_at_ns)?);
        for (bucket, count) in Bucket::ALL.into_iter().zip(self.counts) {
            *aggregate.count_mut(bucket) = to_u64(count, "aggregate counter")?;
        }
        Ok(aggregate)
    }
}

/// Raw error record row.
struct ErrorRow {
    /// Content hash.
    hash: String,
    /// Classification prefix.
    error_type: String,
    /// Total occurrences.
    total_count: i64,
    /// Status label.
    status: String,
    /// Latest execution.
    latest_execution_id: String,
    /// Details JSON.
    details: String,
    /// Creation time.
    created_at_ns: i64,
    /// Update time.
    updated_at_ns: i64,
}

impl ErrorRow {
    /// Reads the row in [`ERROR_COLUMNS`] order.
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            hash: row.get(0)?,
            error_type: row.get(1)?,
            total_count: row.get(2)?,
            status: row.get(3)?,
            latest_execution_id: row.get(4)?,
            details: row.get(5)?,
            created_at_ns: row.get(6)?,
            updated_at_ns: row.get(7)?,
        })
    }

    /// Validates the row into an error record.
    fn into_record(self) -> Result<ErrorRecord, SqliteStoreError> {
        Ok(ErrorRecord {
            error_code: ErrorHash::new(self.hash),
            error_type: self.error_type,
            total_count: to_u64(self.total_count, "total_count")?,
            error_status: parse_status(&self.status)?,
            latest_execution_id: ExecutionId::new(self.latest_execution_id),
            error_details: parse_details(&self.details)?,
            created_at: timestamp(self.created_at_ns)?,
            updated_at: timestamp(self.updated_at_ns)?,
        })
    }
}

/// Raw link row joined with its record.
struct LinkRow {
    /// Execution identifier.
    execution_id: String,
    /// Content hash.
    hash: String,
    /// Occurrences within the execution.
    occurrences: i64,
    /// Link status label.
    status: String,
    /// Details JSON.
    details: String,
    /// County.
    county: String,
    /// Creation time.
    created_at_ns: i64,
    /// Update time.
    updated_at_ns: i64,
    /// Record classification prefix.
    error_type: String,
    /// Record status label.
    record_status: String,
    /// Record total count.
    total_count: i64,
}

impl LinkRow {
    /// Reads the joined row.
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            execution_id: row.get(0)?,
            hash: row.get(1)?,
            occurrences: row.get(2)?,
            status: row.get(3)?,
            details: row.get(4)?,
            county: row.get(5)?,
            created_at_ns: row.get(6)?,
            updated_at_ns: row.get(7)?,
            error_type: row.get(8)?,
            record_status: row.get(9)?,
            total_count: row.get(10)?,
        })
    }

    /// Validates the row into a linked error.
    fn into_linked(self) -> Result<LinkedError, SqliteStoreError> {
        Ok(LinkedError {
            link: ExecutionErrorLink {
                execution_id: ExecutionId::new(self.execution_id),
                error_code: ErrorHash::new(self.hash),
                occurrences: to_u64(self.occurrences, "occurrences")?,
                status: parse_status(&self.status)?,
                error_details: parse_details(&self.details)?,
                county: self.county,
                created_at: timestamp(self.created_at_ns)?,
                updated_at: timestamp(self.updated_at_ns)?,
            },
            error_type: self.error_type,
            error_status: parse_status(&self.record_status)?,
            total_count: to_u64(self.total_count, "total_count")?,
        })
    }
}

// ============================================================================//
// SECTION: Statements
// ============================================================================//

/// Loads one execution row.
fn select_execution(
    connection: &Connection,
    execution_id: &ExecutionId,
) -> Result<Option<ExecutionState>, SqliteStoreError> {
    let row = connection
        .query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = ?1"),
            params![execution_id.as_str()],
            ExecutionRow::read,
        )
        .optional()?;
    row.map(ExecutionRow::into_state).transpose()
}

/// Inserts a new execution; returns false when a row already exists.
fn insert_execution(tx: &Transaction<'_>, state: &ExecutionState) -> Result<bool, SqliteStoreError> {
    let rows = tx.execute(
        &format!(
            "INSERT INTO executions ({EXECUTION_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
             ON CONFLICT(execution_id) DO NOTHING"
        ),
        params![
            state.execution_id.as_str(),
            state.county,
            state.data_group_label,
            state.phase,
            state.step,
            state.bucket.as_str(),
            state.raw_status,
            state.task_token,
            nanos(state.last_event_time)?,
            nanos(state.created_at)?,
            nanos(state.updated_at)?,
            to_i64(state.version, "version")?
        ],
    )?;
    Ok(rows == 1)
}

/// Writes a snapshot only if the stored event time is strictly older.
fn update_execution(
    tx: &Transaction<'_>,
    state: &ExecutionState,
    event_time_ns: i64,
) -> Result<bool, SqliteStoreError> {
    let rows = tx.execute(
        "UPDATE executions SET county = ?2, data_group_label = ?3, phase = ?4, step = ?5, \
         bucket = ?6, raw_status = ?7, task_token = ?8, last_event_time_ns = ?9, \
         updated_at_ns = ?10, version = ?11 \
         WHERE execution_id = ?1 AND last_event_time_ns < ?9",
        params![
            state.execution_id.as_str(),
            state.county,
            state.data_group_label,
            state.phase,
            state.step,
            state.bucket.as_str(),
            state.raw_status,
            state.task_token,
            event_time_ns,
            nanos(state.updated_at)?,
            to_i64(state.version, "version")?
        ],
    )?;
    Ok(rows == 1)
}

/// Returns the counter column for a bucket.
const fn bucket_column(bucket: Bucket) -> &'static str {
    match bucket {
        Bucket::InProgress => "in_progress_count",
        Bucket::Failed => "failed_count",
        Bucket::Succeeded => "succeeded_count",
    }
}

/// Increments a counter, creating the aggregate row when absent.
fn increment_counter(
    tx: &Transaction<'_>,
    key: &StepKey,
    bucket: Bucket,
    at: i64,
) -> Result<(), SqliteStoreError> {
    tx.execute(
        "INSERT INTO step_aggregates (county, data_group_label, phase, step, shard, updated_at_ns) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(county, data_group_label, phase, step) DO NOTHING",
        params![key.county, key.data_group_label, key.phase, key.step, key.shard(), at],
    )?;
    let column = bucket_column(bucket);
    tx.execute(
        &format!(
            "UPDATE step_aggregates SET {column} = {column} + 1, updated_at_ns = ?5 \
             WHERE county = ?1 AND data_group_label = ?2 AND phase = ?3 AND step = ?4"
        ),
        params![key.county, key.data_group_label, key.phase, key.step, at],
    )?;
    Ok(())
}

/// Decrements a counter; a missing or zero counter aborts the transaction.
fn decrement_counter(
    tx: &Transaction<'_>,
    key: &StepKey,
    bucket: Bucket,
    at: i64,
) -> Result<(), SqliteStoreError> {
    let column = bucket_column(bucket);
    let rows = tx.execute(
        &format!(
            "UPDATE step_aggregates SET {column} = {column} - 1, updated_at_ns = ?5 \
             WHERE county = ?1 AND data_group_label = ?2 AND phase = ?3 AND step = ?4 \
             AND {column} > 0"
        ),
        params![key.county, key.data_group_label, key.phase, key.step, at],
    )?;
    if rows == 1 {
        Ok(())
    } else {
        Err(SqliteStoreError::Corrupt(format!(
            "step aggregate {}#{}#{}#{} has no {bucket} count to move",
            key.county, key.data_group_label, key.phase, key.step
        )))
    }
}

/// Returns true when a token is already in the ledger.
fn is_processed(connection: &Connection, scope: &str, token: &str) -> Result<bool, SqliteStoreError> {
    let found: Option<i64> = connection
        .query_row(
            "SELECT 1 FROM processed_tokens WHERE scope = ?1 AND token = ?2",
            params![scope, token],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Records a token in the ledger.
fn mark_processed(
    tx: &Transaction<'_>,
    scope: &str,
    token: &str,
    at: i64,
) -> Result<(), SqliteStoreError> {
    let rows = tx.execute(
        "INSERT INTO processed_tokens (scope, token, processed_at_ns) VALUES (?1, ?2, ?3) \
         ON CONFLICT(scope, token) DO NOTHING",
        params![scope, token, at],
    )?;
    if rows == 1 {
        Ok(())
    } else {
        Err(SqliteStoreError::Conflict(format!("token {token} already processed")))
    }
}

// ============================================================================//
// SECTION: Helpers
// ============================================================================//

/// Ensures the parent directory for the store exists.
fn ensure_parent_dir(path: &Path) -> Result<(), SqliteStoreError> {
    let Some(parent) = path.parent() else {
        return Err(SqliteStoreError::Io("store path missing parent directory".to_string()));
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).map_err(|err| SqliteStoreError::Io(err.to_string()))
}

/// Validates store paths for safety limits.
fn validate_store_path(path: &Path) -> Result<(), SqliteStoreError> {
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SqliteStoreError::Invalid("store path exceeds length limit".to_string()));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(SqliteStoreError::Invalid(
                "store path contains an overlong component".to_string(),
            ));
        }
    }
    if path.exists() && path.is_dir() {
        return Err(SqliteStoreError::Invalid(
            "store path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Opens an `SQLite` connection with secure defaults.
fn open_connection(config: &SqliteStoreConfig) -> Result<Connection, SqliteStoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags)?;
    apply_pragmas(&connection, config)?;
    Ok(connection)
}

/// Applies `SQLite` pragmas required for durability.
fn apply_pragmas(
    connection: &Connection,
    config: &SqliteStoreConfig,
) -> Result<(), SqliteStoreError> {
    connection.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))?;
    Ok(())
}

/// Initializes the `SQLite` schema or validates existing version.
fn initialize_schema(connection: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])?;
            tx.execute_batch(SCHEMA_SQL)?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(SqliteStoreError::VersionMismatch(format!(
                "unsupported schema version: {value}"
            )));
        }
    }
    tx.commit()?;
    Ok(())
}

/// Converts a timestamp to stored nanoseconds.
fn nanos(value: UtcTimestamp) -> Result<i64, SqliteStoreError> {
    value.unix_nanos().map_err(|err| SqliteStoreError::Invalid(err.to_string()))
}

/// Converts stored nanoseconds to a timestamp.
fn timestamp(nanos: i64) -> Result<UtcTimestamp, SqliteStoreError> {
    UtcTimestamp::from_unix_nanos(nanos).map_err(|err| SqliteStoreError::Corrupt(err.to_string()))
}

/// Converts a count to a stored integer.
fn to_i64(value: u64, field: &str) -> Result<i64, SqliteStoreError> {
    i64::try_from(value).map_err(|_| SqliteStoreError::Invalid(format!("{field} out of range")))
}

/// Converts a page size to a stored integer.
fn to_i64_usize(value: usize) -> Result<i64, SqliteStoreError> {
    i64::try_from(value).map_err(|_| SqliteStoreError::Invalid("limit out of range".to_string()))
}

/// Converts a stored integer to a count.
fn to_u64(value: i64, field: &str) -> Result<u64, SqliteStoreError> {
    u64::try_from(value).map_err(|_| SqliteStoreError::Corrupt(format!("negative {field}")))
}

/// Parses a stored error status label.
fn parse_status(label: &str) -> Result<ErrorStatus, SqliteStoreError> {
    label.parse().map_err(SqliteStoreError::Corrupt)
}

/// Parses stored details JSON.
fn parse_details(raw: &str) -> Result<Value, SqliteStoreError> {
    serde_json::from_str(raw).map_err(|err| SqliteStoreError::Corrupt(err.to_string()))
}

/// Maps a malformed token into an invalid-request error.
fn invalid(err: StoreError) -> SqliteStoreError {
    SqliteStoreError::Invalid(err.to_string())
}
