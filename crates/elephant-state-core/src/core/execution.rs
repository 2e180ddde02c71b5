// crates/elephant-state-core/src/core/execution.rs
// ============================================================================
// Module: Execution State Model
// Description: Execution snapshots, step aggregates, and inbound notifications.
// Purpose: Define the records the execution state store fences and counts.
// Dependencies: serde, crate::core
// ============================================================================

//! ## Overview
//! An [`ExecutionState`] is the current lifecycle snapshot for one workflow
//! execution. Each snapshot is counted in exactly one [`StepAggregate`]
//! bucket, keyed by its [`StepKey`]. Inbound [`WorkflowEvent`] notifications
//! are validated into an [`ExecutionUpdate`] before any store sees them.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::error_record::ErrorRow;
use crate::core::identifiers::EventId;
use crate::core::identifiers::ExecutionId;
use crate::core::shard::shard_for;
use crate::core::status::Bucket;
use crate::core::status::normalize_data_group_label;
use crate::core::status::normalize_step_status_to_bucket;
use crate::core::time::UtcTimestamp;
use crate::core::validation::MAX_FIELD_BYTES;
use crate::core::validation::MAX_TASK_TOKEN_BYTES;
use crate::core::validation::ValidationError;
use crate::core::validation::optional_field;
use crate::core::validation::require_field;

// ============================================================================
// SECTION: Step Keys
// ============================================================================

/// Aggregate key: county, data group, phase, and step.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepKey {
    /// County name.
    pub county: String,
    /// Normalized data-group label.
    pub data_group_label: String,
    /// Workflow phase label.
    pub phase: String,
    /// Workflow step label.
    pub step: String,
}

impl StepKey {
    /// Builds a step key, normalizing the data-group label.
    #[must_use]
    pub fn new(
        county: impl Into<String>,
        data_group_label: Option<&str>,
        phase: impl Into<String>,
        step: impl Into<String>,
    ) -> Self {
        Self {
            county: county.into(),
            data_group_label: normalize_data_group_label(data_group_label),
            phase: phase.into(),
            step: step.into(),
        }
    }

    /// Returns the aggregate index shard for this key.
    #[must_use]
    pub fn shard(&self) -> u32 {
        shard_for(&self.county, &self.data_group_label)
    }
}

// ============================================================================
// SECTION: Execution State
// ============================================================================

/// Current lifecycle snapshot of one execution.
///
/// # Invariants
/// - `bucket` is always `normalize_step_status_to_bucket(raw_status)`.
/// - `version` starts at 1 and grows by one per accepted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    /// Execution identifier.
    pub execution_id: ExecutionId,
    /// County name.
    pub county: String,
    /// Normalized data-group label.
    pub data_group_label: String,
    /// Workflow phase label.
    pub phase: String,
    /// Workflow step label.
    pub step: String,
    /// Aggregate bucket.
    pub bucket: Bucket,
    /// Raw status as reported upstream.
    pub raw_status: String,
    /// Callback token for resuming the execution, when the engine supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_token: Option<String>,
    /// Event time of the last accepted notification (fencing field).
    pub last_event_time: UtcTimestamp,
    /// Creation time.
    pub created_at: UtcTimestamp,
    /// Last update time.
    pub updated_at: UtcTimestamp,
    /// Write version.
    pub version: u64,
}

impl ExecutionState {
    /// Returns the aggregate key the execution is counted under.
    #[must_use]
    pub fn step_key(&self) -> StepKey {
        StepKey {
            county: self.county.clone(),
            data_group_label: self.data_group_label.clone(),
            phase: self.phase.clone(),
            step: self.step.clone(),
        }
    }
}

// ============================================================================
// SECTION: Step Aggregates
// ============================================================================

/// Bucketed execution counters for one step key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepAggregate {
    /// County name.
    pub county: String,
    /// Normalized data-group label.
    pub data_group_label: String,
    /// Workflow phase label.
    pub phase: String,
    /// Workflow step label.
    pub step: String,
    /// Executions currently in progress at this step.
    pub in_progress_count: u64,
    /// Executions currently failed at this step.
    pub failed_count: u64,
    /// Executions currently succeeded at this step.
    pub succeeded_count: u64,
    /// Last counter change.
    pub updated_at: UtcTimestamp,
}

impl StepAggregate {
    /// Creates an empty aggregate for a key.
    #[must_use]
    pub fn empty(key: &StepKey, updated_at: UtcTimestamp) -> Self {
        Self {
            county: key.county.clone(),
            data_group_label: key.data_group_label.clone(),
            phase: key.phase.clone(),
            step: key.step.clone(),
            in_progress_count: 0,
            failed_count: 0,
            succeeded_count: 0,
            updated_at,
        }
    }

    /// Returns the aggregate key.
    #[must_use]
    pub fn step_key(&self) -> StepKey {
        StepKey {
            county: self.county.clone(),
            data_group_label: self.data_group_label.clone(),
            phase: self.phase.clone(),
            step: self.step.clone(),
        }
    }

    /// Returns the counter for a bucket.
    #[must_use]
    pub const fn count(&self, bucket: Bucket) -> u64 {
        match bucket {
            Bucket::InProgress => self.in_progress_count,
            Bucket::Failed => self.failed_count,
            Bucket::Succeeded => self.succeeded_count,
        }
    }

    /// Returns a mutable reference to the counter for a bucket.
    pub const fn count_mut(&mut self, bucket: Bucket) -> &mut u64 {
        match bucket {
            Bucket::InProgress => &mut self.in_progress_count,
            Bucket::Failed => &mut self.failed_count,
            Bucket::Succeeded => &mut self.succeeded_count,
        }
    }

    /// Returns the sum of all bucket counters.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.in_progress_count.saturating_add(self.failed_count).saturating_add(self.succeeded_count)
    }
}

// ============================================================================
// SECTION: Inbound Notifications
// ============================================================================

/// Workflow notification detail as delivered by the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEventDetail {
    /// Execution identifier.
    pub execution_id: String,
    /// County name.
    pub county: String,
    /// Optional data-group label.
    #[serde(default)]
    pub data_group_label: Option<String>,
    /// Raw status.
    pub status: String,
    /// Phase label.
    pub phase: String,
    /// Step label.
    pub step: String,
    /// Optional callback token.
    #[serde(default)]
    pub task_token: Option<String>,
    /// Optional validation errors observed by the step.
    #[serde(default)]
    pub errors: Vec<ErrorRow>,
}

/// Notification envelope: detail plus delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    /// Upstream event identifier (idempotency token).
    pub event_id: String,
    /// Event time (RFC 3339).
    pub event_time: String,
    /// Notification detail.
    pub detail: WorkflowEventDetail,
}

/// Validated, normalized execution state update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionUpdate {
    /// Execution identifier.
    pub execution_id: ExecutionId,
    /// Target aggregate key.
    pub step_key: StepKey,
    /// Raw status as reported.
    pub raw_status: String,
    /// Bucket derived from the raw status.
    pub bucket: Bucket,
    /// Optional callback token.
    pub task_token: Option<String>,
    /// Idempotency token.
    pub event_id: EventId,
    /// Fencing time.
    pub event_time: UtcTimestamp,
    /// Time the update was processed (drives `createdAt`/`updatedAt`).
    pub received_at: UtcTimestamp,
}

impl ExecutionUpdate {
    /// Validates a notification and normalizes it into an update.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when a required field is blank, too long,
    /// or the event time is not RFC 3339.
    pub fn from_event(
        event: &WorkflowEvent,
        received_at: UtcTimestamp,
    ) -> Result<Self, ValidationError> {
        let detail = &event.detail;
        let event_id = require_field("eventId", &event.event_id, MAX_FIELD_BYTES)?;
        let event_time = UtcTimestamp::parse(&event.event_time)
            .map_err(|err| ValidationError::new(format!("eventTime: {err}")))?;
        event_time.unix_nanos().map_err(|err| ValidationError::new(format!("eventTime: {err}")))?;
        let execution_id = require_field("executionId", &detail.execution_id, MAX_FIELD_BYTES)?;
        let county = require_field("county", &detail.county, MAX_FIELD_BYTES)?;
        let phase = require_field("phase", &detail.phase, MAX_FIELD_BYTES)?;
        let step = require_field("step", &detail.step, MAX_FIELD_BYTES)?;
        let raw_status = require_field("status", &detail.status, MAX_FIELD_BYTES)?;
        let data_group_label =
            optional_field("dataGroupLabel", detail.data_group_label.as_deref(), MAX_FIELD_BYTES)?;
        let task_token =
            optional_field("taskToken", detail.task_token.as_deref(), MAX_TASK_TOKEN_BYTES)?;
        let bucket = normalize_step_status_to_bucket(&raw_status);
        Ok(Self {
            execution_id: ExecutionId::new(execution_id),
            step_key: StepKey::new(county, data_group_label.as_deref(), phase, step),
            raw_status,
            bucket,
            task_token,
            event_id: EventId::new(event_id),
            event_time,
            received_at,
        })
    }
}
