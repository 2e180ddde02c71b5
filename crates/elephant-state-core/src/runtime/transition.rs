// crates/elephant-state-core/src/runtime/transition.rs
// ============================================================================
// Module: Transition Planner
// Description: Pure decision of what an update does to state and counters.
// Purpose: Keep fencing and counter deltas identical across every backend.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! [`plan_transition`] compares the stored snapshot with an update and
//! returns the complete write set: the next snapshot plus at most one
//! decrement and one increment. Backends apply the plan atomically and still
//! re-check the fence inside the write.

// ============================================================================
// SECTION: Imports
// ============================================================================

use crate::core::Bucket;
use crate::core::ExecutionState;
use crate::core::ExecutionUpdate;
use crate::core::StepKey;
use crate::interfaces::SkipReason;
use crate::interfaces::UpsertOutcome;

// ============================================================================
// SECTION: Plans
// ============================================================================

/// Write set for one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionPlan {
    /// First notification: write `state`, increment one counter.
    Create {
        /// New snapshot.
        state: ExecutionState,
        /// Counter to increment.
        increment: (StepKey, Bucket),
    },
    /// Fenced: no writes.
    Skip(SkipReason),
    /// Same key and bucket: write `state`, no counter change.
    Refresh {
        /// New snapshot.
        state: ExecutionState,
    },
    /// Key or bucket changed: write `state`, move one count.
    Move {
        /// New snapshot.
        state: ExecutionState,
        /// Counter to decrement.
        decrement: (StepKey, Bucket),
        /// Counter to increment.
        increment: (StepKey, Bucket),
    },
}

impl TransitionPlan {
    /// Returns the upsert outcome this plan produces.
    #[must_use]
    pub const fn outcome(&self) -> UpsertOutcome {
        match self {
            Self::Create { .. } => UpsertOutcome::Created,
            Self::Skip(reason) => UpsertOutcome::Skipped(*reason),
            Self::Refresh { .. } => UpsertOutcome::Updated,
            Self::Move { .. } => UpsertOutcome::Moved,
        }
    }

    /// Returns the snapshot to write, if any.
    #[must_use]
    pub const fn state(&self) -> Option<&ExecutionState> {
        match self {
            Self::Create { state, .. } | Self::Refresh { state } | Self::Move { state, .. } => {
                Some(state)
            }
            Self::Skip(_) => None,
        }
    }
}

/// Plans the effect of `update` against the stored snapshot.
///
/// Fencing is strict: an event whose time equals the stored time is skipped.
#[must_use]
pub fn plan_transition(current: Option<&ExecutionState>, update: &ExecutionUpdate) -> TransitionPlan {
    let Some(current) = current else {
        let state = ExecutionState {
            execution_id: update.execution_id.clone(),
            county: update.step_key.county.clone(),
            data_group_label: update.step_key.data_group_label.clone(),
            phase: update.step_key.phase.clone(),
            step: update.step_key.step.clone(),
            bucket: update.bucket,
            raw_status: update.raw_status.clone(),
            task_token: update.task_token.clone(),
            last_event_time: update.event_time,
            created_at: update.received_at,
            updated_at: update.received_at,
            version: 1,
        };
        return TransitionPlan::Create {
            state,
            increment: (update.step_key.clone(), update.bucket),
        };
    };
    if update.event_time <= current.last_event_time {
        return TransitionPlan::Skip(SkipReason::StaleEvent);
    }
    let previous_key = current.step_key();
    let same_slot = previous_key == update.step_key && current.bucket == update.bucket;
    let mut state = current.clone();
    state.phase.clone_from(&update.step_key.phase);
    state.step.clone_from(&update.step_key.step);
    state.county.clone_from(&update.step_key.county);
    state.data_group_label.clone_from(&update.step_key.data_group_label);
    state.bucket = update.bucket;
    state.raw_status.clone_from(&update.raw_status);
    state.last_event_time = update.event_time;
    state.updated_at = update.received_at;
    state.version = current.version.saturating_add(1);
    if same_slot {
        // A refresh without a token keeps the step's pending callback.
        if update.task_token.is_some() {
            state.task_token.clone_from(&update.task_token);
        }
        return TransitionPlan::Refresh { state };
    }
    state.task_token.clone_from(&update.task_token);
    TransitionPlan::Move {
        state,
        decrement: (previous_key, current.bucket),
        increment: (update.step_key.clone(), update.bucket),
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
