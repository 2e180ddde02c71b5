// crates/elephant-state-core/src/lib.rs
// ============================================================================
// Module: Elephant State Core Library
// Description: Public API surface for the workflow state and error store.
// Purpose: Expose core types, store interfaces, and runtime services.
// Dependencies: crate::{core, interfaces, runtime}
// ============================================================================

//! ## Overview
//! Elephant state core records the current lifecycle state of long-running
//! property-record mining executions, keeps bucketed step counters in step
//! with those states, and deduplicates recurring validation errors across
//! executions. Storage is reached only through the traits in [`interfaces`];
//! the in-memory store in [`runtime`] is the reference backend.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use core::*;

pub use interfaces::AggregateIndex;
pub use interfaces::DeleteOutcome;
pub use interfaces::ErrorFilter;
pub use interfaces::ErrorIngestOutcome;
pub use interfaces::ErrorRecordPage;
pub use interfaces::ErrorRecordStore;
pub use interfaces::ExecutionStateStore;
pub use interfaces::ShardPage;
pub use interfaces::SkipReason;
pub use interfaces::StatusChange;
pub use interfaces::StoreError;
pub use interfaces::UpsertOutcome;
pub use interfaces::UpsertResult;
pub use interfaces::WorkflowStore;
pub use runtime::AggregatePage;
pub use runtime::Clock;
pub use runtime::CountyAggregateRequest;
pub use runtime::ErrorListRequest;
pub use runtime::ErrorPage;
pub use runtime::EventOutcome;
pub use runtime::ExecutionErrorSummary;
pub use runtime::ExecutionRankRequest;
pub use runtime::ExecutionSummary;
pub use runtime::FleetStepTotal;
pub use runtime::InMemoryWorkflowStore;
pub use runtime::IngestError;
pub use runtime::PageLimits;
pub use runtime::QueryError;
pub use runtime::ReportOutcome;
pub use runtime::SharedWorkflowStore;
pub use runtime::SystemClock;
pub use runtime::TransitionPlan;
pub use runtime::WorkflowIngestor;
pub use runtime::WorkflowQueryService;
pub use runtime::plan_transition;
