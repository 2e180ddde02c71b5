// crates/elephant-state-core/src/runtime/mod.rs
// ============================================================================
// Module: Elephant State Runtime
// Description: Transition planning, reference store, ingest and query services.
// Purpose: Drive the store interfaces from inbound payloads and dashboard reads.
// Dependencies: crate::{core, interfaces}, tracing
// ============================================================================

//! ## Overview
//! The write side ([`WorkflowIngestor`]) validates notifications and error
//! reports before any store call. The read side ([`WorkflowQueryService`])
//! fans aggregate scans out across shards and ranks repair candidates. Both
//! are generic over [`crate::interfaces::WorkflowStore`].

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod ingest;
pub mod query;
pub mod store;
pub mod transition;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use ingest::Clock;
pub use ingest::EventOutcome;
pub use ingest::IngestError;
pub use ingest::ReportOutcome;
pub use ingest::SystemClock;
pub use ingest::WorkflowIngestor;
pub use query::AggregatePage;
pub use query::CountyAggregateRequest;
pub use query::ErrorListRequest;
pub use query::ErrorPage;
pub use query::ExecutionErrorSummary;
pub use query::ExecutionRankRequest;
pub use query::ExecutionSummary;
pub use query::FleetStepTotal;
pub use query::PageLimits;
pub use query::QueryError;
pub use query::WorkflowQueryService;
pub use store::InMemoryWorkflowStore;
pub use store::SharedWorkflowStore;
pub use transition::TransitionPlan;
pub use transition::plan_transition;
