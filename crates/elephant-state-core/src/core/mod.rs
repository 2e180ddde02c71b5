// crates/elephant-state-core/src/core/mod.rs
// ============================================================================
// Module: Workflow State Core Types
// Description: Canonical execution, aggregate, and error record structures.
// Purpose: Provide stable, serializable types shared by stores and services.
// Dependencies: serde, serde_json, sha2, time
// ============================================================================

//! ## Overview
//! Core types describe execution snapshots, bucketed step aggregates, the
//! deduplicated error catalogue, and the helpers (normalization, hashing,
//! sharding, cursors) every backend must agree on.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod cursor;
pub mod error_record;
pub mod execution;
pub mod hashing;
pub mod identifiers;
pub mod shard;
pub mod status;
pub mod time;
pub mod validation;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use cursor::CursorError;
pub use cursor::ShardPositions;
pub use error_record::ErrorBatch;
pub use error_record::ErrorOccurrence;
pub use error_record::ErrorRecord;
pub use error_record::ErrorReport;
pub use error_record::ErrorRow;
pub use error_record::ExecutionErrorLink;
pub use error_record::FailedExecutionItem;
pub use error_record::LinkedError;
pub use error_record::classify_error_type;
pub use execution::ExecutionState;
pub use execution::ExecutionUpdate;
pub use execution::StepAggregate;
pub use execution::StepKey;
pub use execution::WorkflowEvent;
pub use execution::WorkflowEventDetail;
pub use hashing::create_error_hash;
pub use identifiers::ErrorHash;
pub use identifiers::EventId;
pub use identifiers::ExecutionId;
pub use shard::SHARD_COUNT;
pub use shard::compute_shard_index;
pub use status::Bucket;
pub use status::DATA_GROUP_NOT_SET;
pub use status::ErrorStatus;
pub use status::SortOrder;
pub use status::get_bucket_count_attribute;
pub use status::normalize_data_group_label;
pub use status::normalize_step_status_to_bucket;
pub use time::TimestampError;
pub use time::UtcTimestamp;
pub use validation::ValidationError;
