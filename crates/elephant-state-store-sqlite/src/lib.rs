// crates/elephant-state-store-sqlite/src/lib.rs
// ============================================================================
// Module: SQLite Workflow Store
// Description: Durable workflow store backend using SQLite WAL.
// Purpose: Persist execution state, step counters, and error records.
// Dependencies: elephant-state-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate provides a SQLite-backed implementation of every workflow store
//! interface. Each multi-record update (state write plus counter deltas,
//! error record plus link) runs inside one `IMMEDIATE` transaction, and the
//! event-time fence is re-checked by the conditional `UPDATE` itself.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;
pub use store::SqliteStoreMode;
pub use store::SqliteSyncMode;
pub use store::SqliteWorkflowStore;
