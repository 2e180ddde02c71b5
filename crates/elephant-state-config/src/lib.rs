// crates/elephant-state-config/src/lib.rs
// ============================================================================
// Module: Elephant State Config Library
// Description: Canonical config model and validation.
// Purpose: Single source of truth for elephant-state.toml semantics.
// Dependencies: elephant-state-core, elephant-state-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! `elephant-state-config` defines the configuration model for the workflow
//! state store: backend selection, query page limits, and logging. Loading is
//! strict and fails before any store is opened.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
