//! Battle session integration tests.
//!
//! This module contains integration tests for the battle driver:
//! - Lifecycle: start, ticking, settlement, reset, dismissal, upsync cadence
//! - Reconciliation: mispredictions, rewinds and contradicted history
//! - Authority: resyncs, checksum comparison, underrun recovery
//! - Collision: order independence of the pushback sum
//! - Determinism: batched versus single-frame advancing

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Battle test modules
mod battle {
    pub mod authority;
    pub mod collision;
    pub mod determinism;
    pub mod lifecycle;
    pub mod reconciliation;
}
