//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `harness`: battle fixtures (players, authoritative frames, confirmations)
//!   and a reference simulation that steps frames without a session
//! - `spaces`: alternative collision engines for order-independence checks
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::harness::{two_player_session, start_frame};
//! ```

pub mod harness;
pub mod spaces;

// Re-export commonly used items for convenience.
#[allow(unused_imports)]
pub use harness::{
    applied_frames, assert_history_matches, confirm, local_binding, player, reference_frames, standard_players,
    remote_turns_right_at, start_frame, started, two_player_session, upsync_batches, LOCAL_JOIN, LOCAL_PLAYER,
    REMOTE_JOIN, REMOTE_PLAYER,
};
#[allow(unused_imports)]
pub use spaces::ReversedPotentials;
