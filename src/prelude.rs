//! Convenient re-exports for common usage.
//!
//! This module provides a "prelude" that re-exports the most commonly used types
//! from Rollback Chaser, allowing you to import them all at once.
//!
//! # Usage
//!
//! ```rust
//! use rollback_chaser::prelude::*;
//! ```
//!
//! # What's Included
//!
//! The prelude includes:
//!
//! - **Session types**: [`BattleSession`], [`SessionBuilder`], [`SharedBattle`]
//! - **Configuration**: [`BattleConfig`], [`BarrierPolygon`], [`LocalBinding`]
//! - **Fundamental types**: [`RenderFrameId`], [`InputFrameId`], [`PlayerId`], [`JoinIndex`], [`NULL_FRAME`]
//! - **Frames**: [`RenderFrame`], [`PlayerState`], [`InputFrame`], [`EncodedDirection`]
//! - **Messages**: [`AuthoritativeRenderFrame`], [`InputFrameDownsyncBatch`], [`InputFrameUpsyncBatch`]
//! - **Request/Event handling**: [`BattleRequest`], [`BattleEvent`], [`BattleState`]
//! - **Error handling**: [`RollbackError`], [`RollbackResult`], [`DesyncReason`]
//!
//! # Example
//!
//! ```rust
//! use rollback_chaser::prelude::*;
//!
//! fn handle(requests: Vec<BattleRequest>) {
//!     for request in requests {
//!         match request {
//!             BattleRequest::SendUpsync { batch } => { /* send batch */ },
//!             BattleRequest::ApplyRenderFrame { frame, countdown_nanos } => { /* draw */ },
//!             BattleRequest::SpawnPlayer { handle, .. } => { /* create node */ },
//!             BattleRequest::DespawnPlayer { handle } => { /* destroy node */ },
//!             _ => {},
//!         }
//!     }
//! }
//!
//! let session: BattleSession = SessionBuilder::new().start()?;
//! assert_eq!(session.state(), BattleState::Waiting);
//! # Ok::<(), RollbackError>(())
//! ```

// Core session types
pub use crate::sessions::battle_session::BattleSession;
pub use crate::sessions::builder::SessionBuilder;
pub use crate::sessions::shared::SharedBattle;

// Configuration
pub use crate::sessions::config::{BarrierPolygon, BattleConfig};
pub use crate::upsync::LocalBinding;

// Fundamental types and constants
pub use crate::{InputFrameId, JoinIndex, PlayerId, RenderFrameId, NULL_FRAME};

// Frames
pub use crate::frame_info::{EncodedDirection, InputFrame, PlayerState, RenderFrame};

// Messages
pub use crate::messages::{AuthoritativeRenderFrame, InputFrameDownsyncBatch, InputFrameUpsyncBatch};

// Request and event handling
pub use crate::{BattleEvent, BattleRequest, BattleState};

// Error handling
pub use crate::error::{DesyncReason, RollbackError, RollbackResult};
