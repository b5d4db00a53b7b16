//! # Rollback Chaser
//!
//! Rollback Chaser is a client-side rollback simulation engine for delayed-input lockstep battles,
//! written in 100% safe Rust.
//! A server collects every player's input, and confirms it back to all clients some time later.
//! In the meantime each client predicts the missing inputs, simulates ahead, and once a confirmation
//! disagrees with what it predicted, rewinds a "chase cursor" and replays a bounded number of frames
//! per tick until the corrected history catches up with the visible tip.
//!
//! Like its sibling rollback libraries, the API is request-driven: instead of registering callbacks,
//! [`BattleSession::tick`] returns a list of [`BattleRequest`]s for the host to fulfill.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use chaser::{ReplayOutcome, ReplayPass, RollbackChaser};
pub use collision::{CollisionKey, CollisionSpace, Overlap, SatCollisionSpace, Vec2};
pub use error::{CacheKind, DesyncReason, RollbackError, RollbackResult};
pub use frame_id::FrameIdConverter;
pub use frame_info::{
    Direction, EncodedDirection, InputFrame, InputList, PlayerBattleState, PlayerState,
    RenderFrame,
};
pub use messages::{
    AuthoritativeRenderFrame, InputFrameDownsync, InputFrameDownsyncBatch, InputFrameUpsync,
    InputFrameUpsyncBatch, PlayerMeta,
};
pub use prediction::InputPredictor;
pub use reconciler::{DownsyncReconciler, ReconcileOutcome};
pub use ring_buffer::{FrameKey, RingBuffer, SetOutcome};
pub use roster::{PlayerRichInfo, PresentationHandle, Roster};
pub use sessions::battle_session::{BattleSession, BattleStats};
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{BarrierPolygon, BattleConfig};
pub use sessions::shared::SharedBattle;
pub use stepper::SimulationStepper;
pub use sync_layer::{FrameCursors, SyncLayer};
pub use upsync::{LocalBinding, UpsyncBatcher};

pub mod chaser;
pub mod checksum;
pub mod collision;
pub mod error;
pub mod frame_id;
pub mod frame_info;
pub mod messages;
pub mod prediction;
pub mod reconciler;
pub mod ring_buffer;
pub mod roster;
pub mod stepper;
pub mod sync_layer;
pub mod telemetry;
pub mod upsync;

/// Shared test configuration for property-based testing.
#[cfg(test)]
pub(crate) mod test_config;

/// Battle driver, its configuration, and the shared handle.
pub mod sessions {
    /// The per-tick battle driver.
    pub mod battle_session;
    /// Builder for [`BattleSession`](crate::BattleSession).
    pub mod builder;
    /// Battle configuration.
    pub mod config;
    /// Mutex-guarded handle for multi-threaded hosts.
    pub mod shared;
}

pub mod prelude;

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// Authoritative render-frame id announcing that every seat is filled and the battle is about to start.
pub const BATTLE_READY_TO_START: i32 = -1;

/// Authoritative render-frame id of the first simulated frame.
pub const BATTLE_START: i32 = 0;

macro_rules! frame_id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Copy,
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Default,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i32);

        impl $name {
            /// The null id, representing "no frame" or "uninitialized".
            pub const NULL: $name = $name(NULL_FRAME);

            /// Creates a new id from an `i32` value. No validation is done.
            #[inline]
            #[must_use]
            pub const fn new(id: i32) -> Self {
                $name(id)
            }

            /// Returns the underlying `i32` value.
            #[inline]
            #[must_use]
            pub const fn as_i32(self) -> i32 {
                self.0
            }

            /// Returns `true` if this is the null id.
            #[inline]
            #[must_use]
            pub const fn is_null(self) -> bool {
                self.0 == NULL_FRAME
            }

            /// Returns `true` if this id is non-negative.
            #[inline]
            #[must_use]
            pub const fn is_valid(self) -> bool {
                self.0 >= 0
            }

            /// Returns the id that follows this one.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                $name(self.0 + 1)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                if self.is_null() {
                    write!(f, "NULL_FRAME")
                } else {
                    write!(f, "{}", self.0)
                }
            }
        }

        impl std::ops::Add<i32> for $name {
            type Output = $name;

            #[inline]
            fn add(self, rhs: i32) -> Self::Output {
                $name(self.0 + rhs)
            }
        }

        impl std::ops::AddAssign<i32> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: i32) {
                self.0 += rhs;
            }
        }

        impl std::ops::Sub<i32> for $name {
            type Output = $name;

            #[inline]
            fn sub(self, rhs: i32) -> Self::Output {
                $name(self.0 - rhs)
            }
        }

        impl std::ops::Sub<$name> for $name {
            type Output = i32;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl From<i32> for $name {
            #[inline]
            fn from(value: i32) -> Self {
                $name(value)
            }
        }

        impl From<$name> for i32 {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl PartialEq<i32> for $name {
            #[inline]
            fn eq(&self, other: &i32) -> bool {
                self.0 == *other
            }
        }

        impl PartialOrd<i32> for $name {
            #[inline]
            fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
                self.0.partial_cmp(other)
            }
        }

        impl ring_buffer::FrameKey for $name {
            #[inline]
            fn as_i32(self) -> i32 {
                self.0
            }

            #[inline]
            fn from_i32(id: i32) -> Self {
                $name(id)
            }
        }
    };
}

frame_id_type!(
    /// Id of a render-frame: one tick of full simulated state.
    ///
    /// Render-frame ids are the simulation's total order. The battle starts at
    /// [`BATTLE_START`] and the tip advances by exactly one per tick.
    ///
    /// ```
    /// use rollback_chaser::RenderFrameId;
    ///
    /// let tip = RenderFrameId::new(12);
    /// assert_eq!((tip + 1).as_i32(), 13);
    /// assert!(RenderFrameId::NULL.is_null());
    /// ```
    RenderFrameId
);

frame_id_type!(
    /// Id of an input-frame: one sampled input snapshot covering `2^scale` render-frames.
    ///
    /// See [`FrameIdConverter`] for how the two id spaces map onto each other.
    InputFrameId
);

/// Server-assigned identifier of a player.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct PlayerId(i32);

impl PlayerId {
    /// Creates a new `PlayerId`.
    #[inline]
    #[must_use]
    pub const fn new(id: i32) -> Self {
        PlayerId(id)
    }

    /// Returns the underlying value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 1-based seat number of a player within a battle.
///
/// Join index `k` owns slot `k - 1` of every [`InputFrame`] input list and bit
/// `k - 1` of its confirmation mask. Zero is never a valid join index, and a
/// mask has no bit for anything above [`JoinIndex::MAX`].
///
/// ```
/// use rollback_chaser::JoinIndex;
///
/// let second = JoinIndex::new(2);
/// assert_eq!(second.seat(), Some(1));
/// assert_eq!(second.seat_bit(), 0b10);
/// assert_eq!(JoinIndex::new(0).seat(), None);
/// assert_eq!(JoinIndex::new(65).seat(), None);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct JoinIndex(u32);

impl JoinIndex {
    /// The highest seated join index.
    pub const MAX: JoinIndex = JoinIndex(64);

    /// Creates a new `JoinIndex`.
    #[inline]
    #[must_use]
    pub const fn new(join_index: u32) -> Self {
        JoinIndex(join_index)
    }

    /// Returns the underlying 1-based value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the 0-based slot in input lists, or `None` for 0 and anything above [`MAX`](Self::MAX).
    #[inline]
    #[must_use]
    pub const fn seat(self) -> Option<usize> {
        match self.0 {
            0 | 65.. => None,
            n => Some(n as usize - 1),
        }
    }

    /// Returns this seat's bit in a confirmation mask, or 0 for the invalid join index 0.
    #[inline]
    #[must_use]
    pub const fn seat_bit(self) -> u64 {
        match self.0 {
            0 | 65.. => 0,
            n => 1 << (n - 1),
        }
    }
}

impl std::fmt::Display for JoinIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// #############
// #   ENUMS   #
// #############

/// Lifecycle of a battle as seen by one client.
///
/// `Waiting → InBattle → InSettlement` is the normal path. `InDismissal` is the
/// abnormal exit and can be entered from any state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[repr(i32)]
pub enum BattleState {
    /// No authoritative battle-start frame has arrived yet.
    #[default]
    Waiting = 0,
    /// Ticks simulate, predict and upsync.
    InBattle = 1,
    /// The countdown reached zero. Confirmations are still accepted, ticks do nothing.
    InSettlement = 2,
    /// The battle was abandoned.
    InDismissal = 3,
}

impl std::fmt::Display for BattleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::InBattle => write!(f, "in battle"),
            Self::InSettlement => write!(f, "in settlement"),
            Self::InDismissal => write!(f, "in dismissal"),
        }
    }
}

/// Notifications about the battle. Drain them with [`BattleSession::events`].
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]`. Always include a wildcard arm when matching.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum BattleEvent {
    /// Every seat is filled; the roster is known but nothing is simulated yet.
    ReadyToStart {
        /// Number of seated players.
        players: usize,
    },
    /// The battle-start frame arrived and ticking begins.
    BattleStarted {
        /// Generation of the session that started.
        generation: u64,
    },
    /// An authoritative frame replaced local history ahead of the cache window.
    Resynced {
        /// The authoritative frame the session jumped to.
        frame: RenderFrameId,
    },
    /// A confirmed input frame differed from the local prediction.
    MispredictionDetected {
        /// First input frame of the batch whose confirmation differed.
        input_frame: InputFrameId,
        /// Where the chase cursor was rewound to, if it was rewound.
        rewound_to: Option<RenderFrameId>,
    },
    /// The local and authoritative copies of the watermark frame differ.
    ChecksumMismatch {
        /// The compared frame.
        frame: RenderFrameId,
        /// Checksum of the local copy.
        local_checksum: u128,
        /// Checksum of the authoritative copy.
        remote_checksum: u128,
    },
    /// Local history can no longer be trusted. The host should request a fresh snapshot or disconnect.
    DesyncDetected {
        /// What went wrong.
        reason: DesyncReason,
    },
    /// The countdown reached zero.
    Settled {
        /// The last frame simulated in battle.
        frame: RenderFrameId,
    },
    /// The battle was dismissed.
    Dismissed,
    /// All battle state was discarded.
    Reset {
        /// The new generation.
        generation: u64,
    },
}

/// Work the host must carry out on behalf of the session.
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]`. Always include a wildcard arm when matching.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum BattleRequest {
    /// Send this batch of local input to the server.
    SendUpsync {
        /// The batch to send.
        batch: InputFrameUpsyncBatch,
    },
    /// Present this frame.
    ApplyRenderFrame {
        /// The frame to present.
        frame: RenderFrame,
        /// Remaining battle time.
        countdown_nanos: i64,
    },
    /// Create the presentation for a newly seated player.
    SpawnPlayer {
        /// Handle later used by [`BattleRequest::DespawnPlayer`].
        handle: PresentationHandle,
        /// The player.
        player_id: PlayerId,
        /// The player's seat.
        join_index: JoinIndex,
        /// Initial virtual-grid position.
        position: (i32, i32),
    },
    /// Destroy a player's presentation.
    DespawnPlayer {
        /// Handle returned by the matching spawn.
        handle: PresentationHandle,
    },
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    // ==========================================
    // Frame Id Tests
    // ==========================================

    #[test]
    fn null_ids_display_as_null_frame() {
        assert_eq!(RenderFrameId::NULL.to_string(), "NULL_FRAME");
        assert_eq!(InputFrameId::new(3).to_string(), "3");
    }

    #[test]
    fn frame_id_arithmetic() {
        let mut id = RenderFrameId::new(10);
        id += 2;
        assert_eq!(id, 12);
        assert_eq!(id - RenderFrameId::new(4), 8);
        assert_eq!((id - 12).as_i32(), 0);
        assert_eq!(id.next(), RenderFrameId::new(13));
        assert!(id > 11);
    }

    #[test]
    fn frame_id_serializes_as_bare_integer() {
        let json = serde_json::to_string(&InputFrameId::new(42)).unwrap();
        assert_eq!(json, "42");
    }

    // ==========================================
    // Join Index Tests
    // ==========================================

    #[test]
    fn join_index_seat_bits() {
        assert_eq!(JoinIndex::new(1).seat_bit(), 1);
        assert_eq!(JoinIndex::new(3).seat_bit(), 4);
        assert_eq!(JoinIndex::new(0).seat_bit(), 0);
        assert_eq!(JoinIndex::new(65).seat_bit(), 0);
    }

    #[test]
    fn join_index_above_max_has_no_seat() {
        assert_eq!(JoinIndex::MAX.seat(), Some(63));
        assert_eq!(JoinIndex::MAX.seat_bit(), 1 << 63);
        assert_eq!(JoinIndex::new(65).seat(), None);
        assert_eq!(JoinIndex::new(u32::MAX).seat(), None);
    }

    #[test]
    fn battle_state_discriminants() {
        assert_eq!(BattleState::Waiting as i32, 0);
        assert_eq!(BattleState::InBattle as i32, 1);
        assert_eq!(BattleState::InSettlement as i32, 2);
        assert_eq!(BattleState::InDismissal as i32, 3);
        assert_eq!(BattleState::default(), BattleState::Waiting);
    }
}
