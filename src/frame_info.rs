//! Per-frame state: player positions, encoded directions and input-frames.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::checksum::{compute_checksum, ChecksumError};
use crate::{InputFrameId, JoinIndex, PlayerId, RenderFrameId};

/// `(dx, dy)` for every encoded direction. Horizontal steps are doubled so
/// that diagonals keep a 2:1 aspect on the isometric grid.
pub const DIRECTION_DECODER: [(i32, i32); 13] = [
    (0, 0),
    (0, 1),
    (0, -1),
    (2, 0),
    (-2, 0),
    (2, 1),
    (-2, -1),
    (2, -1),
    (-2, 1),
    (2, 0),
    (-2, 0),
    (0, 1),
    (0, -1),
];

/// A decoded movement direction on the virtual grid.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub struct Direction {
    /// Horizontal component.
    pub dx: i32,
    /// Vertical component.
    pub dy: i32,
}

impl Direction {
    /// No movement.
    pub const NEUTRAL: Direction = Direction { dx: 0, dy: 0 };
}

/// One player's input for one input-frame: an index into [`DIRECTION_DECODER`].
///
/// ```
/// use rollback_chaser::{Direction, EncodedDirection};
///
/// assert_eq!(EncodedDirection::new(3).decode(), Direction { dx: 2, dy: 0 });
/// assert_eq!(EncodedDirection::new(99).decode(), Direction::NEUTRAL);
/// assert_eq!(EncodedDirection::encode(Direction { dx: -2, dy: -1 }), Some(EncodedDirection::new(6)));
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
pub struct EncodedDirection(u32);

impl EncodedDirection {
    /// Standing still.
    pub const NEUTRAL: EncodedDirection = EncodedDirection(0);

    /// Wraps a raw encoded value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        EncodedDirection(raw)
    }

    /// Returns the raw encoded value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Decodes to a direction. Unknown values decode as [`Direction::NEUTRAL`].
    #[must_use]
    pub fn decode(self) -> Direction {
        DIRECTION_DECODER
            .get(self.0 as usize)
            .map_or(Direction::NEUTRAL, |&(dx, dy)| Direction { dx, dy })
    }

    /// Returns the lowest encoding of `direction`, if it has one.
    #[must_use]
    pub fn encode(direction: Direction) -> Option<Self> {
        DIRECTION_DECODER
            .iter()
            .position(|&(dx, dy)| dx == direction.dx && dy == direction.dy)
            .map(|index| EncodedDirection(index as u32))
    }
}

/// Per-player battle lifecycle as reported by the server.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub enum PlayerBattleState {
    /// Joined, waiting for the server to place its collider.
    AddedPendingBattleColliderAck,
    /// Rejoined after a disconnect, waiting for the server to place its collider.
    ReaddedPendingBattleColliderAck,
    /// Taking part in the battle.
    #[default]
    Active,
    /// Connection lost; the seat is kept.
    Disconnected,
    /// Connection lost for good.
    Lost,
    /// Removed by the server during the battle.
    ExpelledDuringGame,
    /// Removed by the server while the battle was being dismissed.
    ExpelledInDismissal,
}

/// One player's state inside a [`RenderFrame`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PlayerState {
    /// The player.
    pub id: PlayerId,
    /// The player's seat.
    pub join_index: JoinIndex,
    /// Horizontal position in virtual-grid units.
    pub virtual_grid_x: i32,
    /// Vertical position in virtual-grid units.
    pub virtual_grid_y: i32,
    /// Direction sampled for the last step.
    pub dir: Direction,
    /// Extra virtual-grid units moved per tick on top of the base step.
    pub speed: i32,
    /// Server-reported lifecycle.
    pub battle_state: PlayerBattleState,
    /// Score.
    pub score: i32,
    /// Removed players are carried forward unchanged.
    pub removed: bool,
}

impl PlayerState {
    /// Creates an active, motionless player at the given grid position.
    #[must_use]
    pub fn new(id: PlayerId, join_index: JoinIndex, virtual_grid_x: i32, virtual_grid_y: i32) -> Self {
        Self {
            id,
            join_index,
            virtual_grid_x,
            virtual_grid_y,
            dir: Direction::NEUTRAL,
            speed: 0,
            battle_state: PlayerBattleState::Active,
            score: 0,
            removed: false,
        }
    }

    /// Sets the speed.
    #[must_use]
    pub fn with_speed(mut self, speed: i32) -> Self {
        self.speed = speed;
        self
    }
}

/// Full simulated state for one tick.
///
/// `Clone` is a deep copy; cached frames never share player state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RenderFrame {
    /// The frame id.
    pub id: RenderFrameId,
    /// Player states, iterated in player-id order.
    pub players: BTreeMap<PlayerId, PlayerState>,
}

impl RenderFrame {
    /// Creates a frame with no players.
    #[must_use]
    pub fn new(id: RenderFrameId) -> Self {
        Self {
            id,
            players: BTreeMap::new(),
        }
    }

    /// Adds or replaces a player.
    #[must_use]
    pub fn with_player(mut self, player: PlayerState) -> Self {
        self.players.insert(player.id, player);
        self
    }

    /// Deterministic checksum of the frame.
    pub fn checksum(&self) -> Result<u128, ChecksumError> {
        compute_checksum(self)
    }
}

/// Per-seat encoded directions of one input-frame. Inline for up to four seats.
pub type InputList = SmallVec<[EncodedDirection; 4]>;

/// Returns the confirmation mask in which every one of `num_seats` seats is set.
#[must_use]
pub const fn all_confirmed_mask(num_seats: usize) -> u64 {
    if num_seats >= 64 {
        u64::MAX
    } else {
        (1u64 << num_seats) - 1
    }
}

/// One sampled input snapshot for every seat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct InputFrame {
    /// The input-frame id.
    pub input_frame_id: InputFrameId,
    /// Encoded direction per seat, in join-index order.
    pub input_list: InputList,
    /// Bit `k` is set once seat `k` is confirmed.
    pub confirmed_list: u64,
}

impl InputFrame {
    /// All seats neutral and nothing confirmed.
    #[must_use]
    pub fn neutral(input_frame_id: InputFrameId, num_seats: usize) -> Self {
        Self {
            input_frame_id,
            input_list: SmallVec::from_elem(EncodedDirection::NEUTRAL, num_seats),
            confirmed_list: 0,
        }
    }

    /// Every seat confirmed with the given inputs.
    #[must_use]
    pub fn confirmed(input_frame_id: InputFrameId, input_list: InputList) -> Self {
        let confirmed_list = all_confirmed_mask(input_list.len());
        Self {
            input_frame_id,
            input_list,
            confirmed_list,
        }
    }

    /// Returns `true` if every one of `num_seats` seats is confirmed.
    #[must_use]
    pub const fn is_all_confirmed(&self, num_seats: usize) -> bool {
        self.confirmed_list == all_confirmed_mask(num_seats)
    }

    /// Input of the seat at `join_index`, or neutral if the list is too short.
    #[must_use]
    pub fn input_of(&self, join_index: JoinIndex) -> EncodedDirection {
        join_index
            .seat()
            .and_then(|seat| self.input_list.get(seat).copied())
            .unwrap_or(EncodedDirection::NEUTRAL)
    }

    /// Pads or truncates the input list to exactly `num_seats` entries.
    pub fn resize_seats(&mut self, num_seats: usize) {
        self.input_list.resize(num_seats, EncodedDirection::NEUTRAL);
    }
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
    use smallvec::smallvec;

    fn player(id: i32, join_index: u32) -> PlayerState {
        PlayerState::new(PlayerId::new(id), JoinIndex::new(join_index), 0, 0)
    }

    #[test]
    fn every_encoding_round_trips_to_its_first_occurrence() {
        for (index, &(dx, dy)) in DIRECTION_DECODER.iter().enumerate() {
            let encoded = EncodedDirection::encode(Direction { dx, dy }).unwrap();
            assert!(encoded.as_u32() as usize <= index);
            assert_eq!(encoded.decode(), Direction { dx, dy });
        }
        assert_eq!(EncodedDirection::encode(Direction { dx: 1, dy: 1 }), None);
    }

    #[test]
    fn clone_is_a_deep_copy() {
        let original = RenderFrame::new(RenderFrameId::new(3)).with_player(player(7, 1));
        let mut copy = original.clone();
        copy.players.get_mut(&PlayerId::new(7)).unwrap().virtual_grid_x = 99;
        assert_eq!(original.players[&PlayerId::new(7)].virtual_grid_x, 0);
    }

    #[test]
    fn checksum_tracks_contents() {
        let a = RenderFrame::new(RenderFrameId::new(3)).with_player(player(7, 1));
        let mut b = a.clone();
        assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());
        b.players.get_mut(&PlayerId::new(7)).unwrap().virtual_grid_y = 1;
        assert_ne!(a.checksum().unwrap(), b.checksum().unwrap());
    }

    #[test]
    fn all_confirmed_requires_every_seat() {
        let mut frame = InputFrame::neutral(InputFrameId::new(0), 3);
        frame.confirmed_list = 0b011;
        assert!(!frame.is_all_confirmed(3));
        frame.confirmed_list = 0b111;
        assert!(frame.is_all_confirmed(3));
        assert!(InputFrame::confirmed(InputFrameId::new(1), smallvec![EncodedDirection::new(1)])
            .is_all_confirmed(1));
    }

    #[test]
    fn input_of_out_of_range_seat_is_neutral() {
        let frame = InputFrame::confirmed(
            InputFrameId::new(0),
            smallvec![EncodedDirection::new(3), EncodedDirection::new(4)],
        );
        assert_eq!(frame.input_of(JoinIndex::new(2)), EncodedDirection::new(4));
        assert_eq!(frame.input_of(JoinIndex::new(5)), EncodedDirection::NEUTRAL);
        assert_eq!(frame.input_of(JoinIndex::new(0)), EncodedDirection::NEUTRAL);
    }
}
