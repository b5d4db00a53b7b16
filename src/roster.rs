//! Per-battle player metadata.
//!
//! A [`PlayerRichInfo`] is created the first time a player appears in an
//! authoritative frame and lives until the battle is reset. Unlike a
//! [`PlayerState`](crate::PlayerState), it is never rolled back.

use std::collections::BTreeMap;

use crate::{JoinIndex, PlayerId};

/// Opaque handle to the host's presentation of a player (a scene node, a sprite, ...).
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct PresentationHandle(u64);

impl PresentationHandle {
    /// Returns the raw handle.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Persistent metadata of one seated player.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlayerRichInfo {
    /// The player.
    pub player_id: PlayerId,
    /// The player's seat.
    pub join_index: JoinIndex,
    /// Half the side of the player's square collider, in world units.
    pub collider_radius: f64,
    /// The host-side presentation of this player.
    pub presentation: PresentationHandle,
}

/// Every seated player, iterated in join-index order.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    by_seat: BTreeMap<JoinIndex, PlayerRichInfo>,
    next_handle: u64,
}

impl Roster {
    /// Creates an empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seats a player unless its seat is already taken.
    ///
    /// Returns the new entry, or `None` if the seat was already occupied or
    /// the join index has no seat.
    pub fn insert_if_absent(
        &mut self,
        player_id: PlayerId,
        join_index: JoinIndex,
        collider_radius: f64,
    ) -> Option<&PlayerRichInfo> {
        if join_index.seat().is_none() || self.by_seat.contains_key(&join_index) {
            return None;
        }
        let presentation = PresentationHandle(self.next_handle);
        self.next_handle += 1;
        self.by_seat.insert(
            join_index,
            PlayerRichInfo {
                player_id,
                join_index,
                collider_radius,
                presentation,
            },
        );
        self.by_seat.get(&join_index)
    }

    /// Players in join-index order.
    pub fn iter(&self) -> impl Iterator<Item = &PlayerRichInfo> {
        self.by_seat.values()
    }

    /// The player seated at `join_index`.
    #[must_use]
    pub fn by_join_index(&self, join_index: JoinIndex) -> Option<&PlayerRichInfo> {
        self.by_seat.get(&join_index)
    }

    /// Looks a player up by id.
    #[must_use]
    pub fn by_player_id(&self, player_id: PlayerId) -> Option<&PlayerRichInfo> {
        self.by_seat.values().find(|info| info.player_id == player_id)
    }

    /// Number of seated players.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_seat.len()
    }

    /// Returns `true` if nobody is seated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_seat.is_empty()
    }

    /// Length of every input list: the highest occupied join index.
    #[must_use]
    pub fn num_seats(&self) -> usize {
        self.by_seat
            .keys()
            .next_back()
            .map_or(0, |join_index| join_index.as_u32() as usize)
    }

    /// Removes everyone and returns their presentation handles in join-index order.
    pub fn clear(&mut self) -> Vec<PresentationHandle> {
        let handles = self.by_seat.values().map(|info| info.presentation).collect();
        self.by_seat.clear();
        handles
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

    #[test]
    fn iterates_in_join_order_regardless_of_insertion() {
        let mut roster = Roster::new();
        roster.insert_if_absent(PlayerId::new(30), JoinIndex::new(3), 12.0);
        roster.insert_if_absent(PlayerId::new(10), JoinIndex::new(1), 12.0);
        roster.insert_if_absent(PlayerId::new(20), JoinIndex::new(2), 12.0);

        let ids: Vec<i32> = roster.iter().map(|info| info.player_id.as_i32()).collect();
        assert_eq!(ids, vec![10, 20, 30]);
        assert_eq!(roster.num_seats(), 3);
    }

    #[test]
    fn occupied_seat_is_kept() {
        let mut roster = Roster::new();
        assert!(roster.insert_if_absent(PlayerId::new(1), JoinIndex::new(1), 12.0).is_some());
        assert!(roster.insert_if_absent(PlayerId::new(2), JoinIndex::new(1), 20.0).is_none());
        assert_eq!(roster.by_join_index(JoinIndex::new(1)).unwrap().player_id, PlayerId::new(1));
        assert!(roster.insert_if_absent(PlayerId::new(3), JoinIndex::new(0), 12.0).is_none());
    }

    #[test]
    fn clear_returns_every_handle_and_handles_stay_unique() {
        let mut roster = Roster::new();
        roster.insert_if_absent(PlayerId::new(1), JoinIndex::new(1), 12.0);
        roster.insert_if_absent(PlayerId::new(2), JoinIndex::new(2), 12.0);
        let handles = roster.clear();
        assert_eq!(handles.len(), 2);
        assert!(roster.is_empty());

        let fresh = roster
            .insert_if_absent(PlayerId::new(1), JoinIndex::new(1), 12.0)
            .unwrap()
            .presentation;
        assert!(!handles.contains(&fresh));
    }

    #[test]
    fn join_index_above_max_is_not_seated() {
        let mut roster = Roster::new();
        assert!(roster.insert_if_absent(PlayerId::new(1), JoinIndex::new(65), 12.0).is_none());
        assert!(roster.insert_if_absent(PlayerId::new(2), JoinIndex::MAX, 12.0).is_some());
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.num_seats(), 64);
    }

    #[test]
    fn sparse_seats_size_input_lists_by_highest_seat() {
        let mut roster = Roster::new();
        roster.insert_if_absent(PlayerId::new(4), JoinIndex::new(4), 12.0);
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.num_seats(), 4);
        assert_eq!(roster.by_player_id(PlayerId::new(4)).unwrap().join_index, JoinIndex::new(4));
    }
}
