//! Messages exchanged with the battle server.
//!
//! Every type derives serde's `Serialize` and `Deserialize`; the host picks
//! the wire encoding.

use serde::{Deserialize, Serialize};

use crate::frame_info::{
    all_confirmed_mask, EncodedDirection, InputFrame, InputList, PlayerState, RenderFrame,
};
use crate::{InputFrameId, JoinIndex, PlayerId, RenderFrameId};

/// Per-player metadata that travels with an authoritative frame.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerMeta {
    /// The player.
    pub player_id: PlayerId,
    /// Radius of the player's square collider, in world units.
    pub collider_radius: f64,
}

/// A full render-frame sent by the server at battle start or on resync.
///
/// Id [`BATTLE_READY_TO_START`](crate::BATTLE_READY_TO_START) only announces
/// the roster; nothing is simulated from it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthoritativeRenderFrame {
    /// The render-frame id.
    pub id: RenderFrameId,
    /// Every player's state.
    pub players: Vec<PlayerState>,
    /// Optional per-player metadata. Players without an entry use the configured collider radius.
    #[serde(default)]
    pub player_metas: Vec<PlayerMeta>,
    /// Remaining battle time, in nanoseconds.
    pub countdown_nanos: i64,
}

impl AuthoritativeRenderFrame {
    /// Converts the message into a cacheable render-frame.
    #[must_use]
    pub fn to_render_frame(&self) -> RenderFrame {
        self.players
            .iter()
            .cloned()
            .fold(RenderFrame::new(self.id), RenderFrame::with_player)
    }

    /// The collider radius the server announced for `player_id`, if any.
    #[must_use]
    pub fn collider_radius_of(&self, player_id: PlayerId) -> Option<f64> {
        self.player_metas
            .iter()
            .find(|meta| meta.player_id == player_id)
            .map(|meta| meta.collider_radius)
    }
}

/// One input-frame confirmed by the server for every seat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFrameDownsync {
    /// The input-frame id.
    pub input_frame_id: InputFrameId,
    /// Encoded direction per seat, in join-index order.
    pub input_list: InputList,
}

impl InputFrameDownsync {
    /// Converts to an [`InputFrame`] confirmed for exactly `num_seats` seats.
    ///
    /// The server's list is padded with neutral input or truncated to fit.
    #[must_use]
    pub fn into_input_frame(self, num_seats: usize) -> InputFrame {
        let mut frame = InputFrame::confirmed(self.input_frame_id, self.input_list);
        frame.resize_seats(num_seats);
        frame.confirmed_list = all_confirmed_mask(num_seats);
        frame
    }
}

/// Confirmed input-frames in ascending id order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFrameDownsyncBatch {
    /// The confirmed frames.
    pub frames: Vec<InputFrameDownsync>,
}

/// The local player's input for one input-frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFrameUpsync {
    /// The input-frame id.
    pub input_frame_id: InputFrameId,
    /// The local player's encoded direction.
    pub encoded_direction: EncodedDirection,
}

/// Unacknowledged local input sent to the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFrameUpsyncBatch {
    /// Increments with every batch sent in a battle.
    pub msg_id: u64,
    /// The sending player.
    pub player_id: PlayerId,
    /// The sending player's seat.
    pub join_index: JoinIndex,
    /// The local render watermark.
    pub acking_render_frame_id: RenderFrameId,
    /// The local confirmed-input watermark.
    pub acking_input_frame_id: InputFrameId,
    /// The local input-frames, ascending.
    pub frames: Vec<InputFrameUpsync>,
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

    #[test]
    fn authoritative_frame_without_metas_deserializes() {
        let json = r#"{"id":0,"players":[],"countdown_nanos":5}"#;
        let frame: AuthoritativeRenderFrame = serde_json::from_str(json).unwrap();
        assert!(frame.player_metas.is_empty());
        assert_eq!(frame.to_render_frame(), RenderFrame::new(RenderFrameId::new(0)));
    }

    #[test]
    fn authoritative_frame_keeps_every_player() {
        let message = AuthoritativeRenderFrame {
            id: RenderFrameId::new(40),
            players: vec![
                PlayerState::new(PlayerId::new(9), JoinIndex::new(2), 10, 0),
                PlayerState::new(PlayerId::new(3), JoinIndex::new(1), -10, 0),
            ],
            player_metas: vec![PlayerMeta {
                player_id: PlayerId::new(9),
                collider_radius: 16.0,
            }],
            countdown_nanos: 0,
        };
        let frame = message.to_render_frame();
        assert_eq!(frame.id, RenderFrameId::new(40));
        assert_eq!(frame.players.len(), 2);
        assert_eq!(message.collider_radius_of(PlayerId::new(9)), Some(16.0));
        assert_eq!(message.collider_radius_of(PlayerId::new(3)), None);
    }

    #[test]
    fn downsync_becomes_fully_confirmed() {
        let downsync = InputFrameDownsync {
            input_frame_id: InputFrameId::new(5),
            input_list: smallvec![EncodedDirection::new(1), EncodedDirection::new(2)],
        };
        let frame = downsync.into_input_frame(2);
        assert!(frame.is_all_confirmed(2));
    }

    #[test]
    fn downsync_is_fitted_to_the_roster() {
        let downsync = InputFrameDownsync {
            input_frame_id: InputFrameId::new(5),
            input_list: smallvec![
                EncodedDirection::new(1),
                EncodedDirection::new(2),
                EncodedDirection::new(3)
            ],
        };
        let wide = downsync.clone().into_input_frame(2);
        assert_eq!(wide.input_list.as_slice(), &[EncodedDirection::new(1), EncodedDirection::new(2)]);
        assert_eq!(wide.confirmed_list, 0b11);
        assert!(wide.is_all_confirmed(2));

        let narrow = downsync.into_input_frame(4);
        assert_eq!(narrow.input_list[3], EncodedDirection::NEUTRAL);
        assert!(narrow.is_all_confirmed(4));
    }
}
