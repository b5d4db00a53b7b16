//! Determinism integration tests.
//!
//! These check relationships rather than fixed values: batched advancing
//! against single frames, and late confirmations against a simulation that
//! knew every input up front.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::{
    applied_frames, assert_history_matches, confirm, local_binding, player, start_frame,
    two_player_session, LOCAL_JOIN, LOCAL_PLAYER,
};
use proptest::prelude::*;
use rollback_chaser::{
    BattleConfig, BattleSession, EncodedDirection, RenderFrame, RenderFrameId, SessionBuilder,
};

fn lone_player(x: i32, y: i32, direction: u32) -> BattleSession {
    let mut session = SessionBuilder::new()
        .with_config(BattleConfig::offline())
        .with_local_player(local_binding())
        .start()
        .unwrap();
    session
        .on_authoritative_render_frame(&start_frame(0, vec![player(LOCAL_PLAYER, LOCAL_JOIN, x, y)]))
        .unwrap();
    session.events().for_each(drop);
    session.set_local_direction(EncodedDirection::new(direction));
    session
}

fn cached_history(session: &BattleSession) -> Vec<RenderFrame> {
    let (start, end) = session.sync_layer().render_window();
    (start.as_i32()..end.as_i32())
        .map(|raw| session.sync_layer().render_frame(RenderFrameId::new(raw)).unwrap().clone())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: advancing n frames at once is the same as n single advances.
    #[test]
    fn prop_batched_advance_matches_single_frames(
        frames in 1usize..=40,
        direction in 0u32..13,
        x in -1_000_000i32..1_000_000,
        y in -1_000_000i32..1_000_000,
    ) {
        let mut batched = lone_player(x, y, direction);
        let mut single = lone_player(x, y, direction);

        let batched_requests = batched.advance_frames(frames).unwrap();
        let mut single_requests = Vec::new();
        for _ in 0..frames {
            single_requests.extend(single.advance_frame().unwrap());
        }

        prop_assert_eq!(&batched_requests, &single_requests);
        prop_assert_eq!(batched.battle_stats(), single.battle_stats());
        prop_assert_eq!(cached_history(&batched), cached_history(&single));

        let step = EncodedDirection::new(direction).decode();
        let tip = applied_frames(&batched_requests).pop().unwrap();
        prop_assert_eq!(tip.id, RenderFrameId::new(frames as i32));
        let state = &tip.players[&LOCAL_PLAYER];
        prop_assert_eq!(state.virtual_grid_x, x + step.dx * frames as i32);
        prop_assert_eq!(state.virtual_grid_y, y + step.dy * frames as i32);
    }

    /// Property: however late the server reveals a turn, catching up lands on
    /// the history a client with perfect knowledge would have simulated.
    #[test]
    fn prop_late_confirmation_converges(
        ticks in 20usize..=80,
        confirmed_seed in any::<u32>(),
        turn_seed in any::<u32>(),
    ) {
        let mut session = two_player_session(BattleConfig::default());
        session.advance_frames(ticks).unwrap();

        // Only input-frames the client has sampled itself can be confirmed in place.
        let newest_sampled = (ticks as i32 - 1) >> 2;
        let newest_confirmed = 1 + (confirmed_seed % newest_sampled as u32) as i32;
        let turn = 1 + (turn_seed % newest_confirmed as u32) as i32;
        let inputs: Vec<(u32, u32)> = (0..=newest_confirmed)
            .map(|raw| (0, if raw >= turn { 3 } else { 0 }))
            .collect();
        let outcome = session.on_input_frame_downsync_batch(&confirm(0, &inputs)).unwrap();
        prop_assert_eq!(outcome.contradicted, None);

        session.advance_frames(40).unwrap();
        let cursors = session.cursors();
        prop_assert_eq!(cursors.chaser_render_frame_id, cursors.render_frame_id - 1);
        assert_history_matches(&session, turn);
    }
}
