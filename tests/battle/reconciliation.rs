//! Reconciliation integration tests: confirmations against predicted history.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;

use crate::common::{
    assert_history_matches, confirm, started, two_player_session, LOCAL_PLAYER, REMOTE_PLAYER,
};
use rollback_chaser::telemetry::{CollectingObserver, ViolationKind};
use rollback_chaser::{
    BattleConfig, BattleEvent, BattleSession, DesyncReason, EncodedDirection, InputFrameDownsync,
    InputFrameDownsyncBatch, InputFrameId, RenderFrameId, RollbackError, SessionBuilder,
};

/// Forty ticks of neutral prediction, then the server confirms that the
/// remote player started walking right at input-frame 5.
fn mispredicted_battle() -> BattleSession {
    let mut session = two_player_session(BattleConfig::default());
    session.advance_frames(40).unwrap();

    let cursors = session.cursors();
    assert_eq!(cursors.render_frame_id, RenderFrameId::new(40));
    assert_eq!(cursors.chaser_render_frame_id, RenderFrameId::new(39));
    assert_eq!(cursors.last_all_confirmed_render_frame_id, RenderFrameId::new(0));

    let mut inputs = vec![(0, 0); 5];
    inputs.push((0, 3));
    let outcome = session.on_input_frame_downsync_batch(&confirm(0, &inputs)).unwrap();
    assert_eq!(outcome.applied, 6);
    assert_eq!(outcome.first_mismatch, Some(InputFrameId::new(5)));
    assert_eq!(outcome.rewound_to, Some(RenderFrameId::new(28)));
    session
}

#[test]
fn misprediction_rewinds_the_chaser_to_the_first_consumer() {
    let mut session = mispredicted_battle();

    let cursors = session.cursors();
    assert_eq!(cursors.render_frame_id, RenderFrameId::new(40));
    assert_eq!(cursors.chaser_render_frame_id, RenderFrameId::new(28));
    assert_eq!(cursors.last_all_confirmed_input_frame_id, InputFrameId::new(5));
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![BattleEvent::MispredictionDetected {
            input_frame: InputFrameId::new(5),
            rewound_to: Some(RenderFrameId::new(28)),
        }]
    );
}

#[test]
fn catch_up_is_bounded_per_tick() -> Result<(), RollbackError> {
    let mut session = mispredicted_battle();
    let budget = session.config().max_chasing_render_frames_per_update as i32;

    session.advance_frame()?;
    assert_eq!(session.cursors().chaser_render_frame_id, RenderFrameId::new(28 + budget));
    assert_eq!(session.cursors().render_frame_id, RenderFrameId::new(41));

    session.advance_frame()?;
    assert_eq!(session.cursors().chaser_render_frame_id, RenderFrameId::new(28 + 2 * budget));
    Ok(())
}

#[test]
fn replay_regenerates_history_from_confirmed_input() -> Result<(), RollbackError> {
    let mut session = mispredicted_battle();
    let requests = session.advance_frames(10)?;

    let cursors = session.cursors();
    assert_eq!(cursors.render_frame_id, RenderFrameId::new(50));
    assert_eq!(cursors.chaser_render_frame_id, RenderFrameId::new(49));
    // Render-frames 28..=31 consume input-frame 5, the newest confirmed one.
    assert_eq!(cursors.last_all_confirmed_render_frame_id, RenderFrameId::new(32));

    assert_history_matches(&session, 5);

    let latest = crate::common::applied_frames(&requests).pop().unwrap().clone();
    assert_eq!(latest.id, RenderFrameId::new(50));
    assert_eq!(latest.players[&REMOTE_PLAYER].virtual_grid_x, 2 * (50 - 28));
    assert_eq!(latest.players[&LOCAL_PLAYER].virtual_grid_x, 0);
    Ok(())
}

#[test]
fn matching_confirmations_do_not_rewind() -> Result<(), RollbackError> {
    let mut session = two_player_session(BattleConfig::default());
    session.advance_frames(40)?;

    let outcome = session.on_input_frame_downsync_batch(&confirm(0, &[(0, 0); 6]))?;
    assert_eq!(outcome.applied, 6);
    assert_eq!(outcome.first_mismatch, None);
    assert_eq!(outcome.rewound_to, None);
    assert_eq!(session.cursors().chaser_render_frame_id, RenderFrameId::new(39));
    assert_eq!(session.events().count(), 0);

    // Replaying the same confirmations again is a no-op below the input watermark.
    let outcome = session.on_input_frame_downsync_batch(&confirm(0, &[(0, 0); 6]))?;
    assert_eq!(outcome.stale, 5);
    assert_eq!(outcome.applied, 1);
    Ok(())
}

#[test]
fn confirmation_ahead_of_the_tip_needs_no_rewind() -> Result<(), RollbackError> {
    let mut session = two_player_session(BattleConfig::default());
    session.advance_frames(40)?;

    // Input-frame 9 is first consumed by render-frame 44, which is not simulated yet.
    let mut inputs = vec![(0, 0); 9];
    inputs.push((0, 3));
    let outcome = session.on_input_frame_downsync_batch(&confirm(0, &inputs))?;
    assert_eq!(outcome.first_mismatch, Some(InputFrameId::new(9)));
    assert_eq!(outcome.rewound_to, None);
    assert_eq!(session.cursors().chaser_render_frame_id, RenderFrameId::new(39));

    session.advance_frames(10)?;
    // Render-frames 40..=47 consume the confirmed input-frames 8 and 9.
    assert_eq!(
        session.cursors().last_all_confirmed_render_frame_id,
        RenderFrameId::new(48)
    );
    assert_history_matches(&session, 9);
    Ok(())
}

#[test]
fn contradicting_the_watermark_is_a_desync() -> Result<(), RollbackError> {
    let observer = Arc::new(CollectingObserver::new());
    let mut session = started(
        SessionBuilder::new().with_violation_observer(observer.clone()),
    );
    session.advance_frames(40)?;
    let mut inputs = vec![(0, 0); 5];
    inputs.push((0, 3));
    session.on_input_frame_downsync_batch(&confirm(0, &inputs))?;
    session.advance_frames(10)?;
    session.events().for_each(drop);
    assert_eq!(
        session.cursors().last_all_confirmed_render_frame_id,
        RenderFrameId::new(32)
    );

    // Input-frame 5 was already folded into render-frames 28..=31.
    let outcome = session.on_input_frame_downsync_batch(&confirm(5, &[(0, 4)]))?;
    let reason = DesyncReason::ConfirmedHistoryContradicted {
        input_frame: InputFrameId::new(5),
        watermark: RenderFrameId::new(32),
    };
    assert_eq!(outcome.contradicted, Some(reason.clone()));
    assert_eq!(outcome.rewound_to, None);
    assert!(observer.has_violation(ViolationKind::Reconciliation));
    assert_eq!(session.desync(), Some(&reason));
    assert!(session
        .events()
        .any(|event| event == BattleEvent::DesyncDetected { reason: reason.clone() }));
    assert_eq!(
        session.advance_frame(),
        Err(RollbackError::DesyncDetected { reason })
    );
    Ok(())
}

#[test]
fn predicted_remote_input_repeats_the_newest_confirmation() -> Result<(), RollbackError> {
    let mut session = two_player_session(BattleConfig::default());
    session.on_input_frame_downsync_batch(&confirm(0, &[(0, 0), (0, 1)]))?;
    session.advance_frames(40)?;

    // Everything after input-frame 1 is predicted from it.
    for raw in 2..10 {
        let input = session.sync_layer().input_frame(InputFrameId::new(raw)).unwrap();
        assert_eq!(input.input_list[1], EncodedDirection::new(1), "input frame {raw}");
        assert_eq!(input.confirmed_list, 0b01);
    }
    let tip = session.sync_layer().render_frame(RenderFrameId::new(40)).unwrap();
    // Render-frames 12..=39 moved the remote player one step up each.
    assert_eq!(tip.players[&REMOTE_PLAYER].virtual_grid_y, 100_000 + 28);
    Ok(())
}

#[test]
fn confirmations_wider_than_the_roster_match_the_prediction() -> Result<(), RollbackError> {
    let mut session = two_player_session(BattleConfig::default());
    session.advance_frames(40)?;

    // The server lists a third seat nobody occupies.
    let batch = InputFrameDownsyncBatch {
        frames: (0..8)
            .map(|raw| InputFrameDownsync {
                input_frame_id: InputFrameId::new(raw),
                input_list: [
                    EncodedDirection::NEUTRAL,
                    EncodedDirection::NEUTRAL,
                    EncodedDirection::new(5),
                ]
                .into_iter()
                .collect(),
            })
            .collect(),
    };
    let outcome = session.on_input_frame_downsync_batch(&batch)?;
    assert_eq!(outcome.applied, 8);
    assert_eq!(outcome.first_mismatch, None);
    assert_eq!(outcome.rewound_to, None);

    let stored = session.sync_layer().input_frame(InputFrameId::new(7)).unwrap();
    assert_eq!(stored.input_list.len(), 2);
    assert!(stored.is_all_confirmed(2));

    session.advance_frames(10)?;
    let cursors = session.cursors();
    assert_eq!(cursors.last_all_confirmed_input_frame_id, InputFrameId::new(7));
    assert_eq!(cursors.last_all_confirmed_render_frame_id, RenderFrameId::new(40));
    assert!(session.desync().is_none());
    assert!(!session
        .events()
        .any(|event| matches!(event, BattleEvent::MispredictionDetected { .. })));
    Ok(())
}
