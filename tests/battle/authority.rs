//! Authoritative frame integration tests: resyncs, checksums and cache limits.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;

use crate::common::{
    applied_frames, confirm, local_binding, player, standard_players, start_frame,
    two_player_session, upsync_batches, LOCAL_JOIN, LOCAL_PLAYER, REMOTE_PLAYER,
};
use rollback_chaser::telemetry::{CollectingObserver, ViolationKind};
use rollback_chaser::{
    AuthoritativeRenderFrame, BattleConfig, BattleEvent, BattleRequest, BattleState, CacheKind,
    DesyncReason, InputFrameId, RenderFrameId, RollbackError, SessionBuilder,
};

#[test]
fn frame_beyond_the_cache_window_resyncs() -> Result<(), RollbackError> {
    let mut session = two_player_session(BattleConfig::default());
    session.advance_frames(20)?;

    let mut players = standard_players();
    players[1].virtual_grid_x = 5_000;
    let frame = AuthoritativeRenderFrame {
        countdown_nanos: 1_000_000_000,
        ..start_frame(500, players)
    };
    let requests = session.on_authoritative_render_frame(&frame)?;

    assert_eq!(requests.len(), 1);
    match &requests[0] {
        BattleRequest::ApplyRenderFrame {
            frame,
            countdown_nanos,
        } => {
            assert_eq!(frame.id, RenderFrameId::new(500));
            assert_eq!(*countdown_nanos, 1_000_000_000);
        },
        other => panic!("expected the resync frame to be applied, got {other:?}"),
    }
    let cursors = session.cursors();
    assert_eq!(cursors.render_frame_id, RenderFrameId::new(500));
    assert_eq!(cursors.chaser_render_frame_id, RenderFrameId::new(500));
    assert_eq!(cursors.last_all_confirmed_render_frame_id, RenderFrameId::new(500));
    assert_eq!(session.countdown_nanos(), 1_000_000_000);
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![BattleEvent::Resynced {
            frame: RenderFrameId::new(500)
        }]
    );

    // Render-frames 500..=507 consume input-frames 123 and 124, which only the server has.
    let outcome = session.on_input_frame_downsync_batch(&confirm(123, &[(0, 0), (0, 0)]))?;
    assert_eq!(outcome.applied, 2);

    let requests = session.advance_frames(8)?;
    assert_eq!(applied_frames(&requests).len(), 8);
    let batches = upsync_batches(&requests);
    assert_eq!(batches[0].frames[0].input_frame_id, InputFrameId::new(123));

    let cursors = session.cursors();
    assert_eq!(cursors.render_frame_id, RenderFrameId::new(508));
    assert_eq!(cursors.last_all_confirmed_render_frame_id, RenderFrameId::new(508));
    let tip = session.sync_layer().render_frame(RenderFrameId::new(508)).unwrap();
    assert_eq!(tip.players[&REMOTE_PLAYER].virtual_grid_x, 5_000);
    Ok(())
}

#[test]
fn tick_before_downsync_after_resync_keeps_advancing() -> Result<(), RollbackError> {
    let mut session = two_player_session(BattleConfig::default());
    session.advance_frames(20)?;
    session.on_authoritative_render_frame(&start_frame(500, standard_players()))?;
    session.events().for_each(drop);

    // The tip moves on a prediction before the server has confirmed anything past the resync.
    let requests = session.advance_frame()?;
    assert_eq!(applied_frames(&requests).len(), 1);
    let batches = upsync_batches(&requests);
    assert_eq!(batches[0].frames[0].input_frame_id, InputFrameId::new(123));
    assert_eq!(session.cursors().render_frame_id, RenderFrameId::new(501));

    let outcome = session.on_input_frame_downsync_batch(&confirm(123, &[(0, 0), (0, 0), (0, 0)]))?;
    assert_eq!(outcome.applied, 3);
    assert_eq!(outcome.stale, 0);
    assert_eq!(outcome.first_mismatch, None);

    session.advance_frames(20)?;
    let cursors = session.cursors();
    assert_eq!(cursors.render_frame_id, RenderFrameId::new(521));
    assert_eq!(cursors.last_all_confirmed_input_frame_id, InputFrameId::new(125));
    assert_eq!(cursors.last_all_confirmed_render_frame_id, RenderFrameId::new(512));
    assert_eq!(session.state(), BattleState::InBattle);
    assert!(session.desync().is_none());
    assert!(!session
        .events()
        .any(|event| matches!(event, BattleEvent::DesyncDetected { .. })));
    Ok(())
}

#[test]
fn watermark_checksum_mismatch_is_reported_and_adopted() -> Result<(), RollbackError> {
    let observer = Arc::new(CollectingObserver::new());
    let mut session = SessionBuilder::new()
        .with_config(BattleConfig::offline())
        .with_local_player(local_binding())
        .with_violation_observer(observer.clone())
        .start()?;
    session.on_authoritative_render_frame(&start_frame(0, vec![player(LOCAL_PLAYER, LOCAL_JOIN, 0, 0)]))?;
    session.advance_frames(5)?;
    session.events().for_each(drop);
    assert_eq!(
        session.cursors().last_all_confirmed_render_frame_id,
        RenderFrameId::new(5)
    );

    let local = session.sync_layer().render_frame(RenderFrameId::new(5)).unwrap().clone();
    let same = start_frame(5, local.players.values().cloned().collect());
    assert!(session.on_authoritative_render_frame(&same)?.is_empty());
    assert_eq!(session.events().count(), 0);
    assert!(observer.is_empty());

    let mut players: Vec<_> = local.players.values().cloned().collect();
    players[0].virtual_grid_x = 999;
    let diverged = start_frame(5, players);
    assert!(session.on_authoritative_render_frame(&diverged)?.is_empty());

    let remote_checksum = diverged.to_render_frame().checksum().unwrap();
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![BattleEvent::ChecksumMismatch {
            frame: RenderFrameId::new(5),
            local_checksum: local.checksum().unwrap(),
            remote_checksum,
        }]
    );
    assert!(observer.has_violation(ViolationKind::ChecksumMismatch));
    let violation = &observer.violations()[0];
    assert_eq!(violation.frame, Some(5));
    assert_eq!(
        violation.context.get("remote_checksum"),
        Some(&format!("{remote_checksum:#x}"))
    );
    assert!(session.desync().is_none());
    assert_eq!(session.cursors().chaser_render_frame_id, RenderFrameId::new(5));

    // The authoritative copy is what the next step builds on.
    let requests = session.advance_frame()?;
    let next = applied_frames(&requests)[0];
    assert_eq!(next.id, RenderFrameId::new(6));
    assert_eq!(next.players[&LOCAL_PLAYER].virtual_grid_x, 999);
    Ok(())
}

#[test]
fn frame_below_the_watermark_is_stale() -> Result<(), RollbackError> {
    let mut session = SessionBuilder::new()
        .with_config(BattleConfig::offline())
        .with_local_player(local_binding())
        .start()?;
    session.on_authoritative_render_frame(&start_frame(0, vec![player(LOCAL_PLAYER, LOCAL_JOIN, 0, 0)]))?;
    session.advance_frames(5)?;

    assert_eq!(
        session.on_authoritative_render_frame(&start_frame(3, Vec::new())),
        Err(RollbackError::StaleRenderFrame {
            frame: RenderFrameId::new(3),
            watermark: RenderFrameId::new(5),
        })
    );
    assert_eq!(session.state(), BattleState::InBattle);
    Ok(())
}

#[test]
fn desynced_battle_restarts_from_any_authoritative_frame() -> Result<(), RollbackError> {
    let config = BattleConfig {
        underrun_grace_ticks: 1,
        ..BattleConfig::default()
    };
    let mut session = SessionBuilder::new().with_config(config).start()?;
    session.on_authoritative_render_frame(&start_frame(0, standard_players()))?;
    session.advance_frame()?;
    assert!(session.desync().is_some());
    session.events().for_each(drop);

    // Frame 1 would be a plain append; while desynced it restarts the battle.
    let requests = session.on_authoritative_render_frame(&start_frame(1, standard_players()))?;
    assert_eq!(applied_frames(&requests).len(), 1);
    assert!(session.desync().is_none());
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![BattleEvent::Resynced {
            frame: RenderFrameId::new(1)
        }]
    );

    session.on_input_frame_downsync_batch(&confirm(0, &[(0, 0), (0, 0)]))?;
    session.advance_frames(15)?;
    assert_eq!(session.cursors().render_frame_id, RenderFrameId::new(16));
    assert!(session.desync().is_none());
    Ok(())
}

#[test]
fn unconfirmed_history_overflowing_the_render_cache_is_an_overrun() -> Result<(), RollbackError> {
    let config = BattleConfig {
        render_cache_capacity: 16,
        ..BattleConfig::default()
    };
    let mut session = two_player_session(config);

    // The watermark never leaves frame 0, so the seventeenth frame pushes it out.
    session.advance_frames(16)?;
    let reason = DesyncReason::HistoryOverrun {
        cache: CacheKind::Render,
        floor: 0,
        start: 1,
    };
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
