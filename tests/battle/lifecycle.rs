//! Battle lifecycle integration tests.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::harness::COUNTDOWN_NANOS;
use crate::common::{
    applied_frames, local_binding, player, standard_players, start_frame, two_player_session,
    upsync_batches, LOCAL_JOIN, LOCAL_PLAYER, REMOTE_JOIN, REMOTE_PLAYER,
};
use rollback_chaser::{
    BattleConfig, BattleEvent, BattleRequest, BattleState, DesyncReason, EncodedDirection,
    InputFrameDownsync, InputFrameDownsyncBatch, InputFrameId, JoinIndex, LocalBinding, PlayerId,
    PresentationHandle, RenderFrameId, RollbackError, SessionBuilder, SharedBattle,
    BATTLE_READY_TO_START,
};
use serial_test::serial;
use smallvec::smallvec;
use web_time::{Duration, Instant};

fn spawn_handles(requests: &[BattleRequest]) -> Vec<PresentationHandle> {
    requests
        .iter()
        .filter_map(|request| match request {
            BattleRequest::SpawnPlayer { handle, .. } => Some(*handle),
            _ => None,
        })
        .collect()
}

#[test]
fn start_spawns_players_and_presents_first_frame() -> Result<(), RollbackError> {
    let mut session = SessionBuilder::new()
        .with_local_player(local_binding())
        .start()?;
    let requests = session.on_authoritative_render_frame(&start_frame(0, standard_players()))?;

    assert_eq!(requests.len(), 3);
    assert!(matches!(
        requests[0],
        BattleRequest::SpawnPlayer {
            player_id: LOCAL_PLAYER,
            join_index: LOCAL_JOIN,
            position: (0, 0),
            ..
        }
    ));
    assert!(matches!(
        requests[1],
        BattleRequest::SpawnPlayer {
            player_id: REMOTE_PLAYER,
            join_index: REMOTE_JOIN,
            position: (0, 100_000),
            ..
        }
    ));
    match &requests[2] {
        BattleRequest::ApplyRenderFrame {
            frame,
            countdown_nanos,
        } => {
            assert_eq!(frame.id, RenderFrameId::new(0));
            assert_eq!(frame.players.len(), 2);
            assert_eq!(*countdown_nanos, COUNTDOWN_NANOS);
        },
        other => panic!("expected the start frame to be applied, got {other:?}"),
    }

    assert_eq!(session.state(), BattleState::InBattle);
    let cursors = session.cursors();
    assert_eq!(cursors.render_frame_id, RenderFrameId::new(0));
    assert_eq!(cursors.chaser_render_frame_id, RenderFrameId::new(0));
    assert_eq!(cursors.last_all_confirmed_render_frame_id, RenderFrameId::new(0));
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![BattleEvent::BattleStarted { generation: 0 }]
    );
    Ok(())
}

#[test]
fn ready_to_start_seats_players_once() -> Result<(), RollbackError> {
    let mut session = SessionBuilder::new()
        .with_local_player(local_binding())
        .start()?;

    let ready = session.on_authoritative_render_frame(&start_frame(
        BATTLE_READY_TO_START,
        standard_players(),
    ))?;
    assert_eq!(spawn_handles(&ready).len(), 2);
    assert_eq!(session.state(), BattleState::Waiting);
    assert_eq!(session.roster().num_seats(), 2);

    let start = session.on_authoritative_render_frame(&start_frame(0, standard_players()))?;
    assert!(spawn_handles(&start).is_empty());
    assert_eq!(applied_frames(&start).len(), 1);
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![
            BattleEvent::ReadyToStart { players: 2 },
            BattleEvent::BattleStarted { generation: 0 },
        ]
    );
    Ok(())
}

#[test]
fn seatless_join_index_is_left_out_of_the_battle() -> Result<(), RollbackError> {
    let mut session = SessionBuilder::new()
        .with_local_player(local_binding())
        .start()?;
    let mut players = standard_players();
    players.push(player(PlayerId::new(65), JoinIndex::new(65), 0, -100_000));

    let requests = session.on_authoritative_render_frame(&start_frame(0, players))?;
    assert_eq!(spawn_handles(&requests).len(), 2);
    assert_eq!(session.roster().num_seats(), 2);

    session.advance_frames(12)?;
    assert_eq!(session.cursors().render_frame_id, RenderFrameId::new(12));
    assert!(session.desync().is_none());

    assert!(matches!(
        session.set_local_player(LocalBinding {
            player_id: PlayerId::new(65),
            join_index: JoinIndex::new(65),
        }),
        Err(RollbackError::InvalidRequest { .. })
    ));
    Ok(())
}

#[test]
fn tick_respects_the_interval() -> Result<(), RollbackError> {
    let mut session = two_player_session(BattleConfig::default());
    let t0 = Instant::now();

    assert!(!session.tick(t0)?.is_empty());
    assert_eq!(session.cursors().render_frame_id, RenderFrameId::new(1));

    assert!(session.tick(t0 + Duration::from_millis(1))?.is_empty());
    assert_eq!(session.cursors().render_frame_id, RenderFrameId::new(1));

    session.tick(t0 + Duration::from_millis(17))?;
    assert_eq!(session.cursors().render_frame_id, RenderFrameId::new(2));
    Ok(())
}

#[test]
fn countdown_reaching_zero_settles_the_battle() -> Result<(), RollbackError> {
    let config = BattleConfig {
        battle_duration: Duration::from_nanos(16_666_666 * 10),
        ..BattleConfig::offline()
    };
    let mut session = SessionBuilder::new()
        .with_config(config)
        .with_local_player(local_binding())
        .start()?;
    session.on_authoritative_render_frame(&start_frame(0, vec![player(LOCAL_PLAYER, LOCAL_JOIN, 0, 0)]))?;
    session.events().for_each(drop);

    let requests = session.advance_frames(20)?;
    let countdowns: Vec<i64> = requests
        .iter()
        .filter_map(|request| match request {
            BattleRequest::ApplyRenderFrame { countdown_nanos, .. } => Some(*countdown_nanos),
            _ => None,
        })
        .collect();
    assert_eq!(countdowns.len(), 11);
    assert_eq!(countdowns[0], 166_666_660);
    assert_eq!(countdowns[10], 0);

    assert_eq!(session.state(), BattleState::InSettlement);
    assert_eq!(session.cursors().render_frame_id, RenderFrameId::new(11));
    assert_eq!(session.countdown_nanos(), 0);
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![BattleEvent::Settled {
            frame: RenderFrameId::new(11)
        }]
    );

    // Ticks stop, confirmations are still folded in.
    assert!(session.tick(Instant::now())?.is_empty());
    let outcome = session.on_input_frame_downsync_batch(&InputFrameDownsyncBatch {
        frames: vec![InputFrameDownsync {
            input_frame_id: InputFrameId::new(11),
            input_list: smallvec![EncodedDirection::NEUTRAL],
        }],
    })?;
    assert_eq!(outcome.applied, 1);
    Ok(())
}

#[test]
fn reset_despawns_everyone_and_starts_a_new_generation() -> Result<(), RollbackError> {
    let mut session = SessionBuilder::new()
        .with_local_player(local_binding())
        .start()?;
    let first = spawn_handles(&session.on_authoritative_render_frame(&start_frame(0, standard_players()))?);
    session.advance_frames(10)?;
    session.events().for_each(drop);

    let requests = session.reset();
    assert_eq!(
        requests,
        first
            .iter()
            .map(|&handle| BattleRequest::DespawnPlayer { handle })
            .collect::<Vec<_>>()
    );
    assert_eq!(session.state(), BattleState::Waiting);
    assert_eq!(session.generation(), 1);
    assert!(session.roster().is_empty());
    assert!(session.cursors().render_frame_id.is_null());
    assert!(session.sync_layer().render_frame(RenderFrameId::new(0)).is_none());
    assert_eq!(session.local_binding(), Some(local_binding()));
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![BattleEvent::Reset { generation: 1 }]
    );
    assert!(session.tick(Instant::now())?.is_empty());

    let second = spawn_handles(&session.on_authoritative_render_frame(&start_frame(0, standard_players()))?);
    assert_eq!(second.len(), 2);
    assert!(second.iter().all(|handle| !first.contains(handle)));
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![BattleEvent::BattleStarted { generation: 1 }]
    );
    assert_eq!(session.battle_stats().next_msg_id, 0);
    Ok(())
}

#[test]
fn dismissed_battle_refuses_input() -> Result<(), RollbackError> {
    let mut session = two_player_session(BattleConfig::default());
    session.dismiss();
    session.dismiss();

    assert_eq!(session.state(), BattleState::InDismissal);
    assert_eq!(session.events().collect::<Vec<_>>(), vec![BattleEvent::Dismissed]);
    assert!(session.advance_frame()?.is_empty());
    assert!(matches!(
        session.on_authoritative_render_frame(&start_frame(3, standard_players())),
        Err(RollbackError::InvalidState {
            state: BattleState::InDismissal,
            ..
        })
    ));
    let outcome = session.on_input_frame_downsync_batch(&crate::common::confirm(0, &[(0, 0)]))?;
    assert_eq!(outcome.applied, 0);
    Ok(())
}

#[test]
fn upsync_follows_change_and_tolerance() -> Result<(), RollbackError> {
    let mut session = two_player_session(BattleConfig::default());

    let requests = session.advance_frames(12)?;
    let batches = upsync_batches(&requests);
    assert_eq!(batches.len(), 2);

    assert_eq!(batches[0].msg_id, 0);
    assert_eq!(batches[0].player_id, LOCAL_PLAYER);
    assert_eq!(batches[0].join_index, LOCAL_JOIN);
    assert_eq!(batches[0].acking_render_frame_id, RenderFrameId::new(0));
    assert!(batches[0].acking_input_frame_id.is_null());
    let ids: Vec<i32> = batches[0].frames.iter().map(|f| f.input_frame_id.as_i32()).collect();
    assert_eq!(ids, vec![0]);

    assert_eq!(batches[1].msg_id, 1);
    let ids: Vec<i32> = batches[1].frames.iter().map(|f| f.input_frame_id.as_i32()).collect();
    assert_eq!(ids, vec![1, 2]);

    // A changed direction goes out at the very next boundary.
    session.set_local_direction(EncodedDirection::new(3));
    let requests = session.advance_frame()?;
    let batches = upsync_batches(&requests);
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].msg_id, 2);
    assert_eq!(batches[0].frames.len(), 1);
    assert_eq!(batches[0].frames[0].input_frame_id, InputFrameId::new(3));
    assert_eq!(batches[0].frames[0].encoded_direction, EncodedDirection::new(3));
    assert_eq!(session.cursors().last_upsync_input_frame_id, InputFrameId::new(3));
    Ok(())
}

#[test]
fn spectator_desyncs_after_underrun_grace() -> Result<(), RollbackError> {
    let config = BattleConfig {
        underrun_grace_ticks: 3,
        ..BattleConfig::default()
    };
    let mut session = SessionBuilder::new().with_config(config).start()?;
    session.on_authoritative_render_frame(&start_frame(0, standard_players()))?;
    session.events().for_each(drop);

    assert!(session.advance_frame()?.is_empty());
    assert!(session.advance_frame()?.is_empty());
    assert!(session.desync().is_none());
    assert_eq!(session.battle_stats().consecutive_underruns, 2);

    // The tick that exhausts the grace still succeeds; the next ones fail.
    assert!(session.advance_frame()?.is_empty());
    let reason = DesyncReason::UnderrunGraceExceeded {
        consecutive_underruns: 3,
    };
    assert_eq!(session.desync(), Some(&reason));
    assert_eq!(
        session.advance_frame(),
        Err(RollbackError::DesyncDetected {
            reason: reason.clone()
        })
    );
    assert_eq!(
        session.tick(Instant::now()),
        Err(RollbackError::DesyncDetected {
            reason: reason.clone()
        })
    );
    assert_eq!(session.cursors().render_frame_id, RenderFrameId::new(0));
    assert_eq!(
        session.events().collect::<Vec<_>>(),
        vec![BattleEvent::DesyncDetected { reason }]
    );
    Ok(())
}

#[test]
fn spectator_follows_confirmed_input() -> Result<(), RollbackError> {
    let config = BattleConfig {
        underrun_grace_ticks: 3,
        ..BattleConfig::default()
    };
    let mut session = SessionBuilder::new().with_config(config).start()?;
    session.on_authoritative_render_frame(&start_frame(0, standard_players()))?;

    session.advance_frames(2)?;
    let outcome =
        session.on_input_frame_downsync_batch(&crate::common::confirm(0, &[(0, 0), (3, 0), (0, 1)]))?;
    assert_eq!(outcome.applied, 3);
    assert_eq!(outcome.first_mismatch, None);

    // Input-frames 0..=2 cover render-frames 0..=19.
    let requests = session.advance_frames(20)?;
    assert!(upsync_batches(&requests).is_empty());
    assert_eq!(applied_frames(&requests).len(), 20);
    let cursors = session.cursors();
    assert_eq!(cursors.render_frame_id, RenderFrameId::new(20));
    assert_eq!(cursors.chaser_render_frame_id, RenderFrameId::new(20));
    assert_eq!(cursors.last_all_confirmed_render_frame_id, RenderFrameId::new(20));

    let frame = session.sync_layer().render_frame(RenderFrameId::new(20)).unwrap();
    assert_eq!(frame.players[&LOCAL_PLAYER].virtual_grid_x, 4 * 2);
    assert_eq!(frame.players[&REMOTE_PLAYER].virtual_grid_y, 100_000 + 4);

    // A successful roll-forward restarts the grace.
    session.advance_frames(2)?;
    assert!(session.desync().is_none());
    assert_eq!(session.battle_stats().consecutive_underruns, 2);
    Ok(())
}

#[test]
fn stale_generation_never_reaches_the_new_battle() -> Result<(), RollbackError> {
    let shared = SharedBattle::new(two_player_session(BattleConfig::default()));
    let observed = shared.generation();
    shared.tick(Instant::now())?;

    let remote = shared.clone();
    let despawns = std::thread::spawn(move || remote.reset()).join().unwrap();
    assert_eq!(despawns.len(), 2);

    assert_eq!(
        shared.on_authoritative_render_frame(observed, &start_frame(0, standard_players())),
        Err(RollbackError::StaleGeneration {
            expected: observed,
            actual: observed + 1
        })
    );
    assert_eq!(
        shared.on_input_frame_downsync_batch(observed, &crate::common::confirm(0, &[(0, 0)])),
        Err(RollbackError::StaleGeneration {
            expected: observed,
            actual: observed + 1
        })
    );
    assert_eq!(shared.with(|session| session.state()), BattleState::Waiting);

    shared.on_authoritative_render_frame(shared.generation(), &start_frame(0, standard_players()))?;
    assert_eq!(shared.with(|session| session.state()), BattleState::InBattle);
    Ok(())
}

#[test]
#[serial]
fn battle_runs_under_a_tracing_subscriber() -> Result<(), RollbackError> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .finish();

    tracing::subscriber::with_default(subscriber, || -> Result<(), RollbackError> {
        let mut session = two_player_session(BattleConfig::default());
        session.advance_frames(40)?;
        session.on_input_frame_downsync_batch(&crate::common::confirm(0, &[(0, 0), (0, 4)]))?;
        session.advance_frames(4)?;
        session.log_battle_stats();
        assert_eq!(session.cursors().render_frame_id, RenderFrameId::new(44));
        Ok(())
    })
}
