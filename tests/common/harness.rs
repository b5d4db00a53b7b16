//! Battle fixtures for integration tests.
//!
//! The standard battle has two players far enough apart that they never touch:
//! the local player at seat 1 and a remote player at seat 2.

#![allow(dead_code)]

use rollback_chaser::{
    AuthoritativeRenderFrame, BattleConfig, BattleRequest, BattleSession, CollisionKey,
    CollisionSpace, EncodedDirection, InputFrame, InputFrameDownsync, InputFrameDownsyncBatch,
    InputFrameId, InputFrameUpsyncBatch, InputList, JoinIndex, LocalBinding, PlayerId,
    PlayerState, RenderFrame, RenderFrameId, Roster, SatCollisionSpace, SessionBuilder,
    SimulationStepper,
};
use smallvec::smallvec;

pub const LOCAL_PLAYER: PlayerId = PlayerId::new(7);
pub const LOCAL_JOIN: JoinIndex = JoinIndex::new(1);
pub const REMOTE_PLAYER: PlayerId = PlayerId::new(9);
pub const REMOTE_JOIN: JoinIndex = JoinIndex::new(2);

/// Countdown carried by every fixture frame.
pub const COUNTDOWN_NANOS: i64 = 180_000_000_000;

pub fn local_binding() -> LocalBinding {
    LocalBinding {
        player_id: LOCAL_PLAYER,
        join_index: LOCAL_JOIN,
    }
}

pub fn player(id: PlayerId, join_index: JoinIndex, x: i32, y: i32) -> PlayerState {
    PlayerState::new(id, join_index, x, y)
}

/// Both players of the standard battle, 100 world units apart.
pub fn standard_players() -> Vec<PlayerState> {
    vec![
        player(LOCAL_PLAYER, LOCAL_JOIN, 0, 0),
        player(REMOTE_PLAYER, REMOTE_JOIN, 0, 100_000),
    ]
}

pub fn start_frame(id: i32, players: Vec<PlayerState>) -> AuthoritativeRenderFrame {
    AuthoritativeRenderFrame {
        id: RenderFrameId::new(id),
        players,
        player_metas: Vec::new(),
        countdown_nanos: COUNTDOWN_NANOS,
    }
}

/// A started standard battle with the local player bound. Start-up events are drained.
pub fn two_player_session(config: BattleConfig) -> BattleSession {
    started(SessionBuilder::new().with_config(config))
}

/// Binds the local player, starts the standard battle on `builder`, and drains start-up events.
pub fn started(builder: SessionBuilder) -> BattleSession {
    let mut session = builder.with_local_player(local_binding()).start().unwrap();
    session
        .on_authoritative_render_frame(&start_frame(0, standard_players()))
        .unwrap();
    session.events().for_each(drop);
    session
}

/// Confirmations for consecutive input-frames starting at `first`, as `(seat 1, seat 2)` pairs.
pub fn confirm(first: i32, inputs: &[(u32, u32)]) -> InputFrameDownsyncBatch {
    InputFrameDownsyncBatch {
        frames: inputs
            .iter()
            .enumerate()
            .map(|(offset, &(local, remote))| InputFrameDownsync {
                input_frame_id: InputFrameId::new(first + offset as i32),
                input_list: smallvec![EncodedDirection::new(local), EncodedDirection::new(remote)],
            })
            .collect(),
    }
}

pub fn applied_frames(requests: &[BattleRequest]) -> Vec<&RenderFrame> {
    requests
        .iter()
        .filter_map(|request| match request {
            BattleRequest::ApplyRenderFrame { frame, .. } => Some(frame),
            _ => None,
        })
        .collect()
}

pub fn upsync_batches(requests: &[BattleRequest]) -> Vec<&InputFrameUpsyncBatch> {
    requests
        .iter()
        .filter_map(|request| match request {
            BattleRequest::SendUpsync { batch } => Some(batch),
            _ => None,
        })
        .collect()
}

/// Steps `start` up to render-frame `until` without a session, feeding every
/// render-frame the input-frame it consumes under `config`.
///
/// Element `k` of the result is render-frame `start.id + k`.
pub fn reference_frames<C, F>(
    config: &BattleConfig,
    start: &AuthoritativeRenderFrame,
    inputs: F,
    until: RenderFrameId,
) -> Vec<RenderFrame>
where
    C: CollisionSpace + Default,
    F: Fn(InputFrameId) -> InputList,
{
    let converter = config.converter();
    let stepper = SimulationStepper::new(config.world_to_virtual_grid_ratio);
    let mut space = C::default();
    for (ordinal, barrier) in config.barriers.iter().enumerate() {
        space.insert_polygon(CollisionKey::barrier(ordinal as u32), barrier.anchor, &barrier.points);
    }

    let mut roster = Roster::new();
    for state in &start.players {
        let radius = start
            .collider_radius_of(state.id)
            .unwrap_or(config.player_collider_radius);
        if let Some(info) = roster.insert_if_absent(state.id, state.join_index, radius) {
            stepper.insert_player_collider(&mut space, info, state.virtual_grid_x, state.virtual_grid_y);
        }
    }

    let mut frames = vec![start.to_render_frame()];
    for raw in start.id.as_i32()..until.as_i32() {
        let input_frame_id = converter.to_input_frame_id(RenderFrameId::new(raw));
        let input = InputFrame::confirmed(input_frame_id, inputs(input_frame_id));
        let current = frames.last().unwrap();
        let next = stepper.step(&roster, &mut space, current, Some(&input)).unwrap();
        frames.push(next);
    }
    frames
}

/// Remote seat holds still until `turn`, then walks right.
pub fn remote_turns_right_at(turn: i32) -> impl Fn(InputFrameId) -> InputList {
    move |input_frame_id| {
        let remote = if input_frame_id.as_i32() >= turn { 3 } else { 0 };
        smallvec![EncodedDirection::NEUTRAL, EncodedDirection::new(remote)]
    }
}

/// Every cached frame of the session equals the reference simulation's frame with the same id.
pub fn assert_history_matches(session: &BattleSession, turn: i32) {
    let (start, end) = session.sync_layer().render_window();
    let reference = reference_frames::<SatCollisionSpace, _>(
        session.config(),
        &start_frame(0, standard_players()),
        remote_turns_right_at(turn),
        end,
    );
    assert!(start < end);
    for raw in start.as_i32()..end.as_i32() {
        let cached = session.sync_layer().render_frame(RenderFrameId::new(raw)).unwrap();
        assert_eq!(cached, &reference[raw as usize], "render frame {raw}");
    }
}
