//! Collision integration tests: pushback against walls and other players.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::{
    applied_frames, local_binding, player, reference_frames, start_frame, ReversedPotentials,
    LOCAL_JOIN, LOCAL_PLAYER, REMOTE_JOIN, REMOTE_PLAYER,
};
use rollback_chaser::{
    BarrierPolygon, BattleConfig, BattleSession, CollisionSpace, EncodedDirection, InputFrameId,
    InputList, PlayerId, PlayerState, RenderFrame, RenderFrameId, RollbackError, SatCollisionSpace,
    SessionBuilder, Vec2,
};
use smallvec::smallvec;

/// Offline battle with a tall wall whose left edge is half a world unit
/// inside both players' colliders.
fn walled() -> BattleConfig {
    BattleConfig {
        barriers: vec![BarrierPolygon {
            anchor: Vec2::new(11.5, -100.0),
            points: vec![
                Vec2::new(0.0, 0.0),
                Vec2::new(100.0, 0.0),
                Vec2::new(100.0, 200.0),
                Vec2::new(0.0, 200.0),
            ],
        }],
        ..BattleConfig::offline()
    }
}

/// Two players whose colliders overlap by four world units vertically.
fn crowded() -> Vec<PlayerState> {
    vec![
        player(LOCAL_PLAYER, LOCAL_JOIN, 0, 0),
        player(REMOTE_PLAYER, REMOTE_JOIN, 0, 20_000),
    ]
}

fn constant(local: u32, remote: u32) -> impl Fn(InputFrameId) -> InputList {
    move |_| smallvec![EncodedDirection::new(local), EncodedDirection::new(remote)]
}

fn position(frame: &RenderFrame, id: PlayerId) -> (i32, i32) {
    let state = &frame.players[&id];
    (state.virtual_grid_x, state.virtual_grid_y)
}

fn crowded_session<C: CollisionSpace + Default>() -> BattleSession<C> {
    let mut session = SessionBuilder::new()
        .with_config(walled())
        .with_local_player(local_binding())
        .start_with_collision_space::<C>()
        .unwrap();
    session
        .on_authoritative_render_frame(&start_frame(0, crowded()))
        .unwrap();
    session.events().for_each(drop);
    session.set_local_direction(EncodedDirection::new(3));
    session
}

#[test]
fn pushback_sums_wall_and_player_overlaps() {
    let frames = reference_frames::<SatCollisionSpace, _>(
        &walled(),
        &start_frame(0, crowded()),
        constant(3, 0),
        RenderFrameId::new(1),
    );
    let next = &frames[1];

    // The local player walked two units into the wall; both are pushed left
    // by the wall and apart by each other, from their tentative positions.
    assert_eq!(position(next, LOCAL_PLAYER), (-500, -4_000));
    assert_eq!(position(next, REMOTE_PLAYER), (-500, 24_000));
    assert_eq!(next.players[&LOCAL_PLAYER].dir, EncodedDirection::new(3).decode());
}

#[test]
fn removed_player_still_blocks() {
    let mut players = crowded();
    players[1].removed = true;
    let frames = reference_frames::<SatCollisionSpace, _>(
        &walled(),
        &start_frame(0, players),
        constant(3, 3),
        RenderFrameId::new(1),
    );

    assert_eq!(position(&frames[1], REMOTE_PLAYER), (0, 20_000));
    assert_eq!(position(&frames[1], LOCAL_PLAYER), (-500, -4_000));
}

#[test]
fn potential_order_does_not_change_the_simulation() -> Result<(), RollbackError> {
    let mut sorted = crowded_session::<SatCollisionSpace>();
    let mut reversed = crowded_session::<ReversedPotentials>();

    let sorted_requests = sorted.advance_frames(30)?;
    let reversed_requests = reversed.advance_frames(30)?;
    let sorted_frames = applied_frames(&sorted_requests);
    let reversed_frames = applied_frames(&reversed_requests);

    assert_eq!(sorted_frames.len(), 30);
    assert_eq!(sorted_frames, reversed_frames);
    assert_eq!(
        sorted_frames.last().unwrap().checksum().unwrap(),
        reversed_frames.last().unwrap().checksum().unwrap()
    );
    Ok(())
}

#[test]
fn walking_into_a_wall_stops_at_its_edge() -> Result<(), RollbackError> {
    let mut session = SessionBuilder::new()
        .with_config(walled())
        .with_local_player(local_binding())
        .start()?;
    // Thirty steps of two grid units short of the wall.
    session.on_authoritative_render_frame(&start_frame(
        0,
        vec![player(LOCAL_PLAYER, LOCAL_JOIN, -560, 0)],
    ))?;
    session.set_local_direction(EncodedDirection::new(3));

    let requests = session.advance_frames(60)?;
    let xs: Vec<i32> = applied_frames(&requests)
        .iter()
        .map(|frame| frame.players[&LOCAL_PLAYER].virtual_grid_x)
        .collect();
    assert_eq!(xs.len(), 60);
    assert_eq!(xs[28], -502);
    assert!(xs[29..].iter().all(|&x| x == -500), "{xs:?}");
    Ok(())
}
