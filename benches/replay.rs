//! Benchmarks for simulation and replay
//!
//! Run with: cargo bench --bench replay
//!
//! These measure the work done every tick (one roll-forward step) and the
//! worst case after a misprediction (a full catch-up budget of replayed steps).

// Allow benchmark-specific patterns
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rollback_chaser::{
    AuthoritativeRenderFrame, BattleConfig, BattleSession, EncodedDirection, InputFrame,
    InputFrameDownsync, InputFrameDownsyncBatch, InputFrameId, JoinIndex, LocalBinding, PlayerId,
    PlayerState, RenderFrameId, Roster, SatCollisionSpace, SessionBuilder, SimulationStepper,
};
use std::hint::black_box;

/// `count` players on a row, close enough that neighbours overlap.
fn row_of_players(count: i32) -> Vec<PlayerState> {
    (1..=count)
        .map(|seat| PlayerState::new(PlayerId::new(seat), JoinIndex::new(seat), seat * 20_000, 0))
        .collect()
}

fn start_frame(players: Vec<PlayerState>) -> AuthoritativeRenderFrame {
    AuthoritativeRenderFrame {
        id: RenderFrameId::new(0),
        players,
        player_metas: Vec::new(),
        countdown_nanos: 180_000_000_000,
    }
}

fn session(config: BattleConfig, players: i32) -> BattleSession {
    let mut session = SessionBuilder::new()
        .with_config(config)
        .with_local_player(LocalBinding {
            player_id: PlayerId::new(1),
            join_index: JoinIndex::new(1),
        })
        .start()
        .expect("Failed to create session");
    session
        .on_authoritative_render_frame(&start_frame(row_of_players(players)))
        .unwrap();
    session.set_local_direction(EncodedDirection::new(3));
    session
}

/// Benchmark a single simulation step without any session bookkeeping.
fn bench_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("SimulationStepper");

    for players in [2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("step", players), &players, |b, &players| {
            let stepper = SimulationStepper::default();
            let mut space = SatCollisionSpace::default();
            let mut roster = Roster::new();
            let start = start_frame(row_of_players(players));
            for state in &start.players {
                if let Some(info) = roster.insert_if_absent(state.id, state.join_index, 12.0) {
                    stepper.insert_player_collider(&mut space, info, state.virtual_grid_x, state.virtual_grid_y);
                }
            }
            let frame = start.to_render_frame();
            let input = InputFrame::confirmed(
                InputFrameId::new(0),
                (0..players).map(|seat| EncodedDirection::new(seat as u32 % 13)).collect(),
            );

            b.iter(|| {
                let next = stepper
                    .step(&roster, &mut space, black_box(&frame), Some(&input))
                    .unwrap();
                black_box(next)
            });
        });
    }

    group.finish();
}

/// Benchmark ticking an offline battle, where every frame is confirmed as it is simulated.
fn bench_offline_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("BattleSession");

    group.bench_function("advance_frame_offline", |b| {
        let mut battle = session(BattleConfig::offline(), 1);
        b.iter(|| black_box(battle.advance_frame().unwrap()));
    });

    group.finish();
}

/// A two-player battle 48 frames in, just told that the remote player was
/// walking left from the very first input-frame.
fn mispredicted(config: BattleConfig) -> BattleSession {
    let mut battle = session(config, 2);
    battle.advance_frames(48).unwrap();
    let frames = (0..=3)
        .map(|raw| InputFrameDownsync {
            input_frame_id: InputFrameId::new(raw),
            input_list: [EncodedDirection::new(3), EncodedDirection::new(4)].into_iter().collect(),
        })
        .collect();
    battle
        .on_input_frame_downsync_batch(&InputFrameDownsyncBatch { frames })
        .unwrap();
    battle
}

/// Benchmark the first tick after a misprediction that rewinds to render-frame 0.
fn bench_catch_up(c: &mut Criterion) {
    let mut group = c.benchmark_group("BattleSession");

    for budget in [4u32, 8, 16] {
        group.bench_with_input(
            BenchmarkId::new("catch_up_tick", budget),
            &budget,
            |b, &budget| {
                let config = BattleConfig {
                    max_chasing_render_frames_per_update: budget,
                    ..BattleConfig::default()
                };
                b.iter_batched(
                    || mispredicted(config.clone()),
                    |mut battle| black_box(battle.advance_frame().unwrap()),
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_step, bench_offline_tick, bench_catch_up);
criterion_main!(benches);
