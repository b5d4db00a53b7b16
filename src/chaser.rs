//! Bounded replay from a safe point toward the tip.
//!
//! Each tick runs two passes over [`RollbackChaser::replay`]:
//!
//! * [`ReplayPass::Chasing`] replays at most `max_chasing_render_frames_per_update`
//!   frames from the chase cursor toward the tip, regenerating history with the
//!   best inputs known so far.
//! * [`ReplayPass::RollForward`] steps the tip by one frame. It always runs,
//!   so visible gameplay never waits for a backlog.
//!
//! Whenever a replayed frame consumed a fully confirmed input-frame, the
//! render watermark advances behind it.

use std::sync::Arc;

use tracing::{error, trace, warn};

use crate::collision::CollisionSpace;
use crate::error::{CacheKind, RollbackError};
use crate::frame_info::RenderFrame;
use crate::prediction::InputPredictor;
use crate::report_violation_to;
use crate::ring_buffer::SetOutcome;
use crate::roster::Roster;
use crate::stepper::SimulationStepper;
use crate::sync_layer::{FrameCursors, SyncLayer};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::RenderFrameId;

/// Which of the two per-tick passes a replay is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplayPass {
    /// Catch-up from the chase cursor. The cursor follows the replay.
    Chasing,
    /// The single mandatory step from the tip.
    RollForward,
}

/// Everything a replay reads and writes, borrowed for the duration of one call.
pub struct ReplayContext<'a, C: CollisionSpace> {
    /// Caches and cursors.
    pub layer: &'a mut SyncLayer,
    /// Seated players, in join-index order.
    pub roster: &'a Roster,
    /// The collision engine.
    pub space: &'a mut C,
    /// Fills remote seats of delayed input.
    pub predictor: InputPredictor,
    /// Advances frames.
    pub stepper: SimulationStepper,
    /// The generation the caller observed. The replay stops if the layer moves on.
    pub generation: u64,
}

/// Result of one [`RollbackChaser::replay`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayOutcome {
    /// The newest frame reached: the start frame if nothing was stepped.
    pub latest: Option<RenderFrame>,
    /// Number of frames stepped.
    pub stepped: usize,
    /// Why the replay stopped before `to`, if it did.
    pub interrupted: Option<RollbackError>,
}

impl ReplayOutcome {
    /// Returns `true` if the replay stopped early because a frame was not cached.
    #[must_use]
    pub fn is_underrun(&self) -> bool {
        matches!(self.interrupted, Some(RollbackError::CacheUnderrun { .. }))
    }
}

/// Drives replays with a per-tick catch-up budget.
pub struct RollbackChaser {
    max_chasing_render_frames_per_update: i32,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for RollbackChaser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            max_chasing_render_frames_per_update,
            violation_observer,
        } = self;

        f.debug_struct("RollbackChaser")
            .field(
                "max_chasing_render_frames_per_update",
                max_chasing_render_frames_per_update,
            )
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl RollbackChaser {
    /// Creates a chaser that catches up at most `max_chasing_render_frames_per_update` frames per tick.
    #[must_use]
    pub fn new(
        max_chasing_render_frames_per_update: u32,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        Self {
            max_chasing_render_frames_per_update: max_chasing_render_frames_per_update as i32,
            violation_observer,
        }
    }

    /// The per-tick catch-up budget.
    #[must_use]
    pub fn max_chasing_render_frames_per_update(&self) -> i32 {
        self.max_chasing_render_frames_per_update
    }

    /// Where this tick's catch-up pass stops: the budget past the chase cursor, capped at the tip.
    #[must_use]
    pub fn chase_target(&self, cursors: FrameCursors) -> RenderFrameId {
        (cursors.chaser_render_frame_id + self.max_chasing_render_frames_per_update)
            .min(cursors.render_frame_id)
    }

    /// Replays render-frames `from` up to, not including, `to`, storing each result at `i + 1`.
    ///
    /// A missing render-frame or input-frame stops the replay and is reported
    /// as [`RollbackError::CacheUnderrun`] in the outcome. That is not fatal:
    /// a fresh authoritative frame may have moved the cache window, and the
    /// next tick retries. A result that cannot be stored consecutively stops
    /// the replay with [`RollbackError::NonConsecutiveInsert`].
    pub fn replay<C: CollisionSpace>(
        &self,
        ctx: &mut ReplayContext<'_, C>,
        from: RenderFrameId,
        to: RenderFrameId,
        pass: ReplayPass,
    ) -> ReplayOutcome {
        let mut outcome = ReplayOutcome::default();
        let Some(start) = ctx.layer.render_frame(from).cloned() else {
            warn!(from = %from, to = %to, ?pass, cursors = ?ctx.layer.cursors(), "Replay start frame is not cached");
            outcome.interrupted = Some(RollbackError::CacheUnderrun {
                cache: CacheKind::Render,
                frame: from.as_i32(),
            });
            return outcome;
        };
        outcome.latest = Some(start);

        let converter = ctx.layer.converter();
        for raw in from.as_i32()..to.as_i32() {
            let i = RenderFrameId::new(raw);
            if ctx.layer.generation() != ctx.generation {
                outcome.interrupted = Some(RollbackError::StaleGeneration {
                    expected: ctx.generation,
                    actual: ctx.layer.generation(),
                });
                break;
            }

            let Some(current) = ctx.layer.render_frame(i).cloned() else {
                warn!(frame = %i, ?pass, "Render frame vanished mid-replay");
                outcome.interrupted = Some(RollbackError::CacheUnderrun {
                    cache: CacheKind::Render,
                    frame: i.as_i32(),
                });
                break;
            };
            let input_frame_id = converter.to_input_frame_id(i);
            let Some(input) = ctx.predictor.delayed_input_frame(ctx.layer, input_frame_id) else {
                warn!(frame = %i, input_frame = %input_frame_id, ?pass, "Delayed input frame is not cached");
                outcome.interrupted = Some(RollbackError::CacheUnderrun {
                    cache: CacheKind::Input,
                    frame: input_frame_id.as_i32(),
                });
                break;
            };

            let next = match ctx.stepper.step(ctx.roster, ctx.space, &current, Some(&input)) {
                Ok(next) => next,
                Err(err) => {
                    error!(frame = %i, error = %err, "Simulation step failed");
                    outcome.interrupted = Some(err);
                    break;
                },
            };

            let next_id = next.id;
            let cursors = ctx.layer.cursors();
            let caught_up = pass == ReplayPass::Chasing || cursors.chaser_render_frame_id >= i;
            if input.is_all_confirmed(ctx.layer.num_seats())
                && next_id > cursors.last_all_confirmed_render_frame_id
                && caught_up
            {
                ctx.layer.cursors.last_all_confirmed_render_frame_id = next_id;
                if next_id > ctx.layer.cursors.chaser_render_frame_id {
                    ctx.layer.cursors.chaser_render_frame_id = next_id;
                }
            }
            if pass == ReplayPass::Chasing {
                ctx.layer.cursors.chaser_render_frame_id = next_id;
            }

            let expected = ctx.layer.render_window().1;
            match ctx.layer.store_render_frame(next.clone()) {
                SetOutcome::Consecutive => {},
                SetOutcome::NonConsecutive => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Critical,
                        ViolationKind::RenderCache,
                        "replayed frame {} skipped ahead of render cache end {}",
                        next_id,
                        expected
                    );
                    outcome.interrupted = Some(RollbackError::NonConsecutiveInsert {
                        cache: CacheKind::Render,
                        frame: next_id.as_i32(),
                        expected: expected.as_i32(),
                    });
                },
                SetOutcome::Failed => {
                    outcome.interrupted = Some(RollbackError::InternalError {
                        context: format!("replayed frame {next_id} is older than the render cache window"),
                    });
                    break;
                },
            }
            outcome.latest = Some(next);
            outcome.stepped += 1;
            if outcome.interrupted.is_some() {
                break;
            }
        }

        trace!(
            from = %from,
            to = %to,
            ?pass,
            stepped = outcome.stepped,
            chaser = %ctx.layer.cursors().chaser_render_frame_id,
            watermark = %ctx.layer.cursors().last_all_confirmed_render_frame_id,
            "Replay finished"
        );
        outcome
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
    use crate::collision::SatCollisionSpace;
    use crate::frame_id::FrameIdConverter;
    use crate::frame_info::{EncodedDirection, InputFrame, PlayerState};
    use crate::{InputFrameId, JoinIndex, PlayerId};
    use smallvec::smallvec;

    struct Battle {
        layer: SyncLayer,
        roster: Roster,
        space: SatCollisionSpace,
        stepper: SimulationStepper,
    }

    impl Battle {
        /// One player at the origin, frame 0 cached, delay 0 and scale 0 so input `i` drives frame `i`.
        fn new() -> Self {
            let stepper = SimulationStepper::new(1000.0);
            let mut layer = SyncLayer::new(FrameIdConverter::new(0, 0), 64, 64);
            let mut roster = Roster::new();
            let mut space = SatCollisionSpace::default();
            let info = roster
                .insert_if_absent(PlayerId::new(1), JoinIndex::new(1), 12.0)
                .unwrap()
                .clone();
            stepper.insert_player_collider(&mut space, &info, 0, 0);
            layer.set_num_seats(1);
            layer.store_render_frame(
                RenderFrame::new(RenderFrameId::new(0))
                    .with_player(PlayerState::new(PlayerId::new(1), JoinIndex::new(1), 0, 0)),
            );
            layer.restart_at(RenderFrameId::new(0));
            Self {
                layer,
                roster,
                space,
                stepper,
            }
        }

        fn predict(&mut self, ids: std::ops::Range<i32>, raw: u32) {
            for id in ids {
                self.layer.store_input_frame(InputFrame {
                    input_frame_id: InputFrameId::new(id),
                    input_list: smallvec![EncodedDirection::new(raw)],
                    confirmed_list: 0,
                });
            }
        }

        fn confirm(&mut self, ids: std::ops::Range<i32>, raw: u32) {
            for id in ids {
                self.layer.store_input_frame(InputFrame::confirmed(
                    InputFrameId::new(id),
                    smallvec![EncodedDirection::new(raw)],
                ));
                self.layer.cursors.last_all_confirmed_input_frame_id = InputFrameId::new(id);
            }
        }

        fn replay(&mut self, from: i32, to: i32, pass: ReplayPass) -> ReplayOutcome {
            let generation = self.layer.generation();
            let mut ctx = ReplayContext {
                layer: &mut self.layer,
                roster: &self.roster,
                space: &mut self.space,
                predictor: InputPredictor::new(Some(JoinIndex::new(1))),
                stepper: self.stepper,
                generation,
            };
            RollbackChaser::new(4, None).replay(&mut ctx, RenderFrameId::new(from), RenderFrameId::new(to), pass)
        }

        fn x_at(&self, id: i32) -> i32 {
            self.layer.render_frame(RenderFrameId::new(id)).unwrap().players[&PlayerId::new(1)].virtual_grid_x
        }
    }

    #[test]
    fn empty_range_returns_start_frame() {
        let mut battle = Battle::new();
        let outcome = battle.replay(0, 0, ReplayPass::Chasing);
        assert_eq!(outcome.stepped, 0);
        assert_eq!(outcome.latest.unwrap().id, RenderFrameId::new(0));
        assert!(outcome.interrupted.is_none());
    }

    #[test]
    fn missing_start_frame_is_an_underrun() {
        let mut battle = Battle::new();
        let outcome = battle.replay(5, 6, ReplayPass::RollForward);
        assert!(outcome.is_underrun());
        assert!(outcome.latest.is_none());
    }

    #[test]
    fn missing_input_stops_early_with_latest_result() {
        let mut battle = Battle::new();
        battle.predict(0..2, 3);
        let outcome = battle.replay(0, 4, ReplayPass::Chasing);
        assert_eq!(outcome.stepped, 2);
        assert_eq!(outcome.latest.unwrap().id, RenderFrameId::new(2));
        assert_eq!(
            outcome.interrupted,
            Some(RollbackError::CacheUnderrun {
                cache: CacheKind::Input,
                frame: 2
            })
        );
        assert_eq!(battle.layer.cursors().chaser_render_frame_id, RenderFrameId::new(2));
    }

    #[test]
    fn confirmed_inputs_advance_watermark_while_chasing() {
        let mut battle = Battle::new();
        battle.confirm(0..3, 3);
        battle.predict(3..4, 3);
        battle.layer.cursors.render_frame_id = RenderFrameId::new(4);

        let outcome = battle.replay(0, 4, ReplayPass::Chasing);
        assert_eq!(outcome.stepped, 4);
        let cursors = battle.layer.cursors();
        assert_eq!(cursors.last_all_confirmed_render_frame_id, RenderFrameId::new(3));
        assert_eq!(cursors.chaser_render_frame_id, RenderFrameId::new(4));
        assert_eq!(battle.x_at(4), 8);
    }

    #[test]
    fn roll_forward_waits_for_chase_cursor_before_advancing_watermark() {
        let mut battle = Battle::new();
        battle.predict(0..2, 3);
        battle.replay(0, 2, ReplayPass::RollForward);
        battle.layer.cursors.render_frame_id = RenderFrameId::new(2);
        battle.confirm(2..3, 3);

        // Chase cursor is still at 0, so frame 3 must not be marked confirmed.
        battle.replay(2, 3, ReplayPass::RollForward);
        let cursors = battle.layer.cursors();
        assert_eq!(cursors.last_all_confirmed_render_frame_id, RenderFrameId::new(0));
        assert_eq!(cursors.chaser_render_frame_id, RenderFrameId::new(0));
    }

    #[test]
    fn split_replay_equals_single_replay() {
        let mut whole = Battle::new();
        let mut split = Battle::new();
        for battle in [&mut whole, &mut split] {
            battle.predict(0..3, 3);
            battle.predict(3..6, 5);
        }

        let single = whole.replay(0, 6, ReplayPass::Chasing);
        split.replay(0, 2, ReplayPass::Chasing);
        let composed = split.replay(2, 6, ReplayPass::Chasing);
        assert_eq!(single.latest, composed.latest);
        for id in 0..=6 {
            assert_eq!(
                whole.layer.render_frame(RenderFrameId::new(id)),
                split.layer.render_frame(RenderFrameId::new(id))
            );
        }
    }

    #[test]
    fn stale_generation_stops_before_first_store() {
        let mut battle = Battle::new();
        battle.predict(0..2, 3);
        let mut ctx = ReplayContext {
            layer: &mut battle.layer,
            roster: &battle.roster,
            space: &mut battle.space,
            predictor: InputPredictor::new(Some(JoinIndex::new(1))),
            stepper: battle.stepper,
            generation: 7,
        };
        let outcome = RollbackChaser::new(4, None).replay(
            &mut ctx,
            RenderFrameId::new(0),
            RenderFrameId::new(2),
            ReplayPass::Chasing,
        );
        assert_eq!(outcome.stepped, 0);
        assert!(matches!(outcome.interrupted, Some(RollbackError::StaleGeneration { expected: 7, .. })));
        assert!(battle.layer.render_frame(RenderFrameId::new(1)).is_none());
    }

    #[test]
    fn chase_target_respects_budget_and_tip() {
        let chaser = RollbackChaser::new(4, None);
        let mut cursors = FrameCursors {
            render_frame_id: RenderFrameId::new(100),
            chaser_render_frame_id: RenderFrameId::new(10),
            ..FrameCursors::default()
        };
        assert_eq!(chaser.chase_target(cursors), RenderFrameId::new(14));
        cursors.chaser_render_frame_id = RenderFrameId::new(98);
        assert_eq!(chaser.chase_target(cursors), RenderFrameId::new(100));
    }
}
