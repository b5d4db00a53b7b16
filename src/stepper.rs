//! Advancing one render-frame by one tick.
//!
//! Given render-frame `N` and the input-frame it consumes, [`SimulationStepper::step`]
//! produces render-frame `N + 1`:
//!
//! 1. Every player is copied forward.
//! 2. Each player moves by its decoded direction times `1 + speed`, and its
//!    collider is placed at the tentative position.
//! 3. One broad phase runs over all colliders.
//! 4. Each player's pushback is the sum of its overlaps, in join-index order,
//!    with potentials sorted by collision key.
//! 5. The pushback is subtracted and the result rounded back onto the virtual grid.
//!
//! The stepper holds no state of its own. Collider positions are rewritten
//! from the input frame on every call, so stepping the same inputs always
//! yields the same frame.

use tracing::trace;

use crate::collision::{CollisionKey, CollisionSpace, Vec2};
use crate::error::{RollbackError, RollbackResult};
use crate::frame_info::{InputFrame, RenderFrame};
use crate::roster::{PlayerRichInfo, Roster};

/// Conversion between the integer virtual grid and collision-world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationStepper {
    world_to_virtual_grid_ratio: f64,
    virtual_grid_to_world_ratio: f64,
}

impl SimulationStepper {
    /// Creates a stepper. `world_to_virtual_grid_ratio` is the number of grid units per world unit.
    #[must_use]
    pub fn new(world_to_virtual_grid_ratio: f64) -> Self {
        Self {
            world_to_virtual_grid_ratio,
            virtual_grid_to_world_ratio: 1.0 / world_to_virtual_grid_ratio,
        }
    }

    /// Grid units per world unit.
    #[must_use]
    pub fn world_to_virtual_grid_ratio(&self) -> f64 {
        self.world_to_virtual_grid_ratio
    }

    /// World position of a virtual-grid position. Exact up to float precision.
    #[must_use]
    pub fn virtual_grid_to_world(&self, virtual_grid_x: i32, virtual_grid_y: i32) -> Vec2 {
        Vec2::new(
            f64::from(virtual_grid_x) * self.virtual_grid_to_world_ratio,
            f64::from(virtual_grid_y) * self.virtual_grid_to_world_ratio,
        )
    }

    /// Virtual-grid position of a world position, rounding half away from zero.
    #[must_use]
    pub fn world_to_virtual_grid(&self, world: Vec2) -> (i32, i32) {
        (
            (world.x * self.world_to_virtual_grid_ratio).round() as i32,
            (world.y * self.world_to_virtual_grid_ratio).round() as i32,
        )
    }

    /// Anchor of a player's square collider: its lower-left corner.
    #[must_use]
    pub fn collider_anchor(&self, virtual_grid_x: i32, virtual_grid_y: i32, collider_radius: f64) -> Vec2 {
        let world = self.virtual_grid_to_world(virtual_grid_x, virtual_grid_y);
        Vec2::new(world.x - collider_radius, world.y - collider_radius)
    }

    /// Virtual-grid position of a player whose collider is anchored at `anchor`.
    #[must_use]
    pub fn anchor_to_virtual_grid(&self, anchor: Vec2, collider_radius: f64) -> (i32, i32) {
        self.world_to_virtual_grid(Vec2::new(anchor.x + collider_radius, anchor.y + collider_radius))
    }

    /// The polygon of a player's collider, relative to its anchor.
    #[must_use]
    pub fn player_polygon(collider_radius: f64) -> [Vec2; 4] {
        let side = collider_radius * 2.0;
        [
            Vec2::new(0.0, 0.0),
            Vec2::new(side, 0.0),
            Vec2::new(side, side),
            Vec2::new(0.0, side),
        ]
    }

    /// Inserts the collider of a newly seated player at its initial position.
    pub fn insert_player_collider<C: CollisionSpace>(
        &self,
        space: &mut C,
        info: &PlayerRichInfo,
        virtual_grid_x: i32,
        virtual_grid_y: i32,
    ) {
        space.insert_polygon(
            CollisionKey::for_seat(info.join_index),
            self.collider_anchor(virtual_grid_x, virtual_grid_y, info.collider_radius),
            &Self::player_polygon(info.collider_radius),
        );
    }

    /// Produces the render-frame after `frame`.
    ///
    /// Without an input-frame the players are copied forward unchanged and only
    /// the id advances. Removed players are always copied unchanged; their
    /// colliders stay where they are so that others still bump into them.
    ///
    /// # Errors
    ///
    /// [`RollbackError::InternalError`] if a seated player has no collider in `space`.
    pub fn step<C: CollisionSpace>(
        &self,
        roster: &Roster,
        space: &mut C,
        frame: &RenderFrame,
        input: Option<&InputFrame>,
    ) -> RollbackResult<RenderFrame> {
        let mut next = frame.clone();
        next.id = frame.id.next();
        let Some(input) = input else {
            return Ok(next);
        };

        let mut movers: Vec<&PlayerRichInfo> = Vec::with_capacity(roster.len());
        for info in roster.iter() {
            let Some(player) = frame.players.get(&info.player_id) else {
                continue;
            };
            let key = CollisionKey::for_seat(info.join_index);
            let (virtual_grid_x, virtual_grid_y) = if player.removed {
                (player.virtual_grid_x, player.virtual_grid_y)
            } else {
                let dir = input.input_of(info.join_index).decode();
                let stride = 1 + player.speed;
                if let Some(next_player) = next.players.get_mut(&info.player_id) {
                    next_player.dir = dir;
                }
                movers.push(info);
                (
                    player.virtual_grid_x + dir.dx * stride,
                    player.virtual_grid_y + dir.dy * stride,
                )
            };
            let anchor = self.collider_anchor(virtual_grid_x, virtual_grid_y, info.collider_radius);
            if !space.set_position(key, anchor) {
                return Err(RollbackError::InternalError {
                    context: format!(
                        "player {} at seat {} has no collider",
                        info.player_id, info.join_index
                    ),
                });
            }
        }

        space.update();

        for info in movers {
            let key = CollisionKey::for_seat(info.join_index);
            let mut potentials = space.potentials(key);
            potentials.sort_unstable();
            let pushback = potentials
                .into_iter()
                .filter_map(|other| space.overlap(key, other))
                .fold(Vec2::ZERO, |sum, overlap| sum + overlap.pushback());

            let anchor = space.position(key).unwrap_or(Vec2::ZERO);
            let (virtual_grid_x, virtual_grid_y) =
                self.anchor_to_virtual_grid(anchor - pushback, info.collider_radius);
            if let Some(next_player) = next.players.get_mut(&info.player_id) {
                next_player.virtual_grid_x = virtual_grid_x;
                next_player.virtual_grid_y = virtual_grid_y;
            }
        }

        trace!(frame = %next.id, input_frame = %input.input_frame_id, "Stepped render frame");
        Ok(next)
    }
}

impl Default for SimulationStepper {
    fn default() -> Self {
        Self::new(1000.0)
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
    use crate::frame_info::{Direction, EncodedDirection, PlayerState};
    use crate::{InputFrameId, JoinIndex, PlayerId, RenderFrameId};
    use smallvec::smallvec;

    const RIGHT: EncodedDirection = EncodedDirection::new(3);
    const LEFT: EncodedDirection = EncodedDirection::new(4);

    struct World {
        stepper: SimulationStepper,
        roster: Roster,
        space: SatCollisionSpace,
        frame: RenderFrame,
    }

    /// Two 1x1 (world) players, `gap` grid units apart on the x axis.
    fn two_players(gap: i32, speed: i32) -> World {
        let stepper = SimulationStepper::new(10.0);
        let mut roster = Roster::new();
        let mut space = SatCollisionSpace::default();
        let mut frame = RenderFrame::new(RenderFrameId::new(0));
        for (id, join_index, x) in [(1, 1, 0), (2, 2, gap)] {
            let info = roster
                .insert_if_absent(PlayerId::new(id), JoinIndex::new(join_index), 0.5)
                .unwrap()
                .clone();
            stepper.insert_player_collider(&mut space, &info, x, 0);
            frame = frame.with_player(
                PlayerState::new(PlayerId::new(id), JoinIndex::new(join_index), x, 0).with_speed(speed),
            );
        }
        World {
            stepper,
            roster,
            space,
            frame,
        }
    }

    fn inputs(a: EncodedDirection, b: EncodedDirection) -> InputFrame {
        InputFrame::confirmed(InputFrameId::new(0), smallvec![a, b])
    }

    #[test]
    fn null_input_only_advances_id() {
        let mut world = two_players(100, 0);
        let next = world
            .stepper
            .step(&world.roster, &mut world.space, &world.frame, None)
            .unwrap();
        assert_eq!(next.id, RenderFrameId::new(1));
        assert_eq!(next.players, world.frame.players);
    }

    #[test]
    fn free_movement_scales_with_speed() {
        let mut world = two_players(100, 2);
        let next = world
            .stepper
            .step(&world.roster, &mut world.space, &world.frame, Some(&inputs(RIGHT, LEFT)))
            .unwrap();
        let first = &next.players[&PlayerId::new(1)];
        assert_eq!((first.virtual_grid_x, first.virtual_grid_y), (6, 0));
        assert_eq!(first.dir, Direction { dx: 2, dy: 0 });
        assert_eq!(next.players[&PlayerId::new(2)].virtual_grid_x, 94);
    }

    #[test]
    fn overlapping_players_are_pushed_apart_symmetrically() {
        // 10 grid units = 1 world unit = one collider side.
        let mut world = two_players(12, 0);
        let next = world
            .stepper
            .step(&world.roster, &mut world.space, &world.frame, Some(&inputs(RIGHT, LEFT)))
            .unwrap();
        // Tentative 2 and 10 overlap by 2; each is pushed back by the full overlap.
        assert_eq!(next.players[&PlayerId::new(1)].virtual_grid_x, 0);
        assert_eq!(next.players[&PlayerId::new(2)].virtual_grid_x, 12);
    }

    #[test]
    fn removed_player_is_copied_unchanged() {
        let mut world = two_players(100, 0);
        world.frame.players.get_mut(&PlayerId::new(1)).unwrap().removed = true;
        let next = world
            .stepper
            .step(&world.roster, &mut world.space, &world.frame, Some(&inputs(RIGHT, LEFT)))
            .unwrap();
        assert_eq!(next.players[&PlayerId::new(1)], world.frame.players[&PlayerId::new(1)]);
        assert_eq!(next.players[&PlayerId::new(2)].virtual_grid_x, 98);
    }

    #[test]
    fn missing_collider_is_an_internal_error() {
        let mut world = two_players(100, 0);
        world.space.remove(CollisionKey::player(2));
        let result = world
            .stepper
            .step(&world.roster, &mut world.space, &world.frame, Some(&inputs(RIGHT, LEFT)));
        assert!(matches!(result, Err(RollbackError::InternalError { .. })));
    }

    #[test]
    fn grid_world_round_trip_rounds_half_away_from_zero() {
        let stepper = SimulationStepper::new(1000.0);
        assert_eq!(stepper.world_to_virtual_grid(Vec2::new(0.0125, -0.0125)), (13, -13));
        let anchor = stepper.collider_anchor(1234, -567, 12.0);
        assert_eq!(stepper.anchor_to_virtual_grid(anchor, 12.0), (1234, -567));
    }
}
