//! The 2D collision contract the stepper drives, plus a small reference engine.
//!
//! The stepper treats the engine as opaque: it positions shapes, runs one
//! broad phase, asks for each player's potentials and resolves every
//! potential pair with a narrow-phase overlap query. [`SatCollisionSpace`]
//! implements that with axis-aligned bounding boxes and the separating axis
//! theorem over convex polygons.
//!
//! ```
//! use rollback_chaser::{CollisionKey, CollisionSpace, SatCollisionSpace, Vec2};
//!
//! let square = [Vec2::new(0.0, 0.0), Vec2::new(2.0, 0.0), Vec2::new(2.0, 2.0), Vec2::new(0.0, 2.0)];
//! let mut space = SatCollisionSpace::default();
//! space.insert_polygon(CollisionKey::player(1), Vec2::new(0.0, 0.0), &square);
//! space.insert_polygon(CollisionKey::barrier(0), Vec2::new(1.5, 0.0), &square);
//! space.update();
//!
//! let overlap = space
//!     .overlap(CollisionKey::player(1), CollisionKey::barrier(0))
//!     .expect("shapes overlap");
//! assert_eq!((overlap.overlap, overlap.overlap_x, overlap.overlap_y), (0.5, 1.0, 0.0));
//! ```

use std::collections::BTreeMap;
use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

use crate::JoinIndex;

/// A point or vector in world units.
#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    /// Horizontal component.
    pub x: f64,
    /// Vertical component.
    pub y: f64,
}

impl Vec2 {
    /// The origin.
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    /// Creates a vector.
    #[inline]
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Dot product.
    #[inline]
    #[must_use]
    pub fn dot(self, other: Vec2) -> f64 {
        self.x * other.x + self.y * other.y
    }

    /// Euclidean length.
    #[inline]
    #[must_use]
    pub fn length(self) -> f64 {
        self.dot(self).sqrt()
    }

    /// The left-hand perpendicular.
    #[inline]
    #[must_use]
    pub fn perp(self) -> Vec2 {
        Vec2::new(-self.y, self.x)
    }
}

impl Add for Vec2 {
    type Output = Vec2;

    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Vec2;

    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Vec2 {
    type Output = Vec2;

    fn mul(self, rhs: f64) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

impl Neg for Vec2 {
    type Output = Vec2;

    fn neg(self) -> Vec2 {
        Vec2::new(-self.x, -self.y)
    }
}

/// Key of a shape in a [`CollisionSpace`].
///
/// Players and barriers live in disjoint ranges so their keys never collide.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CollisionKey(u32);

impl CollisionKey {
    /// First key of the player range.
    pub const PLAYER_PREFIX: u32 = 1 << 17;
    /// First key of the barrier range.
    pub const BARRIER_PREFIX: u32 = 1 << 16;

    /// Key of the collider of the player seated at `join_index`.
    #[must_use]
    pub const fn player(join_index: u32) -> Self {
        CollisionKey(Self::PLAYER_PREFIX + join_index)
    }

    /// Key of the collider of the player seated at `join_index`.
    #[must_use]
    pub const fn for_seat(join_index: JoinIndex) -> Self {
        Self::player(join_index.as_u32())
    }

    /// Key of the `ordinal`-th static barrier.
    #[must_use]
    pub const fn barrier(ordinal: u32) -> Self {
        CollisionKey(Self::BARRIER_PREFIX + ordinal)
    }

    /// The raw key.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns `true` if this key is in the player range.
    #[must_use]
    pub const fn is_player(self) -> bool {
        self.0 >= Self::PLAYER_PREFIX
    }
}

/// Penetration of one shape into another.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overlap {
    /// Penetration depth along the axis, in world units. Always positive.
    pub overlap: f64,
    /// X of the unit axis pointing from the queried shape toward the other one.
    pub overlap_x: f64,
    /// Y of the unit axis pointing from the queried shape toward the other one.
    pub overlap_y: f64,
}

impl Overlap {
    /// The vector that, subtracted from the queried shape's position, separates the shapes.
    #[must_use]
    pub fn pushback(&self) -> Vec2 {
        Vec2::new(self.overlap * self.overlap_x, self.overlap * self.overlap_y)
    }
}

/// The geometry engine consumed by the simulation stepper.
///
/// Shapes are polygons given as points relative to an anchor; moving a shape
/// moves its anchor. Broad-phase results reflect positions as of the last
/// [`update`](CollisionSpace::update).
pub trait CollisionSpace {
    /// Inserts or replaces the polygon stored under `key`.
    fn insert_polygon(&mut self, key: CollisionKey, anchor: Vec2, points: &[Vec2]);

    /// Moves the shape's anchor. Returns `false` if there is no such shape.
    fn set_position(&mut self, key: CollisionKey, anchor: Vec2) -> bool;

    /// The shape's anchor, if it exists.
    fn position(&self, key: CollisionKey) -> Option<Vec2>;

    /// Removes the shape. Returns `false` if there was no such shape.
    fn remove(&mut self, key: CollisionKey) -> bool;

    /// Runs the broad phase over all shapes.
    fn update(&mut self);

    /// Shapes whose bounds touched `key`'s bounds in the last broad phase. Any order.
    fn potentials(&self, key: CollisionKey) -> Vec<CollisionKey>;

    /// Narrow-phase penetration of `a` into `b`, or `None` if they do not overlap.
    fn overlap(&self, a: CollisionKey, b: CollisionKey) -> Option<Overlap>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Bounds {
    min: Vec2,
    max: Vec2,
}

impl Bounds {
    fn intersects(&self, other: &Bounds) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Polygon {
    anchor: Vec2,
    points: Vec<Vec2>,
}

impl Polygon {
    fn world_points(&self) -> impl Iterator<Item = Vec2> + '_ {
        self.points.iter().map(move |&point| self.anchor + point)
    }

    fn bounds(&self) -> Bounds {
        let mut min = Vec2::new(f64::INFINITY, f64::INFINITY);
        let mut max = Vec2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for point in self.world_points() {
            min = Vec2::new(min.x.min(point.x), min.y.min(point.y));
            max = Vec2::new(max.x.max(point.x), max.y.max(point.y));
        }
        Bounds { min, max }
    }

    /// Unit normals of every non-degenerate edge, in edge order.
    fn axes(&self) -> Vec<Vec2> {
        let count = self.points.len();
        (0..count)
            .filter_map(|i| {
                let edge = self.points[(i + 1) % count] - self.points[i];
                let length = edge.length();
                (length > 0.0).then(|| edge.perp() * (1.0 / length))
            })
            .collect()
    }

    fn project(&self, axis: Vec2) -> (f64, f64) {
        self.world_points()
            .map(|point| point.dot(axis))
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), value| {
                (lo.min(value), hi.max(value))
            })
    }
}

/// Convex polygons, bounding-box broad phase, separating-axis narrow phase.
///
/// Shapes are kept in a `BTreeMap`, so every query is deterministic for a given
/// set of shapes and positions.
#[derive(Debug, Clone, Default)]
pub struct SatCollisionSpace {
    shapes: BTreeMap<CollisionKey, Polygon>,
    potentials: BTreeMap<CollisionKey, Vec<CollisionKey>>,
}

impl SatCollisionSpace {
    /// Number of shapes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    /// Returns `true` if there are no shapes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

impl CollisionSpace for SatCollisionSpace {
    fn insert_polygon(&mut self, key: CollisionKey, anchor: Vec2, points: &[Vec2]) {
        self.shapes.insert(
            key,
            Polygon {
                anchor,
                points: points.to_vec(),
            },
        );
    }

    fn set_position(&mut self, key: CollisionKey, anchor: Vec2) -> bool {
        match self.shapes.get_mut(&key) {
            Some(shape) => {
                shape.anchor = anchor;
                true
            },
            None => false,
        }
    }

    fn position(&self, key: CollisionKey) -> Option<Vec2> {
        self.shapes.get(&key).map(|shape| shape.anchor)
    }

    fn remove(&mut self, key: CollisionKey) -> bool {
        self.potentials.remove(&key);
        self.shapes.remove(&key).is_some()
    }

    fn update(&mut self) {
        let bounds: Vec<(CollisionKey, Bounds)> = self
            .shapes
            .iter()
            .map(|(&key, shape)| (key, shape.bounds()))
            .collect();

        self.potentials.clear();
        for (i, (a, a_bounds)) in bounds.iter().enumerate() {
            for (b, b_bounds) in bounds.iter().skip(i + 1) {
                if a_bounds.intersects(b_bounds) {
                    self.potentials.entry(*a).or_default().push(*b);
                    self.potentials.entry(*b).or_default().push(*a);
                }
            }
        }
    }

    fn potentials(&self, key: CollisionKey) -> Vec<CollisionKey> {
        self.potentials.get(&key).cloned().unwrap_or_default()
    }

    fn overlap(&self, a: CollisionKey, b: CollisionKey) -> Option<Overlap> {
        let shape_a = self.shapes.get(&a)?;
        let shape_b = self.shapes.get(&b)?;

        let mut best: Option<(f64, Vec2)> = None;
        for axis in shape_a.axes().into_iter().chain(shape_b.axes()) {
            let (min_a, max_a) = shape_a.project(axis);
            let (min_b, max_b) = shape_b.project(axis);
            let toward_b = max_a - min_b;
            let toward_a = max_b - min_a;
            let (depth, direction) = if toward_b <= toward_a {
                (toward_b, axis)
            } else {
                (toward_a, -axis)
            };
            if depth <= 0.0 {
                return None;
            }
            if best.map_or(true, |(best_depth, _)| depth < best_depth) {
                best = Some((depth, direction));
            }
        }

        best.map(|(overlap, direction)| Overlap {
            overlap,
            overlap_x: direction.x,
            overlap_y: direction.y,
        })
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::float_cmp
)]
mod tests {
    use super::*;

    fn square(side: f64) -> Vec<Vec2> {
        vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(side, 0.0),
            Vec2::new(side, side),
            Vec2::new(0.0, side),
        ]
    }

    #[test]
    fn key_ranges_are_disjoint() {
        assert!(CollisionKey::player(1).is_player());
        assert!(!CollisionKey::barrier(5000).is_player());
        assert_eq!(CollisionKey::for_seat(JoinIndex::new(3)), CollisionKey::player(3));
        assert!(CollisionKey::barrier(0) < CollisionKey::player(0));
    }

    #[test]
    fn separated_shapes_have_no_potentials() {
        let mut space = SatCollisionSpace::default();
        space.insert_polygon(CollisionKey::player(1), Vec2::ZERO, &square(1.0));
        space.insert_polygon(CollisionKey::player(2), Vec2::new(5.0, 5.0), &square(1.0));
        space.update();
        assert!(space.potentials(CollisionKey::player(1)).is_empty());
        assert_eq!(space.overlap(CollisionKey::player(1), CollisionKey::player(2)), None);
    }

    #[test]
    fn touching_edges_do_not_overlap() {
        let mut space = SatCollisionSpace::default();
        space.insert_polygon(CollisionKey::player(1), Vec2::ZERO, &square(1.0));
        space.insert_polygon(CollisionKey::barrier(0), Vec2::new(1.0, 0.0), &square(1.0));
        space.update();
        assert_eq!(space.potentials(CollisionKey::player(1)), vec![CollisionKey::barrier(0)]);
        assert_eq!(space.overlap(CollisionKey::player(1), CollisionKey::barrier(0)), None);
    }

    #[test]
    fn overlap_points_toward_other_shape() {
        let mut space = SatCollisionSpace::default();
        space.insert_polygon(CollisionKey::player(1), Vec2::new(0.0, 0.25), &square(2.0));
        space.insert_polygon(CollisionKey::barrier(0), Vec2::new(0.0, 2.0), &square(2.0));
        space.update();

        let down = space.overlap(CollisionKey::player(1), CollisionKey::barrier(0)).unwrap();
        assert_eq!(down.overlap, 0.25);
        assert_eq!((down.overlap_x, down.overlap_y), (0.0, 1.0));
        assert_eq!(down.pushback(), Vec2::new(0.0, 0.25));

        let up = space.overlap(CollisionKey::barrier(0), CollisionKey::player(1)).unwrap();
        assert_eq!((up.overlap_x, up.overlap_y), (0.0, -1.0));
    }

    #[test]
    fn broad_phase_reflects_last_update_only() {
        let mut space = SatCollisionSpace::default();
        space.insert_polygon(CollisionKey::player(1), Vec2::ZERO, &square(1.0));
        space.insert_polygon(CollisionKey::player(2), Vec2::new(9.0, 0.0), &square(1.0));
        space.update();
        assert!(space.set_position(CollisionKey::player(2), Vec2::new(0.5, 0.0)));
        assert!(space.potentials(CollisionKey::player(1)).is_empty());
        space.update();
        assert_eq!(space.potentials(CollisionKey::player(1)), vec![CollisionKey::player(2)]);
    }

    #[test]
    fn remove_and_missing_shapes() {
        let mut space = SatCollisionSpace::default();
        space.insert_polygon(CollisionKey::player(1), Vec2::ZERO, &square(1.0));
        assert!(space.remove(CollisionKey::player(1)));
        assert!(!space.remove(CollisionKey::player(1)));
        assert!(!space.set_position(CollisionKey::player(1), Vec2::ZERO));
        assert_eq!(space.position(CollisionKey::player(1)), None);
        assert!(space.is_empty());
    }
}
