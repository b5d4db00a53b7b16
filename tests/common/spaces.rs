//! Collision engines that differ from the built-in one only in ways the
//! simulation must not observe.

#![allow(dead_code)]

use rollback_chaser::{CollisionKey, CollisionSpace, Overlap, SatCollisionSpace, Vec2};

/// Reports broad-phase potentials in reverse order.
#[derive(Debug, Default)]
pub struct ReversedPotentials {
    inner: SatCollisionSpace,
}

impl CollisionSpace for ReversedPotentials {
    fn insert_polygon(&mut self, key: CollisionKey, anchor: Vec2, points: &[Vec2]) {
        self.inner.insert_polygon(key, anchor, points);
    }

    fn set_position(&mut self, key: CollisionKey, anchor: Vec2) -> bool {
        self.inner.set_position(key, anchor)
    }

    fn position(&self, key: CollisionKey) -> Option<Vec2> {
        self.inner.position(key)
    }

    fn remove(&mut self, key: CollisionKey) -> bool {
        self.inner.remove(key)
    }

    fn update(&mut self) {
        self.inner.update();
    }

    fn potentials(&self, key: CollisionKey) -> Vec<CollisionKey> {
        let mut potentials = self.inner.potentials(key);
        potentials.reverse();
        potentials
    }

    fn overlap(&self, a: CollisionKey, b: CollisionKey) -> Option<Overlap> {
        self.inner.overlap(a, b)
    }
}
