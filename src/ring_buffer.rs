//! Fixed-capacity history caches keyed by monotonic frame id.
//!
//! A [`RingBuffer`] holds a contiguous window `[st_frame_id, ed_frame_id)` of
//! frames. Writes are only accepted at or inside the window; a write past the
//! end resets the window there and reports [`SetOutcome::NonConsecutive`] so
//! the caller can treat it as a resync signal. Appending to a full buffer
//! evicts the oldest entry.
//!
//! ```
//! use rollback_chaser::{RingBuffer, RenderFrameId, SetOutcome};
//!
//! let mut cache: RingBuffer<RenderFrameId, &str> = RingBuffer::new(4);
//! assert_eq!(cache.set(RenderFrameId::new(0), "a"), SetOutcome::Consecutive);
//! assert_eq!(cache.set(RenderFrameId::new(1), "b"), SetOutcome::Consecutive);
//! assert_eq!(cache.set(RenderFrameId::new(7), "c"), SetOutcome::NonConsecutive);
//! assert_eq!(cache.get(RenderFrameId::new(1)), None);
//! assert_eq!(cache.get(RenderFrameId::new(7)), Some(&"c"));
//! ```

use crate::telemetry::{InvariantChecker, InvariantViolation};

/// Frame ids usable as ring buffer keys.
pub trait FrameKey: Copy + Ord + std::fmt::Debug {
    /// The raw id.
    fn as_i32(self) -> i32;
    /// Builds a key from a raw id.
    fn from_i32(id: i32) -> Self;
}

/// Result of [`RingBuffer::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetOutcome {
    /// Appended at the end of the window, or overwrote an entry inside it.
    Consecutive,
    /// The id was beyond the end of the window; the window was reset to start there.
    NonConsecutive,
    /// The id was before the start of the window; nothing was stored.
    Failed,
}

/// Contiguous fixed-capacity window of frames.
#[derive(Debug, Clone)]
pub struct RingBuffer<K, T> {
    slots: Vec<Option<T>>,
    /// Slot of `st_frame_id`.
    st: usize,
    /// Slot `ed_frame_id` would be written to.
    ed: usize,
    cnt: usize,
    st_frame_id: i32,
    ed_frame_id: i32,
    _key: std::marker::PhantomData<K>,
}

impl<K: FrameKey, T> RingBuffer<K, T> {
    /// Creates an empty buffer whose window starts at frame 0. A capacity of 0 is treated as 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            st: 0,
            ed: 0,
            cnt: 0,
            st_frame_id: 0,
            ed_frame_id: 0,
            _key: std::marker::PhantomData,
        }
    }

    /// Maximum number of frames held at once.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of frames currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cnt
    }

    /// Returns `true` if no frame is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cnt == 0
    }

    /// Returns `true` if the next append will evict the oldest frame.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.cnt == self.slots.len()
    }

    /// First id inside the window.
    #[must_use]
    pub fn st_frame_id(&self) -> K {
        K::from_i32(self.st_frame_id)
    }

    /// One past the last id inside the window; the id the next append gets.
    #[must_use]
    pub fn ed_frame_id(&self) -> K {
        K::from_i32(self.ed_frame_id)
    }

    /// Stores `item` under `id`.
    pub fn set(&mut self, id: K, item: T) -> SetOutcome {
        let id = id.as_i32();
        if id < self.st_frame_id {
            return SetOutcome::Failed;
        }
        if id < self.ed_frame_id {
            let slot = self.slot_of(id);
            self.slots[slot] = Some(item);
            return SetOutcome::Consecutive;
        }

        let mut outcome = SetOutcome::Consecutive;
        if id > self.ed_frame_id {
            self.reset_at(id);
            outcome = SetOutcome::NonConsecutive;
        }
        self.push(item);
        outcome
    }

    /// Returns the frame stored under `id`, or `None` outside the window.
    #[must_use]
    pub fn get(&self, id: K) -> Option<&T> {
        let id = id.as_i32();
        if id < self.st_frame_id || id >= self.ed_frame_id {
            return None;
        }
        self.slots[self.slot_of(id)].as_ref()
    }

    /// Mutable variant of [`get`](Self::get).
    pub fn get_mut(&mut self, id: K) -> Option<&mut T> {
        let id = id.as_i32();
        if id < self.st_frame_id || id >= self.ed_frame_id {
            return None;
        }
        let slot = self.slot_of(id);
        self.slots[slot].as_mut()
    }

    /// Evicts and returns the oldest frame.
    pub fn pop(&mut self) -> Option<(K, T)> {
        if self.cnt == 0 {
            return None;
        }
        let id = self.st_frame_id;
        let item = self.slots[self.st].take();
        self.st = (self.st + 1) % self.slots.len();
        self.st_frame_id += 1;
        self.cnt -= 1;
        item.map(|item| (K::from_i32(id), item))
    }

    /// Evicts every frame older than `floor`, keeping `floor` itself. Returns how many were evicted.
    pub fn evict_before(&mut self, floor: K) -> usize {
        let floor = floor.as_i32();
        let mut evicted = 0;
        while self.cnt > 0 && self.st_frame_id < floor {
            self.pop();
            evicted += 1;
        }
        evicted
    }

    /// Drops every frame and restarts the window at frame 0.
    pub fn clear(&mut self) {
        self.reset_at(0);
    }

    /// Drops every frame and restarts the window at `id`, so that `id` is the next append.
    pub fn clear_at(&mut self, id: K) {
        self.reset_at(id.as_i32());
    }

    fn push(&mut self, item: T) {
        if self.is_full() {
            self.pop();
        }
        self.slots[self.ed] = Some(item);
        self.ed = (self.ed + 1) % self.slots.len();
        self.ed_frame_id += 1;
        self.cnt += 1;
    }

    fn reset_at(&mut self, id: i32) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.st = 0;
        self.ed = 0;
        self.cnt = 0;
        self.st_frame_id = id;
        self.ed_frame_id = id;
    }

    fn slot_of(&self, id: i32) -> usize {
        (self.st + (id - self.st_frame_id) as usize) % self.slots.len()
    }
}

impl<K: FrameKey, T> InvariantChecker for RingBuffer<K, T> {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.cnt > self.slots.len() {
            return Err(InvariantViolation::new("RingBuffer", "count exceeds capacity")
                .with_details(format!("cnt={}, capacity={}", self.cnt, self.slots.len())));
        }
        if (self.ed_frame_id - self.st_frame_id) as usize != self.cnt {
            return Err(
                InvariantViolation::new("RingBuffer", "window width does not match count")
                    .with_details(format!(
                        "st={}, ed={}, cnt={}",
                        self.st_frame_id, self.ed_frame_id, self.cnt
                    )),
            );
        }
        if (self.st + self.cnt) % self.slots.len() != self.ed {
            return Err(InvariantViolation::new("RingBuffer", "slot cursors out of step"));
        }
        Ok(())
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
    use crate::test_config::miri_case_count;
    use crate::RenderFrameId;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    type Cache = RingBuffer<RenderFrameId, i64>;

    fn id(frame: i32) -> RenderFrameId {
        RenderFrameId::new(frame)
    }

    fn filled(capacity: usize, count: i32) -> Cache {
        let mut cache = Cache::new(capacity);
        for frame in 0..count {
            assert_eq!(cache.set(id(frame), i64::from(frame)), SetOutcome::Consecutive);
        }
        cache
    }

    #[test]
    fn append_and_overwrite_are_consecutive() {
        let mut cache = filled(8, 3);
        assert_eq!(cache.set(id(1), 100), SetOutcome::Consecutive);
        assert_eq!(cache.get(id(1)), Some(&100));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.ed_frame_id(), id(3));
    }

    #[test]
    fn write_before_window_fails() {
        let mut cache = filled(8, 5);
        cache.evict_before(id(3));
        assert_eq!(cache.set(id(2), 7), SetOutcome::Failed);
        assert_eq!(cache.get(id(2)), None);
        assert_eq!(cache.st_frame_id(), id(3));
    }

    #[test]
    fn skip_ahead_into_full_cache_resets_window() {
        let mut cache = filled(4, 4);
        assert!(cache.is_full());
        let target = cache.ed_frame_id().as_i32() + 5;
        assert_eq!(cache.set(id(target), 9), SetOutcome::NonConsecutive);
        assert_eq!(cache.st_frame_id(), id(target));
        assert_eq!(cache.ed_frame_id(), id(target + 1));
        assert_eq!(cache.len(), 1);
        for old in 0..4 {
            assert_eq!(cache.get(id(old)), None);
        }
    }

    #[test]
    fn full_cache_append_slides_window() {
        let mut cache = filled(4, 4);
        assert_eq!(cache.set(id(4), 4), SetOutcome::Consecutive);
        assert_eq!(cache.st_frame_id(), id(1));
        assert_eq!(cache.get(id(0)), None);
        assert_eq!(cache.get(id(4)), Some(&4));
    }

    #[test]
    fn evict_before_keeps_the_floor() {
        let mut cache = filled(8, 6);
        assert_eq!(cache.evict_before(id(4)), 4);
        assert_eq!(cache.get(id(4)), Some(&4));
        assert_eq!(cache.evict_before(RenderFrameId::NULL), 0);
    }

    #[test]
    fn pop_returns_oldest_with_id() {
        let mut cache = filled(4, 2);
        assert_eq!(cache.pop(), Some((id(0), 0)));
        assert_eq!(cache.pop(), Some((id(1), 1)));
        assert_eq!(cache.pop(), None);
        assert!(cache.is_empty());
        assert_eq!(cache.set(id(2), 2), SetOutcome::Consecutive);
    }

    #[test]
    fn negative_ids_fail_on_fresh_cache() {
        let mut cache = Cache::new(4);
        assert_eq!(cache.set(RenderFrameId::NULL, 1), SetOutcome::Failed);
    }

    #[test]
    fn clear_at_moves_the_append_point() {
        let mut cache = filled(8, 5);
        cache.clear_at(id(123));
        assert!(cache.is_empty());
        assert_eq!(cache.st_frame_id(), id(123));
        assert_eq!(cache.ed_frame_id(), id(123));
        assert_eq!(cache.get(id(2)), None);
        assert_eq!(cache.set(id(122), 1), SetOutcome::Failed);
        assert_eq!(cache.set(id(123), 1), SetOutcome::Consecutive);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Append(i64),
        Overwrite(usize, i64),
        Skip(i32, i64),
        Pop,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => any::<i64>().prop_map(Op::Append),
            2 => (any::<usize>(), any::<i64>()).prop_map(|(slot, value)| Op::Overwrite(slot, value)),
            1 => (1i32..8, any::<i64>()).prop_map(|(gap, value)| Op::Skip(gap, value)),
            2 => Just(Op::Pop),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: miri_case_count(),
            ..ProptestConfig::default()
        })]

        /// `get` returns the last value set for an id while it is inside the window, and nothing outside.
        #[test]
        fn get_tracks_last_set_inside_window(
            capacity in 1usize..16,
            ops in prop::collection::vec(op_strategy(), 1..64),
        ) {
            let mut cache = Cache::new(capacity);
            let mut model: BTreeMap<i32, i64> = BTreeMap::new();

            for op in ops {
                match op {
                    Op::Append(value) => {
                        let next = cache.ed_frame_id().as_i32();
                        prop_assert_eq!(cache.set(id(next), value), SetOutcome::Consecutive);
                        model.insert(next, value);
                    },
                    Op::Overwrite(slot, value) => {
                        if cache.is_empty() {
                            continue;
                        }
                        let frame = cache.st_frame_id().as_i32() + (slot % cache.len()) as i32;
                        prop_assert_eq!(cache.set(id(frame), value), SetOutcome::Consecutive);
                        model.insert(frame, value);
                    },
                    Op::Skip(gap, value) => {
                        let frame = cache.ed_frame_id().as_i32() + gap;
                        prop_assert_eq!(cache.set(id(frame), value), SetOutcome::NonConsecutive);
                        model.clear();
                        model.insert(frame, value);
                    },
                    Op::Pop => {
                        cache.pop();
                    },
                }

                let st = cache.st_frame_id().as_i32();
                let ed = cache.ed_frame_id().as_i32();
                prop_assert!(cache.check_invariants().is_ok());
                for (frame, value) in &model {
                    if (st..ed).contains(frame) {
                        prop_assert_eq!(cache.get(id(*frame)), Some(value));
                    } else {
                        prop_assert_eq!(cache.get(id(*frame)), None);
                    }
                }
                prop_assert_eq!(cache.get(id(ed)), None);
                prop_assert_eq!(cache.get(id(st - 1)), None);
            }
        }
    }
}
