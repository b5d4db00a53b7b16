//! History shared by every stage of a battle.
//!
//! A [`SyncLayer`] owns the render-frame and input-frame caches together with
//! the [`FrameCursors`] that say how far simulation and confirmation have
//! progressed. Stores go through it so that neither cache ever slides past
//! the frames the watermark still needs; a store that would is recorded as a
//! [`DesyncReason::HistoryOverrun`].

use tracing::{debug, trace};

use crate::error::{CacheKind, DesyncReason};
use crate::frame_id::FrameIdConverter;
use crate::frame_info::{InputFrame, RenderFrame};
use crate::report_violation;
use crate::ring_buffer::{RingBuffer, SetOutcome};
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{InputFrameId, RenderFrameId};

/// The four cursors that describe how far simulation and confirmation have progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FrameCursors {
    /// The tip: the latest render-frame shown. Advances by exactly one per tick.
    pub render_frame_id: RenderFrameId,
    /// The next render-frame the catch-up pass replays from.
    pub chaser_render_frame_id: RenderFrameId,
    /// The watermark: every render-frame up to here was simulated from confirmed input only.
    pub last_all_confirmed_render_frame_id: RenderFrameId,
    /// The newest input-frame the server confirmed.
    pub last_all_confirmed_input_frame_id: InputFrameId,
    /// The newest local input-frame handed to the transport.
    pub last_upsync_input_frame_id: InputFrameId,
}

impl Default for FrameCursors {
    fn default() -> Self {
        Self {
            render_frame_id: RenderFrameId::NULL,
            chaser_render_frame_id: RenderFrameId::NULL,
            last_all_confirmed_render_frame_id: RenderFrameId::NULL,
            last_all_confirmed_input_frame_id: InputFrameId::NULL,
            last_upsync_input_frame_id: InputFrameId::NULL,
        }
    }
}

/// Both history caches, the cursors into them, and the retention policy that keeps them bounded.
///
/// Every store first evicts history below the retention floor. The floor is
/// the render watermark (and the input-frame it consumes), because no
/// rollback ever restarts below it.
#[derive(Debug, Clone)]
pub struct SyncLayer {
    converter: FrameIdConverter,
    render_frames: RingBuffer<RenderFrameId, RenderFrame>,
    input_frames: RingBuffer<InputFrameId, InputFrame>,
    pub(crate) cursors: FrameCursors,
    num_seats: usize,
    generation: u64,
    overrun: Option<DesyncReason>,
}

impl SyncLayer {
    /// Creates empty caches with the given capacities.
    #[must_use]
    pub fn new(converter: FrameIdConverter, render_capacity: usize, input_capacity: usize) -> Self {
        Self {
            converter,
            render_frames: RingBuffer::new(render_capacity),
            input_frames: RingBuffer::new(input_capacity),
            cursors: FrameCursors::default(),
            num_seats: 0,
            generation: 0,
            overrun: None,
        }
    }

    /// The frame-id arithmetic of this battle.
    #[must_use]
    pub fn converter(&self) -> FrameIdConverter {
        self.converter
    }

    /// A snapshot of the cursors.
    #[must_use]
    pub fn cursors(&self) -> FrameCursors {
        self.cursors
    }

    /// Incremented by every [`reset`](Self::reset).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of seats in every input-frame.
    #[must_use]
    pub fn num_seats(&self) -> usize {
        self.num_seats
    }

    pub(crate) fn set_num_seats(&mut self, num_seats: usize) {
        self.num_seats = num_seats;
    }

    /// The cached render-frame `id`, if it is inside the window.
    #[must_use]
    pub fn render_frame(&self, id: RenderFrameId) -> Option<&RenderFrame> {
        self.render_frames.get(id)
    }

    /// The cached input-frame `id`, if it is inside the window.
    #[must_use]
    pub fn input_frame(&self, id: InputFrameId) -> Option<&InputFrame> {
        self.input_frames.get(id)
    }

    pub(crate) fn input_frame_mut(&mut self, id: InputFrameId) -> Option<&mut InputFrame> {
        self.input_frames.get_mut(id)
    }

    /// `[start, end)` of the render cache window.
    #[must_use]
    pub fn render_window(&self) -> (RenderFrameId, RenderFrameId) {
        (self.render_frames.st_frame_id(), self.render_frames.ed_frame_id())
    }

    /// `[start, end)` of the input cache window.
    #[must_use]
    pub fn input_window(&self) -> (InputFrameId, InputFrameId) {
        (self.input_frames.st_frame_id(), self.input_frames.ed_frame_id())
    }

    /// Oldest render-frame that must stay cached.
    #[must_use]
    pub fn render_retention_floor(&self) -> RenderFrameId {
        self.cursors.last_all_confirmed_render_frame_id
    }

    /// Oldest input-frame that must stay cached.
    #[must_use]
    pub fn input_retention_floor(&self) -> InputFrameId {
        let watermark = self.cursors.last_all_confirmed_render_frame_id;
        if !watermark.is_valid() {
            return InputFrameId::NULL;
        }
        self.converter
            .to_input_frame_id(watermark)
            .min(self.cursors.last_all_confirmed_input_frame_id)
    }

    /// Stores a render-frame after evicting everything below the retention floor.
    pub fn store_render_frame(&mut self, frame: RenderFrame) -> SetOutcome {
        let floor = self.render_retention_floor();
        let evicted = self.render_frames.evict_before(floor);
        if evicted > 0 {
            trace!(evicted, floor = %floor, "Evicted render frames below watermark");
        }

        let id = frame.id;
        let start = self.render_frames.st_frame_id();
        let outcome = self.render_frames.set(id, frame);
        let slid_to = self.render_frames.st_frame_id();
        if outcome == SetOutcome::Consecutive && floor.is_valid() && slid_to > start && slid_to > floor {
            self.record_overrun(CacheKind::Render, floor.as_i32(), slid_to.as_i32());
        }
        outcome
    }

    /// Stores an input-frame after evicting everything below the retention floor.
    pub fn store_input_frame(&mut self, frame: InputFrame) -> SetOutcome {
        let floor = self.input_retention_floor();
        let evicted = self.input_frames.evict_before(floor);
        if evicted > 0 {
            trace!(evicted, floor = %floor, "Evicted input frames below watermark");
        }

        let id = frame.input_frame_id;
        let start = self.input_frames.st_frame_id();
        let outcome = self.input_frames.set(id, frame);
        let slid_to = self.input_frames.st_frame_id();
        if outcome == SetOutcome::Consecutive && floor.is_valid() && slid_to > start && slid_to > floor {
            self.record_overrun(CacheKind::Input, floor.as_i32(), slid_to.as_i32());
        }
        outcome
    }

    fn record_overrun(&mut self, cache: CacheKind, floor: i32, start: i32) {
        let kind = match cache {
            CacheKind::Render => ViolationKind::RenderCache,
            CacheKind::Input => ViolationKind::InputCache,
        };
        report_violation!(
            ViolationSeverity::Critical,
            kind,
            "{} slid past retention floor {} to {}",
            cache,
            floor,
            start
        );
        if self.overrun.is_none() {
            self.overrun = Some(DesyncReason::HistoryOverrun { cache, floor, start });
        }
    }

    /// Returns and clears a pending history overrun.
    pub fn take_overrun(&mut self) -> Option<DesyncReason> {
        self.overrun.take()
    }

    /// Moves tip, chase cursor and watermark to an authoritative frame.
    ///
    /// The input cache is kept if its window reaches the input-frame `id`
    /// consumes. Otherwise it is emptied and restarted at that input-frame.
    /// Either way both input cursors end up no lower than the input-frame
    /// just before it, so confirmations and local samples from there on are
    /// accepted in order.
    pub(crate) fn restart_at(&mut self, id: RenderFrameId) {
        let first_input = self.converter.to_input_frame_id(id);
        let below = first_input - 1;
        let (start, end) = self.input_window();
        if first_input < start || first_input > end {
            debug!(
                frame = %id,
                input_frame = %first_input,
                start = %start,
                end = %end,
                "Restarting input cache window"
            );
            self.input_frames.clear_at(first_input);
            self.cursors.last_all_confirmed_input_frame_id = below;
        } else if self.cursors.last_all_confirmed_input_frame_id < below {
            self.cursors.last_all_confirmed_input_frame_id = below;
        }
        self.cursors.last_upsync_input_frame_id = self.cursors.last_upsync_input_frame_id.max(below);

        self.cursors.render_frame_id = id;
        self.cursors.chaser_render_frame_id = id;
        self.cursors.last_all_confirmed_render_frame_id = id;
        self.overrun = None;
    }

    /// Discards both caches and all cursors, and starts a new generation.
    pub fn reset(&mut self) {
        self.render_frames.clear();
        self.input_frames.clear();
        self.cursors = FrameCursors::default();
        self.num_seats = 0;
        self.overrun = None;
        self.generation += 1;
        debug!(generation = self.generation, "Sync layer reset");
    }
}

impl InvariantChecker for SyncLayer {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.render_frames.check_invariants()?;
        self.input_frames.check_invariants()?;

        let cursors = self.cursors;
        if !cursors.render_frame_id.is_valid() {
            return Ok(());
        }
        if cursors.last_all_confirmed_render_frame_id > cursors.chaser_render_frame_id {
            return Err(InvariantViolation::new("SyncLayer", "watermark above chase cursor")
                .with_details(format!(
                    "watermark={}, chaser={}",
                    cursors.last_all_confirmed_render_frame_id, cursors.chaser_render_frame_id
                )));
        }
        if cursors.chaser_render_frame_id > cursors.render_frame_id {
            return Err(InvariantViolation::new("SyncLayer", "chase cursor above tip")
                .with_details(format!(
                    "chaser={}, tip={}",
                    cursors.chaser_render_frame_id, cursors.render_frame_id
                )));
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

    fn layer(render_capacity: usize) -> SyncLayer {
        SyncLayer::new(FrameIdConverter::new(8, 2), render_capacity, 16)
    }

    fn frame(id: i32) -> RenderFrame {
        RenderFrame::new(RenderFrameId::new(id))
    }

    #[test]
    fn store_keeps_watermark_frame() {
        let mut layer = layer(32);
        for id in 0..10 {
            assert_eq!(layer.store_render_frame(frame(id)), SetOutcome::Consecutive);
        }
        layer.cursors.last_all_confirmed_render_frame_id = RenderFrameId::new(6);
        layer.store_render_frame(frame(10));
        assert!(layer.render_frame(RenderFrameId::new(5)).is_none());
        assert!(layer.render_frame(RenderFrameId::new(6)).is_some());
        assert_eq!(layer.render_window().0, RenderFrameId::new(6));
    }

    #[test]
    fn input_floor_is_min_of_consumed_and_confirmed() {
        let mut layer = layer(32);
        assert_eq!(layer.input_retention_floor(), InputFrameId::NULL);

        layer.cursors.last_all_confirmed_render_frame_id = RenderFrameId::new(20);
        layer.cursors.last_all_confirmed_input_frame_id = InputFrameId::new(9);
        assert_eq!(layer.input_retention_floor(), InputFrameId::new(3));

        layer.cursors.last_all_confirmed_input_frame_id = InputFrameId::new(1);
        assert_eq!(layer.input_retention_floor(), InputFrameId::new(1));
    }

    #[test]
    fn sliding_past_watermark_is_an_overrun() {
        let mut layer = layer(4);
        layer.store_render_frame(frame(0));
        layer.cursors.last_all_confirmed_render_frame_id = RenderFrameId::new(0);
        for id in 1..4 {
            layer.store_render_frame(frame(id));
        }
        assert!(layer.take_overrun().is_none());

        layer.store_render_frame(frame(4));
        assert_eq!(
            layer.take_overrun(),
            Some(DesyncReason::HistoryOverrun {
                cache: CacheKind::Render,
                floor: 0,
                start: 1,
            })
        );
        assert!(layer.take_overrun().is_none());
    }

    #[test]
    fn reset_bumps_generation_and_clears() {
        let mut layer = layer(8);
        layer.store_render_frame(frame(0));
        layer.restart_at(RenderFrameId::new(0));
        layer.reset();
        assert_eq!(layer.generation(), 1);
        assert_eq!(layer.cursors(), FrameCursors::default());
        assert!(layer.render_frame(RenderFrameId::new(0)).is_none());
    }

    #[test]
    fn restart_beyond_input_window_starts_a_fresh_one() {
        let mut layer = layer(32);
        layer.set_num_seats(1);
        for raw in 0..6 {
            layer.store_input_frame(InputFrame::neutral(InputFrameId::new(raw), 1));
        }
        layer.cursors.last_all_confirmed_input_frame_id = InputFrameId::new(2);
        layer.cursors.last_upsync_input_frame_id = InputFrameId::new(4);

        layer.restart_at(RenderFrameId::new(500));
        assert_eq!(layer.input_window(), (InputFrameId::new(123), InputFrameId::new(123)));
        assert!(layer.input_frame(InputFrameId::new(5)).is_none());
        let cursors = layer.cursors();
        assert_eq!(cursors.last_all_confirmed_input_frame_id, InputFrameId::new(122));
        assert_eq!(cursors.last_upsync_input_frame_id, InputFrameId::new(122));
        assert_eq!(cursors.render_frame_id, RenderFrameId::new(500));

        let confirmed = InputFrame::confirmed(InputFrameId::new(123), smallvec::smallvec![]);
        assert_eq!(layer.store_input_frame(confirmed), SetOutcome::Consecutive);
        assert!(layer.take_overrun().is_none());
    }

    #[test]
    fn restart_inside_input_window_keeps_it() {
        let mut layer = layer(32);
        layer.set_num_seats(1);
        for raw in 0..10 {
            layer.store_input_frame(InputFrame::neutral(InputFrameId::new(raw), 1));
        }
        layer.cursors.last_all_confirmed_input_frame_id = InputFrameId::new(7);
        layer.cursors.last_upsync_input_frame_id = InputFrameId::new(9);

        layer.restart_at(RenderFrameId::new(28));
        assert_eq!(layer.input_window(), (InputFrameId::new(0), InputFrameId::new(10)));
        let cursors = layer.cursors();
        assert_eq!(cursors.last_all_confirmed_input_frame_id, InputFrameId::new(7));
        assert_eq!(cursors.last_upsync_input_frame_id, InputFrameId::new(9));
    }

    #[test]
    fn restart_at_battle_start_leaves_input_cursors_null() {
        let mut layer = layer(8);
        layer.restart_at(RenderFrameId::new(0));
        let cursors = layer.cursors();
        assert_eq!(cursors.last_all_confirmed_input_frame_id, InputFrameId::NULL);
        assert_eq!(cursors.last_upsync_input_frame_id, InputFrameId::NULL);
        assert_eq!(layer.input_window(), (InputFrameId::new(0), InputFrameId::new(0)));
    }

    #[test]
    fn invariants_catch_chaser_above_tip() {
        let mut layer = layer(8);
        layer.restart_at(RenderFrameId::new(3));
        assert!(layer.check_invariants().is_ok());
        layer.cursors.chaser_render_frame_id = RenderFrameId::new(4);
        assert!(layer.check_invariants().is_err());
    }
}
