//! Mapping between render-frame ids and input-frame ids.
//!
//! A local input sampled at render-frame `r` belongs to input-frame
//! `r >> scale`, but it is not consumed by the simulation until `delay`
//! render-frames later. Every input-frame therefore covers the `2^scale`
//! consecutive render-frames starting at `(inputFrameId << scale) + delay`.
//!
//! ```
//! use rollback_chaser::{FrameIdConverter, InputFrameId, RenderFrameId};
//!
//! let converter = FrameIdConverter::new(8, 2);
//! assert_eq!(converter.to_input_frame_id(RenderFrameId::new(12)), InputFrameId::new(1));
//! assert_eq!(converter.first_render_frame_id(InputFrameId::new(1)), RenderFrameId::new(12));
//! assert_eq!(converter.last_render_frame_id(InputFrameId::new(1)), RenderFrameId::new(15));
//! ```

use crate::{InputFrameId, RenderFrameId};

/// Pure arithmetic over the per-battle input delay and scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameIdConverter {
    input_delay_frames: i32,
    input_scale_frames: u32,
}

impl FrameIdConverter {
    /// Creates a converter for a battle with the given input delay (in
    /// render-frames) and input scale (log2 of render-frames per input-frame).
    #[must_use]
    pub const fn new(input_delay_frames: u32, input_scale_frames: u32) -> Self {
        Self {
            input_delay_frames: input_delay_frames as i32,
            input_scale_frames,
        }
    }

    /// Render-frames between sampling an input and its earliest legal use.
    #[must_use]
    pub const fn input_delay_frames(&self) -> i32 {
        self.input_delay_frames
    }

    /// Log2 of the number of render-frames one input-frame covers.
    #[must_use]
    pub const fn input_scale_frames(&self) -> u32 {
        self.input_scale_frames
    }

    /// Number of render-frames covered by one input-frame.
    #[must_use]
    pub const fn render_frames_per_input_frame(&self) -> i32 {
        1 << self.input_scale_frames
    }

    /// The input-frame consumed when stepping render-frame `render_frame_id`.
    ///
    /// Render-frames inside the initial delay all consume input-frame 0.
    #[must_use]
    pub const fn to_input_frame_id(&self, render_frame_id: RenderFrameId) -> InputFrameId {
        self.to_input_frame_id_with_delay(render_frame_id, self.input_delay_frames)
    }

    /// Same as [`to_input_frame_id`](Self::to_input_frame_id) with an explicit delay.
    #[must_use]
    pub const fn to_input_frame_id_with_delay(
        &self,
        render_frame_id: RenderFrameId,
        delay: i32,
    ) -> InputFrameId {
        let r = render_frame_id.as_i32();
        if r < delay {
            return InputFrameId::new(0);
        }
        InputFrameId::new((r - delay) >> self.input_scale_frames)
    }

    /// The input-frame the local player samples into at `render_frame_id`.
    #[must_use]
    pub const fn sampling_input_frame_id(&self, render_frame_id: RenderFrameId) -> InputFrameId {
        self.to_input_frame_id_with_delay(render_frame_id, 0)
    }

    /// The first render-frame that consumes `input_frame_id`.
    #[must_use]
    pub const fn first_render_frame_id(&self, input_frame_id: InputFrameId) -> RenderFrameId {
        RenderFrameId::new((input_frame_id.as_i32() << self.input_scale_frames) + self.input_delay_frames)
    }

    /// The earliest render-frame whose step reads `input_frame_id`.
    ///
    /// Same as [`first_render_frame_id`](Self::first_render_frame_id) except for
    /// input-frame 0, which the initial delay also feeds from render-frame 0 on.
    #[must_use]
    pub const fn earliest_consumer(&self, input_frame_id: InputFrameId) -> RenderFrameId {
        if input_frame_id.as_i32() <= 0 {
            return RenderFrameId::new(0);
        }
        self.first_render_frame_id(input_frame_id)
    }

    /// The last render-frame that consumes `input_frame_id`.
    #[must_use]
    pub const fn last_render_frame_id(&self, input_frame_id: InputFrameId) -> RenderFrameId {
        RenderFrameId::new(
            self.first_render_frame_id(input_frame_id).as_i32() + self.render_frames_per_input_frame() - 1,
        )
    }

    /// Returns `true` if a new input-frame starts at `render_frame_id`, i.e.
    /// the local input must be sampled on this tick.
    #[must_use]
    pub const fn is_sample_boundary(&self, render_frame_id: RenderFrameId) -> bool {
        render_frame_id.as_i32() & (self.render_frames_per_input_frame() - 1) == 0
    }
}

impl Default for FrameIdConverter {
    fn default() -> Self {
        Self::new(8, 2)
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
    use proptest::prelude::*;

    fn r(id: i32) -> RenderFrameId {
        RenderFrameId::new(id)
    }

    fn i(id: i32) -> InputFrameId {
        InputFrameId::new(id)
    }

    #[test]
    fn delay_eight_scale_two_reference_values() {
        let converter = FrameIdConverter::new(8, 2);
        assert_eq!(converter.to_input_frame_id(r(0)), i(0));
        assert_eq!(converter.to_input_frame_id(r(7)), i(0));
        assert_eq!(converter.to_input_frame_id(r(8)), i(0));
        assert_eq!(converter.to_input_frame_id(r(12)), i(1));
        assert_eq!(converter.first_render_frame_id(i(1)), r(12));
    }

    #[test]
    fn input_frame_zero_is_consumed_from_the_start() {
        let converter = FrameIdConverter::new(8, 2);
        assert_eq!(converter.first_render_frame_id(i(0)), r(8));
        assert_eq!(converter.earliest_consumer(i(0)), r(0));
        assert_eq!(converter.earliest_consumer(i(3)), r(20));
    }

    #[test]
    fn null_render_frame_maps_to_first_input_frame() {
        let converter = FrameIdConverter::new(8, 2);
        assert_eq!(converter.to_input_frame_id(RenderFrameId::NULL), i(0));
    }

    #[test]
    fn sample_boundaries_follow_scale() {
        let converter = FrameIdConverter::new(8, 2);
        let boundaries: Vec<i32> = (0..13)
            .filter(|id| converter.is_sample_boundary(r(*id)))
            .collect();
        assert_eq!(boundaries, vec![0, 4, 8, 12]);

        let every_frame = FrameIdConverter::new(3, 0);
        assert!((0..10).all(|id| every_frame.is_sample_boundary(r(id))));
    }

    #[test]
    fn sampling_ignores_delay() {
        let converter = FrameIdConverter::new(8, 2);
        assert_eq!(converter.sampling_input_frame_id(r(0)), i(0));
        assert_eq!(converter.sampling_input_frame_id(r(4)), i(1));
        assert_eq!(converter.sampling_input_frame_id(r(11)), i(2));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: miri_case_count(),
            ..ProptestConfig::default()
        })]

        /// Every render-frame in an input-frame's span maps back to it.
        #[test]
        fn span_maps_back_to_input_frame(
            delay in 0u32..32,
            scale in 0u32..5,
            input in 0i32..10_000,
        ) {
            let converter = FrameIdConverter::new(delay, scale);
            let first = converter.first_render_frame_id(i(input));
            let last = converter.last_render_frame_id(i(input));
            prop_assert_eq!(last - first + 1, converter.render_frames_per_input_frame());
            for render in first.as_i32()..=last.as_i32() {
                prop_assert_eq!(converter.to_input_frame_id(r(render)), i(input));
            }
        }

        /// Input is always sampled strictly before it is consumed when delay > 0.
        #[test]
        fn sampled_frame_precedes_consumption(
            delay in 1u32..32,
            scale in 0u32..5,
            render in 0i32..10_000,
        ) {
            let converter = FrameIdConverter::new(delay, scale);
            prop_assert!(converter.to_input_frame_id(r(render)) <= converter.sampling_input_frame_id(r(render)));
        }
    }
}
