//! Speculative input for frames the server has not confirmed yet.
//!
//! The local seat is always known exactly: it is what the player pressed. Every
//! other seat is guessed by repeating that seat's input from the newest
//! all-confirmed input-frame.
//!
//! # Determinism Requirement
//!
//! A prediction that was simulated must be the prediction that is later
//! compared against the server's confirmation. [`InputPredictor::delayed_input_frame`]
//! therefore writes its fill back into the cache instead of computing it on the side.

use tracing::{debug, warn};

use crate::frame_info::{EncodedDirection, InputFrame};
use crate::ring_buffer::SetOutcome;
use crate::sync_layer::SyncLayer;
use crate::{InputFrameId, JoinIndex};

/// Builds predicted input-frames for the local player's seat.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputPredictor {
    local_seat: Option<usize>,
}

impl InputPredictor {
    /// Creates a predictor for the given local seat. `None` means no player is bound.
    ///
    /// A join index without a seat binds nothing.
    #[must_use]
    pub fn new(local: Option<JoinIndex>) -> Self {
        Self {
            local_seat: local.and_then(JoinIndex::seat),
        }
    }

    /// The 0-based local seat, if any.
    #[must_use]
    pub fn local_seat(&self) -> Option<usize> {
        self.local_seat
    }

    /// Records the freshly sampled local direction for `input_frame_id`.
    ///
    /// Returns `(previous, current)`: the local input of the preceding
    /// input-frame, if cached, and the local input now stored for this one.
    /// Both are `None` when no player is bound.
    ///
    /// An entry the server already confirmed in full is left untouched, and
    /// its local input is returned as `current`.
    pub fn sample(
        &self,
        layer: &mut SyncLayer,
        input_frame_id: InputFrameId,
        sampled: EncodedDirection,
    ) -> (Option<EncodedDirection>, Option<EncodedDirection>) {
        let Some(seat) = self.local_seat else {
            return (None, None);
        };
        let num_seats = layer.num_seats();
        if seat >= num_seats {
            debug!(seat, num_seats, "Local seat is not part of the roster yet");
            return (None, None);
        }

        let previous = (input_frame_id.as_i32() > 0)
            .then(|| layer.input_frame(input_frame_id - 1))
            .flatten()
            .and_then(|frame| frame.input_list.get(seat).copied());

        let mut frame = match layer.input_frame(input_frame_id).cloned() {
            Some(existing) if existing.is_all_confirmed(num_seats) => {
                let confirmed = existing
                    .input_list
                    .get(seat)
                    .copied()
                    .unwrap_or(EncodedDirection::NEUTRAL);
                return (previous, Some(confirmed));
            },
            Some(existing) => existing,
            None => (input_frame_id.as_i32() > 0)
                .then(|| self.delayed_input_frame(layer, input_frame_id - 1))
                .flatten()
                .unwrap_or_else(|| InputFrame::neutral(input_frame_id, num_seats)),
        };

        frame.input_frame_id = input_frame_id;
        frame.resize_seats(num_seats);
        if let Some(slot) = frame.input_list.get_mut(seat) {
            *slot = sampled;
        }
        frame.confirmed_list = 1u64 << seat;

        let (_, end) = layer.input_window();
        if end < input_frame_id {
            debug!(from = %end, to = %input_frame_id, "Filling input cache gap with the local sample");
            for raw in end.as_i32()..input_frame_id.as_i32() {
                let mut gap = frame.clone();
                gap.input_frame_id = InputFrameId::new(raw);
                layer.store_input_frame(gap);
            }
        }

        match layer.store_input_frame(frame) {
            SetOutcome::Consecutive => {},
            SetOutcome::NonConsecutive => {
                debug!(input_frame = %input_frame_id, "Local sample restarted the input cache window");
            },
            SetOutcome::Failed => {
                warn!(input_frame = %input_frame_id, "Local sample is older than the input cache window");
            },
        }
        (previous, Some(sampled))
    }

    /// Returns the input-frame the simulation consumes for `input_frame_id`.
    ///
    /// Frames above the confirmed-input watermark get every non-local seat
    /// filled from the watermark frame, and the filled copy is stored back.
    /// Returns `None` if the frame is not cached.
    pub fn delayed_input_frame(
        &self,
        layer: &mut SyncLayer,
        input_frame_id: InputFrameId,
    ) -> Option<InputFrame> {
        let num_seats = layer.num_seats();
        let watermark = layer.cursors().last_all_confirmed_input_frame_id;
        if watermark.is_valid() && input_frame_id > watermark {
            let source = layer
                .input_frame(watermark)
                .map(|frame| frame.input_list.clone());
            if let (Some(source), Some(frame)) = (source, layer.input_frame_mut(input_frame_id)) {
                if !frame.is_all_confirmed(num_seats) {
                    frame.resize_seats(num_seats);
                    for (seat, slot) in frame.input_list.iter_mut().enumerate() {
                        if Some(seat) == self.local_seat {
                            continue;
                        }
                        *slot = source
                            .get(seat)
                            .copied()
                            .unwrap_or(EncodedDirection::NEUTRAL);
                    }
                }
            }
        }
        layer.input_frame(input_frame_id).cloned()
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
    use crate::frame_id::FrameIdConverter;
    use smallvec::smallvec;

    fn layer(num_seats: usize) -> SyncLayer {
        let mut layer = SyncLayer::new(FrameIdConverter::new(8, 2), 64, 64);
        layer.set_num_seats(num_seats);
        layer
    }

    fn dir(raw: u32) -> EncodedDirection {
        EncodedDirection::new(raw)
    }

    fn id(raw: i32) -> InputFrameId {
        InputFrameId::new(raw)
    }

    #[test]
    fn unbound_predictor_samples_nothing() {
        let mut layer = layer(2);
        let predictor = InputPredictor::new(None);
        assert_eq!(predictor.sample(&mut layer, id(0), dir(3)), (None, None));
        assert!(layer.input_frame(id(0)).is_none());
    }

    #[test]
    fn sample_sets_only_local_seat_and_bit() {
        let mut layer = layer(3);
        let predictor = InputPredictor::new(Some(JoinIndex::new(2)));
        assert_eq!(predictor.sample(&mut layer, id(0), dir(4)), (None, Some(dir(4))));

        let frame = layer.input_frame(id(0)).unwrap();
        assert_eq!(frame.input_list.as_slice(), &[dir(0), dir(4), dir(0)]);
        assert_eq!(frame.confirmed_list, 0b010);
    }

    #[test]
    fn previous_is_local_input_of_preceding_frame() {
        let mut layer = layer(2);
        let predictor = InputPredictor::new(Some(JoinIndex::new(1)));
        predictor.sample(&mut layer, id(0), dir(1));
        assert_eq!(predictor.sample(&mut layer, id(1), dir(2)), (Some(dir(1)), Some(dir(2))));
    }

    #[test]
    fn fully_confirmed_entry_is_reused_verbatim() {
        let mut layer = layer(2);
        let confirmed = InputFrame::confirmed(id(0), smallvec![dir(5), dir(6)]);
        layer.store_input_frame(confirmed.clone());

        let predictor = InputPredictor::new(Some(JoinIndex::new(1)));
        assert_eq!(predictor.sample(&mut layer, id(0), dir(1)), (None, Some(dir(5))));
        assert_eq!(layer.input_frame(id(0)), Some(&confirmed));
    }

    #[test]
    fn remote_seats_repeat_last_confirmed_input() {
        let mut layer = layer(2);
        layer.store_input_frame(InputFrame::confirmed(id(0), smallvec![dir(0), dir(7)]));
        layer.cursors.last_all_confirmed_input_frame_id = id(0);

        let predictor = InputPredictor::new(Some(JoinIndex::new(1)));
        predictor.sample(&mut layer, id(1), dir(3));
        let delayed = predictor.delayed_input_frame(&mut layer, id(1)).unwrap();
        assert_eq!(delayed.input_list.as_slice(), &[dir(3), dir(7)]);
        assert_eq!(delayed.confirmed_list, 0b01);

        // The fill is what a later confirmation is compared against.
        assert_eq!(layer.input_frame(id(1)), Some(&delayed));
    }

    #[test]
    fn new_prediction_clones_filled_predecessor() {
        let mut layer = layer(2);
        layer.store_input_frame(InputFrame::confirmed(id(0), smallvec![dir(0), dir(8)]));
        layer.cursors.last_all_confirmed_input_frame_id = id(0);

        let predictor = InputPredictor::new(Some(JoinIndex::new(1)));
        predictor.sample(&mut layer, id(1), dir(3));
        predictor.sample(&mut layer, id(2), dir(4));
        let frame = layer.input_frame(id(2)).unwrap();
        assert_eq!(frame.input_list.as_slice(), &[dir(4), dir(8)]);
    }

    #[test]
    fn sample_past_window_end_fills_the_gap() {
        let mut layer = layer(2);
        layer.restart_at(crate::RenderFrameId::new(500));
        let predictor = InputPredictor::new(Some(JoinIndex::new(1)));
        predictor.sample(&mut layer, id(125), dir(2));

        assert_eq!(layer.input_window(), (id(123), id(126)));
        for raw in 123..=125 {
            let frame = layer.input_frame(id(raw)).unwrap();
            assert_eq!(frame.input_frame_id, id(raw));
            assert_eq!(frame.input_list.as_slice(), &[dir(2), dir(0)]);
            assert_eq!(frame.confirmed_list, 0b01);
        }
    }

    #[test]
    fn join_index_without_a_seat_binds_nothing() {
        let mut layer = layer(2);
        let predictor = InputPredictor::new(Some(JoinIndex::new(65)));
        assert_eq!(predictor.local_seat(), None);
        assert_eq!(predictor.sample(&mut layer, id(0), dir(1)), (None, None));
        assert_eq!(InputPredictor::new(Some(JoinIndex::new(64))).local_seat(), Some(63));
    }

    #[test]
    fn missing_frame_has_no_delayed_input() {
        let mut layer = layer(2);
        let predictor = InputPredictor::new(Some(JoinIndex::new(1)));
        assert!(predictor.delayed_input_frame(&mut layer, id(3)).is_none());
    }
}
