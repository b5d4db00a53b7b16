//! Sending unacknowledged local input to the server.
//!
//! Each batch repeats every local input-frame since the last one sent, not
//! just the newest, so the server can confirm frames for which this client's
//! input never changed.

use std::sync::Arc;

use tracing::{error, trace};

use crate::error::{RollbackError, RollbackResult};
use crate::frame_info::EncodedDirection;
use crate::messages::{InputFrameUpsync, InputFrameUpsyncBatch};
use crate::report_violation_to;
use crate::sync_layer::SyncLayer;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{InputFrameId, JoinIndex, PlayerId};

/// The local player this client simulates and upsyncs for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LocalBinding {
    /// The local player.
    pub player_id: PlayerId,
    /// The local player's seat.
    pub join_index: JoinIndex,
}

/// Decides when to upsync and assembles the batches.
pub struct UpsyncBatcher {
    delay_tolerance: i32,
    next_msg_id: u64,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for UpsyncBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            delay_tolerance,
            next_msg_id,
            violation_observer,
        } = self;

        f.debug_struct("UpsyncBatcher")
            .field("delay_tolerance", delay_tolerance)
            .field("next_msg_id", next_msg_id)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl UpsyncBatcher {
    /// Creates a batcher that sends at least every `delay_tolerance` input-frames.
    #[must_use]
    pub fn new(delay_tolerance: u32) -> Self {
        Self {
            delay_tolerance: delay_tolerance as i32,
            next_msg_id: 0,
            violation_observer: None,
        }
    }

    /// Routes anomalies to `observer` instead of the tracing fallback.
    #[must_use]
    pub fn with_violation_observer(mut self, observer: Option<Arc<dyn ViolationObserver>>) -> Self {
        self.violation_observer = observer;
        self
    }

    /// The id the next batch will carry.
    #[must_use]
    pub fn next_msg_id(&self) -> u64 {
        self.next_msg_id
    }

    /// Returns `true` if a batch should go out after sampling `current_input_frame_id`.
    ///
    /// Sends when the local input changed, or when `delay_tolerance` input-frames
    /// have gone unsent. Never sends without a current input.
    #[must_use]
    pub fn should_send(
        &self,
        previous: Option<EncodedDirection>,
        current: Option<EncodedDirection>,
        last_upsync_input_frame_id: InputFrameId,
        current_input_frame_id: InputFrameId,
    ) -> bool {
        let Some(current) = current else {
            return false;
        };
        current_input_frame_id - last_upsync_input_frame_id >= self.delay_tolerance
            || previous != Some(current)
    }

    /// Builds the batch covering every local input-frame after the last one
    /// sent, up to and including `latest`, and marks them as sent.
    ///
    /// The range is clipped to the start of the input cache. Frames missing
    /// from the cache are reported and skipped.
    ///
    /// # Errors
    ///
    /// [`RollbackError::MissingBinding`] if no player is bound.
    pub fn build_batch(
        &mut self,
        layer: &mut SyncLayer,
        binding: Option<LocalBinding>,
        latest: InputFrameId,
    ) -> RollbackResult<InputFrameUpsyncBatch> {
        let binding = binding.ok_or(RollbackError::MissingBinding)?;
        if binding.join_index.seat().is_none() {
            return Err(RollbackError::MissingBinding);
        }

        let cursors = layer.cursors();
        let (window_start, _) = layer.input_window();
        let start = cursors.last_upsync_input_frame_id.next().max(window_start);

        let mut frames = Vec::with_capacity((latest - start + 1).max(0) as usize);
        for raw in start.as_i32()..=latest.as_i32() {
            let input_frame_id = InputFrameId::new(raw);
            match layer.input_frame(input_frame_id) {
                Some(frame) => frames.push(InputFrameUpsync {
                    input_frame_id,
                    encoded_direction: frame.input_of(binding.join_index),
                }),
                None => {
                    error!(
                        input_frame = %input_frame_id,
                        start = %start,
                        latest = %latest,
                        "Local input frame missing from upsync range"
                    );
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Error,
                        ViolationKind::Upsync,
                        "input frame {} missing from upsync range {}..={}",
                        input_frame_id,
                        start,
                        latest
                    );
                },
            }
        }

        layer.cursors.last_upsync_input_frame_id = latest;
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;
        trace!(msg_id, frames = frames.len(), latest = %latest, "Built upsync batch");

        Ok(InputFrameUpsyncBatch {
            msg_id,
            player_id: binding.player_id,
            join_index: binding.join_index,
            acking_render_frame_id: cursors.last_all_confirmed_render_frame_id,
            acking_input_frame_id: cursors.last_all_confirmed_input_frame_id,
            frames,
        })
    }

    /// Restarts message ids for a new battle.
    pub fn reset(&mut self) {
        self.next_msg_id = 0;
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
    use crate::frame_info::InputFrame;
    use crate::telemetry::CollectingObserver;
    use smallvec::smallvec;

    fn binding() -> LocalBinding {
        LocalBinding {
            player_id: PlayerId::new(11),
            join_index: JoinIndex::new(2),
        }
    }

    fn dir(raw: u32) -> EncodedDirection {
        EncodedDirection::new(raw)
    }

    fn id(raw: i32) -> InputFrameId {
        InputFrameId::new(raw)
    }

    fn layer_with_frames(ids: std::ops::Range<i32>) -> SyncLayer {
        let mut layer = SyncLayer::new(FrameIdConverter::new(8, 2), 32, 32);
        layer.set_num_seats(2);
        for raw in ids {
            layer.store_input_frame(InputFrame {
                input_frame_id: id(raw),
                input_list: smallvec![dir(0), dir(raw as u32 % 13)],
                confirmed_list: 0b10,
            });
        }
        layer
    }

    #[test]
    fn no_current_input_never_sends() {
        let batcher = UpsyncBatcher::new(2);
        assert!(!batcher.should_send(None, None, InputFrameId::NULL, id(100)));
    }

    #[test]
    fn changed_input_sends_immediately() {
        let batcher = UpsyncBatcher::new(2);
        assert!(batcher.should_send(Some(dir(1)), Some(dir(2)), id(9), id(10)));
        assert!(!batcher.should_send(Some(dir(2)), Some(dir(2)), id(9), id(10)));
    }

    #[test]
    fn idle_input_sends_once_gap_reaches_tolerance() {
        let batcher = UpsyncBatcher::new(2);
        assert!(!batcher.should_send(Some(dir(0)), Some(dir(0)), id(9), id(10)));
        assert!(batcher.should_send(Some(dir(0)), Some(dir(0)), id(8), id(10)));
        assert!(batcher.should_send(Some(dir(0)), Some(dir(0)), InputFrameId::NULL, id(1)));
    }

    #[test]
    fn batch_covers_unsent_range_and_advances_cursor() {
        let mut layer = layer_with_frames(0..6);
        layer.cursors.last_upsync_input_frame_id = id(2);
        let mut batcher = UpsyncBatcher::new(2);

        let batch = batcher.build_batch(&mut layer, Some(binding()), id(5)).unwrap();
        let ids: Vec<i32> = batch.frames.iter().map(|f| f.input_frame_id.as_i32()).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(batch.frames[0].encoded_direction, dir(3));
        assert_eq!(batch.msg_id, 0);
        assert_eq!(batch.join_index, JoinIndex::new(2));
        assert_eq!(layer.cursors().last_upsync_input_frame_id, id(5));

        let next = batcher.build_batch(&mut layer, Some(binding()), id(5)).unwrap();
        assert!(next.frames.is_empty());
        assert_eq!(next.msg_id, 1);
    }

    #[test]
    fn batch_is_clipped_to_cache_start() {
        let mut layer = SyncLayer::new(FrameIdConverter::new(8, 2), 32, 32);
        layer.set_num_seats(2);
        layer.store_input_frame(InputFrame::neutral(id(20), 2));
        layer.store_input_frame(InputFrame::neutral(id(21), 2));

        let mut batcher = UpsyncBatcher::new(2);
        let batch = batcher.build_batch(&mut layer, Some(binding()), id(21)).unwrap();
        let ids: Vec<i32> = batch.frames.iter().map(|f| f.input_frame_id.as_i32()).collect();
        assert_eq!(ids, vec![20, 21]);
    }

    #[test]
    fn gaps_are_reported_but_do_not_abort() {
        let mut layer = layer_with_frames(0..3);
        let observer = Arc::new(CollectingObserver::new());
        let mut batcher = UpsyncBatcher::new(2)
            .with_violation_observer(Some(observer.clone() as Arc<dyn ViolationObserver>));

        let batch = batcher.build_batch(&mut layer, Some(binding()), id(4)).unwrap();
        assert_eq!(batch.frames.len(), 3);
        assert_eq!(observer.violations_of_kind(ViolationKind::Upsync).len(), 2);
        assert_eq!(layer.cursors().last_upsync_input_frame_id, id(4));
    }

    #[test]
    fn unbound_player_is_missing_binding() {
        let mut layer = layer_with_frames(0..3);
        let mut batcher = UpsyncBatcher::new(2);
        assert_eq!(
            batcher.build_batch(&mut layer, None, id(2)),
            Err(RollbackError::MissingBinding)
        );
        assert_eq!(layer.cursors().last_upsync_input_frame_id, InputFrameId::NULL);
    }
}
