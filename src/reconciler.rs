//! Folding server-confirmed input into local history.
//!
//! Confirmations overwrite whatever the client predicted. When the first
//! confirmation of a batch differs from the prediction that was simulated,
//! the chase cursor is rewound to the first render-frame that consumed it so
//! the next ticks replay from there.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::{DesyncReason, RollbackResult};
use crate::messages::InputFrameDownsyncBatch;
use crate::report_violation_to;
use crate::ring_buffer::SetOutcome;
use crate::sync_layer::SyncLayer;
use crate::telemetry::{
    report_to_observer, Violation, ViolationKind, ViolationObserver, ViolationSeverity,
};
use crate::{BattleState, InputFrameId, RenderFrameId};

/// What one call to [`DownsyncReconciler::reconcile`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Confirmations stored.
    pub applied: usize,
    /// Confirmations skipped because they were older than the confirmed-input watermark.
    pub stale: usize,
    /// The first confirmation that differed from the local prediction.
    pub first_mismatch: Option<InputFrameId>,
    /// Where the chase cursor was rewound to.
    pub rewound_to: Option<RenderFrameId>,
    /// Set if the mismatch lies below the render watermark.
    pub contradicted: Option<DesyncReason>,
}

/// Applies inbound confirmation batches to a [`SyncLayer`].
#[derive(Default)]
pub struct DownsyncReconciler {
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for DownsyncReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownsyncReconciler")
            .field("has_violation_observer", &self.violation_observer.is_some())
            .finish()
    }
}

impl DownsyncReconciler {
    /// Creates a reconciler that reports anomalies through `observer`, or tracing if `None`.
    #[must_use]
    pub fn new(observer: Option<Arc<dyn ViolationObserver>>) -> Self {
        Self {
            violation_observer: observer,
        }
    }

    /// Applies `batch` in order.
    ///
    /// Does nothing unless the battle is [`BattleState::InBattle`] or
    /// [`BattleState::InSettlement`].
    pub fn reconcile(
        &self,
        layer: &mut SyncLayer,
        state: BattleState,
        batch: &InputFrameDownsyncBatch,
    ) -> RollbackResult<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        if !matches!(state, BattleState::InBattle | BattleState::InSettlement) {
            trace!(%state, frames = batch.frames.len(), "Ignoring downsync batch");
            return Ok(outcome);
        }

        for downsync in &batch.frames {
            let input_frame_id = downsync.input_frame_id;
            let watermark = layer.cursors().last_all_confirmed_input_frame_id;
            if input_frame_id < watermark {
                debug!(input_frame = %input_frame_id, watermark = %watermark, "Skipping stale confirmation");
                outcome.stale += 1;
                continue;
            }

            let confirmed = downsync.clone().into_input_frame(layer.num_seats());
            if outcome.first_mismatch.is_none() {
                if let Some(local) = layer.input_frame(input_frame_id) {
                    if local.input_list != confirmed.input_list {
                        outcome.first_mismatch = Some(input_frame_id);
                    }
                }
            }

            match layer.store_input_frame(confirmed) {
                SetOutcome::Consecutive => {},
                SetOutcome::NonConsecutive => {
                    warn!(input_frame = %input_frame_id, "Confirmation restarted the input cache window");
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::InputCache,
                        "confirmation of input frame {} skipped ahead of the input cache",
                        input_frame_id
                    );
                },
                SetOutcome::Failed => {
                    warn!(input_frame = %input_frame_id, "Confirmation is older than the input cache window");
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::InputCache,
                        "confirmation of input frame {} could not be stored",
                        input_frame_id
                    );
                    continue;
                },
            }
            layer.cursors.last_all_confirmed_input_frame_id = input_frame_id;
            outcome.applied += 1;
        }

        let Some(mismatch) = outcome.first_mismatch else {
            return Ok(outcome);
        };

        let cursors = layer.cursors();
        let first_consumer = layer.converter().earliest_consumer(mismatch);
        if first_consumer >= cursors.render_frame_id {
            debug!(input_frame = %mismatch, first_consumer = %first_consumer, "Mismatch not simulated yet");
        } else if first_consumer < cursors.last_all_confirmed_render_frame_id {
            let reason = DesyncReason::ConfirmedHistoryContradicted {
                input_frame: mismatch,
                watermark: cursors.last_all_confirmed_render_frame_id,
            };
            let violation = Violation::new(
                ViolationSeverity::Critical,
                ViolationKind::Reconciliation,
                reason.to_string(),
                concat!(file!(), ":", line!()),
            )
            .with_frame(mismatch.as_i32())
            .with_context("first_consumer", first_consumer.to_string())
            .with_context("watermark", cursors.last_all_confirmed_render_frame_id.to_string());
            report_to_observer(self.violation_observer.as_ref(), &violation);
            outcome.contradicted = Some(reason);
        } else if first_consumer < cursors.chaser_render_frame_id {
            // A chase cursor already at the first consumer replays it next tick anyway.
            warn!(
                input_frame = %mismatch,
                from = %cursors.chaser_render_frame_id,
                to = %first_consumer,
                tip = %cursors.render_frame_id,
                "Misprediction detected, rewinding chase cursor"
            );
            layer.cursors.chaser_render_frame_id = first_consumer;
            outcome.rewound_to = Some(first_consumer);
        }
        Ok(outcome)
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
    use crate::frame_info::{EncodedDirection, InputFrame};
    use crate::messages::InputFrameDownsync;
    use crate::telemetry::CollectingObserver;
    use smallvec::smallvec;

    fn dir(raw: u32) -> EncodedDirection {
        EncodedDirection::new(raw)
    }

    fn id(raw: i32) -> InputFrameId {
        InputFrameId::new(raw)
    }

    fn confirm(frames: &[(i32, u32, u32)]) -> InputFrameDownsyncBatch {
        InputFrameDownsyncBatch {
            frames: frames
                .iter()
                .map(|&(raw, a, b)| InputFrameDownsync {
                    input_frame_id: id(raw),
                    input_list: smallvec![dir(a), dir(b)],
                })
                .collect(),
        }
    }

    /// Predicted frames 0..=7 with seat 2 holding `predicted`, tip at render-frame 40.
    fn predicted_layer(predicted: u32) -> SyncLayer {
        let mut layer = SyncLayer::new(FrameIdConverter::new(8, 2), 64, 64);
        layer.set_num_seats(2);
        for raw in 0..8 {
            layer.store_input_frame(InputFrame {
                input_frame_id: id(raw),
                input_list: smallvec![dir(0), dir(predicted)],
                confirmed_list: 0b01,
            });
        }
        layer.cursors.render_frame_id = RenderFrameId::new(40);
        layer.cursors.chaser_render_frame_id = RenderFrameId::new(40);
        layer.cursors.last_all_confirmed_render_frame_id = RenderFrameId::new(0);
        layer
    }

    #[test]
    fn ignored_outside_battle() {
        let mut layer = predicted_layer(1);
        let outcome = DownsyncReconciler::default()
            .reconcile(&mut layer, BattleState::Waiting, &confirm(&[(0, 0, 2)]))
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::default());
        assert_eq!(layer.cursors().last_all_confirmed_input_frame_id, InputFrameId::NULL);
    }

    #[test]
    fn matching_confirmations_advance_watermark_without_rewind() {
        let mut layer = predicted_layer(1);
        let outcome = DownsyncReconciler::default()
            .reconcile(&mut layer, BattleState::InBattle, &confirm(&[(0, 0, 1), (1, 0, 1)]))
            .unwrap();
        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.first_mismatch, None);
        assert_eq!(layer.cursors().last_all_confirmed_input_frame_id, id(1));
        assert!(layer.input_frame(id(1)).unwrap().is_all_confirmed(2));
    }

    #[test]
    fn extra_seats_in_a_confirmation_are_dropped() {
        let mut layer = predicted_layer(1);
        let batch = InputFrameDownsyncBatch {
            frames: vec![InputFrameDownsync {
                input_frame_id: id(0),
                input_list: smallvec![dir(0), dir(1), dir(6)],
            }],
        };
        let outcome = DownsyncReconciler::default()
            .reconcile(&mut layer, BattleState::InBattle, &batch)
            .unwrap();
        assert_eq!(outcome.first_mismatch, None);
        assert_eq!(layer.cursors().last_all_confirmed_input_frame_id, id(0));

        let stored = layer.input_frame(id(0)).unwrap();
        assert_eq!(stored.input_list.as_slice(), &[dir(0), dir(1)]);
        assert!(stored.is_all_confirmed(2));
    }

    #[test]
    fn mismatch_rewinds_chase_cursor_to_first_consumer() {
        let mut layer = predicted_layer(1);
        let batch = confirm(&[(4, 0, 1), (5, 0, 2), (6, 0, 3)]);
        let outcome = DownsyncReconciler::default()
            .reconcile(&mut layer, BattleState::InBattle, &batch)
            .unwrap();
        assert_eq!(outcome.first_mismatch, Some(id(5)));
        assert_eq!(outcome.rewound_to, Some(RenderFrameId::new(28)));
        assert_eq!(layer.cursors().chaser_render_frame_id, RenderFrameId::new(28));
        assert_eq!(layer.cursors().last_all_confirmed_input_frame_id, id(6));
        assert_eq!(layer.input_frame(id(5)).unwrap().input_list[1], dir(2));
    }

    #[test]
    fn mismatch_at_first_input_frame_rewinds_to_battle_start() {
        let mut layer = predicted_layer(1);
        let outcome = DownsyncReconciler::default()
            .reconcile(&mut layer, BattleState::InBattle, &confirm(&[(0, 0, 4)]))
            .unwrap();
        assert_eq!(outcome.rewound_to, Some(RenderFrameId::new(0)));
    }

    #[test]
    fn mismatch_beyond_tip_does_not_rewind() {
        let mut layer = predicted_layer(1);
        layer.cursors.render_frame_id = RenderFrameId::new(20);
        layer.cursors.chaser_render_frame_id = RenderFrameId::new(20);
        let outcome = DownsyncReconciler::default()
            .reconcile(&mut layer, BattleState::InBattle, &confirm(&[(5, 0, 2)]))
            .unwrap();
        assert_eq!(outcome.first_mismatch, Some(id(5)));
        assert_eq!(outcome.rewound_to, None);
        assert_eq!(layer.cursors().chaser_render_frame_id, RenderFrameId::new(20));
    }

    #[test]
    fn mismatch_behind_chase_cursor_only() {
        let mut layer = predicted_layer(1);
        layer.cursors.chaser_render_frame_id = RenderFrameId::new(24);
        let outcome = DownsyncReconciler::default()
            .reconcile(&mut layer, BattleState::InSettlement, &confirm(&[(5, 0, 2)]))
            .unwrap();
        assert_eq!(outcome.rewound_to, None);
        assert_eq!(layer.cursors().chaser_render_frame_id, RenderFrameId::new(24));
    }

    #[test]
    fn chase_cursor_at_first_consumer_is_left_alone() {
        let mut layer = predicted_layer(1);
        layer.cursors.chaser_render_frame_id = RenderFrameId::new(28);
        let outcome = DownsyncReconciler::default()
            .reconcile(&mut layer, BattleState::InBattle, &confirm(&[(5, 0, 2)]))
            .unwrap();
        assert_eq!(outcome.first_mismatch, Some(id(5)));
        assert_eq!(outcome.rewound_to, None);
        assert_eq!(layer.cursors().chaser_render_frame_id, RenderFrameId::new(28));
    }

    #[test]
    fn stale_confirmations_are_skipped() {
        let mut layer = predicted_layer(1);
        layer.cursors.last_all_confirmed_input_frame_id = id(3);
        let outcome = DownsyncReconciler::default()
            .reconcile(&mut layer, BattleState::InBattle, &confirm(&[(2, 0, 9), (3, 0, 1)]))
            .unwrap();
        assert_eq!(outcome.stale, 1);
        assert_eq!(outcome.applied, 1);
        assert_eq!(layer.input_frame(id(2)).unwrap().input_list[1], dir(1));
    }

    #[test]
    fn contradiction_below_watermark_is_reported() {
        let mut layer = predicted_layer(1);
        layer.cursors.last_all_confirmed_render_frame_id = RenderFrameId::new(32);
        layer.cursors.chaser_render_frame_id = RenderFrameId::new(36);
        let observer = Arc::new(CollectingObserver::new());
        let reconciler = DownsyncReconciler::new(Some(observer.clone() as Arc<dyn ViolationObserver>));

        let outcome = reconciler
            .reconcile(&mut layer, BattleState::InBattle, &confirm(&[(5, 0, 2)]))
            .unwrap();
        assert!(matches!(
            outcome.contradicted,
            Some(DesyncReason::ConfirmedHistoryContradicted { .. })
        ));
        assert_eq!(layer.cursors().chaser_render_frame_id, RenderFrameId::new(36));
        assert!(observer.has_violation(ViolationKind::Reconciliation));

        let violations = observer.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].frame, Some(5));
        assert_eq!(violations[0].context.get("first_consumer").map(String::as_str), Some("28"));
        assert_eq!(violations[0].context.get("watermark").map(String::as_str), Some("32"));
    }
}
