//! The per-tick battle driver.
//!
//! A [`BattleSession`] owns both history caches, the roster, the collision
//! space and every cursor. The host feeds it three things:
//!
//! * wall-clock ticks through [`BattleSession::tick`],
//! * authoritative frames through [`BattleSession::on_authoritative_render_frame`],
//! * confirmed input through [`BattleSession::on_input_frame_downsync_batch`],
//!
//! and carries out the [`BattleRequest`]s they return.
//!
//! # Example
//!
//! ```
//! use rollback_chaser::{
//!     AuthoritativeRenderFrame, BattleConfig, BattleRequest, BattleState, JoinIndex,
//!     LocalBinding, PlayerId, PlayerState, RenderFrameId, SessionBuilder,
//! };
//! use web_time::Instant;
//!
//! let mut session = SessionBuilder::new()
//!     .with_config(BattleConfig::offline())
//!     .with_local_player(LocalBinding {
//!         player_id: PlayerId::new(7),
//!         join_index: JoinIndex::new(1),
//!     })
//!     .start()?;
//!
//! session.on_authoritative_render_frame(&AuthoritativeRenderFrame {
//!     id: RenderFrameId::new(0),
//!     players: vec![PlayerState::new(PlayerId::new(7), JoinIndex::new(1), 0, 0)],
//!     player_metas: Vec::new(),
//!     countdown_nanos: 60_000_000_000,
//! })?;
//! assert_eq!(session.state(), BattleState::InBattle);
//!
//! for request in session.tick(Instant::now())? {
//!     match request {
//!         BattleRequest::SendUpsync { batch } => { /* hand to the transport */ },
//!         BattleRequest::ApplyRenderFrame { frame, .. } => { /* draw */ },
//!         _ => {},
//!     }
//! }
//! # Ok::<(), rollback_chaser::RollbackError>(())
//! ```

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};
use web_time::Instant;

use crate::chaser::{ReplayContext, ReplayOutcome, ReplayPass, RollbackChaser};
use crate::collision::{CollisionKey, CollisionSpace, SatCollisionSpace};
use crate::error::{CacheKind, DesyncReason, RollbackError, RollbackResult};
use crate::frame_info::{EncodedDirection, RenderFrame};
use crate::messages::{AuthoritativeRenderFrame, InputFrameDownsyncBatch, InputFrameUpsyncBatch};
use crate::prediction::InputPredictor;
use crate::reconciler::{DownsyncReconciler, ReconcileOutcome};
use crate::ring_buffer::SetOutcome;
use crate::roster::Roster;
use crate::sessions::config::BattleConfig;
use crate::stepper::SimulationStepper;
use crate::sync_layer::{FrameCursors, SyncLayer};
use crate::telemetry::{
    report_to_observer, Violation, ViolationKind, ViolationObserver, ViolationSeverity,
};
use crate::upsync::{LocalBinding, UpsyncBatcher};
use crate::{
    debug_check_invariants, BattleEvent, BattleRequest, BattleState, InputFrameId, RenderFrameId,
    BATTLE_READY_TO_START, BATTLE_START,
};

/// The maximum number of events kept in the event queue. Older events are discarded.
const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// A snapshot of every cursor and cache window, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BattleStats {
    /// The session generation.
    pub generation: u64,
    /// The battle state.
    pub state: BattleState,
    /// All cursors.
    pub cursors: FrameCursors,
    /// `[start, end)` of the render cache.
    pub render_window: (RenderFrameId, RenderFrameId),
    /// `[start, end)` of the input cache.
    pub input_window: (InputFrameId, InputFrameId),
    /// Remaining battle time.
    pub countdown_nanos: i64,
    /// Ticks in a row whose roll-forward pass could not run.
    pub consecutive_underruns: u32,
    /// Seated players.
    pub num_players: usize,
    /// The id the next upsync batch will carry.
    pub next_msg_id: u64,
}

/// One client's view of one battle.
///
/// `C` is the collision engine. It is rebuilt from `C::default()` on every
/// [`reset`](Self::reset), with the configured barriers re-inserted.
pub struct BattleSession<C = SatCollisionSpace>
where
    C: CollisionSpace + Default,
{
    config: BattleConfig,
    state: BattleState,
    layer: SyncLayer,
    roster: Roster,
    space: C,
    stepper: SimulationStepper,
    batcher: UpsyncBatcher,
    reconciler: DownsyncReconciler,
    chaser: RollbackChaser,
    local: Option<LocalBinding>,
    local_direction: EncodedDirection,
    last_tick_at: Option<Instant>,
    countdown_nanos: i64,
    consecutive_underruns: u32,
    desync: Option<DesyncReason>,
    event_queue: VecDeque<BattleEvent>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<C: CollisionSpace + Default> std::fmt::Debug for BattleSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BattleSession")
            .field("state", &self.state)
            .field("generation", &self.layer.generation())
            .field("cursors", &self.layer.cursors())
            .field("local", &self.local)
            .field("countdown_nanos", &self.countdown_nanos)
            .field("desync", &self.desync)
            .field("pending_events", &self.event_queue.len())
            .field("has_violation_observer", &self.violation_observer.is_some())
            .finish_non_exhaustive()
    }
}

impl<C: CollisionSpace + Default> BattleSession<C> {
    pub(crate) fn new(
        config: BattleConfig,
        local: Option<LocalBinding>,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        let layer = SyncLayer::new(
            config.converter(),
            config.render_cache_capacity,
            config.input_cache_capacity,
        );
        let space = build_space(&config);
        let countdown_nanos = config.battle_duration_nanos();
        Self {
            stepper: SimulationStepper::new(config.world_to_virtual_grid_ratio),
            batcher: UpsyncBatcher::new(config.input_frame_upsync_delay_tolerance)
                .with_violation_observer(violation_observer.clone()),
            reconciler: DownsyncReconciler::new(violation_observer.clone()),
            chaser: RollbackChaser::new(
                config.max_chasing_render_frames_per_update,
                violation_observer.clone(),
            ),
            state: BattleState::Waiting,
            layer,
            roster: Roster::new(),
            space,
            local,
            local_direction: EncodedDirection::NEUTRAL,
            last_tick_at: None,
            countdown_nanos,
            consecutive_underruns: 0,
            desync: None,
            event_queue: VecDeque::new(),
            violation_observer,
            config,
        }
    }

    // ==========================================
    // Ticking
    // ==========================================

    /// Runs one tick if at least the configured tick interval has passed since the last one.
    ///
    /// Returns no requests when the gate is closed or the battle is not
    /// [`BattleState::InBattle`].
    ///
    /// # Errors
    ///
    /// [`RollbackError::DesyncDetected`] once local history can no longer be
    /// trusted. Every further tick fails the same way until the session is
    /// resynced by an authoritative frame or [`reset`](Self::reset).
    pub fn tick(&mut self, now: Instant) -> RollbackResult<Vec<BattleRequest>> {
        if let Some(reason) = &self.desync {
            return Err(RollbackError::DesyncDetected {
                reason: reason.clone(),
            });
        }
        if self.state != BattleState::InBattle {
            return Ok(Vec::new());
        }
        if let Some(last) = self.last_tick_at {
            if now.saturating_duration_since(last) < self.config.tick_interval {
                return Ok(Vec::new());
            }
        }
        self.last_tick_at = Some(now);
        self.advance_frame()
    }

    /// Runs one tick without consulting the wall clock.
    ///
    /// In order: sample and upsync the local input at input-frame boundaries,
    /// run the catch-up pass, roll the tip forward by one frame, update the
    /// countdown, and finally advance the tip.
    ///
    /// # Errors
    ///
    /// [`RollbackError::DesyncDetected`] as for [`tick`](Self::tick), and
    /// [`RollbackError::InternalError`] if the simulation itself fails.
    pub fn advance_frame(&mut self) -> RollbackResult<Vec<BattleRequest>> {
        if let Some(reason) = &self.desync {
            return Err(RollbackError::DesyncDetected {
                reason: reason.clone(),
            });
        }
        if self.state != BattleState::InBattle {
            trace!(state = %self.state, "Not in battle, skipping frame");
            return Ok(Vec::new());
        }

        let mut requests = Vec::new();
        let converter = self.layer.converter();
        let tip = self.layer.cursors().render_frame_id;

        if converter.is_sample_boundary(tip) {
            if let Some(batch) = self.sample_and_upsync(converter.sampling_input_frame_id(tip))? {
                requests.push(BattleRequest::SendUpsync { batch });
            }
        }

        let chase_from = self.layer.cursors().chaser_render_frame_id;
        let chase_to = self.chaser.chase_target(self.layer.cursors());
        if chase_from < chase_to {
            let chased = self.replay(chase_from, chase_to, ReplayPass::Chasing);
            if let Some(err) = chased.interrupted {
                self.absorb_interruption(err)?;
            }
        }

        let rolled = self.replay(tip, tip + 1, ReplayPass::RollForward);
        let stepped = rolled.stepped > 0;
        if let Some(err) = rolled.interrupted {
            self.absorb_interruption(err)?;
        }
        if stepped {
            self.consecutive_underruns = 0;
        } else {
            self.consecutive_underruns += 1;
            warn!(
                tip = %tip,
                consecutive_underruns = self.consecutive_underruns,
                grace = self.config.underrun_grace_ticks,
                "Roll-forward underrun, holding tip"
            );
            if self.consecutive_underruns >= self.config.underrun_grace_ticks {
                self.flag_desync(DesyncReason::UnderrunGraceExceeded {
                    consecutive_underruns: self.consecutive_underruns,
                });
            }
        }
        if let Some(reason) = self.layer.take_overrun() {
            self.flag_desync(reason);
        }

        if !stepped {
            return Ok(requests);
        }

        self.countdown_nanos = self
            .config
            .battle_duration_nanos()
            .saturating_sub(i64::from(tip.as_i32()).saturating_mul(self.config.tick_interval_nanos()));
        if let Some(frame) = rolled.latest {
            requests.push(BattleRequest::ApplyRenderFrame {
                frame,
                countdown_nanos: self.countdown_nanos,
            });
        }
        let settled = self.countdown_nanos <= 0;
        if settled {
            self.state = BattleState::InSettlement;
        }

        self.layer.cursors.render_frame_id = tip + 1;
        debug_check_invariants!(self.layer, "after tick");
        trace!(
            tip = %self.layer.cursors().render_frame_id,
            chaser = %self.layer.cursors().chaser_render_frame_id,
            watermark = %self.layer.cursors().last_all_confirmed_render_frame_id,
            requests = requests.len(),
            "Tick complete"
        );

        if settled {
            let frame = self.layer.cursors().render_frame_id;
            info!(frame = %frame, "Battle settled");
            self.push_event(BattleEvent::Settled { frame });
        }
        Ok(requests)
    }

    /// Runs [`advance_frame`](Self::advance_frame) `frames` times and concatenates the requests.
    ///
    /// Stops early when the battle leaves [`BattleState::InBattle`].
    ///
    /// # Errors
    ///
    /// The first error of any frame.
    pub fn advance_frames(&mut self, frames: usize) -> RollbackResult<Vec<BattleRequest>> {
        let mut requests = Vec::new();
        for _ in 0..frames {
            if self.state != BattleState::InBattle {
                break;
            }
            requests.extend(self.advance_frame()?);
        }
        Ok(requests)
    }

    fn sample_and_upsync(
        &mut self,
        sampling_id: InputFrameId,
    ) -> RollbackResult<Option<InputFrameUpsyncBatch>> {
        let (previous, current) =
            self.predictor()
                .sample(&mut self.layer, sampling_id, self.local_direction);
        let last_upsync = self.layer.cursors().last_upsync_input_frame_id;
        if !self
            .batcher
            .should_send(previous, current, last_upsync, sampling_id)
        {
            return Ok(None);
        }
        match self.batcher.build_batch(&mut self.layer, self.local, sampling_id) {
            Ok(batch) => Ok(Some(batch)),
            Err(RollbackError::MissingBinding) => {
                trace!(input_frame = %sampling_id, "No local player bound, skipping upsync");
                Ok(None)
            },
            Err(err) => Err(err),
        }
    }

    fn replay(&mut self, from: RenderFrameId, to: RenderFrameId, pass: ReplayPass) -> ReplayOutcome {
        let predictor = self.predictor();
        let mut ctx = ReplayContext {
            generation: self.layer.generation(),
            layer: &mut self.layer,
            roster: &self.roster,
            space: &mut self.space,
            predictor,
            stepper: self.stepper,
        };
        self.chaser.replay(&mut ctx, from, to, pass)
    }

    /// Turns a replay interruption into a desync, an error, or nothing.
    fn absorb_interruption(&mut self, err: RollbackError) -> RollbackResult<()> {
        match err {
            RollbackError::CacheUnderrun { .. } => Ok(()),
            RollbackError::NonConsecutiveInsert {
                cache: CacheKind::Render,
                frame,
                ..
            } => {
                self.flag_desync(DesyncReason::RenderCacheNonConsecutive {
                    frame: RenderFrameId::new(frame),
                });
                Ok(())
            },
            other => Err(other),
        }
    }

    // ==========================================
    // Inbound messages
    // ==========================================

    /// Handles a full frame from the server.
    ///
    /// * [`BATTLE_READY_TO_START`] seats every listed player.
    /// * [`BATTLE_START`], any frame that cannot be appended to the render
    ///   cache, and any frame received while desynced (re)starts the battle
    ///   at that frame.
    /// * Any other frame overwrites the local copy. If it is the render
    ///   watermark, the checksums of both copies are compared first.
    ///
    /// # Errors
    ///
    /// * [`RollbackError::InvalidState`] after [`dismiss`](Self::dismiss).
    /// * [`RollbackError::StaleRenderFrame`] for frames below the render watermark.
    pub fn on_authoritative_render_frame(
        &mut self,
        frame: &AuthoritativeRenderFrame,
    ) -> RollbackResult<Vec<BattleRequest>> {
        if self.state == BattleState::InDismissal {
            return Err(RollbackError::InvalidState {
                state: self.state,
                operation: "accept an authoritative frame",
            });
        }
        let watermark = self.layer.cursors().last_all_confirmed_render_frame_id;
        if frame.id < watermark {
            return Err(RollbackError::StaleRenderFrame {
                frame: frame.id,
                watermark,
            });
        }

        if frame.id == BATTLE_READY_TO_START {
            let requests = self.seat_players(frame);
            info!(players = self.roster.len(), "Battle ready to start");
            self.push_event(BattleEvent::ReadyToStart {
                players: self.roster.len(),
            });
            return Ok(requests);
        }

        let render_frame = frame.to_render_frame();
        if frame.id == watermark {
            self.compare_checksums(&render_frame);
        }

        let outcome = self.layer.store_render_frame(render_frame.clone());
        match outcome {
            SetOutcome::Failed => {
                return Err(RollbackError::StaleRenderFrame {
                    frame: frame.id,
                    watermark: self.layer.render_window().0,
                });
            },
            SetOutcome::Consecutive
                if frame.id != BATTLE_START
                    && self.state != BattleState::Waiting
                    && self.desync.is_none() =>
            {
                trace!(frame = %frame.id, "Refreshed cached render frame");
                return Ok(Vec::new());
            },
            _ => {},
        }

        let resync = frame.id > BATTLE_START && self.state != BattleState::Waiting;
        let mut requests = self.seat_players(frame);
        self.place_colliders(&render_frame);
        self.layer.restart_at(frame.id);
        self.countdown_nanos = frame.countdown_nanos;
        self.consecutive_underruns = 0;
        self.last_tick_at = None;
        self.desync = None;
        self.state = BattleState::InBattle;

        if resync {
            warn!(frame = %frame.id, ?outcome, "Resynced to authoritative frame");
            self.push_event(BattleEvent::Resynced { frame: frame.id });
        } else {
            info!(frame = %frame.id, players = self.roster.len(), "Battle started");
            self.push_event(BattleEvent::BattleStarted {
                generation: self.layer.generation(),
            });
        }
        debug_check_invariants!(self.layer, "after authoritative frame");

        requests.push(BattleRequest::ApplyRenderFrame {
            frame: render_frame,
            countdown_nanos: self.countdown_nanos,
        });
        Ok(requests)
    }

    /// Folds a batch of confirmed input into local history.
    ///
    /// Ignored unless the battle is [`BattleState::InBattle`] or
    /// [`BattleState::InSettlement`]. A confirmation that contradicts history
    /// below the render watermark flags a desync.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`DownsyncReconciler::reconcile`].
    pub fn on_input_frame_downsync_batch(
        &mut self,
        batch: &InputFrameDownsyncBatch,
    ) -> RollbackResult<ReconcileOutcome> {
        let outcome = self.reconciler.reconcile(&mut self.layer, self.state, batch)?;
        if let Some(input_frame) = outcome.first_mismatch {
            self.push_event(BattleEvent::MispredictionDetected {
                input_frame,
                rewound_to: outcome.rewound_to,
            });
        }
        if let Some(reason) = outcome.contradicted.clone() {
            self.flag_desync(reason);
        }
        if let Some(reason) = self.layer.take_overrun() {
            self.flag_desync(reason);
        }
        debug_check_invariants!(self.layer, "after downsync batch");
        Ok(outcome)
    }

    fn seat_players(&mut self, frame: &AuthoritativeRenderFrame) -> Vec<BattleRequest> {
        let mut requests = Vec::new();
        for player in &frame.players {
            let radius = frame
                .collider_radius_of(player.id)
                .unwrap_or(self.config.player_collider_radius);
            if player.join_index.seat().is_none() {
                warn!(player = %player.id, join_index = %player.join_index, "Player has no seat, not seating");
                continue;
            }
            if let Some(info) = self.roster.insert_if_absent(player.id, player.join_index, radius) {
                debug!(player = %player.id, join_index = %player.join_index, "Seated player");
                requests.push(BattleRequest::SpawnPlayer {
                    handle: info.presentation,
                    player_id: player.id,
                    join_index: player.join_index,
                    position: (player.virtual_grid_x, player.virtual_grid_y),
                });
            }
        }
        self.layer.set_num_seats(self.roster.num_seats());
        requests
    }

    fn place_colliders(&mut self, frame: &RenderFrame) {
        for info in self.roster.iter() {
            let Some(player) = frame.players.get(&info.player_id) else {
                continue;
            };
            let anchor = self.stepper.collider_anchor(
                player.virtual_grid_x,
                player.virtual_grid_y,
                info.collider_radius,
            );
            if !self.space.set_position(CollisionKey::for_seat(info.join_index), anchor) {
                self.stepper.insert_player_collider(
                    &mut self.space,
                    info,
                    player.virtual_grid_x,
                    player.virtual_grid_y,
                );
            }
        }
    }

    fn compare_checksums(&mut self, remote: &RenderFrame) {
        let Some(local) = self.layer.render_frame(remote.id) else {
            return;
        };
        let (local_checksum, remote_checksum) = match (local.checksum(), remote.checksum()) {
            (Ok(local), Ok(remote)) => (local, remote),
            (Err(err), _) | (_, Err(err)) => {
                warn!(frame = %remote.id, error = %err, "Could not checksum render frame");
                return;
            },
        };
        if local_checksum == remote_checksum {
            trace!(frame = %remote.id, "Watermark checksum matches");
            return;
        }

        let violation = Violation::new(
            ViolationSeverity::Error,
            ViolationKind::ChecksumMismatch,
            format!("render frame {} differs from its authoritative copy", remote.id),
            concat!(file!(), ":", line!()),
        )
        .with_frame(remote.id.as_i32())
        .with_context("local_checksum", format!("{local_checksum:#x}"))
        .with_context("remote_checksum", format!("{remote_checksum:#x}"));
        report_to_observer(self.violation_observer.as_ref(), &violation);
        self.push_event(BattleEvent::ChecksumMismatch {
            frame: remote.id,
            local_checksum,
            remote_checksum,
        });
        self.layer.cursors.chaser_render_frame_id = remote.id;
    }

    // ==========================================
    // Lifecycle
    // ==========================================

    /// Abandons the battle. Ticks and authoritative frames are refused from now on.
    pub fn dismiss(&mut self) {
        if self.state == BattleState::InDismissal {
            return;
        }
        info!(from = %self.state, "Battle dismissed");
        self.state = BattleState::InDismissal;
        self.push_event(BattleEvent::Dismissed);
    }

    /// Discards all battle state and starts a new generation.
    ///
    /// Returns a despawn request for every seated player. The local binding
    /// and configuration are kept.
    pub fn reset(&mut self) -> Vec<BattleRequest> {
        let requests = self
            .roster
            .clear()
            .into_iter()
            .map(|handle| BattleRequest::DespawnPlayer { handle })
            .collect();
        self.layer.reset();
        self.space = build_space(&self.config);
        self.batcher.reset();
        self.state = BattleState::Waiting;
        self.local_direction = EncodedDirection::NEUTRAL;
        self.last_tick_at = None;
        self.countdown_nanos = self.config.battle_duration_nanos();
        self.consecutive_underruns = 0;
        self.desync = None;

        let generation = self.layer.generation();
        info!(generation, "Battle reset");
        self.push_event(BattleEvent::Reset { generation });
        requests
    }

    // ==========================================
    // Local player
    // ==========================================

    /// Binds the local player.
    ///
    /// # Errors
    ///
    /// [`RollbackError::InvalidRequest`] for join index 0 or above [`JoinIndex::MAX`].
    pub fn set_local_player(&mut self, binding: LocalBinding) -> RollbackResult<()> {
        if binding.join_index.seat().is_none() {
            return Err(RollbackError::InvalidRequest {
                info: format!("join index {} is not a seat", binding.join_index),
            });
        }
        debug!(player = %binding.player_id, join_index = %binding.join_index, "Bound local player");
        self.local = Some(binding);
        Ok(())
    }

    /// The bound local player.
    #[must_use]
    pub fn local_binding(&self) -> Option<LocalBinding> {
        self.local
    }

    /// Sets the direction sampled at the next input-frame boundary.
    pub fn set_local_direction(&mut self, direction: EncodedDirection) {
        self.local_direction = direction;
    }

    fn predictor(&self) -> InputPredictor {
        InputPredictor::new(self.local.map(|binding| binding.join_index))
    }

    // ==========================================
    // Queries
    // ==========================================

    /// Returns all events that happened since the last call.
    pub fn events(&mut self) -> Drain<'_, BattleEvent> {
        self.event_queue.drain(..)
    }

    /// The battle state.
    #[must_use]
    pub fn state(&self) -> BattleState {
        self.state
    }

    /// Incremented by every [`reset`](Self::reset).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.layer.generation()
    }

    /// A snapshot of the cursors.
    #[must_use]
    pub fn cursors(&self) -> FrameCursors {
        self.layer.cursors()
    }

    /// Why local history is no longer trusted, if it isn't.
    #[must_use]
    pub fn desync(&self) -> Option<&DesyncReason> {
        self.desync.as_ref()
    }

    /// Remaining battle time, as of the last tick or authoritative frame.
    #[must_use]
    pub fn countdown_nanos(&self) -> i64 {
        self.countdown_nanos
    }

    /// The configuration the session was started with.
    pub fn config(&self) -> &BattleConfig {
        &self.config
    }

    /// Caches and cursors, read-only.
    #[must_use]
    pub fn sync_layer(&self) -> &SyncLayer {
        &self.layer
    }

    /// Seated players.
    #[must_use]
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// The collision space, read-only.
    #[must_use]
    pub fn collision_space(&self) -> &C {
        &self.space
    }

    /// Returns the violation observer, if one was configured.
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.violation_observer.as_ref()
    }

    /// A snapshot of every cursor and cache window.
    #[must_use]
    pub fn battle_stats(&self) -> BattleStats {
        BattleStats {
            generation: self.layer.generation(),
            state: self.state,
            cursors: self.layer.cursors(),
            render_window: self.layer.render_window(),
            input_window: self.layer.input_window(),
            countdown_nanos: self.countdown_nanos,
            consecutive_underruns: self.consecutive_underruns,
            num_players: self.roster.len(),
            next_msg_id: self.batcher.next_msg_id(),
        }
    }

    /// Logs [`battle_stats`](Self::battle_stats) at debug level.
    pub fn log_battle_stats(&self) {
        let stats = self.battle_stats();
        debug!(
            generation = stats.generation,
            state = %stats.state,
            tip = %stats.cursors.render_frame_id,
            chaser = %stats.cursors.chaser_render_frame_id,
            watermark = %stats.cursors.last_all_confirmed_render_frame_id,
            confirmed_input = %stats.cursors.last_all_confirmed_input_frame_id,
            last_upsync = %stats.cursors.last_upsync_input_frame_id,
            render_window = ?stats.render_window,
            input_window = ?stats.input_window,
            countdown_nanos = stats.countdown_nanos,
            consecutive_underruns = stats.consecutive_underruns,
            "Battle stats"
        );
    }

    fn flag_desync(&mut self, reason: DesyncReason) {
        if self.desync.is_some() {
            return;
        }
        error!(reason = %reason, cursors = ?self.layer.cursors(), "Desync detected");
        self.desync = Some(reason.clone());
        self.push_event(BattleEvent::DesyncDetected { reason });
    }

    fn push_event(&mut self, event: BattleEvent) {
        self.event_queue.push_back(event);
        // check event queue size and discard oldest events if too big
        while self.event_queue.len() > MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
    }
}

fn build_space<C: CollisionSpace + Default>(config: &BattleConfig) -> C {
    let mut space = C::default();
    for (ordinal, barrier) in config.barriers.iter().enumerate() {
        space.insert_polygon(
            CollisionKey::barrier(ordinal as u32),
            barrier.anchor,
            &barrier.points,
        );
    }
    space
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
    use crate::frame_info::PlayerState;
    use crate::{JoinIndex, PlayerId};
    use web_time::Duration;

    fn offline() -> BattleSession {
        BattleSession::new(
            BattleConfig::offline(),
            Some(LocalBinding {
                player_id: PlayerId::new(1),
                join_index: JoinIndex::new(1),
            }),
            None,
        )
    }

    fn start_frame(id: i32) -> AuthoritativeRenderFrame {
        AuthoritativeRenderFrame {
            id: RenderFrameId::new(id),
            players: vec![PlayerState::new(PlayerId::new(1), JoinIndex::new(1), 0, 0)],
            player_metas: Vec::new(),
            countdown_nanos: 1_000_000_000,
        }
    }

    #[test]
    fn max_event_queue_size_is_reasonable() {
        const _: () = assert!(MAX_EVENT_QUEUE_SIZE >= 50);
        const _: () = assert!(MAX_EVENT_QUEUE_SIZE <= 1000);
    }

    #[test]
    fn waiting_session_ticks_are_noops() {
        let mut session = offline();
        assert!(session.tick(Instant::now()).unwrap().is_empty());
        assert_eq!(session.state(), BattleState::Waiting);
    }

    #[test]
    fn ready_to_start_seats_players_without_starting() {
        let mut session = offline();
        let requests = session.on_authoritative_render_frame(&start_frame(BATTLE_READY_TO_START)).unwrap();
        assert!(matches!(requests.as_slice(), [BattleRequest::SpawnPlayer { .. }]));
        assert_eq!(session.state(), BattleState::Waiting);
        assert_eq!(
            session.events().collect::<Vec<_>>(),
            vec![BattleEvent::ReadyToStart { players: 1 }]
        );

        // Already seated: the battle start only applies the frame.
        let requests = session.on_authoritative_render_frame(&start_frame(0)).unwrap();
        assert!(matches!(requests.as_slice(), [BattleRequest::ApplyRenderFrame { .. }]));
        assert_eq!(session.state(), BattleState::InBattle);
    }

    #[test]
    fn tick_gate_respects_interval() {
        let mut session = offline();
        session.on_authoritative_render_frame(&start_frame(0)).unwrap();
        let t0 = Instant::now();
        assert!(!session.tick(t0).unwrap().is_empty());
        assert!(session.tick(t0 + Duration::from_millis(1)).unwrap().is_empty());
        assert!(!session.tick(t0 + Duration::from_millis(17)).unwrap().is_empty());
        assert_eq!(session.cursors().render_frame_id, RenderFrameId::new(2));
    }

    #[test]
    fn tip_increments_last_and_frame_is_applied() {
        let mut session = offline();
        session.on_authoritative_render_frame(&start_frame(0)).unwrap();
        session.set_local_direction(EncodedDirection::new(3));
        let requests = session.advance_frame().unwrap();
        let applied = requests
            .iter()
            .find_map(|request| match request {
                BattleRequest::ApplyRenderFrame { frame, .. } => Some(frame.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(applied.id, RenderFrameId::new(1));
        assert_eq!(applied.players[&PlayerId::new(1)].virtual_grid_x, 2);
        assert_eq!(session.cursors().render_frame_id, RenderFrameId::new(1));
    }

    #[test]
    fn dismissed_session_refuses_frames() {
        let mut session = offline();
        session.dismiss();
        assert!(matches!(
            session.on_authoritative_render_frame(&start_frame(0)),
            Err(RollbackError::InvalidState {
                state: BattleState::InDismissal,
                ..
            })
        ));
        assert_eq!(session.events().collect::<Vec<_>>(), vec![BattleEvent::Dismissed]);
    }

    #[test]
    fn stale_authoritative_frame_is_rejected() {
        let mut session = offline();
        session.on_authoritative_render_frame(&start_frame(0)).unwrap();
        session.advance_frames(5).unwrap();
        assert!(matches!(
            session.on_authoritative_render_frame(&start_frame(2)),
            Err(RollbackError::StaleRenderFrame { .. })
        ));
    }

    #[test]
    fn set_local_player_rejects_seat_zero() {
        let mut session = offline();
        let result = session.set_local_player(LocalBinding {
            player_id: PlayerId::new(1),
            join_index: JoinIndex::new(0),
        });
        assert!(matches!(result, Err(RollbackError::InvalidRequest { .. })));
    }

    #[test]
    fn set_local_player_rejects_join_index_above_max() {
        let mut session = offline();
        let result = session.set_local_player(LocalBinding {
            player_id: PlayerId::new(1),
            join_index: JoinIndex::new(65),
        });
        assert!(matches!(result, Err(RollbackError::InvalidRequest { .. })));
        assert_eq!(session.local_binding(), None);
    }

    #[test]
    fn event_queue_discards_oldest() {
        let mut session = offline();
        for _ in 0..(MAX_EVENT_QUEUE_SIZE + 5) {
            session.reset();
        }
        let events: Vec<_> = session.events().collect();
        assert_eq!(events.len(), MAX_EVENT_QUEUE_SIZE);
        assert_eq!(
            events.last(),
            Some(&BattleEvent::Reset {
                generation: (MAX_EVENT_QUEUE_SIZE + 5) as u64
            })
        );
    }
}
