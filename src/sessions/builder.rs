use std::sync::Arc;

use web_time::Duration;

use crate::collision::{CollisionSpace, SatCollisionSpace};
use crate::error::{RollbackError, RollbackResult};
use crate::sessions::battle_session::BattleSession;
use crate::sessions::config::{BarrierPolygon, BattleConfig};
use crate::telemetry::ViolationObserver;
use crate::upsync::LocalBinding;

/// Largest accepted input delay, in render-frames.
const MAX_INPUT_DELAY_FRAMES: u32 = 1024;
/// Largest accepted input scale. One input-frame then covers 256 render-frames.
const MAX_INPUT_SCALE_FRAMES: u32 = 8;

/// The [`SessionBuilder`] builds a [`BattleSession`].
///
/// Every value starts at [`BattleConfig::default`]. After setting the
/// appropriate values, call [`start`](Self::start) to validate them and
/// construct the session.
///
/// ```
/// use rollback_chaser::{BattleConfig, JoinIndex, LocalBinding, PlayerId, SessionBuilder};
/// use web_time::Duration;
///
/// let session = SessionBuilder::new()
///     .with_config(BattleConfig::lan())
///     .with_battle_duration(Duration::from_secs(90))
///     .with_local_player(LocalBinding {
///         player_id: PlayerId::new(3),
///         join_index: JoinIndex::new(2),
///     })
///     .start()?;
/// assert_eq!(session.config().input_delay_frames, 4);
/// # Ok::<(), rollback_chaser::RollbackError>(())
/// ```
#[must_use = "SessionBuilder must be consumed by calling start()"]
#[derive(Default)]
pub struct SessionBuilder {
    config: BattleConfig,
    local: Option<LocalBinding>,
    /// Optional observer for invariant violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            config,
            local,
            violation_observer,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("config", config)
            .field("local", local)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl SessionBuilder {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn with_config(mut self, config: BattleConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the input delay, in render-frames.
    ///
    /// # Errors
    ///
    /// Returns [`RollbackError::InvalidRequest`] if `delay` exceeds 1024.
    pub fn with_input_delay(mut self, delay: u32) -> RollbackResult<Self> {
        if delay > MAX_INPUT_DELAY_FRAMES {
            return Err(RollbackError::InvalidRequest {
                info: format!("input delay {delay} exceeds {MAX_INPUT_DELAY_FRAMES}"),
            });
        }
        self.config.input_delay_frames = delay;
        Ok(self)
    }

    /// Sets the input scale: one input-frame covers `2^scale` render-frames.
    ///
    /// # Errors
    ///
    /// Returns [`RollbackError::InvalidRequest`] if `scale` exceeds 8.
    pub fn with_input_scale(mut self, scale: u32) -> RollbackResult<Self> {
        if scale > MAX_INPUT_SCALE_FRAMES {
            return Err(RollbackError::InvalidRequest {
                info: format!("input scale {scale} exceeds {MAX_INPUT_SCALE_FRAMES}"),
            });
        }
        self.config.input_scale_frames = scale;
        Ok(self)
    }

    /// Sets how many unsent input-frames force an upsync of unchanged input.
    ///
    /// # Errors
    ///
    /// Returns [`RollbackError::InvalidRequest`] if `tolerance` is 0.
    pub fn with_upsync_delay_tolerance(mut self, tolerance: u32) -> RollbackResult<Self> {
        if tolerance == 0 {
            return Err(RollbackError::InvalidRequest {
                info: "upsync delay tolerance must be at least 1".to_owned(),
            });
        }
        self.config.input_frame_upsync_delay_tolerance = tolerance;
        Ok(self)
    }

    /// Sets the catch-up budget per tick.
    ///
    /// # Errors
    ///
    /// Returns [`RollbackError::InvalidRequest`] if `frames` is 0.
    pub fn with_max_chasing_render_frames_per_update(mut self, frames: u32) -> RollbackResult<Self> {
        if frames == 0 {
            return Err(RollbackError::InvalidRequest {
                info: "the catch-up budget must be at least 1 frame".to_owned(),
            });
        }
        self.config.max_chasing_render_frames_per_update = frames;
        Ok(self)
    }

    /// Sets the minimum wall-clock time between two ticks.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Sets the number of virtual-grid units per world unit.
    pub fn with_world_to_virtual_grid_ratio(mut self, ratio: f64) -> Self {
        self.config.world_to_virtual_grid_ratio = ratio;
        self
    }

    /// Sets the battle length.
    pub fn with_battle_duration(mut self, duration: Duration) -> Self {
        self.config.battle_duration = duration;
        self
    }

    /// Adds a static obstacle.
    pub fn with_barrier(mut self, barrier: BarrierPolygon) -> Self {
        self.config.barriers.push(barrier);
        self
    }

    /// Binds the local player. Without one, the session only spectates.
    pub fn with_local_player(mut self, binding: LocalBinding) -> Self {
        self.local = Some(binding);
        self
    }

    /// Sets a custom observer for invariant violations.
    ///
    /// Cache anomalies, upsync gaps, contradicted confirmations and checksum
    /// mismatches are reported to it. Without one, violations are logged via
    /// the `tracing` crate.
    ///
    /// ```
    /// use rollback_chaser::{telemetry::CollectingObserver, SessionBuilder};
    /// use std::sync::Arc;
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let session = SessionBuilder::new()
    ///     .with_violation_observer(observer.clone())
    ///     .start()?;
    /// assert!(session.violation_observer().is_some());
    /// assert!(observer.is_empty());
    /// # Ok::<(), rollback_chaser::RollbackError>(())
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Consumes the builder to construct a [`BattleSession`] on the built-in collision engine.
    ///
    /// # Errors
    ///
    /// - Returns [`RollbackError::InvalidConfig`] if the configuration does not validate.
    /// - Returns [`RollbackError::InvalidRequest`] if the local player has join index 0.
    pub fn start(self) -> RollbackResult<BattleSession<SatCollisionSpace>> {
        self.start_with_collision_space()
    }

    /// Like [`start`](Self::start), on a caller-chosen collision engine.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub fn start_with_collision_space<C>(self) -> RollbackResult<BattleSession<C>>
    where
        C: CollisionSpace + Default,
    {
        self.config.validate()?;
        if let Some(binding) = self.local {
            if binding.join_index.seat().is_none() {
                return Err(RollbackError::InvalidRequest {
                    info: format!("local player {} has no seat", binding.player_id),
                });
            }
        }
        Ok(BattleSession::new(self.config, self.local, self.violation_observer))
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
    use crate::{BattleState, JoinIndex, PlayerId};

    #[test]
    fn builder_starts_from_defaults() {
        let builder = SessionBuilder::new();
        assert_eq!(builder.config, BattleConfig::default());
        assert!(builder.local.is_none());
    }

    #[test]
    fn input_delay_bounds() {
        assert!(SessionBuilder::new().with_input_delay(MAX_INPUT_DELAY_FRAMES).is_ok());
        assert!(matches!(
            SessionBuilder::new().with_input_delay(MAX_INPUT_DELAY_FRAMES + 1),
            Err(RollbackError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn input_scale_bounds() {
        assert!(SessionBuilder::new().with_input_scale(0).is_ok());
        assert!(SessionBuilder::new().with_input_scale(MAX_INPUT_SCALE_FRAMES + 1).is_err());
    }

    #[test]
    fn zero_tolerance_and_budget_are_rejected() {
        assert!(SessionBuilder::new().with_upsync_delay_tolerance(0).is_err());
        assert!(SessionBuilder::new().with_max_chasing_render_frames_per_update(0).is_err());
    }

    #[test]
    fn start_validates_config() {
        let result = SessionBuilder::new()
            .with_tick_interval(Duration::from_secs(5))
            .start();
        assert!(matches!(
            result,
            Err(RollbackError::InvalidConfig {
                field: "tick_interval",
                ..
            })
        ));
    }

    #[test]
    fn start_rejects_seatless_local_player() {
        let result = SessionBuilder::new()
            .with_local_player(LocalBinding {
                player_id: PlayerId::new(1),
                join_index: JoinIndex::new(0),
            })
            .start();
        assert!(matches!(result, Err(RollbackError::InvalidRequest { .. })));
    }

    #[test]
    fn start_rejects_join_index_above_max() {
        let result = SessionBuilder::new()
            .with_local_player(LocalBinding {
                player_id: PlayerId::new(1),
                join_index: JoinIndex::new(65),
            })
            .start();
        assert!(matches!(result, Err(RollbackError::InvalidRequest { .. })));
    }

    #[test]
    fn started_session_is_waiting() {
        let session = SessionBuilder::new().start().unwrap();
        assert_eq!(session.state(), BattleState::Waiting);
        assert_eq!(session.generation(), 0);
    }
}
