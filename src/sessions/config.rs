//! One-time battle configuration.
//!
//! The server hands these values to every client before the battle starts;
//! all clients of a battle must use the same ones.
//!
//! | Preset | Purpose |
//! |--------|---------|
//! | `BattleConfig::default()` | The reference map: delay 8, scale 2 |
//! | `BattleConfig::lan()` | Low latency, short delay, fast catch-up |
//! | `BattleConfig::high_latency()` | Long delay, deep history |
//! | `BattleConfig::offline()` | Single client, no delay |
//!
//! # Example
//!
//! ```
//! use rollback_chaser::BattleConfig;
//! use web_time::Duration;
//!
//! let config = BattleConfig {
//!     battle_duration: Duration::from_secs(60),
//!     ..BattleConfig::lan()
//! };
//! assert!(config.validate().is_ok());
//! ```

use web_time::Duration;

use crate::collision::Vec2;
use crate::error::{RollbackError, RollbackResult};
use crate::frame_id::FrameIdConverter;

/// A static obstacle, as a polygon relative to its anchor.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BarrierPolygon {
    /// World position of the polygon's origin.
    pub anchor: Vec2,
    /// Convex polygon points, relative to `anchor`.
    pub points: Vec<Vec2>,
}

/// Parameters of one battle.
///
/// # Forward Compatibility
///
/// New fields may be added to this struct in future versions. Construct it
/// with the `..BattleConfig::default()` pattern.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[must_use = "BattleConfig has no effect unless passed to SessionBuilder::with_config()"]
pub struct BattleConfig {
    /// Render-frames between sampling a local input and its earliest use.
    ///
    /// Default: 8
    pub input_delay_frames: u32,

    /// Log2 of the number of render-frames one input-frame covers.
    ///
    /// Default: 2
    pub input_scale_frames: u32,

    /// Unsent input-frames after which an unchanged input is upsynced anyway.
    ///
    /// Default: 2
    pub input_frame_upsync_delay_tolerance: u32,

    /// Minimum wall-clock time between two ticks.
    ///
    /// Default: 16.666666ms
    pub tick_interval: Duration,

    /// Catch-up budget per tick.
    ///
    /// Default: 4
    pub max_chasing_render_frames_per_update: u32,

    /// Virtual-grid units per world unit.
    ///
    /// Default: 1000.0
    pub world_to_virtual_grid_ratio: f64,

    /// Length of the battle. The countdown is derived from it and the tip.
    ///
    /// Default: 3 minutes
    pub battle_duration: Duration,

    /// Render-frames kept for rollback.
    ///
    /// Default: 1024
    pub render_cache_capacity: usize,

    /// Input-frames kept for rollback and upsync.
    ///
    /// Default: 1024
    pub input_cache_capacity: usize,

    /// Collider radius of players the server sends no metadata for.
    ///
    /// Default: 12.0
    pub player_collider_radius: f64,

    /// Consecutive ticks the roll-forward pass may fail before the session reports a desync.
    ///
    /// Default: 30
    pub underrun_grace_ticks: u32,

    /// Static obstacles of the map.
    ///
    /// Default: none
    pub barriers: Vec<BarrierPolygon>,
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self {
            input_delay_frames: 8,
            input_scale_frames: 2,
            input_frame_upsync_delay_tolerance: 2,
            tick_interval: Duration::from_nanos(16_666_666),
            max_chasing_render_frames_per_update: 4,
            world_to_virtual_grid_ratio: 1000.0,
            battle_duration: Duration::from_secs(180),
            render_cache_capacity: 1024,
            input_cache_capacity: 1024,
            player_collider_radius: 12.0,
            underrun_grace_ticks: 30,
            barriers: Vec::new(),
        }
    }
}

impl BattleConfig {
    /// Creates a new `BattleConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for LAN battles: a short delay, one render-frame pair per input-frame, quick catch-up.
    pub fn lan() -> Self {
        Self {
            input_delay_frames: 4,
            input_scale_frames: 1,
            input_frame_upsync_delay_tolerance: 1,
            max_chasing_render_frames_per_update: 8,
            ..Self::default()
        }
    }

    /// Preset for 150ms+ round trips: a longer delay and deeper history.
    pub fn high_latency() -> Self {
        Self {
            input_delay_frames: 16,
            input_frame_upsync_delay_tolerance: 4,
            render_cache_capacity: 2048,
            input_cache_capacity: 2048,
            underrun_grace_ticks: 60,
            ..Self::default()
        }
    }

    /// Preset for a single client without a server round trip.
    pub fn offline() -> Self {
        Self {
            input_delay_frames: 0,
            input_scale_frames: 0,
            input_frame_upsync_delay_tolerance: 1,
            ..Self::default()
        }
    }

    /// The frame-id arithmetic of this configuration.
    #[must_use]
    pub fn converter(&self) -> FrameIdConverter {
        FrameIdConverter::new(self.input_delay_frames, self.input_scale_frames)
    }

    /// The battle duration in nanoseconds, saturating at `i64::MAX`.
    #[must_use]
    pub fn battle_duration_nanos(&self) -> i64 {
        i64::try_from(self.battle_duration.as_nanos()).unwrap_or(i64::MAX)
    }

    /// The tick interval in nanoseconds, saturating at `i64::MAX`.
    #[must_use]
    pub fn tick_interval_nanos(&self) -> i64 {
        i64::try_from(self.tick_interval.as_nanos()).unwrap_or(i64::MAX)
    }

    /// Checks every field against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns [`RollbackError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> RollbackResult<()> {
        if self.input_scale_frames > 8 {
            return Err(invalid("input_scale_frames", format!("{} exceeds 8", self.input_scale_frames)));
        }
        if self.input_delay_frames > 1024 {
            return Err(invalid("input_delay_frames", format!("{} exceeds 1024", self.input_delay_frames)));
        }
        if self.input_frame_upsync_delay_tolerance < 1 {
            return Err(invalid("input_frame_upsync_delay_tolerance", "must be at least 1"));
        }
        if self.tick_interval < Duration::from_millis(1) || self.tick_interval > Duration::from_secs(1) {
            return Err(invalid(
                "tick_interval",
                format!("{:?} is outside 1ms..=1s", self.tick_interval),
            ));
        }
        if self.max_chasing_render_frames_per_update < 1 {
            return Err(invalid("max_chasing_render_frames_per_update", "must be at least 1"));
        }
        if !(self.world_to_virtual_grid_ratio.is_finite() && self.world_to_virtual_grid_ratio > 0.0) {
            return Err(invalid(
                "world_to_virtual_grid_ratio",
                format!("{} is not a positive finite number", self.world_to_virtual_grid_ratio),
            ));
        }
        if self.battle_duration.is_zero() {
            return Err(invalid("battle_duration", "must not be zero"));
        }
        let render_frames_per_input_frame = 1usize << self.input_scale_frames;
        let min_render_capacity = self.input_delay_frames as usize + 2 * render_frames_per_input_frame;
        if self.render_cache_capacity < min_render_capacity {
            return Err(invalid(
                "render_cache_capacity",
                format!(
                    "{} cannot hold the {} frames between sampling and consumption",
                    self.render_cache_capacity, min_render_capacity
                ),
            ));
        }
        if self.input_cache_capacity < 2 {
            return Err(invalid("input_cache_capacity", "must be at least 2"));
        }
        if !(self.player_collider_radius.is_finite() && self.player_collider_radius > 0.0) {
            return Err(invalid(
                "player_collider_radius",
                format!("{} is not a positive finite number", self.player_collider_radius),
            ));
        }
        if self.underrun_grace_ticks < 1 {
            return Err(invalid("underrun_grace_ticks", "must be at least 1"));
        }
        if let Some(ordinal) = self.barriers.iter().position(|barrier| barrier.points.len() < 3) {
            return Err(invalid("barriers", format!("barrier {ordinal} has fewer than 3 points")));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, info: impl Into<String>) -> RollbackError {
    RollbackError::InvalidConfig {
        field,
        info: info.into(),
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

    #[test]
    fn presets_are_valid() {
        for config in [
            BattleConfig::default(),
            BattleConfig::lan(),
            BattleConfig::high_latency(),
            BattleConfig::offline(),
        ] {
            assert_eq!(config.validate(), Ok(()), "{config:?}");
        }
    }

    #[test]
    fn default_matches_reference_map() {
        let config = BattleConfig::default();
        assert_eq!(config.converter(), FrameIdConverter::new(8, 2));
        assert_eq!(config.tick_interval_nanos(), 16_666_666);
        assert_eq!(config.battle_duration_nanos(), 180_000_000_000);
    }

    #[test]
    fn rejects_tiny_render_cache() {
        let config = BattleConfig {
            render_cache_capacity: 8,
            ..BattleConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RollbackError::InvalidConfig {
                field: "render_cache_capacity",
                ..
            })
        ));
    }

    #[test]
    fn rejects_degenerate_barrier() {
        let config = BattleConfig {
            barriers: vec![BarrierPolygon {
                anchor: Vec2::ZERO,
                points: vec![Vec2::ZERO, Vec2::new(1.0, 0.0)],
            }],
            ..BattleConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RollbackError::InvalidConfig { field: "barriers", .. })
        ));
    }

    #[test]
    fn rejects_non_positive_ratio() {
        let config = BattleConfig {
            world_to_virtual_grid_ratio: f64::NAN,
            ..BattleConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let config = BattleConfig::lan();
        let json = serde_json::to_string(&config).unwrap();
        let back: BattleConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
