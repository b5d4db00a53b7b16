//! A cloneable, mutex-guarded [`BattleSession`] for hosts that receive
//! network messages on a different thread than the one that ticks.
//!
//! Every call holds the lock for its full duration, so a tick and a
//! downsync handler never interleave. Handler calls carry the generation the
//! caller observed when the message was routed; a [`BattleSession::reset`] in
//! between turns them into [`RollbackError::StaleGeneration`] instead of
//! writing a previous battle's data into the new one.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use web_time::Instant;

use crate::collision::{CollisionSpace, SatCollisionSpace};
use crate::error::{RollbackError, RollbackResult};
use crate::messages::{AuthoritativeRenderFrame, InputFrameDownsyncBatch};
use crate::reconciler::ReconcileOutcome;
use crate::sessions::battle_session::BattleSession;
use crate::BattleRequest;

/// Shared handle to one battle.
pub struct SharedBattle<C = SatCollisionSpace>
where
    C: CollisionSpace + Default,
{
    inner: Arc<Mutex<BattleSession<C>>>,
}

impl<C: CollisionSpace + Default> Clone for SharedBattle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: CollisionSpace + Default> std::fmt::Debug for SharedBattle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_lock() {
            Some(session) => f.debug_tuple("SharedBattle").field(&*session).finish(),
            None => f.write_str("SharedBattle(<locked>)"),
        }
    }
}

impl<C: CollisionSpace + Default> From<BattleSession<C>> for SharedBattle<C> {
    fn from(session: BattleSession<C>) -> Self {
        Self::new(session)
    }
}

impl<C: CollisionSpace + Default> SharedBattle<C> {
    /// Wraps a session.
    #[must_use]
    pub fn new(session: BattleSession<C>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// The session's current generation. Tag routed messages with it.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation()
    }

    /// Runs `f` with exclusive access to the session.
    pub fn with<R>(&self, f: impl FnOnce(&mut BattleSession<C>) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// See [`BattleSession::tick`].
    ///
    /// # Errors
    ///
    /// See [`BattleSession::tick`].
    pub fn tick(&self, now: Instant) -> RollbackResult<Vec<BattleRequest>> {
        self.inner.lock().tick(now)
    }

    /// See [`BattleSession::on_authoritative_render_frame`].
    ///
    /// # Errors
    ///
    /// [`RollbackError::StaleGeneration`] if the session was reset after
    /// `generation` was observed, otherwise as the session method.
    pub fn on_authoritative_render_frame(
        &self,
        generation: u64,
        frame: &AuthoritativeRenderFrame,
    ) -> RollbackResult<Vec<BattleRequest>> {
        let mut session = self.inner.lock();
        check_generation(generation, session.generation())?;
        session.on_authoritative_render_frame(frame)
    }

    /// See [`BattleSession::on_input_frame_downsync_batch`].
    ///
    /// # Errors
    ///
    /// [`RollbackError::StaleGeneration`] if the session was reset after
    /// `generation` was observed, otherwise as the session method.
    pub fn on_input_frame_downsync_batch(
        &self,
        generation: u64,
        batch: &InputFrameDownsyncBatch,
    ) -> RollbackResult<ReconcileOutcome> {
        let mut session = self.inner.lock();
        check_generation(generation, session.generation())?;
        session.on_input_frame_downsync_batch(batch)
    }

    /// See [`BattleSession::reset`].
    pub fn reset(&self) -> Vec<BattleRequest> {
        self.inner.lock().reset()
    }
}

fn check_generation(expected: u64, actual: u64) -> RollbackResult<()> {
    if expected != actual {
        debug!(expected, actual, "Dropping message routed to a previous generation");
        return Err(RollbackError::StaleGeneration { expected, actual });
    }
    Ok(())
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
    use crate::sessions::builder::SessionBuilder;
    use crate::BattleState;

    #[test]
    fn stale_generation_is_rejected_after_reset() {
        let shared = SharedBattle::new(SessionBuilder::new().start().unwrap());
        let observed = shared.generation();
        shared.reset();

        let result = shared.on_input_frame_downsync_batch(observed, &InputFrameDownsyncBatch::default());
        assert_eq!(
            result,
            Err(RollbackError::StaleGeneration {
                expected: observed,
                actual: observed + 1
            })
        );
        assert!(shared
            .on_input_frame_downsync_batch(shared.generation(), &InputFrameDownsyncBatch::default())
            .is_ok());
    }

    #[test]
    fn clones_share_one_session() {
        let shared = SharedBattle::new(SessionBuilder::new().start().unwrap());
        let other = shared.clone();
        other.with(BattleSession::dismiss);
        assert_eq!(shared.with(|session| session.state()), BattleState::InDismissal);
    }

    #[test]
    fn handle_is_usable_across_threads() {
        let shared = SharedBattle::new(SessionBuilder::new().start().unwrap());
        let remote = shared.clone();
        let generation = shared.generation();
        std::thread::spawn(move || {
            remote
                .on_input_frame_downsync_batch(generation, &InputFrameDownsyncBatch::default())
                .unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(shared.generation(), generation);
    }
}
