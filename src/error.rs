//! Errors returned by the session and the reasons a battle can desync.
//!
//! [`RollbackError`] is what fallible operations return. [`DesyncReason`]
//! says why a running battle stopped trusting its own history; it is carried
//! by [`RollbackError::DesyncDetected`] and by the desync event.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{BattleState, InputFrameId, RenderFrameId};

/// Which of the two history caches an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CacheKind {
    /// The render-frame cache (simulated state).
    Render,
    /// The input-frame cache (predicted and confirmed inputs).
    Input,
}

impl Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Render => write!(f, "render cache"),
            Self::Input => write!(f, "input cache"),
        }
    }
}

/// Why the session gave up on its local history.
///
/// Every reason means the same thing to the host: request a fresh
/// authoritative snapshot or disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum DesyncReason {
    /// Replay tried to store a render-frame beyond the end of the cache window.
    RenderCacheNonConsecutive {
        /// The render-frame that could not be stored consecutively.
        frame: RenderFrameId,
    },
    /// The mandatory roll-forward pass could not run for too many ticks in a row.
    UnderrunGraceExceeded {
        /// How many consecutive ticks were unable to roll forward.
        consecutive_underruns: u32,
    },
    /// A full cache evicted entries at or above the retention floor.
    HistoryOverrun {
        /// The cache that overflowed.
        cache: CacheKind,
        /// The oldest frame id that had to be kept.
        floor: i32,
        /// The oldest frame id still held after the overflow.
        start: i32,
    },
    /// A confirmed input frame disagreed with input already folded into the watermark.
    ConfirmedHistoryContradicted {
        /// The input frame whose confirmation differed from the local copy.
        input_frame: InputFrameId,
        /// The render watermark at the time of the contradiction.
        watermark: RenderFrameId,
    },
}

impl Display for DesyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RenderCacheNonConsecutive { frame } => {
                write!(f, "render frame {frame} skipped ahead of the cache window")
            },
            Self::UnderrunGraceExceeded {
                consecutive_underruns,
            } => write!(
                f,
                "roll-forward starved for {consecutive_underruns} consecutive ticks"
            ),
            Self::HistoryOverrun {
                cache,
                floor,
                start,
            } => write!(
                f,
                "{cache} overran its retention floor {floor} (window now starts at {start})"
            ),
            Self::ConfirmedHistoryContradicted {
                input_frame,
                watermark,
            } => write!(
                f,
                "confirmation of input frame {input_frame} contradicts history below watermark {watermark}"
            ),
        }
    }
}

/// This enum contains all errors this library can return. Most API functions will generally return a [`RollbackResult`].
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackError {
    /// A requested frame is not in the cache window, either evicted or not yet produced.
    CacheUnderrun {
        /// The cache that was queried.
        cache: CacheKind,
        /// The raw frame id that was requested.
        frame: i32,
    },
    /// A cache write skipped past the end of the window.
    NonConsecutiveInsert {
        /// The cache that was written.
        cache: CacheKind,
        /// The raw frame id that was written.
        frame: i32,
        /// The frame id the window expected next.
        expected: i32,
    },
    /// A downsync input frame is older than the confirmed-input watermark.
    StaleConfirmation {
        /// The stale input frame.
        input_frame: InputFrameId,
        /// The confirmed-input watermark.
        watermark: InputFrameId,
    },
    /// An authoritative render-frame is older than the render watermark.
    StaleRenderFrame {
        /// The stale render-frame.
        frame: RenderFrameId,
        /// The render watermark.
        watermark: RenderFrameId,
    },
    /// No local player is bound to this session, or the bound player has no seat yet.
    MissingBinding,
    /// A handler call was tagged with a generation that has since been reset.
    StaleGeneration {
        /// The generation the caller expected.
        expected: u64,
        /// The session's current generation.
        actual: u64,
    },
    /// The operation is not allowed in the session's current state.
    InvalidState {
        /// The state the session was in.
        state: BattleState,
        /// The rejected operation.
        operation: &'static str,
    },
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// A configuration value is out of range.
    InvalidConfig {
        /// The offending field.
        field: &'static str,
        /// Why the value was rejected.
        info: String,
    },
    /// The session detected that its local history can no longer be trusted.
    DesyncDetected {
        /// What went wrong.
        reason: DesyncReason,
    },
    /// An internal error occurred. This indicates a bug in this crate.
    InternalError {
        /// A description of what went wrong.
        context: String,
    },
}

impl Display for RollbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CacheUnderrun { cache, frame } => {
                write!(f, "Frame {frame} is not available in the {cache}.")
            },
            Self::NonConsecutiveInsert {
                cache,
                frame,
                expected,
            } => write!(
                f,
                "Frame {frame} was written to the {cache} but frame {expected} was expected next."
            ),
            Self::StaleConfirmation {
                input_frame,
                watermark,
            } => write!(
                f,
                "Input frame {input_frame} is older than the confirmed watermark {watermark}."
            ),
            Self::StaleRenderFrame { frame, watermark } => write!(
                f,
                "Render frame {frame} is older than the render watermark {watermark}."
            ),
            Self::MissingBinding => write!(f, "No local player is bound to this session."),
            Self::StaleGeneration { expected, actual } => write!(
                f,
                "Handler expected session generation {expected}, but the session is at generation {actual}."
            ),
            Self::InvalidState { state, operation } => {
                write!(f, "Cannot {operation} while the battle is {state}.")
            },
            Self::InvalidRequest { info } => {
                write!(f, "Invalid Request: {info}")
            },
            Self::InvalidConfig { field, info } => {
                write!(f, "Invalid configuration for {field}: {info}")
            },
            Self::DesyncDetected { reason } => {
                write!(f, "Desync detected: {reason}")
            },
            Self::InternalError { context } => {
                write!(
                    f,
                    "Internal error (please report as bug): {context}"
                )
            },
        }
    }
}

impl Error for RollbackError {}

/// Convenience alias for results returned by this crate.
pub type RollbackResult<T> = Result<T, RollbackError>;

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
    fn display_names_the_cache() {
        let err = RollbackError::CacheUnderrun {
            cache: CacheKind::Input,
            frame: 7,
        };
        assert_eq!(err.to_string(), "Frame 7 is not available in the input cache.");
    }

    #[test]
    fn desync_display_wraps_reason() {
        let err = RollbackError::DesyncDetected {
            reason: DesyncReason::UnderrunGraceExceeded {
                consecutive_underruns: 31,
            },
        };
        assert!(err.to_string().contains("31 consecutive ticks"));
    }

    #[test]
    fn errors_are_std_errors() {
        fn assert_error<E: Error>(_: &E) {}
        assert_error(&RollbackError::MissingBinding);
    }
}
