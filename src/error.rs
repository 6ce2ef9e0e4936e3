//! Error types shared across the scheduling core.
//!
//! Distinguishes library-raised failures (typed, part of the public API)
//! from the caller's work-function failures, which are opaque and simply
//! accumulated on the request that produced them.

use thiserror::Error;

use crate::request::RequestState;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReqflowError>;

/// Errors the scheduling core itself can raise.
#[derive(Debug, Error)]
pub enum ReqflowError {
    /// A `try_transition` was rejected by the transition table.
    ///
    /// Callers in the hot path treat this as a no-op (`Ok(false)` / `None`)
    /// rather than propagating it; this variant exists for code paths that
    /// must fail loudly, e.g. attaching a subsequent request to one that has
    /// already reached a terminal state.
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: RequestState,
        to: RequestState,
    },

    /// A write was attempted on a channel after `try_complete`.
    #[error("channel is closed")]
    ChannelClosed,

    /// Construction-time argument validation failed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An await observed a cancellation scope firing.
    #[error("operation was cancelled")]
    Cancelled,

    /// Opaque/foreign error, including user work-function failures that
    /// aren't modeled as a typed variant above.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Clone for ReqflowError {
    fn clone(&self) -> Self {
        match self {
            Self::InvalidTransition { from, to } => Self::InvalidTransition {
                from: *from,
                to: *to,
            },
            Self::ChannelClosed => Self::ChannelClosed,
            Self::InvalidArgument(msg) => Self::InvalidArgument(msg.clone()),
            Self::Cancelled => Self::Cancelled,
            Self::Other(e) => Self::Other(anyhow::anyhow!(e.to_string())),
        }
    }
}

/// The wrapped aggregate of every error accumulated across a request's attempts.
///
/// Exposed to callers via `Request::exception`; the scheduler never interprets
/// the individual causes beyond counting them against the retry policy.
#[derive(Debug, Error)]
#[error("request failed after {} attempt(s): {}", self.causes.len(), self.summary())]
pub struct AggregateError {
    pub causes: Vec<ReqflowError>,
}

impl AggregateError {
    fn summary(&self) -> String {
        self.causes
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}
