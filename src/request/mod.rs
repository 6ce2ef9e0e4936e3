//! The request lifecycle: states, the abstract `Request` contract, and its
//! concrete closure-backed implementer `OwnRequest`.

pub(crate) mod own_request;
mod state_machine;

pub use own_request::{yield_now, OwnRequest, WorkFn};
pub(crate) use own_request::ExecuteOutcome;
pub use state_machine::{StateMachine, TransitionTable};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::callback::SharedCallbackSink;
use crate::error::{AggregateError, Result};
use crate::handler::Handler;
use crate::priority::Priority;
use crate::token::CancelToken;

/// Identifies a request for the lifetime of the process. Not reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lifecycle states every `Request` (leaf or container) moves through.
///
/// `Paused`, `Completed`, `Failed` and `Cancelled` are absorbing for a leaf
/// request; a container's broader transition table lets it reset `Completed`
/// and `Cancelled` back to `Idle` for reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestState {
    Paused = 0,
    Idle = 1,
    Waiting = 2,
    Running = 3,
    Completed = 4,
    Failed = 5,
    Cancelled = 6,
}

impl RequestState {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            0 => RequestState::Paused,
            1 => RequestState::Idle,
            2 => RequestState::Waiting,
            3 => RequestState::Running,
            4 => RequestState::Completed,
            5 => RequestState::Failed,
            6 => RequestState::Cancelled,
            other => unreachable!("invalid encoded RequestState {other}"),
        }
    }

    /// `Completed`, `Failed` and `Cancelled` are terminal for a leaf request.
    /// `Paused` is not terminal: `start()` can still resume it.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

/// Lifecycle notifications raised on a `Request`, delivered through its
/// `CallbackSink`.
#[derive(Debug, Clone)]
pub enum RequestEvent {
    StateChanged(RequestState),
    Started,
    Completed,
    Failed,
    Cancelled,
    Exception(Arc<AggregateError>),
}

/// A subscriber to a `Request`'s lifecycle events. `Arc`-shared (rather than
/// a plain `Box`) so `Container` can attach the same closure to many members
/// without cloning its captured state.
pub type EventListener = Arc<dyn Fn(RequestEvent) + Send + Sync>;

/// The abstract lifecycle contract shared by leaf requests, dispatchers and
/// containers, so the three can nest inside one another.
///
/// Rust has no class inheritance; this trait plays that role, with
/// `OwnRequest` as the concrete leaf implementer and `ParallelHandler` /
/// `SequentialHandler` / `Container` / `ProgressableContainer` all
/// implementing it so any of them can sit inside a `Container`.
#[async_trait]
pub trait Request: Send + Sync {
    fn id(&self) -> RequestId;
    fn state(&self) -> RequestState;
    fn priority(&self) -> Priority;
    fn attempt_counter(&self) -> u32;

    fn has_completed(&self) -> bool {
        self.state().is_terminal()
    }

    /// The accumulated failure, if any. `None` while running or once
    /// completed successfully.
    fn exception(&self) -> Option<Arc<AggregateError>>;

    /// Move out of `Paused` (the initial state, or after a prior `pause()`).
    async fn start(&self) -> Result<()>;

    /// Request a pause. Cooperative: takes effect at the next yield point.
    async fn pause(&self);

    /// Cancel. Idempotent; a no-op once terminal.
    async fn cancel(&self);

    /// Cancel (if not already terminal) and release any subsequent chain.
    async fn dispose(&self);

    /// Force back to `Idle` from any non-terminal state, reporting success.
    /// Always fails (`false`) once terminal: terminal states still absorb.
    fn try_set_idle(&self) -> bool;

    /// Suspend until this request reaches a terminal state.
    async fn wait_completion(&self);

    fn on_event(&self, listener: EventListener);
}

/// Construction-time options for [`OwnRequest::new`].
#[derive(Clone)]
pub struct RequestOptions {
    pub auto_start: bool,
    pub priority: Priority,
    /// Delay before the request first becomes eligible to run.
    pub deploy_delay: Option<Duration>,
    /// Delay inserted before each retry after a failed attempt.
    pub delay_between_attempts: Option<Duration>,
    pub max_attempts: u32,
    pub user_cancel_token: Option<CancelToken>,
    pub handler: Option<Arc<dyn Handler>>,
    pub callback_sink: Option<SharedCallbackSink>,
    pub(crate) subsequent_request: Option<Arc<OwnRequest>>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            auto_start: true,
            priority: Priority::NORMAL,
            deploy_delay: None,
            delay_between_attempts: None,
            max_attempts: 3,
            user_cancel_token: None,
            handler: None,
            callback_sink: None,
            subsequent_request: None,
        }
    }
}

impl RequestOptions {
    /// Attach a request to run immediately after this one completes
    /// successfully, bypassing the dispatcher's queue.
    ///
    /// Rejected if `subsequent` has already reached a terminal state: a
    /// chain built on an already-finished request could never run.
    pub fn with_subsequent(mut self, subsequent: Arc<OwnRequest>) -> Result<Self> {
        use crate::error::ReqflowError;
        let from = subsequent.state();
        if from.is_terminal() {
            return Err(ReqflowError::InvalidTransition {
                from,
                to: RequestState::Idle,
            });
        }
        self.subsequent_request = Some(subsequent);
        Ok(self)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        use crate::error::ReqflowError;
        if self.max_attempts == 0 {
            return Err(ReqflowError::InvalidArgument(
                "max_attempts must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}
