//! Priority-ordered, retrying, cooperatively-cancellable request scheduling.
//!
//! A quaternary priority queue ([`queue`]) backs a channel abstraction
//! ([`channel`]) that one or more dispatchers ([`dispatcher`]) drain, running
//! closures wrapped as [`request::OwnRequest`] through a runtime-checked
//! lifecycle state machine ([`request::RequestState`]). `Container`/
//! `ProgressableContainer` ([`container`]) aggregate many requests (or
//! dispatchers, or other containers) behind the same `Request` contract.

pub mod callback;
pub mod channel;
pub mod container;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod priority;
pub mod queue;
pub mod request;
pub mod token;

pub use callback::{Callback, CallbackSink, InlineCallbackSink, PoolCallbackSink, SharedCallbackSink};
pub use channel::{Channel, ChannelOptions, DynamicPriorityChannel, FixedPriorityChannel};
pub use container::{Container, ProgressHandle, ProgressableContainer};
pub use dispatcher::{default_handler, DispatcherOptions, ParallelHandler, SequentialHandler};
pub use error::{AggregateError, ReqflowError, Result};
pub use handler::Handler;
pub use priority::Priority;
pub use queue::{PriorityQueue, SequenceId};
pub use request::{
    yield_now, EventListener, OwnRequest, Request, RequestEvent, RequestId, RequestOptions,
    RequestState, WorkFn,
};
pub use token::{CancelToken, PauseToken};
