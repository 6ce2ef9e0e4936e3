//! The dispatcher-facing contract a request enqueues itself onto.
//!
//! Kept as its own trait (rather than folded into `Request`) so
//! `request::own_request` can depend on "something that accepts requests"
//! without depending on the concrete dispatcher types in `dispatcher`, which
//! in turn depend on `OwnRequest`.

use std::sync::Arc;

use crate::error::Result;
use crate::queue::SequenceId;
use crate::request::OwnRequest;
use crate::token::CancelToken;

pub trait Handler: Send + Sync {
    /// The cancellation scope every request admitted to this handler links against.
    fn cancel_token(&self) -> CancelToken;

    /// Admit a request for execution. Non-blocking: the request is placed on
    /// the handler's channel at its own priority and this returns immediately.
    fn enqueue(&self, request: Arc<OwnRequest>) -> Result<SequenceId>;
}
