//! Host callback marshalling.
//!
//! The source re-architected here used multicast event handlers plus a
//! captured host `SynchronizationContext` to marshal callbacks onto a UI
//! thread or similar. That's replaced with a single-method `CallbackSink`
//! trait: `post` accepts a boxed closure to run on the sink's preferred
//! execution context. The default sink just runs closures on the Tokio
//! worker pool; a host with a UI thread (or any other bespoke context)
//! supplies its own.

use std::sync::Arc;

/// A closure to be executed on whatever context a `CallbackSink` prefers.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Accepts closures to run observer callbacks (`started`, `completed`,
/// `failed`, `state_changed`, ...) without blocking the caller that raised
/// the event (typically a dispatcher worker mid state-transition).
pub trait CallbackSink: Send + Sync {
    fn post(&self, callback: Callback);
}

/// Runs every posted callback on a freshly spawned Tokio task.
///
/// Used whenever a `Request` is constructed without an explicit sink.
/// Failures inside a callback (including panics) never propagate back to
/// the scheduler: `tokio::spawn` isolates the panic in its own `JoinHandle`,
/// which this sink deliberately drops.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolCallbackSink;

impl CallbackSink for PoolCallbackSink {
    fn post(&self, callback: Callback) {
        tokio::spawn(async move {
            callback();
        });
    }
}

/// Sink that runs every callback inline, synchronously, on the caller's task.
///
/// Useful for tests that need callback ordering to be deterministic relative
/// to the transition that raised them.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineCallbackSink;

impl CallbackSink for InlineCallbackSink {
    fn post(&self, callback: Callback) {
        callback();
    }
}

pub type SharedCallbackSink = Arc<dyn CallbackSink>;

pub fn default_sink() -> SharedCallbackSink {
    Arc::new(PoolCallbackSink)
}
