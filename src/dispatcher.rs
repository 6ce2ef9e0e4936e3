//! Dispatchers: the workers that pull requests off a channel and execute them.
//!
//! A `JoinSet` of worker tasks pulls from a single shared channel;
//! degree-of-parallelism is enforced by how many workers are alive rather
//! than a semaphore, since the channel itself has no capacity limit and
//! concurrency is bounded purely by worker count. Workers are spawned or
//! retired cooperatively as the configured degree of parallelism changes.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::callback::SharedCallbackSink;
use crate::channel::{Channel, ChannelOptions, DynamicPriorityChannel};
use crate::error::{AggregateError, Result};
use crate::handler::Handler;
use crate::priority::Priority;
use crate::queue::SequenceId;
use crate::request::{
    EventListener, ExecuteOutcome, OwnRequest, Request, RequestEvent, RequestId, RequestState,
    StateMachine, TransitionTable,
};
use crate::token::CancelToken;

/// Construction-time knobs for a dispatcher.
#[derive(Clone, Copy)]
pub struct DispatcherOptions {
    /// Upper bound on concurrently-running requests.
    pub max_degree_of_parallelism: usize,
    /// When `true`, the initial degree of parallelism is
    /// `available_parallelism()` clamped to `max_degree_of_parallelism`.
    /// When `false`, it's pinned at `max_degree_of_parallelism`.
    pub auto_degree_of_parallelism: bool,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            max_degree_of_parallelism: 64,
            auto_degree_of_parallelism: true,
        }
    }
}

fn resolve_initial_dop(options: &DispatcherOptions) -> usize {
    let cap = options.max_degree_of_parallelism.max(1);
    if !options.auto_degree_of_parallelism {
        return cap;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(cap)
}

/// Runs requests with up to `degree_of_parallelism` running concurrently,
/// dynamically adjustable at runtime.
///
/// Implements `Request` itself (the dispatcher-as-request described in the
/// component design), using the broader container transition table, so it
/// can be nested inside a `Container` alongside the requests it runs.
pub struct ParallelHandler {
    id: RequestId,
    channel: Arc<DynamicPriorityChannel<Arc<OwnRequest>>>,
    machine: StateMachine,
    running_workers: std::sync::atomic::AtomicUsize,
    listeners: Mutex<Vec<EventListener>>,
    sink: SharedCallbackSink,
    unhandled_exceptions: tokio::sync::broadcast::Sender<Arc<AggregateError>>,
    self_handle: OnceLock<Weak<ParallelHandler>>,
}

impl ParallelHandler {
    pub fn new(options: DispatcherOptions) -> Arc<Self> {
        let dop = resolve_initial_dop(&options);
        let channel_options = ChannelOptions::new(dop);
        let channel = Arc::new(DynamicPriorityChannel::new(channel_options));
        let (unhandled_exceptions, _) = tokio::sync::broadcast::channel(64);
        let handler = Arc::new(Self {
            id: RequestId::new(),
            channel,
            machine: StateMachine::new(RequestState::Idle, TransitionTable::Container),
            running_workers: std::sync::atomic::AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
            sink: crate::callback::default_sink(),
            unhandled_exceptions,
            self_handle: OnceLock::new(),
        });
        let _ = handler.self_handle.set(Arc::downgrade(&handler));
        let runner = handler.clone();
        tokio::spawn(async move { runner.run().await });
        handler
    }

    pub fn degree_of_parallelism(&self) -> usize {
        self.channel.options().degree_of_parallelism()
    }

    pub fn set_degree_of_parallelism(&self, n: usize) {
        self.channel.options().set_degree_of_parallelism(n);
    }

    /// Workers currently executing a request (as opposed to idle, waiting
    /// on the channel). Useful for introspection/metrics.
    pub fn running_workers(&self) -> usize {
        self.running_workers.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Subscribe to terminal failures from every request this handler runs.
    /// Each `Failed` request's aggregated error is broadcast here in addition
    /// to its own `Request::exception()`/`RequestEvent::Exception`, for hosts
    /// that want one central "something went wrong" feed per handler rather
    /// than per-request listeners.
    pub fn subscribe_unhandled_exceptions(&self) -> tokio::sync::broadcast::Receiver<Arc<AggregateError>> {
        self.unhandled_exceptions.subscribe()
    }

    fn emit(&self, event: RequestEvent) {
        let listeners = self.listeners.lock().clone();
        for l in listeners {
            let event = event.clone();
            let l = l.clone();
            self.sink.post(Box::new(move || l(event)));
        }
    }

    #[tracing::instrument(skip(self), fields(handler_id = %self.id))]
    async fn run(self: Arc<Self>) {
        let mut dop_rx = self.channel.options().degree_of_parallelism_receiver();
        let cancel = self.channel.options().cancel_token.clone();
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut spawned = 0usize;
        loop {
            let target = *dop_rx.borrow();
            while spawned < target {
                let worker = self.clone();
                let ordinal = spawned;
                let worker_dop_rx = dop_rx.clone();
                workers.spawn(async move { worker.worker_loop(ordinal, worker_dop_rx).await });
                spawned += 1;
            }
            tokio::select! {
                changed = dop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
                result = workers.join_next(), if !workers.is_empty() => {
                    if let Some(joined) = result {
                        if let Err(e) = joined {
                            tracing::error!(error = %e, "dispatcher worker panicked");
                        }
                        spawned = spawned.saturating_sub(1);
                    }
                }
            }
        }
        self.channel.try_complete();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "dispatcher worker panicked during drain");
            }
        }
        tracing::debug!("dispatcher worker pool drained");
    }

    async fn worker_loop(self: Arc<Self>, ordinal: usize, mut dop_rx: watch::Receiver<usize>) {
        let cancel = self.channel.options().cancel_token.clone();
        loop {
            if ordinal >= *dop_rx.borrow() {
                tracing::debug!(ordinal, "worker retiring: degree of parallelism lowered");
                return;
            }
            if self
                .channel
                .options()
                .pause_token
                .wait_while_paused(&cancel)
                .await
                .is_err()
            {
                return;
            }
            let item = tokio::select! {
                _ = cancel.cancelled() => None,
                changed = dop_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                item = self.channel.read_async() => item,
            };
            let Some(mut current) = item else { return };
            self.running_workers.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let _guard = scopeguard::guard((), |_| {
                self.running_workers.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            });
            loop {
                match current.clone().begin_execute().await {
                    ExecuteOutcome::Skip => break,
                    ExecuteOutcome::Terminal => {
                        if let Some(exception) = current.exception() {
                            let _ = self.unhandled_exceptions.send(exception);
                        }
                        break;
                    }
                    ExecuteOutcome::Retry => {
                        if let Err(e) = self.channel.write(current.priority(), current.clone()).await {
                            tracing::warn!(error = %e, "failed to re-enqueue retrying request");
                        }
                        break;
                    }
                    ExecuteOutcome::ChainSubsequent(next) => {
                        next.force_admit_for_chain();
                        current = next;
                        continue;
                    }
                }
            }
        }
    }
}

impl Handler for ParallelHandler {
    fn cancel_token(&self) -> CancelToken {
        self.channel.options().cancel_token.clone()
    }

    fn enqueue(&self, request: Arc<OwnRequest>) -> Result<SequenceId> {
        self.channel.try_write(request.priority(), request)
    }
}

#[async_trait]
impl Request for ParallelHandler {
    fn id(&self) -> RequestId {
        self.id
    }

    fn state(&self) -> RequestState {
        self.machine.state()
    }

    fn priority(&self) -> Priority {
        Priority::NORMAL
    }

    fn attempt_counter(&self) -> u32 {
        0
    }

    fn exception(&self) -> Option<Arc<AggregateError>> {
        None
    }

    async fn start(&self) -> Result<()> {
        self.channel.options().pause_token.resume();
        self.machine.try_transition(RequestState::Running);
        Ok(())
    }

    async fn pause(&self) {
        self.channel.options().pause_token.pause();
        self.machine.try_transition(RequestState::Paused);
        self.emit(RequestEvent::StateChanged(RequestState::Paused));
    }

    async fn cancel(&self) {
        self.channel.options().cancel_token.cancel();
        self.channel.try_complete();
        self.machine.try_transition(RequestState::Cancelled);
        self.emit(RequestEvent::Cancelled);
    }

    async fn dispose(&self) {
        self.cancel().await;
    }

    fn try_set_idle(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        self.machine.try_transition(RequestState::Idle).is_some()
    }

    async fn wait_completion(&self) {
        self.channel.options().cancel_token.cancelled().await;
    }

    fn on_event(&self, listener: EventListener) {
        self.listeners.lock().push(listener);
    }
}

/// Identical contract to `ParallelHandler`, with concurrency hard-pinned at
/// one: built by composition rather than duplicating the worker loop.
pub struct SequentialHandler {
    inner: Arc<ParallelHandler>,
}

impl SequentialHandler {
    pub fn new() -> Arc<Self> {
        let inner = ParallelHandler::new(DispatcherOptions {
            max_degree_of_parallelism: 1,
            auto_degree_of_parallelism: false,
        });
        Arc::new(Self { inner })
    }

    pub fn subscribe_unhandled_exceptions(&self) -> tokio::sync::broadcast::Receiver<Arc<AggregateError>> {
        self.inner.subscribe_unhandled_exceptions()
    }
}

impl Handler for SequentialHandler {
    fn cancel_token(&self) -> CancelToken {
        self.inner.cancel_token()
    }

    fn enqueue(&self, request: Arc<OwnRequest>) -> Result<SequenceId> {
        self.inner.enqueue(request)
    }
}

#[async_trait]
impl Request for SequentialHandler {
    fn id(&self) -> RequestId {
        self.inner.id()
    }

    fn state(&self) -> RequestState {
        self.inner.state()
    }

    fn priority(&self) -> Priority {
        self.inner.priority()
    }

    fn attempt_counter(&self) -> u32 {
        self.inner.attempt_counter()
    }

    fn exception(&self) -> Option<Arc<AggregateError>> {
        self.inner.exception()
    }

    async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    async fn pause(&self) {
        self.inner.pause().await
    }

    async fn cancel(&self) {
        self.inner.cancel().await
    }

    async fn dispose(&self) {
        self.inner.dispose().await
    }

    fn try_set_idle(&self) -> bool {
        self.inner.try_set_idle()
    }

    async fn wait_completion(&self) {
        self.inner.wait_completion().await
    }

    fn on_event(&self, listener: EventListener) {
        self.inner.on_event(listener)
    }
}

static DEFAULT_HANDLER: Lazy<Arc<ParallelHandler>> =
    Lazy::new(|| ParallelHandler::new(DispatcherOptions::default()));

/// The process-wide default dispatcher, used by any `OwnRequest` built
/// without an explicit `handler`.
pub fn default_handler() -> Arc<ParallelHandler> {
    DEFAULT_HANDLER.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{OwnRequest, RequestOptions};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    #[tokio::test]
    async fn enforces_degree_of_parallelism_bound() {
        let handler = ParallelHandler::new(DispatcherOptions {
            max_degree_of_parallelism: 2,
            auto_degree_of_parallelism: false,
        });
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..6 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            let work: crate::request::WorkFn = Arc::new(move |_cancel| {
                let concurrent = concurrent.clone();
                let max_seen = max_seen.clone();
                Box::pin(async move {
                    let now = concurrent.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    max_seen.fetch_max(now, AtomicOrdering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    concurrent.fetch_sub(1, AtomicOrdering::SeqCst);
                    Ok(())
                })
            });
            let options = RequestOptions {
                handler: Some(handler.clone()),
                ..Default::default()
            };
            OwnRequest::new(work, options).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(max_seen.load(AtomicOrdering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn lowering_degree_of_parallelism_retires_workers() {
        let handler = ParallelHandler::new(DispatcherOptions {
            max_degree_of_parallelism: 4,
            auto_degree_of_parallelism: false,
        });
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            let work: crate::request::WorkFn = Arc::new(move |_cancel| {
                let concurrent = concurrent.clone();
                let max_seen = max_seen.clone();
                Box::pin(async move {
                    let now = concurrent.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    max_seen.fetch_max(now, AtomicOrdering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    concurrent.fetch_sub(1, AtomicOrdering::SeqCst);
                    Ok(())
                })
            });
            let options = RequestOptions {
                handler: Some(handler.clone()),
                ..Default::default()
            };
            OwnRequest::new(work, options).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.running_workers(), 4);

        handler.set_degree_of_parallelism(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut max_observed_after_retire = 0;
        for _ in 0..10 {
            max_observed_after_retire = max_observed_after_retire.max(handler.running_workers());
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        assert_eq!(max_observed_after_retire, 1);
        assert!(max_seen.load(AtomicOrdering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn broadcasts_unhandled_exception_on_terminal_failure() {
        let handler = ParallelHandler::new(DispatcherOptions::default());
        let mut exceptions = handler.subscribe_unhandled_exceptions();
        let work: crate::request::WorkFn = Arc::new(|_cancel| Box::pin(async { anyhow::bail!("boom") }));
        let options = RequestOptions {
            handler: Some(handler),
            max_attempts: 1,
            ..Default::default()
        };
        let request = OwnRequest::new(work, options).unwrap();
        request.wait_completion().await;

        let received = tokio::time::timeout(Duration::from_millis(500), exceptions.recv())
            .await
            .expect("broadcast should fire promptly")
            .unwrap();
        assert_eq!(received.causes.len(), 1);
    }

    #[tokio::test]
    async fn sequential_handler_never_exceeds_one_concurrent() {
        let handler = SequentialHandler::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            let work: crate::request::WorkFn = Arc::new(move |_cancel| {
                let concurrent = concurrent.clone();
                let max_seen = max_seen.clone();
                Box::pin(async move {
                    let now = concurrent.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    max_seen.fetch_max(now, AtomicOrdering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    concurrent.fetch_sub(1, AtomicOrdering::SeqCst);
                    Ok(())
                })
            });
            let options = RequestOptions {
                handler: Some(handler.clone()),
                ..Default::default()
            };
            OwnRequest::new(work, options).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(max_seen.load(AtomicOrdering::SeqCst), 1);
    }
}
