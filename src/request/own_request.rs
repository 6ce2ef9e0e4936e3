//! `OwnRequest`: the concrete, closure-backed leaf implementation of `Request`.
//!
//! Tracks lifecycle through a runtime-checked `StateMachine` rather than a
//! type parameter, since dispatchers need to hold requests of varying
//! lifecycle stage in one homogeneous queue. Retry/backoff arithmetic,
//! cooperative cancellation/pause, and subsequent-request chaining all live
//! here alongside the claim-execute-complete loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{EventListener, Request, RequestEvent, RequestId, RequestOptions, RequestState};
use super::state_machine::{StateMachine, TransitionTable};
use crate::callback::SharedCallbackSink;
use crate::dispatcher::default_handler;
use crate::error::{AggregateError, ReqflowError, Result};
use crate::handler::Handler;
use crate::priority::Priority;
use crate::token::CancelToken;

/// The caller-supplied unit of work. Takes the request's effective cancel
/// scope (handler token linked with any user-supplied token) and returns
/// `Ok(())` on success or any error on failure; failures are accumulated and
/// retried per `RequestOptions`, never interpreted.
pub type WorkFn =
    Arc<dyn Fn(CancelToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// What a dispatcher worker should do after one `begin_execute` call returns.
pub(crate) enum ExecuteOutcome {
    /// Nothing further to do right now (suspended in `Waiting`/`Paused`, or
    /// the request wasn't actually `Idle` when picked up).
    Skip,
    /// The attempt failed and should be retried; re-enqueue at its priority.
    Retry,
    /// Reached a terminal state; nothing further to do, ever.
    Terminal,
    /// Completed successfully and has a subsequent request chained: the
    /// worker should admit it inline (bypassing the queue) and keep going.
    ChainSubsequent(Arc<OwnRequest>),
}

/// A single unit of scheduled work: a closure plus its lifecycle state.
pub struct OwnRequest {
    id: RequestId,
    priority: Priority,
    machine: StateMachine,
    attempt_counter: AtomicU32,
    max_attempts: u32,
    deploy_delay: Option<Duration>,
    delay_between_attempts: Option<Duration>,
    pause_requested: AtomicBool,
    work: WorkFn,
    handler: Weak<dyn Handler>,
    cancel_scope: CancelToken,
    user_cancel_token: Option<CancelToken>,
    aggregate_errors: Mutex<Vec<ReqflowError>>,
    completion_notify: Notify,
    completed_flag: AtomicBool,
    transition_notify: Notify,
    subsequent: Mutex<Option<Arc<OwnRequest>>>,
    listeners: Mutex<Vec<EventListener>>,
    sink: SharedCallbackSink,
    self_handle: OnceLock<Weak<OwnRequest>>,
}

impl OwnRequest {
    /// Build a request. Starts `Paused`; if `options.auto_start`, spawns a
    /// task that immediately calls `start()`.
    pub fn new(work: WorkFn, options: RequestOptions) -> Result<Arc<Self>> {
        options.validate()?;
        let handler = options.handler.clone().unwrap_or_else(|| default_handler() as Arc<dyn Handler>);
        let cancel_scope = match &options.user_cancel_token {
            Some(user) => CancelToken::linked([handler.cancel_token(), user.clone()]),
            None => CancelToken::linked([handler.cancel_token()]),
        };
        let request = Arc::new(Self {
            id: RequestId::new(),
            priority: options.priority,
            machine: StateMachine::new(RequestState::Paused, TransitionTable::Request),
            attempt_counter: AtomicU32::new(0),
            max_attempts: options.max_attempts,
            deploy_delay: options.deploy_delay,
            delay_between_attempts: options.delay_between_attempts,
            pause_requested: AtomicBool::new(false),
            work,
            handler: Arc::downgrade(&handler),
            cancel_scope,
            user_cancel_token: options.user_cancel_token,
            aggregate_errors: Mutex::new(Vec::new()),
            completion_notify: Notify::new(),
            completed_flag: AtomicBool::new(false),
            transition_notify: Notify::new(),
            subsequent: Mutex::new(options.subsequent_request),
            listeners: Mutex::new(Vec::new()),
            sink: options
                .callback_sink
                .unwrap_or_else(crate::callback::default_sink),
            self_handle: OnceLock::new(),
        });
        let _ = request.self_handle.set(Arc::downgrade(&request));
        if options.auto_start {
            let r = request.clone();
            tokio::spawn(async move {
                if let Err(e) = r.start().await {
                    tracing::warn!(request_id = %r.id, error = %e, "auto-start failed");
                }
            });
        }
        Ok(request)
    }

    fn arc(&self) -> Arc<Self> {
        self.self_handle
            .get()
            .and_then(Weak::upgrade)
            .expect("self_handle is set before the constructor returns")
    }

    fn handler_ref(&self) -> Option<Arc<dyn Handler>> {
        self.handler.upgrade()
    }

    fn emit(&self, event: RequestEvent) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            let event = event.clone();
            let listener = listener.clone();
            self.sink.post(Box::new(move || listener(event)));
        }
    }

    /// Transition, then: wake any `yield_async` waiter, record the edge for
    /// observers. Returns the prior state, or `None` if the table rejected it.
    fn transition_and_announce(&self, to: RequestState) -> Option<RequestState> {
        let from = self.machine.try_transition(to)?;
        if from != to {
            self.transition_notify.notify_waiters();
            self.emit(RequestEvent::StateChanged(to));
        }
        Some(from)
    }

    fn finish_terminal(&self) {
        self.completed_flag.store(true, Ordering::SeqCst);
        self.completion_notify.notify_waiters();
    }

    /// `Paused -> Idle` (or `Waiting` if a deploy delay applies), enqueuing
    /// onto the handler once admitted.
    async fn admit(&self) {
        if self.transition_and_announce(RequestState::Idle).is_some() {
            if let Some(handler) = self.handler_ref() {
                if let Err(e) = handler.enqueue(self.arc()) {
                    tracing::warn!(request_id = %self.id, error = %e, "failed to enqueue request");
                }
            }
        }
    }

    async fn deploy_after(self: Arc<Self>, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel_scope.cancelled() => {
                if self.transition_and_announce(RequestState::Cancelled).is_some() {
                    self.finish_terminal();
                    self.emit(RequestEvent::Cancelled);
                    self.dispose_subsequent_chain();
                }
                return;
            }
        }
        self.admit().await;
    }

    /// Called by a dispatcher worker that just dequeued this request.
    /// Transitions `Idle -> Running`, runs the work closure, and interprets
    /// its result into the next lifecycle step.
    pub(crate) async fn begin_execute(self: Arc<Self>) -> ExecuteOutcome {
        if self.state() != RequestState::Idle {
            return ExecuteOutcome::Skip;
        }
        if self.cancel_scope.is_cancelled() {
            if self.transition_and_announce(RequestState::Cancelled).is_some() {
                self.finish_terminal();
                self.emit(RequestEvent::Cancelled);
                self.dispose_subsequent_chain();
            }
            return ExecuteOutcome::Terminal;
        }
        if self.transition_and_announce(RequestState::Running).is_none() {
            return ExecuteOutcome::Skip;
        }
        self.emit(RequestEvent::Started);
        let attempt = self.attempt_counter.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(request_id = %self.id, attempt, "executing request attempt");

        let cancel_for_work = self.cancel_scope.clone();
        let work = self.work.clone();
        let result = CURRENT_REQUEST.scope(self.clone(), work(cancel_for_work)).await;

        self.interpret_result(result).await
    }

    async fn interpret_result(self: Arc<Self>, result: anyhow::Result<()>) -> ExecuteOutcome {
        // If a concurrent pause() already moved us out of Running, the
        // transition below to Completed/Failed is rejected and we leave the
        // request Paused for the caller to resume.
        if self.state() != RequestState::Running {
            return ExecuteOutcome::Skip;
        }
        match result {
            Ok(()) => {
                if self.transition_and_announce(RequestState::Completed).is_some() {
                    self.finish_terminal();
                    tracing::info!(request_id = %self.id, "request completed");
                    self.emit(RequestEvent::Completed);
                }
                match self.subsequent.lock().take() {
                    Some(next) => ExecuteOutcome::ChainSubsequent(next),
                    None => ExecuteOutcome::Terminal,
                }
            }
            Err(e) => {
                self.aggregate_errors.lock().push(ReqflowError::Other(e));

                if self
                    .user_cancel_token
                    .as_ref()
                    .is_some_and(CancelToken::is_cancelled)
                {
                    if self.transition_and_announce(RequestState::Cancelled).is_some() {
                        self.finish_terminal();
                        self.emit(RequestEvent::Cancelled);
                    }
                    self.dispose_subsequent_chain();
                    return ExecuteOutcome::Terminal;
                }

                if self
                    .handler_ref()
                    .is_some_and(|h| h.cancel_token().is_cancelled())
                {
                    // The handler itself is shutting down: park this request
                    // Paused rather than burning a retry attempt on it.
                    self.transition_and_announce(RequestState::Paused);
                    return ExecuteOutcome::Skip;
                }

                let attempts_so_far = self.attempt_counter.load(Ordering::SeqCst);
                if attempts_so_far < self.max_attempts {
                    if let Some(delay) = self.delay_between_attempts {
                        if self.transition_and_announce(RequestState::Waiting).is_some() {
                            let this = self.clone();
                            tokio::spawn(async move { this.deploy_after(delay).await });
                        }
                        ExecuteOutcome::Skip
                    } else {
                        self.transition_and_announce(RequestState::Idle);
                        ExecuteOutcome::Retry
                    }
                } else {
                    if self.transition_and_announce(RequestState::Failed).is_some() {
                        self.finish_terminal();
                        let causes = self.aggregate_errors.lock().clone();
                        tracing::info!(request_id = %self.id, attempts = causes.len(), "request failed");
                        self.emit(RequestEvent::Failed);
                        self.emit(RequestEvent::Exception(Arc::new(AggregateError { causes })));
                    }
                    self.dispose_subsequent_chain();
                    ExecuteOutcome::Terminal
                }
            }
        }
    }

    fn dispose_subsequent_chain(&self) {
        if let Some(next) = self.subsequent.lock().take() {
            tokio::spawn(async move { next.dispose().await });
        }
    }

    /// Force `Paused -> Idle`, skipping the queue: used by a dispatcher
    /// worker to run a chained subsequent request inline.
    pub(crate) fn force_admit_for_chain(&self) {
        self.transition_and_announce(RequestState::Idle);
    }

    /// Attach (or replace) the request run inline once this one completes
    /// successfully. Rejected once this request is itself terminal, or if
    /// `subsequent` has already reached a terminal state.
    pub fn try_set_subsequent(&self, subsequent: Arc<OwnRequest>) -> Result<()> {
        let from = self.state();
        if from.is_terminal() {
            return Err(ReqflowError::InvalidTransition {
                from,
                to: RequestState::Idle,
            });
        }
        let subsequent_state = subsequent.state();
        if subsequent_state.is_terminal() {
            return Err(ReqflowError::InvalidTransition {
                from: subsequent_state,
                to: RequestState::Idle,
            });
        }
        *self.subsequent.lock() = Some(subsequent);
        Ok(())
    }

    /// Cooperative yield point for the work closure. Fast path (no pause
    /// requested, not cancelled) is a single atomic load and swap, no
    /// allocation, no await. On a pending pause it flips the state to
    /// `Paused` and suspends until `start()` resumes it.
    pub async fn yield_async(&self) -> Result<()> {
        if self.cancel_scope.is_cancelled() {
            return Err(ReqflowError::Cancelled);
        }
        if !self.pause_requested.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if self.transition_and_announce(RequestState::Paused).is_some() {
            self.emit(RequestEvent::StateChanged(RequestState::Paused));
        }
        loop {
            if self.cancel_scope.is_cancelled() {
                return Err(ReqflowError::Cancelled);
            }
            if self.state() == RequestState::Running {
                return Ok(());
            }
            tokio::select! {
                _ = self.transition_notify.notified() => {}
                _ = self.cancel_scope.cancelled() => return Err(ReqflowError::Cancelled),
            }
        }
    }
}

tokio::task_local! {
    static CURRENT_REQUEST: Arc<OwnRequest>;
}

/// Called from inside a work closure without a reference to the `OwnRequest`
/// that's executing it. Resolves to the ambient request set by
/// `begin_execute`; a no-op outside of one.
pub async fn yield_now() -> Result<()> {
    let current = CURRENT_REQUEST.try_with(|r| r.clone()).ok();
    match current {
        Some(request) => request.yield_async().await,
        None => Ok(()),
    }
}

#[async_trait]
impl Request for OwnRequest {
    fn id(&self) -> RequestId {
        self.id
    }

    fn state(&self) -> RequestState {
        self.machine.state()
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn attempt_counter(&self) -> u32 {
        self.attempt_counter.load(Ordering::SeqCst)
    }

    fn exception(&self) -> Option<Arc<AggregateError>> {
        let causes = self.aggregate_errors.lock().clone();
        if causes.is_empty() {
            None
        } else {
            Some(Arc::new(AggregateError { causes }))
        }
    }

    async fn start(&self) -> Result<()> {
        if self.state() != RequestState::Paused {
            return Ok(());
        }
        if let Some(delay) = self.deploy_delay {
            if self.transition_and_announce(RequestState::Waiting).is_some() {
                let this = self.arc();
                tokio::spawn(async move { this.deploy_after(delay).await });
            }
        } else {
            self.admit().await;
        }
        Ok(())
    }

    async fn pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    async fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        if self.transition_and_announce(RequestState::Cancelled).is_some() {
            self.finish_terminal();
            self.emit(RequestEvent::Cancelled);
            self.dispose_subsequent_chain();
        }
    }

    async fn dispose(&self) {
        self.cancel().await;
        self.dispose_subsequent_chain();
    }

    fn try_set_idle(&self) -> bool {
        loop {
            let current = self.state();
            if current.is_terminal() {
                return false;
            }
            if current == RequestState::Idle {
                return true;
            }
            if self.transition_and_announce(RequestState::Idle).is_some() {
                return true;
            }
        }
    }

    async fn wait_completion(&self) {
        if self.completed_flag.load(Ordering::SeqCst) {
            return;
        }
        loop {
            let notified = self.completion_notify.notified();
            if self.completed_flag.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn on_event(&self, listener: EventListener) {
        self.listeners.lock().push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DispatcherOptions, ParallelHandler};
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    use std::time::Duration as StdDuration;

    fn immediate_ok() -> WorkFn {
        Arc::new(|_cancel| Box::pin(async { Ok(()) }))
    }

    fn fails_n_times(n: u32) -> (WorkFn, Arc<StdAtomicU32>) {
        let calls = Arc::new(StdAtomicU32::new(0));
        let c = calls.clone();
        let work: WorkFn = Arc::new(move |_cancel| {
            let c = c.clone();
            Box::pin(async move {
                let attempt = c.fetch_add(1, Ordering::SeqCst);
                if attempt < n {
                    anyhow::bail!("synthetic failure on attempt {attempt}");
                }
                Ok(())
            })
        });
        (work, calls)
    }

    #[tokio::test]
    async fn completes_successfully_with_default_handler() {
        let options = RequestOptions {
            handler: Some(ParallelHandler::new(DispatcherOptions::default())),
            ..Default::default()
        };
        let request = OwnRequest::new(immediate_ok(), options).unwrap();
        request.wait_completion().await;
        assert_eq!(request.state(), RequestState::Completed);
        assert!(request.exception().is_none());
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let (work, calls) = fails_n_times(2);
        let handler = ParallelHandler::new(DispatcherOptions::default());
        let options = RequestOptions {
            handler: Some(handler),
            max_attempts: 3,
            ..Default::default()
        };
        let request = OwnRequest::new(work, options).unwrap();
        request.wait_completion().await;
        assert_eq!(request.state(), RequestState::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(request.attempt_counter(), 3);
    }

    #[tokio::test]
    async fn fails_after_exhausting_attempts() {
        let (work, _calls) = fails_n_times(100);
        let handler = ParallelHandler::new(DispatcherOptions::default());
        let options = RequestOptions {
            handler: Some(handler),
            max_attempts: 3,
            ..Default::default()
        };
        let request = OwnRequest::new(work, options).unwrap();
        request.wait_completion().await;
        assert_eq!(request.state(), RequestState::Failed);
        assert_eq!(request.exception().unwrap().causes.len(), 3);
    }

    #[tokio::test]
    async fn cancel_before_start_short_circuits_work() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let work: WorkFn = Arc::new(move |_cancel| {
            let r = r.clone();
            Box::pin(async move {
                r.store(true, Ordering::SeqCst);
                Ok(())
            })
        });
        let handler = ParallelHandler::new(DispatcherOptions::default());
        let options = RequestOptions {
            handler: Some(handler),
            auto_start: false,
            ..Default::default()
        };
        let request = OwnRequest::new(work, options).unwrap();
        request.cancel().await;
        assert_eq!(request.state(), RequestState::Cancelled);
        let start_result = request.start().await;
        assert!(start_result.is_ok());
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(request.state(), RequestState::Cancelled);
    }

    #[tokio::test]
    async fn zero_max_attempts_is_rejected() {
        let options = RequestOptions {
            max_attempts: 0,
            ..Default::default()
        };
        let result = OwnRequest::new(immediate_ok(), options);
        assert!(matches!(result, Err(ReqflowError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn pause_takes_effect_within_one_yield() {
        let yields_seen = Arc::new(StdAtomicU32::new(0));
        let y = yields_seen.clone();
        let work: WorkFn = Arc::new(move |_cancel| {
            let y = y.clone();
            Box::pin(async move {
                for _ in 0..10 {
                    y.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(StdDuration::from_millis(10)).await;
                    super::yield_now().await.map_err(anyhow::Error::from)?;
                }
                Ok(())
            })
        });
        let handler = ParallelHandler::new(DispatcherOptions::default());
        let options = RequestOptions {
            handler: Some(handler),
            ..Default::default()
        };
        let request = OwnRequest::new(work, options).unwrap();
        tokio::time::sleep(StdDuration::from_millis(25)).await;
        request.pause().await;
        // The in-flight yield_async call should observe the pause request
        // and transition to Paused well within another full sleep-yield cycle.
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(request.state(), RequestState::Paused);
    }

    #[tokio::test]
    async fn subsequent_request_runs_inline_after_success() {
        let handler = ParallelHandler::new(DispatcherOptions::default());
        let second_ran = Arc::new(AtomicBool::new(false));
        let s = second_ran.clone();
        let second_work: WorkFn = Arc::new(move |_cancel| {
            let s = s.clone();
            Box::pin(async move {
                s.store(true, Ordering::SeqCst);
                Ok(())
            })
        });
        let second = OwnRequest::new(
            second_work,
            RequestOptions {
                handler: Some(handler.clone()),
                auto_start: false,
                ..Default::default()
            },
        )
        .unwrap();

        let first_options = RequestOptions {
            handler: Some(handler),
            ..Default::default()
        }
        .with_subsequent(second.clone())
        .unwrap();
        let first = OwnRequest::new(immediate_ok(), first_options).unwrap();

        first.wait_completion().await;
        second.wait_completion().await;
        assert_eq!(first.state(), RequestState::Completed);
        assert_eq!(second.state(), RequestState::Completed);
        assert!(second_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn try_set_subsequent_rejects_terminal_requests() {
        let handler = ParallelHandler::new(DispatcherOptions::default());
        let first = OwnRequest::new(
            immediate_ok(),
            RequestOptions {
                handler: Some(handler.clone()),
                ..Default::default()
            },
        )
        .unwrap();
        first.wait_completion().await;

        let second = OwnRequest::new(
            immediate_ok(),
            RequestOptions {
                handler: Some(handler.clone()),
                auto_start: false,
                ..Default::default()
            },
        )
        .unwrap();
        // `first` is already terminal: attaching a subsequent to it now is rejected.
        assert!(matches!(
            first.try_set_subsequent(second.clone()),
            Err(ReqflowError::InvalidTransition { .. })
        ));

        // A fresh, non-terminal request may still have one attached.
        let third = OwnRequest::new(
            immediate_ok(),
            RequestOptions {
                handler: Some(handler),
                auto_start: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(third.try_set_subsequent(second.clone()).is_ok());
        // And a terminal candidate cannot itself be attached.
        assert!(matches!(
            third.try_set_subsequent(first),
            Err(ReqflowError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn cancelling_first_request_disposes_subsequent_without_running_it() {
        let handler = ParallelHandler::new(DispatcherOptions::default());
        let second_ran = Arc::new(AtomicBool::new(false));
        let s = second_ran.clone();
        let second_work: WorkFn = Arc::new(move |_cancel| {
            let s = s.clone();
            Box::pin(async move {
                s.store(true, Ordering::SeqCst);
                Ok(())
            })
        });
        let second = OwnRequest::new(
            second_work,
            RequestOptions {
                handler: Some(handler.clone()),
                auto_start: false,
                ..Default::default()
            },
        )
        .unwrap();

        let (work, _calls) = fails_n_times(100);
        let first_options = RequestOptions {
            handler: Some(handler),
            max_attempts: 50,
            ..Default::default()
        }
        .with_subsequent(second.clone())
        .unwrap();
        let first = OwnRequest::new(work, first_options).unwrap();

        tokio::time::sleep(StdDuration::from_millis(15)).await;
        first.cancel().await;
        first.wait_completion().await;
        second.wait_completion().await;

        assert_eq!(first.state(), RequestState::Cancelled);
        assert_eq!(second.state(), RequestState::Cancelled);
        assert!(!second_ran.load(Ordering::SeqCst));
    }
}
