//! Cooperative suspend/resume and cancellation primitives.
//!
//! Neither of these is a replacement for the other: a `CancelToken` firing is
//! permanent and observed as an error at the next yield point, while a
//! `PauseToken` is a resumable gate that simply blocks a waiter until
//! `resume()` is called.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{ReqflowError, Result};

struct CancelTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
    callbacks: parking_lot::Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

/// A one-shot, idempotent cancellation flag with callback and linked-child support.
#[derive(Clone)]
pub struct CancelToken(Arc<CancelTokenInner>);

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(CancelTokenInner {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
            callbacks: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    /// Build a token that is cancelled as soon as any of `parents` is cancelled.
    ///
    /// This is the "linked composition" mechanism described in the scheduling
    /// model: a request's effective cancel scope links the handler's token
    /// with an optional user-supplied token.
    pub fn linked<I: IntoIterator<Item = CancelToken>>(parents: I) -> Self {
        let child = CancelToken::new();
        for parent in parents {
            if parent.is_cancelled() {
                child.cancel();
                continue;
            }
            let weak_child = child.clone();
            parent.on_cancel(move || weak_child.cancel());
        }
        child
    }

    /// Idempotent: subsequent calls are no-ops.
    pub fn cancel(&self) {
        if self
            .0
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.0.notify.notify_waiters();
            let callbacks = std::mem::take(&mut *self.0.callbacks.lock());
            for cb in callbacks {
                cb();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Register a callback fired exactly once, at the moment of cancellation.
    /// If already cancelled, the callback fires immediately (inline).
    pub fn on_cancel<F: FnOnce() + Send + 'static>(&self, f: F) {
        if self.is_cancelled() {
            f();
            return;
        }
        let mut callbacks = self.0.callbacks.lock();
        // Re-check under the lock: cancel() may have raced us to completion.
        if self.is_cancelled() {
            drop(callbacks);
            f();
        } else {
            callbacks.push(Box::new(f));
        }
    }

    /// Suspend until cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }

    /// Return `Err(Cancelled)` if this token has fired, otherwise `Ok(())`.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ReqflowError::Cancelled)
        } else {
            Ok(())
        }
    }
}

struct PauseTokenInner {
    paused: AtomicBool,
    notify: Notify,
}

/// A two-state, resumable gate. Starts resumed.
#[derive(Clone)]
pub struct PauseToken(Arc<PauseTokenInner>);

impl Default for PauseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseToken {
    pub fn new() -> Self {
        Self(Arc::new(PauseTokenInner {
            paused: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn pause(&self) {
        self.0.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.0.paused.store(false, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.0.paused.load(Ordering::SeqCst)
    }

    /// Suspend while paused. Resolves immediately if not paused.
    ///
    /// If `cancel` fires while waiting, the wait completes with
    /// `ReqflowError::Cancelled` instead of waiting for `resume()`.
    pub async fn wait_while_paused(&self, cancel: &CancelToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(ReqflowError::Cancelled);
            }
            if !self.is_paused() {
                return Ok(());
            }
            let notified = self.0.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(ReqflowError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn cancel_is_idempotent_and_fires_callbacks_once() {
        let token = CancelToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        token.on_cancel(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        token.cancel();
        token.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn linked_child_cancels_with_any_parent() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        let child = CancelToken::linked([a.clone(), b.clone()]);
        assert!(!child.is_cancelled());
        b.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn linked_against_already_cancelled_parent_cancels_immediately() {
        let a = CancelToken::new();
        a.cancel();
        let child = CancelToken::linked([a]);
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn pause_token_blocks_then_releases_on_resume() {
        let pause = PauseToken::new();
        let cancel = CancelToken::new();
        pause.pause();
        let pause2 = pause.clone();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { pause2.wait_while_paused(&cancel2).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        pause.resume();
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn pause_wait_observes_cancellation() {
        let pause = PauseToken::new();
        let cancel = CancelToken::new();
        pause.pause();
        let pause2 = pause.clone();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { pause2.wait_while_paused(&cancel2).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ReqflowError::Cancelled)));
    }
}
