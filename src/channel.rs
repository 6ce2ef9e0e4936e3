//! Channel-shaped facades over the priority queue.
//!
//! Two variants share an identical observable contract (the `Channel`
//! trait): `DynamicPriorityChannel` backs onto the quaternary heap in
//! [`crate::queue`] and accepts any [`Priority`]; `FixedPriorityChannel`
//! buckets into `N` plain FIFO deques indexed by a dense integer priority,
//! for callers who know their priority space is small and contiguous and
//! would rather skip heap bookkeeping entirely.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use crate::error::{ReqflowError, Result};
use crate::priority::Priority;
use crate::queue::{PriorityQueue, SequenceId};
use crate::token::{CancelToken, PauseToken};

/// Options shared by both channel variants: the dispatcher's parallelism
/// bound (observable via a `watch` channel so readers can react to changes
/// without polling), its pause switch, and its cancellation scope.
#[derive(Clone)]
pub struct ChannelOptions {
    dop_tx: watch::Sender<usize>,
    pub pause_token: PauseToken,
    pub cancel_token: CancelToken,
}

impl ChannelOptions {
    pub fn new(initial_degree_of_parallelism: usize) -> Self {
        let (dop_tx, _) = watch::channel(initial_degree_of_parallelism.max(1));
        Self {
            dop_tx,
            pause_token: PauseToken::new(),
            cancel_token: CancelToken::new(),
        }
    }

    /// Subscribe to degree-of-parallelism changes. The dispatcher's reader
    /// loop watches this to spawn or retire workers.
    pub fn degree_of_parallelism_receiver(&self) -> watch::Receiver<usize> {
        self.dop_tx.subscribe()
    }

    pub fn degree_of_parallelism(&self) -> usize {
        *self.dop_tx.borrow()
    }

    pub fn set_degree_of_parallelism(&self, n: usize) {
        // Ignored if there are no receivers left (dispatcher shut down);
        // matches the "best-effort" framing of every other mutator here.
        let _ = self.dop_tx.send(n.max(1));
    }
}

/// The observable contract shared by both channel variants.
#[async_trait]
pub trait Channel<T: Send + 'static>: Send + Sync {
    /// Non-blocking write. `Err(ChannelClosed)` after `try_complete`.
    fn try_write(&self, priority: Priority, item: T) -> Result<SequenceId>;

    /// Writes never actually suspend (the writer side always accepts), so
    /// this simply forwards to `try_write`; kept as a distinct async method
    /// because the trait's callers are otherwise uniformly async.
    async fn write(&self, priority: Priority, item: T) -> Result<SequenceId> {
        self.try_write(priority, item)
    }

    /// Non-blocking read of the minimum-priority item.
    fn try_read(&self) -> Option<T>;

    /// Suspend until an item is available or the channel is drained and completed.
    async fn read_async(&self) -> Option<T>;

    /// `true` once an item becomes visible; `false` once drained and completed.
    async fn wait_to_read(&self) -> bool;

    /// Best-effort removal of a specific previously-written item.
    fn try_remove(&self, id: SequenceId) -> Option<T>;

    /// Idempotent. After completion: writes fail, pending reads drain, and
    /// reads after the drain report `None`/`false`.
    fn try_complete(&self);

    fn is_completed(&self) -> bool;

    fn len(&self) -> usize;

    fn options(&self) -> &ChannelOptions;
}

/// Heap-backed channel accepting any [`Priority`].
pub struct DynamicPriorityChannel<T> {
    queue: PriorityQueue<T>,
    notify: Notify,
    completed: AtomicBool,
    options: ChannelOptions,
}

impl<T> DynamicPriorityChannel<T> {
    pub fn new(options: ChannelOptions) -> Self {
        Self {
            queue: PriorityQueue::new(),
            notify: Notify::new(),
            completed: AtomicBool::new(false),
            options,
        }
    }
}

impl<T: Send + 'static> Default for DynamicPriorityChannel<T> {
    fn default() -> Self {
        Self::new(ChannelOptions::new(1))
    }
}

#[async_trait]
impl<T: Send + 'static> Channel<T> for DynamicPriorityChannel<T> {
    fn try_write(&self, priority: Priority, item: T) -> Result<SequenceId> {
        if self.completed.load(Ordering::SeqCst) {
            return Err(ReqflowError::ChannelClosed);
        }
        let id = self.queue.enqueue(priority, item);
        tracing::trace!(sequence = ?id, "channel write");
        self.notify.notify_one();
        Ok(id)
    }

    fn try_read(&self) -> Option<T> {
        self.queue.try_dequeue().map(|(id, v)| {
            tracing::trace!(sequence = ?id, "channel read");
            v
        })
    }

    async fn read_async(&self) -> Option<T> {
        loop {
            if let Some(item) = self.try_read() {
                return Some(item);
            }
            if self.completed.load(Ordering::SeqCst) && self.queue.is_empty() {
                return None;
            }
            let notified = self.notify.notified();
            if !self.queue.is_empty() {
                continue;
            }
            notified.await;
        }
    }

    async fn wait_to_read(&self) -> bool {
        loop {
            if !self.queue.is_empty() {
                return true;
            }
            if self.completed.load(Ordering::SeqCst) {
                return false;
            }
            self.notify.notified().await;
        }
    }

    fn try_remove(&self, id: SequenceId) -> Option<T> {
        self.queue.try_remove(id)
    }

    fn try_complete(&self) {
        if self
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.notify.notify_waiters();
        }
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn options(&self) -> &ChannelOptions {
        &self.options
    }
}

/// Bucketed channel for dense integer priorities.
///
/// Per the resolved open question on bucket overflow: writes whose priority
/// maps outside `[0, bucket_count)` are rejected with `InvalidArgument`
/// rather than silently clamped or dropped.
pub struct FixedPriorityChannel<T> {
    buckets: Vec<Mutex<VecDeque<(SequenceId, T)>>>,
    next_sequence: AtomicU64,
    notify: Notify,
    completed: AtomicBool,
    options: ChannelOptions,
}

impl<T> FixedPriorityChannel<T> {
    /// `bucket_count` must be > 0.
    pub fn new(bucket_count: usize, options: ChannelOptions) -> Result<Self> {
        if bucket_count == 0 {
            return Err(ReqflowError::InvalidArgument(
                "bucket_count must be > 0".to_string(),
            ));
        }
        Ok(Self {
            buckets: (0..bucket_count).map(|_| Mutex::new(VecDeque::new())).collect(),
            next_sequence: AtomicU64::new(0),
            notify: Notify::new(),
            completed: AtomicBool::new(false),
            options,
        })
    }

    fn bucket_index(&self, priority: Priority) -> Result<usize> {
        let idx = priority.value();
        if idx < 0.0 || idx.fract() != 0.0 || idx as usize >= self.buckets.len() {
            return Err(ReqflowError::InvalidArgument(format!(
                "priority {idx} has no matching bucket (0..{})",
                self.buckets.len()
            )));
        }
        Ok(idx as usize)
    }
}

#[async_trait]
impl<T: Send + 'static> Channel<T> for FixedPriorityChannel<T> {
    fn try_write(&self, priority: Priority, item: T) -> Result<SequenceId> {
        if self.completed.load(Ordering::SeqCst) {
            return Err(ReqflowError::ChannelClosed);
        }
        let idx = self.bucket_index(priority)?;
        let seq = SequenceId::from_raw(self.next_sequence.fetch_add(1, Ordering::SeqCst));
        self.buckets[idx].lock().push_back((seq, item));
        tracing::trace!(sequence = ?seq, bucket = idx, "channel write");
        self.notify.notify_one();
        Ok(seq)
    }

    fn try_read(&self) -> Option<T> {
        for (idx, bucket) in self.buckets.iter().enumerate() {
            let mut guard = bucket.lock();
            if let Some((seq, item)) = guard.pop_front() {
                tracing::trace!(sequence = ?seq, bucket = idx, "channel read");
                return Some(item);
            }
        }
        None
    }

    async fn read_async(&self) -> Option<T> {
        loop {
            if let Some(item) = self.try_read() {
                return Some(item);
            }
            if self.completed.load(Ordering::SeqCst) && self.is_empty_all() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    async fn wait_to_read(&self) -> bool {
        loop {
            if !self.is_empty_all() {
                return true;
            }
            if self.completed.load(Ordering::SeqCst) {
                return false;
            }
            self.notify.notified().await;
        }
    }

    fn try_remove(&self, id: SequenceId) -> Option<T> {
        for bucket in &self.buckets {
            let mut guard = bucket.lock();
            if let Some(pos) = guard.iter().position(|(s, _)| *s == id) {
                return guard.remove(pos).map(|(_, v)| v);
            }
        }
        None
    }

    fn try_complete(&self) {
        if self
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.notify.notify_waiters();
        }
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    fn options(&self) -> &ChannelOptions {
        &self.options
    }
}

impl<T> FixedPriorityChannel<T> {
    fn is_empty_all(&self) -> bool {
        self.buckets.iter().all(|b| b.lock().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ChannelOptions {
        ChannelOptions::new(1)
    }

    #[tokio::test]
    async fn dynamic_channel_is_fifo_within_priority() {
        let ch = DynamicPriorityChannel::new(opts());
        for (p, v) in [(5.0, "a"), (1.0, "b"), (3.0, "c"), (1.0, "d"), (2.0, "e")] {
            ch.write(Priority::new(p), v).await.unwrap();
        }
        let mut out = Vec::new();
        while let Some(v) = ch.try_read() {
            out.push(v);
        }
        assert_eq!(out, vec!["b", "d", "e", "c", "a"]);
    }

    #[tokio::test]
    async fn write_after_complete_fails() {
        let ch: DynamicPriorityChannel<i32> = DynamicPriorityChannel::new(opts());
        ch.try_complete();
        assert!(matches!(
            ch.try_write(Priority::NORMAL, 1),
            Err(ReqflowError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn read_async_drains_then_reports_none_after_complete() {
        let ch = DynamicPriorityChannel::new(opts());
        ch.write(Priority::NORMAL, 1).await.unwrap();
        ch.try_complete();
        assert_eq!(ch.read_async().await, Some(1));
        assert_eq!(ch.read_async().await, None);
    }

    #[tokio::test]
    async fn read_async_suspends_until_write() {
        let ch = Arc::new(DynamicPriorityChannel::<i32>::new(opts()));
        let reader = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.read_async().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!reader.is_finished());
        ch.write(Priority::NORMAL, 7).await.unwrap();
        assert_eq!(reader.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn fixed_channel_rejects_out_of_range_bucket() {
        let ch: FixedPriorityChannel<i32> = FixedPriorityChannel::new(2, opts()).unwrap();
        let result = ch.try_write(Priority::new(2.0), 1);
        assert!(matches!(result, Err(ReqflowError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn fixed_channel_scans_buckets_low_to_high() {
        let ch: FixedPriorityChannel<&str> = FixedPriorityChannel::new(3, opts()).unwrap();
        ch.try_write(Priority::new(2.0), "low").unwrap();
        ch.try_write(Priority::new(0.0), "high").unwrap();
        ch.try_write(Priority::new(1.0), "mid").unwrap();
        assert_eq!(ch.try_read(), Some("high"));
        assert_eq!(ch.try_read(), Some("mid"));
        assert_eq!(ch.try_read(), Some("low"));
    }

    #[test]
    fn zero_buckets_rejected_at_construction() {
        let result: Result<FixedPriorityChannel<i32>> = FixedPriorityChannel::new(0, opts());
        assert!(matches!(result, Err(ReqflowError::InvalidArgument(_))));
    }
}
