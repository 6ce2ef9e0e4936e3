//! A quaternary (branching factor 4) min-heap priority queue.
//!
//! Ordered by `(priority, sequence)` lexicographically, so FIFO order is
//! preserved for items of equal priority. Branching factor 4 gives a
//! shallower tree than a binary heap (depth ~= log4(n)), which cuts the
//! number of comparisons-and-cache-misses on the sift-down path that
//! dominates at high enqueue/dequeue throughput.
//!
//! A single mutex guards the backing array, the sequence counter and the
//! count; every public operation is linearizable with respect to the others.

use parking_lot::Mutex;

/// Opaque handle identifying a previously enqueued item.
///
/// Doubles as the "identity" used by `try_remove`/`contains`: sequence
/// numbers are assigned once, from a monotonic per-queue counter, and are
/// never reused, so handle equality is exact identity equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceId(u64);

impl SequenceId {
    /// Construct a handle from a raw counter value.
    ///
    /// Exposed `pub(crate)` so channel variants that keep their own sequence
    /// counter (e.g. `FixedPriorityChannel`, which doesn't route through
    /// `PriorityQueue`) can still hand out the same handle type.
    pub(crate) fn from_raw(n: u64) -> Self {
        SequenceId(n)
    }
}

#[derive(Debug, Clone)]
struct Entry<T> {
    priority: crate::priority::Priority,
    sequence: SequenceId,
    payload: T,
}

impl<T> Entry<T> {
    fn key(&self) -> (crate::priority::Priority, SequenceId) {
        (self.priority, self.sequence)
    }
}

struct Inner<T> {
    heap: Vec<Entry<T>>,
    next_sequence: u64,
}

/// A thread-safe, stable, quaternary min-heap over `(priority, sequence)`.
pub struct PriorityQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: Vec::new(),
                next_sequence: 0,
            }),
        }
    }

    /// Enqueue `payload` at `priority`, assigning it the next sequence id.
    pub fn enqueue(&self, priority: crate::priority::Priority, payload: T) -> SequenceId {
        let mut inner = self.inner.lock();
        let sequence = SequenceId(inner.next_sequence);
        inner.next_sequence += 1;
        let entry = Entry {
            priority,
            sequence,
            payload,
        };
        let idx = inner.heap.len();
        inner.heap.push(entry);
        sift_up(&mut inner.heap, idx);
        tracing::trace!(sequence = sequence.0, priority = priority.value(), "enqueued");
        sequence
    }

    /// Remove and return the minimum-key item, if any.
    pub fn try_dequeue(&self) -> Option<(SequenceId, T)> {
        let mut inner = self.inner.lock();
        let popped = pop_min(&mut inner.heap).map(|e| (e.sequence, e.payload));
        if let Some((sequence, _)) = &popped {
            tracing::trace!(sequence = sequence.0, "dequeued");
        }
        popped
    }

    /// Return the priority and sequence of the minimum-key item without removing it.
    pub fn peek(&self) -> Option<(crate::priority::Priority, SequenceId)> {
        let inner = self.inner.lock();
        inner.heap.first().map(Entry::key)
    }

    /// Best-effort removal of a specific previously-enqueued item by handle.
    pub fn try_remove(&self, id: SequenceId) -> Option<T> {
        let mut inner = self.inner.lock();
        let idx = inner.heap.iter().position(|e| e.sequence == id)?;
        Some(remove_at(&mut inner.heap, idx).payload)
    }

    pub fn contains(&self, id: SequenceId) -> bool {
        let inner = self.inner.lock();
        inner.heap.iter().any(|e| e.sequence == id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Debug predicate: every parent key must be <= each of its (up to 4) children.
    pub fn is_valid(&self) -> bool
    where
        T: Sized,
    {
        let inner = self.inner.lock();
        let heap = &inner.heap;
        for (i, parent) in heap.iter().enumerate() {
            for c in first_child(i)..first_child(i) + ARITY {
                if let Some(child) = heap.get(c) {
                    if parent.key() > child.key() {
                        return false;
                    }
                }
            }
        }
        true
    }
}

impl<T: Clone> PriorityQueue<T> {
    /// Snapshot the queue in heap order (not sorted order).
    pub fn to_array(&self) -> Vec<T> {
        let inner = self.inner.lock();
        inner.heap.iter().map(|e| e.payload.clone()).collect()
    }
}

const ARITY: usize = 4;

fn parent(i: usize) -> usize {
    (i - 1) / ARITY
}

fn first_child(i: usize) -> usize {
    ARITY * i + 1
}

fn sift_up<T>(heap: &mut [Entry<T>], mut idx: usize) {
    while idx > 0 {
        let p = parent(idx);
        if heap[p].key() <= heap[idx].key() {
            break;
        }
        heap.swap(p, idx);
        idx = p;
    }
}

fn sift_down<T>(heap: &mut [Entry<T>], mut idx: usize) {
    let len = heap.len();
    loop {
        let first = first_child(idx);
        if first >= len {
            break;
        }
        let last_exclusive = (first + ARITY).min(len);
        let smallest = (first..last_exclusive).min_by_key(|&c| heap[c].key()).unwrap();
        if heap[smallest].key() < heap[idx].key() {
            heap.swap(smallest, idx);
            idx = smallest;
        } else {
            break;
        }
    }
}

fn pop_min<T>(heap: &mut Vec<Entry<T>>) -> Option<Entry<T>> {
    if heap.is_empty() {
        return None;
    }
    let last = heap.len() - 1;
    heap.swap(0, last);
    let min = heap.pop();
    if !heap.is_empty() {
        sift_down(heap, 0);
    }
    min
}

fn remove_at<T>(heap: &mut Vec<Entry<T>>, idx: usize) -> Entry<T> {
    let last = heap.len() - 1;
    heap.swap(idx, last);
    let removed = heap.pop().expect("idx was valid, heap non-empty");
    if idx < heap.len() {
        // The item that moved into `idx` may need to move either direction.
        sift_up(heap, idx);
        sift_down(heap, idx);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::Priority;
    use pretty_assertions::assert_eq;

    #[test]
    fn fifo_within_priority() {
        // S1: FIFO within priority.
        let q = PriorityQueue::new();
        let priorities = [5.0, 1.0, 3.0, 1.0, 2.0];
        let payloads = ["a", "b", "c", "d", "e"];
        for (p, v) in priorities.iter().zip(payloads.iter()) {
            q.enqueue(Priority::new(*p), *v);
        }
        let mut out = Vec::new();
        while let Some((_, v)) = q.try_dequeue() {
            out.push(v);
        }
        assert_eq!(out, vec!["b", "d", "e", "c", "a"]);
    }

    #[test]
    fn dequeue_is_permutation_minus_removed() {
        let q = PriorityQueue::new();
        let mut ids = Vec::new();
        for i in 0..37 {
            ids.push(q.enqueue(Priority::new((i % 5) as f64), i));
        }
        // remove a handful, scattered through the heap.
        for &id in &[ids[3], ids[11], ids[20], ids[36]] {
            assert!(q.try_remove(id).is_some());
            assert!(q.is_valid());
        }
        let mut out = Vec::new();
        while let Some((_, v)) = q.try_dequeue() {
            out.push(v);
            assert!(q.is_valid());
        }
        let mut expected: Vec<i32> = (0..37).filter(|i| ![3, 11, 20, 36].contains(i)).collect();
        let mut sorted_out = out.clone();
        sorted_out.sort_unstable();
        expected.sort_unstable();
        assert_eq!(sorted_out, expected);
    }

    #[test]
    fn heap_stays_valid_under_interleaving() {
        let q = PriorityQueue::new();
        for i in 0..200 {
            q.enqueue(Priority::new(((i * 37) % 13) as f64), i);
            assert!(q.is_valid());
            if i % 3 == 0 {
                q.try_dequeue();
                assert!(q.is_valid());
            }
        }
    }

    #[test]
    fn peek_does_not_mutate() {
        let q = PriorityQueue::new();
        q.enqueue(Priority::HIGH, 1);
        q.enqueue(Priority::LOW, 2);
        let peeked = q.peek();
        assert!(peeked.is_some());
        assert_eq!(q.len(), 2);
        let (_, v) = q.try_dequeue().unwrap();
        assert_eq!(v, 1);
    }

    #[test]
    fn empty_queue_dequeues_none() {
        let q: PriorityQueue<i32> = PriorityQueue::new();
        assert_eq!(q.try_dequeue(), None);
        assert!(q.is_valid());
    }

    #[test]
    fn to_array_is_heap_order_snapshot() {
        let q = PriorityQueue::new();
        q.enqueue(Priority::new(2.0), "x");
        q.enqueue(Priority::new(1.0), "y");
        let snap = q.to_array();
        assert_eq!(snap.len(), 2);
        // root of the snapshot must be the minimum.
        assert_eq!(snap[0], "y");
    }
}
