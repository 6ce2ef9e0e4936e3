//! Aggregating collections of `Request`s that are themselves a `Request`.
//!
//! A container's own state is a summary derived from its members' states via
//! a fixed `RequestState` precedence order; membership can grow or shrink at
//! runtime, and the aggregate recomputes whenever a member changes.
//!
//! Like `OwnRequest` and the dispatchers, a container is always handed out
//! as `Arc<Container>`: members hold a weak callback back into it, so it can
//! recompute its aggregate state whenever one of them changes.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::error::AggregateError;
use crate::priority::Priority;
use crate::request::{EventListener, Request, RequestEvent, RequestId, RequestState};

/// Precedence used to fold every member's state into one aggregate state:
/// the first state found present in this order wins.
const PRECEDENCE: [RequestState; 7] = [
    RequestState::Failed,
    RequestState::Running,
    RequestState::Cancelled,
    RequestState::Idle,
    RequestState::Waiting,
    RequestState::Completed,
    RequestState::Paused,
];

fn fold_precedence(states: impl Iterator<Item = RequestState>) -> RequestState {
    let present: Vec<RequestState> = states.collect();
    PRECEDENCE
        .into_iter()
        .find(|s| present.contains(s))
        .unwrap_or(RequestState::Idle)
}

/// An unordered, mutable collection of `Request`s (leaf requests,
/// dispatchers, or nested containers) whose own state is the aggregate of
/// its members'.
///
/// Structural mutation (`add`/`remove`) takes the members list's write lock;
/// reads (`snapshot`, `aggregate_state`) only ever contend with a mutation in
/// progress, never with each other.
pub struct Container {
    id: RequestId,
    members: RwLock<Vec<Arc<dyn Request>>>,
    listeners: Mutex<Vec<EventListener>>,
    self_handle: OnceLock<Weak<Container>>,
}

impl Container {
    pub fn new() -> Arc<Self> {
        let container = Arc::new(Self {
            id: RequestId::new(),
            members: RwLock::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            self_handle: OnceLock::new(),
        });
        let _ = container.self_handle.set(Arc::downgrade(&container));
        container
    }

    /// Add a member, subscribing to its state-change events so the
    /// container's own aggregate state stays current.
    pub fn add(&self, member: Arc<dyn Request>) {
        self.subscribe(&member);
        self.members.write().push(member);
        self.announce_aggregate();
    }

    pub fn add_range(&self, new_members: impl IntoIterator<Item = Arc<dyn Request>>) {
        for member in new_members {
            self.subscribe(&member);
            self.members.write().push(member);
        }
        self.announce_aggregate();
    }

    /// Remove the member with the given id, if present.
    pub fn remove(&self, id: RequestId) -> Option<Arc<dyn Request>> {
        let removed = {
            let mut members = self.members.write();
            let pos = members.iter().position(|m| m.id() == id)?;
            Some(members.remove(pos))
        };
        if removed.is_some() {
            self.announce_aggregate();
        }
        removed
    }

    /// Replace the member at `index` with `replacement`, subscribing the new
    /// member and returning the old one. `None` (leaving the container
    /// untouched) if `index` is out of bounds.
    pub fn replace_at(&self, index: usize, replacement: Arc<dyn Request>) -> Option<Arc<dyn Request>> {
        let old = {
            let mut members = self.members.write();
            if index >= members.len() {
                return None;
            }
            self.subscribe(&replacement);
            Some(std::mem::replace(&mut members[index], replacement))
        };
        self.announce_aggregate();
        old
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn Request>> {
        self.members.read().clone()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The aggregate state: the highest-precedence state present among the
    /// current members, or `Idle` if there are none.
    pub fn aggregate_state(&self) -> RequestState {
        fold_precedence(self.members.read().iter().map(|m| m.state()))
    }

    /// Suspend until every member present *at the time of this call* has
    /// reached a terminal state. Members added afterwards aren't waited on
    /// by this particular call; call again after adding more to cover them.
    pub async fn wait_batch_completion(&self) {
        let members = self.snapshot();
        let waits = members.iter().map(|m| m.wait_completion());
        futures::future::join_all(waits).await;
    }

    fn subscribe(&self, member: &Arc<dyn Request>) {
        let Some(weak_self) = self.self_handle.get().cloned() else {
            return;
        };
        member.on_event(Arc::new(move |event| {
            if let (RequestEvent::StateChanged(_), Some(this)) = (&event, weak_self.upgrade()) {
                this.announce_aggregate();
            }
        }));
    }

    fn announce_aggregate(&self) {
        let state = self.aggregate_state();
        let listeners = self.listeners.lock().clone();
        for l in listeners {
            l(RequestEvent::StateChanged(state));
        }
    }
}

#[async_trait]
impl Request for Container {
    fn id(&self) -> RequestId {
        self.id
    }

    fn state(&self) -> RequestState {
        self.aggregate_state()
    }

    fn priority(&self) -> Priority {
        self.members
            .read()
            .iter()
            .map(|m| m.priority())
            .min()
            .unwrap_or_default()
    }

    fn attempt_counter(&self) -> u32 {
        self.members
            .read()
            .iter()
            .map(|m| m.attempt_counter())
            .max()
            .unwrap_or(0)
    }

    fn exception(&self) -> Option<Arc<AggregateError>> {
        let causes: Vec<_> = self
            .members
            .read()
            .iter()
            .filter_map(|m| m.exception())
            .flat_map(|agg| agg.causes.clone())
            .collect();
        if causes.is_empty() {
            None
        } else {
            Some(Arc::new(AggregateError { causes }))
        }
    }

    async fn start(&self) -> crate::error::Result<()> {
        for member in self.snapshot() {
            member.start().await?;
        }
        Ok(())
    }

    async fn pause(&self) {
        for member in self.snapshot() {
            member.pause().await;
        }
    }

    async fn cancel(&self) {
        for member in self.snapshot() {
            member.cancel().await;
        }
    }

    async fn dispose(&self) {
        for member in self.snapshot() {
            member.dispose().await;
        }
        self.members.write().clear();
    }

    /// Forces every non-terminal member back to `Idle`; fails for a member
    /// still in a terminal state (terminal absorption holds at the leaf
    /// level even though the container as a whole can be reused).
    fn try_set_idle(&self) -> bool {
        let members = self.snapshot();
        if members.is_empty() {
            return true;
        }
        members.iter().all(|m| m.try_set_idle())
    }

    async fn wait_completion(&self) {
        self.wait_batch_completion().await;
    }

    fn on_event(&self, listener: EventListener) {
        self.listeners.lock().push(listener);
    }
}

/// A handle a member reports its progress through, in `[0, 1]`.
///
/// Kept independent of `Request` (rather than a method on the trait) since
/// progress reporting is an opt-in capability most requests don't need;
/// `ProgressableContainer::add` takes one alongside the member it tracks.
struct ProgressInner {
    value: Mutex<f64>,
    listeners: Mutex<Vec<Arc<dyn Fn(f64, f64) + Send + Sync>>>,
}

#[derive(Clone)]
pub struct ProgressHandle {
    id: u64,
    inner: Arc<ProgressInner>,
}

static NEXT_PROGRESS_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

impl Default for ProgressHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHandle {
    pub fn new() -> Self {
        Self {
            id: NEXT_PROGRESS_ID.fetch_add(1, std::sync::atomic::Ordering::SeqCst),
            inner: Arc::new(ProgressInner {
                value: Mutex::new(0.0),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn report(&self, new_value: f64) {
        let old = {
            let mut v = self.inner.value.lock();
            let old = *v;
            *v = new_value;
            old
        };
        let listeners = self.inner.listeners.lock().clone();
        for l in listeners {
            l(old, new_value);
        }
    }

    pub fn value(&self) -> f64 {
        *self.inner.value.lock()
    }

    fn on_change(&self, cb: Arc<dyn Fn(f64, f64) + Send + Sync>) {
        self.inner.listeners.lock().push(cb);
    }
}

struct ProgressState {
    values: HashMap<u64, f64>,
    average: f64,
    listeners: Vec<Arc<dyn Fn(f64) + Send + Sync>>,
}

fn recompute_locked(state: &mut ProgressState) {
    let n = state.values.len();
    state.average = if n == 0 {
        0.0
    } else {
        state.values.values().sum::<f64>() / n as f64
    };
}

/// A `Container` that additionally tracks an incrementally-maintained
/// average progress across its members.
///
/// A progress report updates the average in O(1)
/// (`avg += (new - old) / n`); a structural change (add/remove) instead
/// recomputes the average from scratch over the current member set, since
/// the incremental formula only holds while `n` is unchanged.
pub struct ProgressableContainer {
    container: Arc<Container>,
    progress: Arc<Mutex<ProgressState>>,
    member_progress_ids: Mutex<HashMap<RequestId, u64>>,
}

impl Default for ProgressableContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressableContainer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            container: Container::new(),
            progress: Arc::new(Mutex::new(ProgressState {
                values: HashMap::new(),
                average: 0.0,
                listeners: Vec::new(),
            })),
            member_progress_ids: Mutex::new(HashMap::new()),
        })
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    /// Add a member along with the `ProgressHandle` its work reports
    /// through.
    pub fn add(&self, member: Arc<dyn Request>, progress: ProgressHandle) {
        self.member_progress_ids
            .lock()
            .insert(member.id(), progress.id);
        {
            let mut state = self.progress.lock();
            state.values.insert(progress.id, progress.value());
            recompute_locked(&mut state);
        }

        let progress_ref = self.progress.clone();
        let hid = progress.id;
        progress.on_change(Arc::new(move |old, new| {
            let (average, listeners) = {
                let mut state = progress_ref.lock();
                let Some(v) = state.values.get_mut(&hid) else {
                    return;
                };
                *v = new;
                let n = (state.values.len() as f64).max(1.0);
                state.average += (new - old) / n;
                (state.average, state.listeners.clone())
            };
            for l in listeners {
                l(average);
            }
        }));

        self.container.add(member);
    }

    pub fn remove(&self, id: RequestId) -> Option<Arc<dyn Request>> {
        let removed = self.container.remove(id);
        if removed.is_some() {
            if let Some(hid) = self.member_progress_ids.lock().remove(&id) {
                let mut state = self.progress.lock();
                state.values.remove(&hid);
                recompute_locked(&mut state);
            }
        }
        removed
    }

    pub fn average(&self) -> f64 {
        self.progress.lock().average
    }

    pub fn on_progress(&self, cb: Arc<dyn Fn(f64) + Send + Sync>) {
        self.progress.lock().listeners.push(cb);
    }
}
