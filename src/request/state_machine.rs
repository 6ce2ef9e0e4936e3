//! The CAS-validated runtime state machine shared by requests and containers.
//!
//! The two owners need different transition tables (a container can cycle
//! back from `Cancelled`/`Completed` to `Idle` for reuse; a bare request
//! cannot), so [`StateMachine`] is parameterized over a [`TransitionTable`]
//! rather than hard-coding one.

use std::sync::atomic::{AtomicU8, Ordering};

use super::RequestState;

/// Which transition table a [`StateMachine`] enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionTable {
    /// Leaf requests: terminal states (`Completed`/`Failed`/`Cancelled`) absorb.
    Request,
    /// Containers and dispatchers: terminal states can reset back to `Idle`.
    Container,
}

fn allowed(table: TransitionTable, from: RequestState, to: RequestState) -> bool {
    use RequestState::*;
    if from == to {
        return true;
    }
    let base = matches!(
        (from, to),
        (Paused, Idle)
            | (Paused, Waiting)
            | (Paused, Cancelled)
            | (Idle, Running)
            | (Idle, Cancelled)
            | (Waiting, Idle)
            | (Waiting, Cancelled)
            | (Running, Idle)
            | (Running, Paused)
            | (Running, Waiting)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
    );
    if base {
        return true;
    }
    if table == TransitionTable::Container {
        return matches!(
            (from, to),
            (Idle, Paused)
                | (Paused, Running)
                | (Idle, Waiting)
                | (Running, Completed)
                | (Running, Failed)
                | (Idle, Cancelled)
                | (Running, Cancelled)
                | (Paused, Cancelled)
                | (Waiting, Cancelled)
                | (Cancelled, Idle)
                | (Completed, Idle)
        );
    }
    false
}

/// An atomic `RequestState` cell whose only mutator, [`try_transition`], is
/// validated against a [`TransitionTable`] under a compare-exchange loop.
pub struct StateMachine {
    state: AtomicU8,
    table: TransitionTable,
}

impl StateMachine {
    pub fn new(initial: RequestState, table: TransitionTable) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
            table,
        }
    }

    pub fn state(&self) -> RequestState {
        RequestState::from_raw(self.state.load(Ordering::SeqCst))
    }

    /// Attempt `current -> to`. Returns the prior state on success, `None`
    /// if the table rejects the transition (never loops on rejection).
    /// Contends on concurrent writers by retrying, not on the caller's
    /// requested edge.
    pub fn try_transition(&self, to: RequestState) -> Option<RequestState> {
        loop {
            let from_raw = self.state.load(Ordering::SeqCst);
            let from = RequestState::from_raw(from_raw);
            if !allowed(self.table, from, to) {
                return None;
            }
            if from == to {
                return Some(from);
            }
            let to_raw = to as u8;
            match self.state.compare_exchange(
                from_raw,
                to_raw,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(from),
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_table_rejects_leaving_terminal() {
        let m = StateMachine::new(RequestState::Running, TransitionTable::Request);
        assert!(m.try_transition(RequestState::Completed).is_some());
        assert!(m.try_transition(RequestState::Idle).is_none());
        assert_eq!(m.state(), RequestState::Completed);
    }

    #[test]
    fn container_table_allows_reset_from_terminal() {
        let m = StateMachine::new(RequestState::Running, TransitionTable::Container);
        assert!(m.try_transition(RequestState::Cancelled).is_some());
        assert!(m.try_transition(RequestState::Idle).is_some());
        assert_eq!(m.state(), RequestState::Idle);
    }

    #[test]
    fn same_state_transition_is_a_no_op_success() {
        let m = StateMachine::new(RequestState::Idle, TransitionTable::Request);
        assert_eq!(m.try_transition(RequestState::Idle), Some(RequestState::Idle));
    }
}
