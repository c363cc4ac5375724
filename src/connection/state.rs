//! Connection lifecycle states.
//!
//! Six states; `Closed` is terminal. The pause/resume handshake walks
//! `Open → Waiting → Prewait → Waiting → … → Afterwait → Open` on the side
//! that initiates a negotiation, while the other side sits in `Paused`.
//!
//! The cell is a `watch` channel so owners can await a target state
//! (`join_state`) or subscribe to every transition instead of polling.

use tokio::sync::watch;
use tracing::debug;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Normal traffic in both directions
    Open,
    /// Peer asked us to hold data/subscription traffic
    Paused,
    /// Our pause was confirmed; negotiation window is open
    Prewait,
    /// A request of ours (pause or a negotiation) awaits its response
    Waiting,
    /// Resume sent, waiting for its confirmation
    Afterwait,
    /// Terminal; socket closed, background work cancelled
    Closed,
}

/// Watchable holder of a connection's current state
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    /// Fresh connections start `Open`
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Open);
        Self { tx }
    }

    /// Current state
    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Transition to `next`. `Closed` is terminal: once there, every other
    /// transition is refused. Returns whether the transition took effect.
    pub fn set(&self, next: ConnectionState) -> bool {
        let mut changed = false;
        self.tx.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == next {
                return false;
            }
            debug!(from = ?*current, to = ?next, "connection state transition");
            *current = next;
            changed = true;
            true
        });
        changed
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_open() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::Open);
    }

    #[test]
    fn closed_is_terminal() {
        let cell = StateCell::new();
        assert!(cell.set(ConnectionState::Waiting));
        assert!(cell.set(ConnectionState::Closed));
        assert!(!cell.set(ConnectionState::Open));
        assert_eq!(cell.get(), ConnectionState::Closed);
    }

    #[test]
    fn same_state_transition_is_a_noop() {
        let cell = StateCell::new();
        assert!(!cell.set(ConnectionState::Open));
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();

        cell.set(ConnectionState::Paused);
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow(), ConnectionState::Paused);
    }
}
