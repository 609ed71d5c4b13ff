//! Connection state tracking.

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no reconnect scheduled.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The connection is open and commands may be sent.
    Connected,
    /// The connection was lost and a reconnect timer is armed.
    ReconnectPending,
}

/// A state transition, reported as an (old, new) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChange {
    /// State before the transition.
    pub old: ConnectionState,
    /// State after the transition.
    pub new: ConnectionState,
}

/// Holds the current state and publishes transitions.
///
/// Duplicate-state transitions are suppressed: setting the current state
/// again fires no event.
pub(crate) struct StateTracker {
    current: Mutex<ConnectionState>,
    events: broadcast::Sender<StateChange>,
}

impl StateTracker {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            current: Mutex::new(ConnectionState::Disconnected),
            events,
        }
    }

    pub(crate) fn current(&self) -> ConnectionState {
        *self.current.lock()
    }

    /// Transition to `new`, firing an event unless the state is unchanged.
    pub(crate) fn set(&self, new: ConnectionState) {
        let mut current = self.current.lock();
        if *current == new {
            return;
        }
        let old = std::mem::replace(&mut *current, new);
        // Publish while still holding the lock so concurrent transitions
        // reach subscribers in the order they took effect. `send` never
        // blocks; slow subscribers lag instead.
        let _ = self.events.send(StateChange { old, new });
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transition_fires_old_new_pair() {
        let tracker = StateTracker::new();
        let mut rx = tracker.subscribe();

        tracker.set(ConnectionState::Connecting);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.old, ConnectionState::Disconnected);
        assert_eq!(change.new, ConnectionState::Connecting);
        assert_eq!(tracker.current(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn duplicate_transition_is_suppressed() {
        let tracker = StateTracker::new();
        let mut rx = tracker.subscribe();

        tracker.set(ConnectionState::Connecting);
        tracker.set(ConnectionState::Connecting);
        tracker.set(ConnectionState::Connected);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.new, ConnectionState::Connecting);
        assert_eq!(second.old, ConnectionState::Connecting);
        assert_eq!(second.new, ConnectionState::Connected);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn initial_state_is_disconnected() {
        let tracker = StateTracker::new();
        assert_eq!(tracker.current(), ConnectionState::Disconnected);
    }

    #[test]
    fn concurrent_transitions_publish_in_order() {
        use std::sync::Arc;

        let tracker = Arc::new(StateTracker::new());
        let mut rx = tracker.subscribe();

        // Two threads flip the state back and forth; every published pair
        // must chain onto the one before it. 15 flips per thread keeps the
        // event count under the channel capacity.
        let flapper = |state: ConnectionState| {
            let tracker = Arc::clone(&tracker);
            std::thread::spawn(move || {
                for _ in 0..15 {
                    tracker.set(state);
                }
            })
        };
        let a = flapper(ConnectionState::Connecting);
        let b = flapper(ConnectionState::ReconnectPending);
        a.join().unwrap();
        b.join().unwrap();

        let mut previous = ConnectionState::Disconnected;
        while let Ok(change) = rx.try_recv() {
            assert_eq!(change.old, previous, "transition chain broke");
            previous = change.new;
        }
        assert_eq!(previous, tracker.current());
    }
}
