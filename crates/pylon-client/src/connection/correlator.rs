//! Command/response correlation.
//!
//! Every outgoing command registers a pending entry keyed by its token.
//! Removing an entry from the map is the single resolution decision point:
//! whichever path removes it (matching result, timeout, disconnect flush)
//! is the one that resolves the command, so a token resolves exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use pylon_core::CommandResult;
use tokio::sync::oneshot;

/// Process-wide token sequence. Tokens are never reused within the process,
/// even across connections.
static TOKEN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Allocate a fresh correlation token.
pub(crate) fn next_token() -> String {
    let n = TOKEN_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
    format!("tk-{n}")
}

/// Tracks pending commands by token.
pub(crate) struct Correlator {
    pending: Mutex<HashMap<String, oneshot::Sender<CommandResult>>>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending entry for `token`.
    pub(crate) fn register(&self, token: &str) -> oneshot::Receiver<CommandResult> {
        let (tx, rx) = oneshot::channel();
        let _ = self.pending.lock().insert(token.to_owned(), tx);
        rx
    }

    /// Resolve the entry for `token` with `result`. Returns `false` when the
    /// token is unknown (already resolved, timed out, or never issued).
    pub(crate) fn resolve(&self, token: &str, result: CommandResult) -> bool {
        let entry = self.pending.lock().remove(token);
        match entry {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Withdraw the entry for `token` without resolving it. Returns whether
    /// the entry was still pending; the caller owns the outcome if so.
    pub(crate) fn withdraw(&self, token: &str) -> bool {
        self.pending.lock().remove(token).is_some()
    }

    /// Resolve every pending entry with `ConnectionClosed`.
    ///
    /// The whole map is taken under the lock, so a concurrent flush sees
    /// either zero entries or the complete pre-disconnect set.
    pub(crate) fn flush(&self) {
        let entries = std::mem::take(&mut *self.pending.lock());
        for (_, tx) in entries {
            let _ = tx.send(CommandResult::ConnectionClosed);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_exactly_once() {
        let correlator = Correlator::new();
        let rx = correlator.register("tk-a");

        assert!(correlator.resolve("tk-a", CommandResult::Success));
        // A second resolution finds nothing to resolve.
        assert!(!correlator.resolve("tk-a", CommandResult::ServerInternalError));

        assert_eq!(rx.await.unwrap(), CommandResult::Success);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn resolve_unknown_token_is_rejected() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve("tk-unknown", CommandResult::Success));
    }

    #[tokio::test]
    async fn flush_resolves_all_pending_with_connection_closed() {
        let correlator = Correlator::new();
        let receivers: Vec<_> = (0..5)
            .map(|i| correlator.register(&format!("tk-{i}")))
            .collect();

        correlator.flush();
        assert_eq!(correlator.pending_count(), 0);

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), CommandResult::ConnectionClosed);
        }
    }

    #[tokio::test]
    async fn withdraw_beats_late_resolution() {
        let correlator = Correlator::new();
        let _rx = correlator.register("tk-t");

        // Timeout path wins the race: the entry is withdrawn.
        assert!(correlator.withdraw("tk-t"));
        // A result arriving afterwards is treated as unknown.
        assert!(!correlator.resolve("tk-t", CommandResult::Success));
    }

    #[tokio::test]
    async fn resolution_beats_withdraw() {
        let correlator = Correlator::new();
        let rx = correlator.register("tk-r");

        assert!(correlator.resolve("tk-r", CommandResult::Success));
        // Timeout path lost the race: nothing left to withdraw, and the
        // result is already buffered in the channel.
        assert!(!correlator.withdraw("tk-r"));
        assert_eq!(rx.await.unwrap(), CommandResult::Success);
    }

    #[test]
    fn tokens_are_unique_and_monotonic() {
        let a = next_token();
        let b = next_token();
        assert_ne!(a, b);
        let parse = |t: &str| t.trim_start_matches("tk-").parse::<u64>().unwrap();
        assert!(parse(&b) > parse(&a));
    }
}
