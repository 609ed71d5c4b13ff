//! Connection lifecycle, command correlation, and notification dispatch.
//!
//! A [`Connection`] owns at most one transport link at a time. `connect()`
//! tears down any existing link first, so it is idempotent. A lost link
//! flushes every pending command with `ConnectionClosed` and, when a
//! positive reconnect interval is configured, arms a single reconnect
//! timer. Connection attempts are stamped with a monotonically increasing
//! attempt number; a stale driver observing a newer stamp abandons its
//! teardown instead of stomping the replacement link. Lifecycle transitions
//! (connect, disconnect, loss handling, timer firing) are serialized on one
//! async lock, so a disconnect landing mid-reconnect cannot interleave with
//! the timer's own transition.

mod correlator;
mod dispatch;
mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pylon_core::{Command, CommandResult, Frame, Notify, NotifyKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::transport::{Transport, TransportEvent, TransportSink};

use correlator::Correlator;
use dispatch::NotifyDispatcher;

pub use dispatch::{CaughtNotify, NotifySubscription};
pub use state::{ConnectionState, StateChange};

/// A resilient connection to a client-services backend.
///
/// Cheap to clone; clones share the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    state: state::StateTracker,
    correlator: Correlator,
    dispatcher: NotifyDispatcher,
    writer: tokio::sync::Mutex<Option<Box<dyn TransportSink>>>,
    /// Stamp of the latest `connect()`/`disconnect()` call. Events carrying
    /// an older stamp are stale and ignored.
    attempt: AtomicU64,
    /// Serializes lifecycle transitions: connect, disconnect, loss
    /// handling, and reconnect-timer firing never interleave.
    lifecycle: tokio::sync::Mutex<()>,
    driver: Mutex<Option<JoinHandle<()>>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Create a connection. No I/O happens until [`Connection::connect`].
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                config,
                transport,
                state: state::StateTracker::new(),
                correlator: Correlator::new(),
                dispatcher: NotifyDispatcher::new(),
                writer: tokio::sync::Mutex::new(None),
                attempt: AtomicU64::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
                driver: Mutex::new(None),
                reconnect_timer: Mutex::new(None),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Subscribe to state transitions.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.inner.state.subscribe()
    }

    /// Open a connection, tearing down any existing one first.
    pub async fn connect(&self) {
        self.inner.start_connect().await;
    }

    /// Close the connection, flush every pending command with
    /// `ConnectionClosed`, and cancel any scheduled reconnect.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        let _ = inner.attempt.fetch_add(1, Ordering::SeqCst);
        inner.teardown_link().await;
        inner.state.set(ConnectionState::Disconnected);
    }

    /// Cancel a scheduled reconnect without touching an open connection.
    ///
    /// A no-op unless the state is `ReconnectPending`; a reconnect that has
    /// already started connecting counts as an open connection.
    pub async fn cancel_reconnect(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        if inner.state.current() != ConnectionState::ReconnectPending {
            return;
        }
        let _ = inner.attempt.fetch_add(1, Ordering::SeqCst);
        if let Some(timer) = inner.reconnect_timer.lock().take() {
            timer.abort();
        }
        inner.state.set(ConnectionState::Disconnected);
    }

    /// Send `command` and await its correlated result.
    ///
    /// Every outcome is a [`CommandResult`] value: `ConnectionClosed` when
    /// not connected (no token is allocated) or when the link drops while
    /// pending, `ConnectionTimeout` when the per-command timeout elapses,
    /// `GenericError` when the frame cannot be written.
    pub async fn execute_command(&self, command: Command) -> CommandResult {
        let inner = &self.inner;
        if inner.state.current() != ConnectionState::Connected {
            return CommandResult::ConnectionClosed;
        }

        let token = correlator::next_token();
        let frame = Frame::Command {
            token: token.clone(),
            command,
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to serialize command");
                return CommandResult::GenericError {
                    error: "failed to serialize command".into(),
                };
            }
        };

        // Register before writing so a disconnect flush racing the write
        // still sees (and resolves) this entry.
        let mut rx = inner.correlator.register(&token);

        let send_result = {
            let mut writer = inner.writer.lock().await;
            match writer.as_mut() {
                Some(sink) => sink.send(text).await,
                None => {
                    let _ = inner.correlator.withdraw(&token);
                    return CommandResult::ConnectionClosed;
                }
            }
        };
        if let Err(e) = send_result {
            warn!(token = %token, error = %e, "failed to send command");
            let _ = inner.correlator.withdraw(&token);
            return CommandResult::GenericError {
                error: "failed to send command".into(),
            };
        }

        match tokio::time::timeout(inner.config.command_timeout(), &mut rx).await {
            Ok(Ok(result)) => result,
            // The entry vanished without a result; the connection is gone.
            Ok(Err(_)) => CommandResult::ConnectionClosed,
            Err(_) => {
                if inner.correlator.withdraw(&token) {
                    CommandResult::ConnectionTimeout
                } else {
                    // A resolution won the race against the timeout; the
                    // result is already buffered.
                    rx.try_recv().unwrap_or(CommandResult::ConnectionClosed)
                }
            }
        }
    }

    /// Register a persistent handler for notifications of `kind`.
    ///
    /// Handlers run in registration order; dropping the returned guard
    /// unregisters the handler.
    pub fn on_notify(
        &self,
        kind: NotifyKind,
        callback: impl Fn(&Notify) + Send + Sync + 'static,
    ) -> NotifySubscription {
        self.inner.dispatcher.subscribe(kind, callback)
    }

    /// Catch the next notification of `kind`.
    pub fn catch_notify(&self, kind: NotifyKind) -> CaughtNotify {
        self.inner.dispatcher.catch_next(kind, None)
    }

    /// Catch the next notification of `kind` accepted by `filter`.
    pub fn catch_notify_when(
        &self,
        kind: NotifyKind,
        filter: impl Fn(&Notify) -> bool + Send + Sync + 'static,
    ) -> CaughtNotify {
        self.inner.dispatcher.catch_next(kind, Some(Box::new(filter)))
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.inner.correlator.pending_count()
    }
}

impl ConnInner {
    async fn start_connect(self: &Arc<Self>) {
        let _lifecycle = self.lifecycle.lock().await;
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        self.begin_attempt(attempt).await;
    }

    /// Tear down any existing link and spawn the driver for `attempt`.
    /// Caller must hold the lifecycle lock.
    fn begin_attempt(
        self: &Arc<Self>,
        attempt: u64,
    ) -> impl std::future::Future<Output = ()> + Send + use<'_> {
        async move {
            self.teardown_link().await;
            self.state.set(ConnectionState::Connecting);

            // The driver holds only a weak reference; dropping the last
            // `Connection` handle must be able to reach `Drop` and abort it.
            let weak = Arc::downgrade(self);
            let handle = tokio::spawn(ConnInner::run_attempt(weak, attempt));
            *self.driver.lock() = Some(handle);
        }
    }

    /// Detach the driver before closing the link so no late transport
    /// event fires into a connection that already moved on.
    async fn teardown_link(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        if let Some(timer) = self.reconnect_timer.lock().take() {
            timer.abort();
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            sink.close().await;
        }
        self.correlator.flush();
    }

    async fn run_attempt(this: Weak<Self>, attempt: u64) {
        let Some(conn) = this.upgrade() else { return };
        let transport = Arc::clone(&conn.transport);
        let endpoint = conn.config.endpoint.clone();
        drop(conn);

        let (sink, mut stream) = match transport.connect(&endpoint).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, "connection attempt failed");
                if let Some(conn) = this.upgrade() {
                    conn.handle_lost(attempt).await;
                }
                return;
            }
        };

        {
            let Some(conn) = this.upgrade() else {
                let mut sink = sink;
                sink.close().await;
                return;
            };
            let mut writer = conn.writer.lock().await;
            if conn.attempt.load(Ordering::SeqCst) != attempt {
                // Superseded while the handshake was in flight.
                drop(writer);
                let mut sink = sink;
                sink.close().await;
                return;
            }
            *writer = Some(sink);
            conn.state.set(ConnectionState::Connected);
        }
        debug!("connection established");

        while let Some(event) = stream.next_event().await {
            match event {
                TransportEvent::Message(text) => {
                    let Some(conn) = this.upgrade() else { return };
                    conn.handle_frame(&text);
                }
                TransportEvent::Closed(reason) => {
                    debug!(
                        reason = reason.as_deref().unwrap_or("none"),
                        "connection closed by peer"
                    );
                    break;
                }
            }
        }
        if let Some(conn) = this.upgrade() {
            conn.handle_lost(attempt).await;
        }
    }

    /// React to a lost or failed link belonging to `attempt`.
    async fn handle_lost(self: &Arc<Self>, attempt: u64) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.attempt.load(Ordering::SeqCst) != attempt {
            return;
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            sink.close().await;
        }
        self.correlator.flush();

        let interval = self.config.reconnect_interval();
        if interval.is_zero() {
            self.state.set(ConnectionState::Disconnected);
            return;
        }

        debug!(delay_ms = self.config.reconnect_interval_ms, "scheduling reconnect");
        self.state.set(ConnectionState::ReconnectPending);
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(this) = weak.upgrade() else { return };
            let _lifecycle = this.lifecycle.lock().await;
            // Fire only if no connect() or disconnect() superseded this
            // timer while it slept or waited for the lock.
            if this
                .attempt
                .compare_exchange(attempt, attempt + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            // Remove our own handle; the teardown in begin_attempt must
            // not abort the task that is driving it.
            let _ = this.reconnect_timer.lock().take();
            this.begin_attempt(attempt + 1).await;
        });
        *self.reconnect_timer.lock() = Some(timer);
    }

    fn handle_frame(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                trace!(error = %e, "dropping unparseable frame");
                return;
            }
        };

        match frame {
            Frame::Command { token, .. } => {
                trace!(token = %token, "server sent a command frame; ignoring");
            }
            Frame::CommandResult {
                token: None,
                result,
            } => {
                debug!(result = ?result, "server reported an unattributed error");
            }
            Frame::CommandResult {
                token: Some(token),
                result,
            } => {
                if !self.correlator.resolve(&token, result) {
                    warn!(token = %token, "command result for unknown token");
                }
            }
            Frame::Notify { notify } => self.dispatcher.dispatch(&notify),
        }
    }
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        if let Some(timer) = self.reconnect_timer.lock().take() {
            timer.abort();
        }
    }
}
