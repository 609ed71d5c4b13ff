//! Session lifecycle orchestration on top of [`Connection`].
//!
//! [`ClientService`] watches the connection state and, on every transition
//! into `Connected`, runs the bootstrap sequence: initialize the session,
//! then describe the local agent and push locale data in parallel. Each
//! phase honors a generation counter so a reconnect mid-flight invalidates
//! the older attempt instead of double-initializing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use pylon_core::{
    Command, CommandResult, Notify, NotifyKind, SessionInitialize, SessionInitializeAgent,
    SessionType, SessionUpdateLocale,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState, NotifySubscription, StateChange};
use crate::geo::GeoQuery;
use crate::transport::Transport;

/// Description of the host the client runs on, sent during agent init.
#[derive(Clone, Debug)]
pub struct LocalAgent {
    /// Operating system family.
    pub platform: String,
    /// Operating system version string.
    pub platform_version: String,
    /// CPU architecture.
    pub architecture: String,
    /// Version of the client binary.
    pub client_version: String,
    /// Version of the UI bundle.
    pub ui_version: String,
}

/// Application-provided facts about the running client.
pub trait ServiceConfig: Send + Sync {
    /// Kind of client opening the session.
    fn session_type(&self) -> SessionType;
    /// URL of the locale bundle the user selected, if any.
    fn selected_locale_url(&self) -> Option<String>;
    /// Host description for agent initialization.
    fn host_info(&self) -> LocalAgent;
}

/// Session lifecycle events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    /// The session finished bootstrapping and commands may flow.
    SessionInitialized,
    /// A previously initialized session lost its connection.
    SessionClosed,
}

/// High-level client service: owns a [`Connection`] and keeps its session
/// initialized across reconnects.
pub struct ClientService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    settings: ClientConfig,
    service_config: Arc<dyn ServiceConfig>,
    geo: Arc<dyn GeoQuery>,
    connection: Connection,
    events: broadcast::Sender<ServiceEvent>,
    /// True between a successful agent init and the next connection loss.
    session_initialized: AtomicBool,
    /// Bumped whenever a new agent-init attempt starts or the service
    /// halts; a stale attempt observing a newer value drops its outcome.
    agent_generation: AtomicU64,
    /// Same scheme for locale updates.
    locale_generation: AtomicU64,
    /// Timer for a full reconnect after a fatal bootstrap failure.
    retry_timer: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    _clients_online: NotifySubscription,
}

impl ClientService {
    /// Build a service over `transport`. Call [`start`](Self::start) to
    /// open the connection.
    pub fn new(
        settings: ClientConfig,
        service_config: Arc<dyn ServiceConfig>,
        geo: Arc<dyn GeoQuery>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let connection = Connection::new(settings.clone(), transport);
        let clients_online = connection.on_notify(NotifyKind::ClientsOnline, |notify| {
            if let Notify::ClientsOnline(counts) = notify {
                trace!(
                    total = counts.total_users_online,
                    unique = counts.total_unique_users_online,
                    "online user counts updated"
                );
            }
        });
        let (events, _) = broadcast::channel(16);

        let inner = Arc::new(ServiceInner {
            settings,
            service_config,
            geo,
            connection,
            events,
            session_initialized: AtomicBool::new(false),
            agent_generation: AtomicU64::new(0),
            locale_generation: AtomicU64::new(0),
            retry_timer: Mutex::new(None),
            watcher: Mutex::new(None),
            _clients_online: clients_online,
        });

        let weak = Arc::downgrade(&inner);
        let states = inner.connection.subscribe_state();
        let watcher = tokio::spawn(ServiceInner::watch_states(weak, states));
        *inner.watcher.lock() = Some(watcher);

        Self { inner }
    }

    /// Open the connection. Bootstrap runs automatically once connected.
    pub async fn start(&self) {
        self.inner.connection.connect().await;
    }

    /// Close the connection and cancel any scheduled reconnect.
    pub async fn stop(&self) {
        self.inner.halt().await;
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// The underlying connection, for issuing commands directly.
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Whether the session is currently bootstrapped.
    pub fn is_session_initialized(&self) -> bool {
        self.inner.session_initialized.load(Ordering::SeqCst)
    }
}

impl ServiceInner {
    async fn watch_states(
        inner: std::sync::Weak<ServiceInner>,
        mut states: broadcast::Receiver<StateChange>,
    ) {
        loop {
            let change = match states.recv().await {
                Ok(change) => change,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "state watcher lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            let Some(inner) = inner.upgrade() else { return };
            if change.new == ConnectionState::Connected {
                info!("connected; bootstrapping session");
                let this = Arc::clone(&inner);
                let _detached = tokio::spawn(async move { this.bootstrap().await });
            } else if inner.session_initialized.swap(false, Ordering::SeqCst) {
                let _ = inner.events.send(ServiceEvent::SessionClosed);
            }
        }
    }

    async fn bootstrap(self: Arc<Self>) {
        let init = Command::SessionInitialize(SessionInitialize { anonymize_ip: false });
        match self.execute_with_retry(init).await {
            CommandResult::Success => {
                let agent = Arc::clone(&self).initialize_agent();
                let locale = Arc::clone(&self).update_locale();
                let ((), ()) = tokio::join!(agent, locale);
            }
            // The link dropped; the next connect restarts the bootstrap.
            CommandResult::ConnectionClosed => {}
            other => {
                error!(result = ?other, "session initialization failed; scheduling full reconnect");
                self.schedule_reconnect(self.settings.session_init_backoff())
                    .await;
            }
        }
    }

    async fn initialize_agent(self: Arc<Self>) {
        let generation = self.agent_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let host = self.service_config.host_info();
        let command = Command::SessionInitializeAgent(SessionInitializeAgent {
            session_type: self.service_config.session_type(),
            platform: Some(host.platform),
            platform_version: Some(host.platform_version),
            architecture: Some(host.architecture),
            client_version: Some(host.client_version),
            ui_version: Some(host.ui_version),
        });

        let result = self.execute_with_retry(command).await;
        if self.agent_generation.load(Ordering::SeqCst) != generation {
            trace!("agent initialization superseded; dropping outcome");
            return;
        }
        match result {
            CommandResult::Success => {
                self.session_initialized.store(true, Ordering::SeqCst);
                info!("session initialized");
                let _ = self.events.send(ServiceEvent::SessionInitialized);
            }
            CommandResult::ConnectionClosed => {}
            other => {
                error!(result = ?other, "agent initialization failed; scheduling full reconnect");
                self.schedule_reconnect(self.settings.agent_init_backoff())
                    .await;
            }
        }
    }

    async fn update_locale(self: Arc<Self>) {
        let generation = self.locale_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let geo = self.geo.query(self.settings.geo_budget()).await;
        if self.locale_generation.load(Ordering::SeqCst) != generation {
            trace!("locale update superseded; dropping");
            return;
        }
        let command = Command::SessionUpdateLocale(SessionUpdateLocale {
            ip_country: geo.map(|info| info.country.to_lowercase()),
            selected_locale: self.service_config.selected_locale_url(),
            local_timestamp: Utc::now().timestamp_millis(),
        });
        // Locale data is advisory; a failure here never tears the session
        // down.
        let result = self.connection.execute_command(command).await;
        trace!(result = ?result, "locale update finished");
    }

    /// Execute `command`, retrying after the retry window as long as the
    /// result is transient. Leaves the loop immediately when the connection
    /// drops out of `Connected`, returning the last transient result.
    async fn execute_with_retry(&self, command: Command) -> CommandResult {
        let mut states = self.connection.subscribe_state();
        loop {
            let result = self.connection.execute_command(command.clone()).await;
            if !result.is_retryable() {
                return result;
            }
            debug!(result = ?result, "transient command failure; waiting out the retry window");

            let window = tokio::time::sleep(self.settings.retry_window());
            tokio::pin!(window);
            loop {
                // Biased so a buffered leave-Connected event always beats a
                // window that elapses in the same poll; retrying on the
                // replacement connection would race its own bootstrap.
                tokio::select! {
                    biased;
                    change = states.recv() => match change {
                        Ok(change) if change.new != ConnectionState::Connected => return result,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return result,
                    },
                    () = &mut window => break,
                }
            }
        }
    }

    /// Drop the connection and reconnect from scratch after `delay`.
    async fn schedule_reconnect(self: &Arc<Self>, delay: Duration) {
        self.halt().await;
        info!(delay_s = delay.as_secs(), "full reconnect scheduled");
        // The timer holds only a weak reference so dropping the service
        // disposes it rather than the timer keeping the service alive.
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(this) = weak.upgrade() else { return };
            this.connection.connect().await;
        });
        *self.retry_timer.lock() = Some(timer);
    }

    async fn halt(&self) {
        self.connection.disconnect().await;
        if let Some(timer) = self.retry_timer.lock().take() {
            timer.abort();
        }
        // Invalidate any bootstrap phase still in flight.
        let _ = self.agent_generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.locale_generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        if let Some(timer) = self.retry_timer.lock().take() {
            timer.abort();
        }
    }
}
