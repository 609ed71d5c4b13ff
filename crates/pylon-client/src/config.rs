//! Client configuration.
//!
//! All tunables are explicit fields with serde defaults, so a config can be
//! embedded into a larger settings document or built in code via
//! [`ClientConfig::new`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default reconnect interval in milliseconds. Zero disables auto-reconnect.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;
/// Default per-command timeout in milliseconds.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;
/// Default bootstrap retry window in milliseconds.
pub const DEFAULT_RETRY_WINDOW_MS: u64 = 2_500;
/// Default geolocation lookup budget in milliseconds.
pub const DEFAULT_GEO_BUDGET_MS: u64 = 2_500;
/// Default backoff after a failed `SessionInitialize`, in milliseconds.
pub const DEFAULT_SESSION_INIT_BACKOFF_MS: u64 = 120_000;
/// Default backoff after a failed `SessionInitializeAgent`, in milliseconds.
pub const DEFAULT_AGENT_INIT_BACKOFF_MS: u64 = 60_000;

/// Configuration for a single client-services connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `wss://services.example.net/ws-api/v1`.
    pub endpoint: String,
    /// Delay before reconnecting after a lost connection. Zero disables
    /// automatic reconnection.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// How long a sent command may stay unanswered.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// How long to wait after a retryable result before retrying a
    /// bootstrap command.
    #[serde(default = "default_retry_window_ms")]
    pub retry_window_ms: u64,
    /// How long the locale update waits for geolocation data.
    #[serde(default = "default_geo_budget_ms")]
    pub geo_budget_ms: u64,
    /// Full-reconnect delay after `SessionInitialize` exhausts its retries.
    #[serde(default = "default_session_init_backoff_ms")]
    pub session_init_backoff_ms: u64,
    /// Full-reconnect delay after the server rejects `SessionInitializeAgent`.
    #[serde(default = "default_agent_init_backoff_ms")]
    pub agent_init_backoff_ms: u64,
}

fn default_reconnect_interval_ms() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_MS
}
fn default_command_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_MS
}
fn default_retry_window_ms() -> u64 {
    DEFAULT_RETRY_WINDOW_MS
}
fn default_geo_budget_ms() -> u64 {
    DEFAULT_GEO_BUDGET_MS
}
fn default_session_init_backoff_ms() -> u64 {
    DEFAULT_SESSION_INIT_BACKOFF_MS
}
fn default_agent_init_backoff_ms() -> u64 {
    DEFAULT_AGENT_INIT_BACKOFF_MS
}

impl ClientConfig {
    /// Create a config for `endpoint` with all defaults.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            retry_window_ms: DEFAULT_RETRY_WINDOW_MS,
            geo_budget_ms: DEFAULT_GEO_BUDGET_MS,
            session_init_backoff_ms: DEFAULT_SESSION_INIT_BACKOFF_MS,
            agent_init_backoff_ms: DEFAULT_AGENT_INIT_BACKOFF_MS,
        }
    }

    /// Reconnect interval as a [`Duration`]. Zero disables auto-reconnect.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Per-command timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Bootstrap retry window as a [`Duration`].
    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.retry_window_ms)
    }

    /// Geolocation budget as a [`Duration`].
    pub fn geo_budget(&self) -> Duration {
        Duration::from_millis(self.geo_budget_ms)
    }

    /// Session-init backoff as a [`Duration`].
    pub fn session_init_backoff(&self) -> Duration {
        Duration::from_millis(self.session_init_backoff_ms)
    }

    /// Agent-init backoff as a [`Duration`].
    pub fn agent_init_backoff(&self) -> Duration {
        Duration::from_millis(self.agent_init_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_applies_defaults() {
        let config = ClientConfig::new("wss://example.net/ws-api/v1");
        assert_eq!(config.endpoint, "wss://example.net/ws-api/v1");
        assert_eq!(config.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.retry_window(), Duration::from_millis(2500));
        assert_eq!(config.session_init_backoff(), Duration::from_secs(120));
        assert_eq!(config.agent_init_backoff(), Duration::from_secs(60));
    }

    #[test]
    fn partial_document_fills_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"endpoint":"ws://localhost:1244","reconnectIntervalMs":0}"#)
                .unwrap();
        assert_eq!(config.reconnect_interval_ms, 0);
        assert!(config.reconnect_interval().is_zero());
        assert_eq!(config.command_timeout_ms, DEFAULT_COMMAND_TIMEOUT_MS);
    }
}
