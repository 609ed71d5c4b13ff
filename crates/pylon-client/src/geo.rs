//! Best-effort geolocation with a disk cache.
//!
//! A [`GeoProvider`] tries a chain of HTTP resolvers in order and caches the
//! first answer on disk. Consumers ask through [`GeoQuery::query`] with a
//! budget; an in-flight lookup that outlives the budget degrades to the
//! cached value (or nothing) instead of blocking the caller.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Coarse geolocation data for the client's public IP.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    /// ISO country code.
    pub country: String,
    /// City name, if the resolver reports one.
    pub city: Option<String>,
    /// Region name, if the resolver reports one.
    pub region: Option<String>,
    /// IANA timezone name, if the resolver reports one.
    pub timezone: Option<String>,
}

/// Resolver failure.
#[derive(Debug, Error)]
pub enum GeoError {
    /// The HTTP request failed.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The response did not carry the expected fields.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Source of geolocation lookups, injectable for tests.
#[async_trait]
pub trait GeoQuery: Send + Sync {
    /// Best-effort lookup bounded by `budget`. Never blocks past the budget.
    async fn query(&self, budget: Duration) -> Option<GeoInfo>;
}

/// Provider that never resolves anything. Default for tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoGeo;

#[async_trait]
impl GeoQuery for NoGeo {
    async fn query(&self, _budget: Duration) -> Option<GeoInfo> {
        None
    }
}

/// One upstream geolocation service.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// Service name, for logging.
    fn name(&self) -> &'static str;
    /// Resolve the caller's geolocation.
    async fn resolve(&self) -> Result<GeoInfo, GeoError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in resolvers
// ─────────────────────────────────────────────────────────────────────────────

/// Resolver backed by `ipinfo.io`.
pub struct IpInfoResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl IpInfoResolver {
    /// Resolver against the public `ipinfo.io` endpoint.
    pub fn new() -> Self {
        Self::with_endpoint("https://ipinfo.io/json")
    }

    /// Resolver against a custom endpoint.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

impl Default for IpInfoResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeoResolver for IpInfoResolver {
    fn name(&self) -> &'static str {
        "ipinfo.io"
    }

    async fn resolve(&self) -> Result<GeoInfo, GeoError> {
        let value: serde_json::Value = self
            .client
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let country = value
            .get("country")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| GeoError::Malformed("missing country".into()))?;
        Ok(GeoInfo {
            country: country.to_owned(),
            city: field(&value, "city"),
            region: field(&value, "region"),
            timezone: field(&value, "timezone"),
        })
    }
}

/// Resolver backed by `ipdata.co`.
pub struct IpDataResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl IpDataResolver {
    /// Resolver against the public `ipdata.co` endpoint.
    pub fn new() -> Self {
        Self::with_endpoint("https://api.ipdata.co/?api-key=test")
    }

    /// Resolver against a custom endpoint.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

impl Default for IpDataResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeoResolver for IpDataResolver {
    fn name(&self) -> &'static str {
        "ipdata.co"
    }

    async fn resolve(&self) -> Result<GeoInfo, GeoError> {
        let value: serde_json::Value = self
            .client
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let country = value
            .get("country_code")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| GeoError::Malformed("missing country code".into()))?;
        Ok(GeoInfo {
            country: country.to_owned(),
            city: field(&value, "city"),
            region: field(&value, "region"),
            timezone: value
                .get("time_zone")
                .and_then(|tz| tz.get("name"))
                .and_then(serde_json::Value::as_str)
                .map(ToOwned::to_owned),
        })
    }
}

fn field(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(serde_json::Value::as_str)
        .map(ToOwned::to_owned)
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider
// ─────────────────────────────────────────────────────────────────────────────

const CACHE_VERSION: u32 = 1;
/// A cache entry younger than this is served without a refresh.
const CACHE_FRESH_MS: i64 = 12 * 60 * 60 * 1000;
/// A cache entry older than this is discarded.
const CACHE_MAX_AGE_MS: i64 = 2 * 24 * 60 * 60 * 1000;

#[derive(Serialize, Deserialize)]
struct GeoCache {
    version: u32,
    timestamp: i64,
    info: GeoInfo,
}

/// Resolver chain with a JSON disk cache.
pub struct GeoProvider {
    resolvers: Vec<Box<dyn GeoResolver>>,
    /// Index of the next resolver to try; persists across lookups so a
    /// failing service is not hammered again.
    next_resolver: AtomicUsize,
    cache_path: Option<PathBuf>,
    cached: Mutex<Option<GeoInfo>>,
    lookup: Mutex<Option<watch::Receiver<Option<GeoInfo>>>>,
}

impl GeoProvider {
    /// Provider over `resolvers`, caching at `cache_path` when given.
    pub fn new(resolvers: Vec<Box<dyn GeoResolver>>, cache_path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            resolvers,
            next_resolver: AtomicUsize::new(0),
            cache_path,
            cached: Mutex::new(None),
            lookup: Mutex::new(None),
        })
    }

    /// Provider with the built-in resolver chain.
    pub fn with_default_resolvers(cache_path: Option<PathBuf>) -> Arc<Self> {
        Self::new(
            vec![
                Box::new(IpInfoResolver::new()),
                Box::new(IpDataResolver::new()),
            ],
            cache_path,
        )
    }

    /// Load the disk cache and start a background lookup unless the cached
    /// entry is fresh enough to serve as-is.
    pub fn load_cache(self: &Arc<Self>) {
        match self.read_cache() {
            Some((info, age_ms)) if age_ms < CACHE_FRESH_MS => {
                trace!("geo cache is fresh; skipping refresh");
                *self.cached.lock() = Some(info);
            }
            Some((info, _)) => {
                *self.cached.lock() = Some(info);
                self.spawn_lookup();
            }
            None => self.spawn_lookup(),
        }
    }

    fn read_cache(&self) -> Option<(GeoInfo, i64)> {
        let path = self.cache_path.as_ref()?;
        let raw = std::fs::read_to_string(path).ok()?;
        let cache: GeoCache = match serde_json::from_str(&raw) {
            Ok(cache) => cache,
            Err(e) => {
                trace!(error = %e, "failed to parse geo cache");
                return None;
            }
        };
        if cache.version != CACHE_VERSION {
            trace!(version = cache.version, "unsupported geo cache version");
            return None;
        }
        let age_ms = Utc::now().timestamp_millis() - cache.timestamp;
        if age_ms > CACHE_MAX_AGE_MS {
            trace!("geo cache is too old");
            return None;
        }
        Some((cache.info, age_ms))
    }

    fn write_cache(&self, info: &GeoInfo) {
        let Some(path) = &self.cache_path else { return };
        let cache = GeoCache {
            version: CACHE_VERSION,
            timestamp: Utc::now().timestamp_millis(),
            info: info.clone(),
        };
        match serde_json::to_string(&cache) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    debug!(error = %e, "failed to write geo cache");
                }
            }
            Err(e) => debug!(error = %e, "failed to serialize geo cache"),
        }
    }

    fn spawn_lookup(self: &Arc<Self>) {
        let mut lookup = self.lookup.lock();
        if lookup.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(None);
        *lookup = Some(rx);

        let this = self.clone();
        let _detached = tokio::spawn(async move {
            if let Some(info) = this.run_resolvers().await {
                *this.cached.lock() = Some(info.clone());
                this.write_cache(&info);
                let _ = tx.send(Some(info));
            }
            // On total failure the sender drops, waking waiters empty-handed.
        });
    }

    async fn run_resolvers(&self) -> Option<GeoInfo> {
        loop {
            let index = self.next_resolver.fetch_add(1, Ordering::SeqCst);
            let Some(resolver) = self.resolvers.get(index) else {
                debug!("all geo resolvers failed");
                return None;
            };
            match resolver.resolve().await {
                Ok(info) => {
                    trace!(resolver = resolver.name(), country = %info.country, "geo lookup succeeded");
                    return Some(info);
                }
                Err(e) => {
                    debug!(resolver = resolver.name(), error = %e, "geo resolver failed; trying next");
                }
            }
        }
    }
}

#[async_trait]
impl GeoQuery for GeoProvider {
    async fn query(&self, budget: Duration) -> Option<GeoInfo> {
        let rx = self.lookup.lock().clone();
        let Some(mut rx) = rx else {
            return self.cached.lock().clone();
        };

        let wait = async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(info) = current {
                    return Some(info);
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        match tokio::time::timeout(budget, wait).await {
            Ok(Some(info)) => Some(info),
            Ok(None) | Err(_) => self.cached.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_info(country: &str) -> GeoInfo {
        GeoInfo {
            country: country.into(),
            city: None,
            region: None,
            timezone: None,
        }
    }

    fn write_cache_file(path: &std::path::Path, info: &GeoInfo, age_ms: i64) {
        let cache = GeoCache {
            version: CACHE_VERSION,
            timestamp: Utc::now().timestamp_millis() - age_ms,
            info: info.clone(),
        };
        std::fs::write(path, serde_json::to_string(&cache).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn fresh_cache_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geo.json");
        write_cache_file(&path, &sample_info("DE"), 60_000);

        let provider = GeoProvider::new(Vec::new(), Some(path));
        provider.load_cache();

        let info = provider.query(Duration::from_millis(10)).await;
        assert_eq!(info, Some(sample_info("DE")));
        // No refresh was started.
        assert!(provider.lookup.lock().is_none());
    }

    #[tokio::test]
    async fn stale_cache_serves_as_fallback_while_refreshing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geo.json");
        write_cache_file(&path, &sample_info("FR"), CACHE_FRESH_MS + 1_000);

        // No resolvers, so the refresh fails and the stale entry is used.
        let provider = GeoProvider::new(Vec::new(), Some(path));
        provider.load_cache();
        assert!(provider.lookup.lock().is_some());

        let info = provider.query(Duration::from_millis(200)).await;
        assert_eq!(info, Some(sample_info("FR")));
    }

    #[tokio::test]
    async fn expired_cache_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geo.json");
        write_cache_file(&path, &sample_info("FR"), CACHE_MAX_AGE_MS + 1_000);

        let provider = GeoProvider::new(Vec::new(), Some(path));
        provider.load_cache();

        let info = provider.query(Duration::from_millis(200)).await;
        assert_eq!(info, None);
    }

    #[tokio::test]
    async fn unsupported_cache_version_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geo.json");
        let raw = json!({
            "version": 2,
            "timestamp": Utc::now().timestamp_millis(),
            "info": { "country": "FR", "city": null, "region": null, "timezone": null }
        });
        std::fs::write(&path, raw.to_string()).unwrap();

        let provider = GeoProvider::new(Vec::new(), Some(path));
        provider.load_cache();
        assert_eq!(provider.query(Duration::from_millis(200)).await, None);
    }

    #[tokio::test]
    async fn resolver_chain_falls_through_to_next() {
        let failing = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&failing)
            .await;
        let working = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "country_code": "AT",
                "city": "Vienna",
                "time_zone": { "name": "Europe/Vienna" }
            })))
            .mount(&working)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geo.json");
        let provider = GeoProvider::new(
            vec![
                Box::new(IpInfoResolver::with_endpoint(failing.uri())),
                Box::new(IpDataResolver::with_endpoint(working.uri())),
            ],
            Some(path.clone()),
        );
        provider.load_cache();

        let info = provider.query(Duration::from_secs(5)).await.unwrap();
        assert_eq!(info.country, "AT");
        assert_eq!(info.city.as_deref(), Some("Vienna"));
        assert_eq!(info.timezone.as_deref(), Some("Europe/Vienna"));

        // The answer was written to the disk cache.
        let cache: GeoCache =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(cache.version, CACHE_VERSION);
        assert_eq!(cache.info.country, "AT");
    }

    #[tokio::test]
    async fn slow_lookup_degrades_within_budget() {
        let slow = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "country": "SE" }))
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&slow)
            .await;

        let provider = GeoProvider::new(
            vec![Box::new(IpInfoResolver::with_endpoint(slow.uri()))],
            None,
        );
        provider.load_cache();

        let info = provider.query(Duration::from_millis(50)).await;
        assert_eq!(info, None);
    }

    #[tokio::test]
    async fn ipinfo_response_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "country": "DE",
                "city": "Berlin",
                "region": "Berlin",
                "timezone": "Europe/Berlin"
            })))
            .mount(&server)
            .await;

        let resolver = IpInfoResolver::with_endpoint(server.uri());
        let info = resolver.resolve().await.unwrap();
        assert_eq!(info.country, "DE");
        assert_eq!(info.city.as_deref(), Some("Berlin"));
        assert_eq!(info.timezone.as_deref(), Some("Europe/Berlin"));
    }

    #[tokio::test]
    async fn missing_country_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "city": "Berlin" })))
            .mount(&server)
            .await;

        let resolver = IpInfoResolver::with_endpoint(server.uri());
        let error = resolver.resolve().await.unwrap_err();
        assert!(matches!(error, GeoError::Malformed(_)));
    }
}
