// =============================================================================
// Connectivity Facade — cached requests, supervised streams, address hooks
// =============================================================================
//
// The one surface the rest of the engine talks to:
//   - `request(path, options)` infers the endpoint class from the path and
//     serves idempotent reads from a short-TTL cache.
//   - `stream(class, topic, handler)` starts a supervised stream.
//   - an external address change flushes the cache and forces every stream
//     to reconnect from the new address.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::address_monitor::{AddressEvent, AddressMonitor};
use super::cache::ResponseCache;
use super::client::{ClientStats, ResilientHttpClient};
use super::error::ConnectivityError;
use super::health::EndpointHealth;
use super::rate_limit::QuotaSnapshot;
use super::stream::{PersistentStreamSupervisor, ReconnectPolicy, StreamConnector, StreamHandler, StreamStats};
use super::transport::RequestOptions;
use crate::runtime_config::ConnectivitySettings;
use crate::types::EndpointClass;

/// Point-in-time view of the connectivity layer for the metrics report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub endpoints: Vec<EndpointHealth>,
    pub quotas: Vec<QuotaSnapshot>,
    pub client: ClientStats,
    pub streams: Vec<StreamStats>,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub address_changes: u64,
    pub forced_reconnections: u64,
}

pub struct ConnectivityFacade {
    client: Arc<ResilientHttpClient>,
    cache: ResponseCache,
    connector: Arc<dyn StreamConnector>,
    spot_stream_base: String,
    futures_stream_base: String,
    stream_timeout: Duration,
    reconnect_policy: ReconnectPolicy,
    streams: RwLock<Vec<Arc<PersistentStreamSupervisor>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    address_changes: AtomicU64,
    forced_reconnections: AtomicU64,
}

impl ConnectivityFacade {
    pub fn new(
        client: Arc<ResilientHttpClient>,
        connector: Arc<dyn StreamConnector>,
        settings: &ConnectivitySettings,
    ) -> Self {
        Self {
            client,
            cache: ResponseCache::new(settings.cache_ttl(), settings.cache_max_entries),
            connector,
            spot_stream_base: settings.spot.stream_base.clone(),
            futures_stream_base: settings.futures.stream_base.clone(),
            stream_timeout: settings.stream_timeout(),
            reconnect_policy: ReconnectPolicy::default(),
            streams: RwLock::new(Vec::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            address_changes: AtomicU64::new(0),
            forced_reconnections: AtomicU64::new(0),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Perform a REST request; the endpoint class is inferred from `path`.
    pub async fn request(&self, path: &str, options: RequestOptions) -> Result<Value, ConnectivityError> {
        let class = EndpointClass::infer(path);

        if !ResponseCache::is_cacheable(path, &options) {
            return self.client.request(class, path, &options).await;
        }

        let key = ResponseCache::key(class, path, &options);
        if let Some(hit) = self.cache.get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(path, "response served from cache");
            return Ok(hit);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let value = self.client.request(class, path, &options).await?;
        self.cache.insert(key, value.clone());
        Ok(value)
    }

    pub fn purge_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    // -------------------------------------------------------------------------
    // Streams
    // -------------------------------------------------------------------------

    /// Start a supervised stream for `topic` (e.g. `btcusdt@aggTrade`).
    pub fn stream(
        &self,
        class: EndpointClass,
        topic: &str,
        handler: Arc<dyn StreamHandler>,
    ) -> Arc<PersistentStreamSupervisor> {
        let base = match class {
            EndpointClass::Spot => &self.spot_stream_base,
            EndpointClass::Futures => &self.futures_stream_base,
        };
        let url = format!("{}/{}", base.trim_end_matches('/'), topic);
        let supervisor = Arc::new(PersistentStreamSupervisor::new(
            format!("{class}:{topic}"),
            url,
            handler,
            self.connector.clone(),
            self.stream_timeout,
            self.reconnect_policy.clone(),
        ));
        supervisor.subscribe(|ev| {
            if let super::stream::StreamEvent::Instability { topic, consecutive_failures } = ev {
                warn!(topic = %topic, consecutive_failures, "stream connectivity unstable");
            }
        });
        supervisor.start();
        self.streams.write().push(supervisor.clone());
        info!(class = %class, topic, "stream registered");
        supervisor
    }

    // -------------------------------------------------------------------------
    // Address changes
    // -------------------------------------------------------------------------

    /// React to an address monitor event.
    pub fn handle_address_event(&self, event: &AddressEvent) {
        match event {
            AddressEvent::Changed { old, new, change_count, .. } => {
                self.address_changes.fetch_add(1, Ordering::Relaxed);
                self.cache.clear();
                let streams = self.streams.read().clone();
                for s in &streams {
                    s.force_reconnect();
                }
                self.forced_reconnections
                    .fetch_add(streams.len() as u64, Ordering::Relaxed);
                warn!(
                    old = ?old,
                    new = %new,
                    change_count,
                    streams = streams.len(),
                    "address changed, cache flushed and streams reconnecting"
                );
            }
            AddressEvent::Instability {
                consecutive_failures,
                last_error,
            } => {
                warn!(consecutive_failures, last_error = %last_error, "network instability detected");
            }
        }
    }

    /// Route `monitor` events into this facade without creating a cycle.
    pub fn attach_address_monitor(self: &Arc<Self>, monitor: &AddressMonitor) {
        let weak: Weak<Self> = Arc::downgrade(self);
        monitor.subscribe(move |ev| {
            if let Some(facade) = weak.upgrade() {
                facade.handle_address_event(ev);
            }
        });
    }

    // -------------------------------------------------------------------------
    // Lifecycle & reporting
    // -------------------------------------------------------------------------

    /// Stop every stream. Returns once all supervisors have finished.
    pub async fn shutdown(&self) {
        let streams: Vec<_> = self.streams.write().drain(..).collect();
        for s in &streams {
            s.stop().await;
        }
        info!(streams = streams.len(), "connectivity shut down");
    }

    pub fn report(&self) -> ConnectivityReport {
        ConnectivityReport {
            endpoints: self.client.health().snapshot(),
            quotas: self.client.limiter().snapshot(),
            client: self.client.stats(),
            streams: self.streams.read().iter().map(|s| s.stats()).collect(),
            cache_entries: self.cache.len(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            address_changes: self.address_changes.load(Ordering::Relaxed),
            forced_reconnections: self.forced_reconnections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::error::{StreamError, TransportError};
    use crate::connectivity::health::EndpointHealthTracker;
    use crate::connectivity::rate_limit::RateLimiter;
    use crate::connectivity::stream::{MessageStream, StreamState};
    use crate::connectivity::transport::{Transport, TransportResponse};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    struct CountingTransport {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(
            &self,
            _endpoint: &str,
            path: &str,
            _options: &RequestOptions,
            _timeout: Duration,
        ) -> Result<TransportResponse, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TransportResponse {
                status: 200,
                headers: HashMap::new(),
                body: serde_json::json!({ "path": path, "n": n }),
            })
        }
    }

    /// Connects instantly and never yields frames.
    #[derive(Default)]
    struct IdleConnector {
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StreamConnector for IdleConnector {
        async fn connect(&self, url: &str) -> Result<MessageStream, StreamError> {
            self.urls.lock().push(url.to_string());
            Ok(Box::pin(futures_util::stream::pending::<Result<String, StreamError>>()))
        }
    }

    struct Ignore;
    impl StreamHandler for Ignore {
        fn on_message(&self, _message: Value) {}
    }

    fn facade(transport: Arc<dyn Transport>, connector: Arc<dyn StreamConnector>) -> Arc<ConnectivityFacade> {
        let settings = ConnectivitySettings::default();
        let client = Arc::new(ResilientHttpClient::new(
            transport,
            Arc::new(RateLimiter::new(&settings.quotas)),
            Arc::new(EndpointHealthTracker::new()),
            &settings,
        ));
        Arc::new(ConnectivityFacade::new(client, connector, &settings))
    }

    #[tokio::test]
    async fn cacheable_reads_hit_transport_once() {
        let transport = Arc::new(CountingTransport { calls: AtomicU32::new(0) });
        let f = facade(transport.clone(), Arc::new(IdleConnector::default()));

        let a = f.request("/api/v3/exchangeInfo", RequestOptions::get()).await.unwrap();
        let b = f.request("/api/v3/exchangeInfo", RequestOptions::get()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        // Clock sync is never cached.
        f.request("/api/v3/time", RequestOptions::get()).await.unwrap();
        f.request("/api/v3/time", RequestOptions::get()).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

        let r = f.report();
        assert_eq!(r.cache_hits, 1);
        assert_eq!(r.cache_entries, 1);
    }

    #[tokio::test]
    async fn futures_paths_use_futures_endpoint() {
        let transport = Arc::new(CountingTransport { calls: AtomicU32::new(0) });
        let f = facade(transport, Arc::new(IdleConnector::default()));
        f.request("/fapi/v1/exchangeInfo", RequestOptions::get()).await.unwrap();
        let endpoints: Vec<String> = f.report().endpoints.into_iter().map(|e| e.endpoint).collect();
        assert_eq!(endpoints, vec!["https://fapi.binance.com"]);
    }

    #[tokio::test(start_paused = true)]
    async fn address_change_flushes_cache_and_reconnects_streams() {
        let transport = Arc::new(CountingTransport { calls: AtomicU32::new(0) });
        let connector = Arc::new(IdleConnector::default());
        let f = facade(transport.clone(), connector.clone());

        f.request("/api/v3/exchangeInfo", RequestOptions::get()).await.unwrap();
        let s = f.stream(EndpointClass::Spot, "btcusdt@aggTrade", Arc::new(Ignore));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(s.state(), StreamState::Open);
        assert_eq!(connector.urls.lock()[0], "wss://stream.binance.com:9443/ws/btcusdt@aggTrade");

        f.handle_address_event(&AddressEvent::Changed {
            old: Some("10.0.0.1".parse().unwrap()),
            new: "10.0.0.2".parse().unwrap(),
            change_count: 1,
            at: Utc::now(),
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(connector.urls.lock().len(), 2);
        let r = f.report();
        assert_eq!(r.cache_entries, 0);
        assert_eq!(r.address_changes, 1);
        assert_eq!(r.forced_reconnections, 1);

        // The next read goes back to the network.
        f.request("/api/v3/exchangeInfo", RequestOptions::get()).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

        f.shutdown().await;
        assert_eq!(s.state(), StreamState::Closed);
    }
}
