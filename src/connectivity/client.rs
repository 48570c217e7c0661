// =============================================================================
// Resilient HTTP Client — quotas, retries, health tracking and failover
// =============================================================================
//
// `request(class, path, options)`:
//   1. Against the class's primary endpoint, run up to `max_retries + 1`
//      attempts. Each attempt first reserves quota; an exhausted window
//      makes the attempt wait and re-reserve without spending a retry.
//   2. Every completed attempt updates the endpoint's health record.
//   3. If the primary fails terminally, shuffle the backups with the OS
//      random source and try each exactly once.
//
// A 4xx rejection (other than 418/429) is returned as-is: the request itself
// is wrong and no endpoint will accept it. Requests marked `once` get a
// single attempt against the primary and no failover.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::error::{ConnectivityError, TransportError};
use super::health::EndpointHealthTracker;
use super::rate_limit::{QuotaRefusal, RateLimiter, QUOTA_ORDERS, QUOTA_WEIGHT};
use super::retry::{RetryOutcome, RetryPolicy};
use super::transport::{RequestOptions, Transport};
use crate::runtime_config::ConnectivitySettings;
use crate::secure_random::secure_shuffle;
use crate::types::{EndpointClass, Method};

/// Longest single sleep while waiting for quota.
const MAX_QUOTA_WAIT: Duration = Duration::from_secs(1);

/// Primary and backup base URLs for one endpoint class.
#[derive(Debug, Clone)]
pub struct EndpointSet {
    pub primary: String,
    pub backups: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientStats {
    pub requests: u64,
    pub failures: u64,
    pub failovers: u64,
    pub quota_waits: u64,
}

pub struct ResilientHttpClient {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    health: Arc<EndpointHealthTracker>,
    policy: RetryPolicy,
    timeout: Duration,
    spot: EndpointSet,
    futures: EndpointSet,
    requests: AtomicU64,
    failures: AtomicU64,
    failovers: AtomicU64,
    quota_waits: AtomicU64,
}

impl ResilientHttpClient {
    /// Create a client.
    ///
    /// # Arguments
    /// * `transport` — performs single attempts.
    /// * `limiter`   — shared quota windows.
    /// * `health`    — shared endpoint health table.
    /// * `settings`  — retry budget, timeouts and endpoint lists.
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        health: Arc<EndpointHealthTracker>,
        settings: &ConnectivitySettings,
    ) -> Self {
        let endpoints = |class| {
            let e = settings.endpoints(class);
            EndpointSet {
                primary: e.primary.clone(),
                backups: e.backups.clone(),
            }
        };
        Self {
            transport,
            limiter,
            health,
            policy: RetryPolicy::new(settings.max_retries, settings.backoff_base),
            timeout: settings.request_timeout(),
            spot: endpoints(EndpointClass::Spot),
            futures: endpoints(EndpointClass::Futures),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
            quota_waits: AtomicU64::new(0),
        }
    }

    /// Replace the retry schedule (tests shorten the delays).
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn health(&self) -> &Arc<EndpointHealthTracker> {
        &self.health
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            quota_waits: self.quota_waits.load(Ordering::Relaxed),
        }
    }

    fn endpoints(&self, class: EndpointClass) -> &EndpointSet {
        match class {
            EndpointClass::Spot => &self.spot,
            EndpointClass::Futures => &self.futures,
        }
    }

    // -------------------------------------------------------------------------
    // Public entry point
    // -------------------------------------------------------------------------

    /// Execute a request with retries and failover.
    #[instrument(skip(self, options), name = "resilient_request", fields(class = %class))]
    pub async fn request(
        &self,
        class: EndpointClass,
        path: &str,
        options: &RequestOptions,
    ) -> Result<Value, ConnectivityError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let set = self.endpoints(class).clone();
        if set.primary.is_empty() {
            return Err(ConnectivityError::NoEndpoint(class));
        }

        if options.once {
            return self.attempt(class, &set.primary, path, options).await.map_err(|e| {
                self.failures.fetch_add(1, Ordering::Relaxed);
                terminal_error(&set.primary, path, 1, e)
            });
        }

        let primary_err = match self.with_retries(class, &set.primary, path, options).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_rejection() || set.backups.is_empty() => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
            Err(e) => e,
        };

        self.failovers.fetch_add(1, Ordering::Relaxed);
        let mut backups = set.backups.clone();
        secure_shuffle(&mut backups);
        warn!(
            path,
            primary = %set.primary,
            error = %primary_err,
            backups = backups.len(),
            "primary endpoint failed, starting failover pass"
        );

        let mut failures = vec![primary_err.to_string()];
        for endpoint in &backups {
            match self.attempt(class, endpoint, path, options).await {
                Ok(v) => {
                    info!(endpoint = %endpoint, path, "failover succeeded");
                    return Ok(v);
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "backup endpoint failed");
                    failures.push(format!("{endpoint}: {e}"));
                }
            }
        }

        self.failures.fetch_add(1, Ordering::Relaxed);
        Err(ConnectivityError::AllEndpointsFailed {
            path: path.to_string(),
            failures,
        })
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn with_retries(
        &self,
        class: EndpointClass,
        endpoint: &str,
        path: &str,
        options: &RequestOptions,
    ) -> Result<Value, ConnectivityError> {
        let label = format!("{endpoint}{path}");
        let res = self
            .policy
            .run(&label, |_| self.attempt(class, endpoint, path, options), TransportError::is_transient)
            .await;

        res.map_err(|outcome| match outcome {
            RetryOutcome::Exhausted { attempts, last } => ConnectivityError::RetriesExhausted {
                endpoint: endpoint.to_string(),
                path: path.to_string(),
                attempts,
                last,
            },
            RetryOutcome::Permanent { attempts, error } => terminal_error(endpoint, path, attempts, error),
        })
    }

    /// One quota-gated, health-recorded attempt.
    async fn attempt(
        &self,
        class: EndpointClass,
        endpoint: &str,
        path: &str,
        options: &RequestOptions,
    ) -> Result<Value, TransportError> {
        self.reserve(class, QUOTA_WEIGHT, options.weight).await?;
        if is_order_request(path, options.method) {
            self.reserve(class, QUOTA_ORDERS, 1).await?;
        }

        let timeout = options.timeout.unwrap_or(self.timeout);
        let started = Instant::now();
        // The transport applies its own timeout; this one bounds transports
        // that do not.
        let result = match tokio::time::timeout(timeout, self.transport.send(endpoint, path, options, timeout)).await {
            Ok(r) => r,
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        };
        let latency = started.elapsed();

        match result {
            Ok(resp) => {
                if let Some(used) = resp.used_weight() {
                    self.limiter.observe_used_weight(class, used);
                }
                self.health.record_success(endpoint, latency);
                Ok(resp.body)
            }
            Err(e) => {
                self.health.record_failure(endpoint, latency, &e.to_string());
                Err(e)
            }
        }
    }

    /// Wait until `cost` units of `quota` are reserved. Fails only when the
    /// cost can never fit the quota.
    async fn reserve(&self, class: EndpointClass, quota: &str, cost: u32) -> Result<(), TransportError> {
        loop {
            match self.limiter.try_reserve(class, quota, cost) {
                Ok(()) => return Ok(()),
                Err(QuotaRefusal::ExceedsQuota { cost, max }) => {
                    return Err(TransportError::OverQuota {
                        quota: quota.to_string(),
                        cost,
                        max,
                    })
                }
                Err(QuotaRefusal::Wait(wait)) => {
                    self.quota_waits.fetch_add(1, Ordering::Relaxed);
                    let nap = wait.clamp(Duration::from_millis(10), MAX_QUOTA_WAIT);
                    debug!(class = %class, quota, wait_ms = nap.as_millis() as u64, "waiting for quota");
                    tokio::time::sleep(nap).await;
                }
            }
        }
    }
}

/// Final error for a request whose last attempt failed with `error`.
fn terminal_error(endpoint: &str, path: &str, attempts: u32, error: TransportError) -> ConnectivityError {
    let transient = error.is_transient();
    match error {
        TransportError::Status { status, body } if !transient => {
            ConnectivityError::Rejected {
                endpoint: endpoint.to_string(),
                path: path.to_string(),
                status,
                body,
            }
        }
        last @ TransportError::OverQuota { .. } => ConnectivityError::OverQuota {
            path: path.to_string(),
            last,
        },
        last => ConnectivityError::RetriesExhausted {
            endpoint: endpoint.to_string(),
            path: path.to_string(),
            attempts,
            last,
        },
    }
}

fn is_order_request(path: &str, method: Method) -> bool {
    matches!(method, Method::Post | Method::Delete) && path.contains("/order")
}

impl std::fmt::Debug for ResilientHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientHttpClient")
            .field("spot", &self.spot)
            .field("futures", &self.futures)
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::transport::{ReqwestTransport, TransportResponse};
    use crate::runtime_config::{EndpointSettings, QuotaSettings};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    /// Fails every call on endpoints listed in `down`, succeeds elsewhere.
    struct FakeTransport {
        down: Vec<String>,
        error: TransportError,
        calls: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn new(down: &[&str], error: TransportError) -> Self {
            Self {
                down: down.iter().map(|s| s.to_string()).collect(),
                error,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls_to(&self, endpoint: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.as_str() == endpoint).count()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(
            &self,
            endpoint: &str,
            _path: &str,
            _options: &RequestOptions,
            _timeout: Duration,
        ) -> Result<TransportResponse, TransportError> {
            self.calls.lock().push(endpoint.to_string());
            if self.down.iter().any(|d| d == endpoint) {
                return Err(self.error.clone());
            }
            Ok(TransportResponse {
                status: 200,
                headers: HashMap::new(),
                body: serde_json::json!({ "served_by": endpoint }),
            })
        }
    }

    fn settings(primary: &str, backups: &[&str], max_retries: u32) -> ConnectivitySettings {
        ConnectivitySettings {
            max_retries,
            spot: EndpointSettings {
                primary: primary.to_string(),
                backups: backups.iter().map(|s| s.to_string()).collect(),
                stream_base: "wss://unused".to_string(),
            },
            ..ConnectivitySettings::default()
        }
    }

    fn client(transport: Arc<dyn Transport>, s: &ConnectivitySettings) -> ResilientHttpClient {
        ResilientHttpClient::new(
            transport,
            Arc::new(RateLimiter::new(&s.quotas)),
            Arc::new(EndpointHealthTracker::new()),
            s,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn failing_endpoint_gets_max_retries_plus_one_attempts() {
        let fake = Arc::new(FakeTransport::new(&["p"], TransportError::Connect("reset".into())));
        let s = settings("p", &[], 3);
        let c = client(fake.clone(), &s);

        let err = c.request(EndpointClass::Spot, "/api/v3/time", &RequestOptions::get()).await.unwrap_err();
        assert_eq!(fake.calls_to("p"), 4);
        match err {
            ConnectivityError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other}"),
        }
        let h = c.health().get("p").unwrap();
        assert_eq!(h.failure, 4);
        assert_eq!(c.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_over_to_backup_once_each() {
        let fake = Arc::new(FakeTransport::new(&["p", "b1"], TransportError::Timeout(10)));
        let s = settings("p", &["b1", "b2"], 1);
        let c = client(fake.clone(), &s);

        let body = c.request(EndpointClass::Spot, "/api/v3/exchangeInfo", &RequestOptions::get()).await.unwrap();
        assert_eq!(body["served_by"], "b2");
        assert_eq!(fake.calls_to("p"), 2);
        assert!(fake.calls_to("b1") <= 1);
        assert_eq!(fake.calls_to("b2"), 1);
        assert_eq!(c.stats().failovers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_endpoints_down_is_aggregate_error() {
        let fake = Arc::new(FakeTransport::new(&["p", "b1", "b2"], TransportError::Connect("refused".into())));
        let s = settings("p", &["b1", "b2"], 0);
        let c = client(fake.clone(), &s);

        let err = c.request(EndpointClass::Spot, "/api/v3/time", &RequestOptions::get()).await.unwrap_err();
        match err {
            ConnectivityError::AllEndpointsFailed { failures, .. } => assert_eq!(failures.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fake.calls_to("b1"), 1);
        assert_eq!(fake.calls_to("b2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn client_error_is_not_retried_or_failed_over() {
        let fake = Arc::new(FakeTransport::new(
            &["p"],
            TransportError::Status { status: 400, body: "{\"code\":-1102}".into() },
        ));
        let s = settings("p", &["b1"], 3);
        let c = client(fake.clone(), &s);

        let err = c.request(EndpointClass::Spot, "/api/v3/order", &RequestOptions::post()).await.unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(fake.calls_to("p"), 1);
        assert_eq!(fake.calls_to("b1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_quota_delays_without_spending_retries() {
        let fake = Arc::new(FakeTransport::new(&[], TransportError::Timeout(0)));
        let mut s = settings("p", &[], 0);
        s.quotas = vec![QuotaSettings::new(EndpointClass::Spot, QUOTA_WEIGHT, 1, 1_000)];
        let c = client(fake.clone(), &s);

        // Second request must wait for the window to roll, but still succeeds
        // with a zero retry budget.
        c.request(EndpointClass::Spot, "/a", &RequestOptions::get()).await.unwrap();
        c.request(EndpointClass::Spot, "/b", &RequestOptions::get()).await.unwrap();
        assert_eq!(fake.calls_to("p"), 2);
        assert!(c.stats().quota_waits >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn once_requests_get_a_single_attempt() {
        let fake = Arc::new(FakeTransport::new(&["p"], TransportError::Timeout(10)));
        let s = settings("p", &["b1"], 3);
        let c = client(fake.clone(), &s);

        let err = c
            .request(EndpointClass::Spot, "/api/v3/order", &RequestOptions::post().once())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectivityError::RetriesExhausted { attempts: 1, .. }));
        assert_eq!(fake.calls_to("p"), 1);
        assert_eq!(fake.calls_to("b1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cost_above_quota_fails_fast_without_sending() {
        let fake = Arc::new(FakeTransport::new(&[], TransportError::Timeout(0)));
        let mut s = settings("p", &["b1"], 3);
        s.quotas = vec![QuotaSettings::new(EndpointClass::Spot, QUOTA_WEIGHT, 5, 1_000)];
        let c = client(fake.clone(), &s);

        let opts = RequestOptions::get().weight(10);
        let req = c.request(EndpointClass::Spot, "/api/v3/exchangeInfo", &opts);
        let err = tokio::time::timeout(Duration::from_secs(5), req)
            .await
            .expect("request must not wait forever")
            .unwrap_err();
        assert!(matches!(err, ConnectivityError::OverQuota { .. }));
        assert!(err.is_rejection());
        assert!(fake.calls.lock().is_empty());
        assert_eq!(c.stats().failovers, 0);
    }

    #[tokio::test]
    async fn retries_against_real_http_until_success() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, Respond, Request, ResponseTemplate};

        struct FlakyResponder(Arc<AtomicU32>);
        impl Respond for FlakyResponder {
            fn respond(&self, _: &Request) -> ResponseTemplate {
                if self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2 {
                    ResponseTemplate::new(502)
                } else {
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({ "serverTime": 1 }))
                }
            }
        }

        let server = MockServer::start().await;
        let hits = Arc::new(AtomicU32::new(0));
        Mock::given(method("GET"))
            .respond_with(FlakyResponder(hits.clone()))
            .mount(&server)
            .await;

        let s = settings(&server.uri(), &[], 3);
        let c = client(Arc::new(ReqwestTransport::new().unwrap()), &s).with_policy(RetryPolicy {
            max_retries: 3,
            backoff_base: 2.0,
            initial_delay: Duration::from_millis(5),
            max_jitter: Duration::from_millis(5),
        });

        let body = c.request(EndpointClass::Spot, "/api/v3/time", &RequestOptions::get()).await.unwrap();
        assert_eq!(body["serverTime"], 1);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 3);
        let h = c.health().get(&server.uri()).unwrap();
        assert_eq!(h.success, 1);
        assert_eq!(h.failure, 2);
    }
}
