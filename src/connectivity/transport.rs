// =============================================================================
// Transport — one wire-level HTTP attempt against one endpoint
// =============================================================================
//
// The resilient client owns policy (quotas, retries, failover, health); a
// `Transport` only performs a single request with an explicit timeout. The
// production implementation is backed by `reqwest`.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::{debug, instrument};

use super::error::TransportError;
use crate::types::Method;

/// Per-request options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Request weight charged against the class's weight quota.
    pub weight: u32,
    /// Overrides the client's default timeout.
    pub timeout: Option<Duration>,
    /// Allow the facade to serve this request from its response cache.
    pub cacheable: bool,
    /// Send at most once: no retries and no failover. For requests that
    /// must not be repeated blindly, such as order placement.
    pub once: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::Get,
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            weight: 1,
            timeout: None,
            cacheable: true,
            once: false,
        }
    }
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post() -> Self {
        Self {
            method: Method::Post,
            cacheable: false,
            ..Self::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// `k1=v1&k2=v2` in insertion order.
    pub fn query_string(&self) -> String {
        self.query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Successful response from one attempt.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names lower-cased.
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl TransportResponse {
    /// Exchange-reported request weight used in the current minute.
    pub fn used_weight(&self) -> Option<u32> {
        self.headers
            .get("x-mbx-used-weight-1m")
            .and_then(|v| v.parse().ok())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        endpoint: &str,
        path: &str,
        options: &RequestOptions,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

/// `Transport` over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sigfuse/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn build_headers(pairs: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (k, v) in pairs {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
            headers.insert(name, value);
        }
    }
    headers
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[instrument(skip(self, options), name = "http_send", fields(method = %options.method))]
    async fn send(
        &self,
        endpoint: &str,
        path: &str,
        options: &RequestOptions,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let url = format!("{endpoint}{path}");
        let mut req = self
            .client
            .request(to_reqwest(options.method), &url)
            .headers(build_headers(&options.headers))
            .timeout(timeout);
        if !options.query.is_empty() {
            req = req.query(&options.query);
        }
        if let Some(body) = &options.body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout.as_millis() as u64)
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let headers: HashMap<String, String> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_ascii_lowercase(), v.to_string())))
            .collect();

        let text = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout.as_millis() as u64)
            } else {
                TransportError::Decode(e.to_string())
            }
        })?;

        if !(200..300).contains(&status) {
            return Err(TransportError::Status { status, body: text });
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))?
        };
        debug!(url = %url, status, "response received");

        Ok(TransportResponse { status, headers, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn query_string_keeps_order() {
        let opts = RequestOptions::get().query("symbol", "BTCUSDT").query("limit", "5");
        assert_eq!(opts.query_string(), "symbol=BTCUSDT&limit=5");
    }

    #[tokio::test]
    async fn decodes_json_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/ticker/price"))
            .and(query_param("symbol", "BTCUSDT"))
            .and(header("X-Test", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-MBX-USED-WEIGHT-1M", "17")
                    .set_body_json(serde_json::json!({"symbol": "BTCUSDT", "price": "50000.0"})),
            )
            .mount(&server)
            .await;

        let t = ReqwestTransport::new().unwrap();
        let opts = RequestOptions::get().query("symbol", "BTCUSDT").header("X-Test", "1");
        let resp = t
            .send(&server.uri(), "/api/v3/ticker/price", &opts, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["price"], "50000.0");
        assert_eq!(resp.used_weight(), Some(17));
    }

    #[tokio::test]
    async fn non_success_status_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let t = ReqwestTransport::new().unwrap();
        let err = t
            .send(&server.uri(), "/api/v3/time", &RequestOptions::get(), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            TransportError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let t = ReqwestTransport::new().unwrap();
        let err = t
            .send(&server.uri(), "/slow", &RequestOptions::get(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(50)));
    }
}
