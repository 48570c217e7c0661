// =============================================================================
// Connectivity errors
// =============================================================================

use thiserror::Error;

use crate::types::EndpointClass;

/// Failure of a single wire-level attempt.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("request cost {cost} exceeds the {quota} quota of {max}")]
    OverQuota { quota: String, cost: u32, max: u32 },
}

impl TransportError {
    /// Worth retrying against the same endpoint: timeouts, resets, 5xx and
    /// exchange-side throttling (418 / 429).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connect(_) | Self::Decode(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429 || *status == 418,
            Self::OverQuota { .. } => false,
        }
    }
}

/// Terminal outcome of `request()` after retries and failover.
#[derive(Debug, Clone, Error)]
pub enum ConnectivityError {
    #[error("{endpoint}{path} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        endpoint: String,
        path: String,
        attempts: u32,
        last: TransportError,
    },

    #[error("{endpoint}{path} rejected the request: HTTP {status}: {body}")]
    Rejected {
        endpoint: String,
        path: String,
        status: u16,
        body: String,
    },

    #[error("{path} can never fit its rate limit: {last}")]
    OverQuota { path: String, last: TransportError },

    #[error("all endpoints failed for {path}: {}", failures.join("; "))]
    AllEndpointsFailed { path: String, failures: Vec<String> },

    #[error("no endpoint configured for {0}")]
    NoEndpoint(EndpointClass),
}

impl ConnectivityError {
    /// The remote understood and refused the request; another endpoint
    /// would refuse it too.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::OverQuota { .. })
    }
}

/// Errors surfaced by a streaming connection to its handler.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("handshake with {url} timed out after {timeout_ms} ms")]
    HandshakeTimeout { url: String, timeout_ms: u64 },

    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("read error: {0}")]
    Read(String),

    #[error("unparseable message: {0}")]
    Parse(String),

    #[error("connection closed by remote")]
    Closed,
}
