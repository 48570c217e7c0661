// =============================================================================
// Endpoint Health Tracker — per-endpoint success/failure and latency
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Weight given to the newest latency sample.
const LATENCY_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Rolling counters for a single endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    /// Exponentially weighted moving average of request latency.
    pub average_latency_ms: f64,
    pub last_latency_ms: u64,
    pub status: HealthStatus,
    pub last_error: Option<String>,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl EndpointHealth {
    fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            total: 0,
            success: 0,
            failure: 0,
            average_latency_ms: 0.0,
            last_latency_ms: 0,
            status: HealthStatus::Unknown,
            last_error: None,
            last_request_at: None,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.success as f64 / self.total as f64
    }

    /// Success rate as a percentage.
    pub fn health_score(&self) -> f64 {
        self.success_rate() * 100.0
    }

    fn observe_latency(&mut self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        self.last_latency_ms = ms;
        self.average_latency_ms = if self.total <= 1 {
            ms as f64
        } else {
            self.average_latency_ms * (1.0 - LATENCY_ALPHA) + ms as f64 * LATENCY_ALPHA
        };
    }
}

/// Sharded map of endpoint health records. Records are never removed.
#[derive(Debug, Default)]
pub struct EndpointHealthTracker {
    records: DashMap<String, EndpointHealth>,
}

impl EndpointHealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, endpoint: &str, latency: Duration) {
        let mut rec = self
            .records
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointHealth::new(endpoint));
        rec.total += 1;
        rec.success += 1;
        rec.observe_latency(latency);
        rec.status = HealthStatus::Healthy;
        rec.last_request_at = Some(Utc::now());
    }

    pub fn record_failure(&self, endpoint: &str, latency: Duration, error: &str) {
        let mut rec = self
            .records
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointHealth::new(endpoint));
        rec.total += 1;
        rec.failure += 1;
        rec.observe_latency(latency);
        rec.last_error = Some(error.to_string());
        rec.last_request_at = Some(Utc::now());

        let previous = rec.status;
        rec.status = if rec.success_rate() < 0.5 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        if rec.status == HealthStatus::Unhealthy && previous != HealthStatus::Unhealthy {
            warn!(
                endpoint,
                success_rate = rec.success_rate(),
                error,
                "endpoint marked unhealthy"
            );
        }
    }

    pub fn get(&self, endpoint: &str) -> Option<EndpointHealth> {
        self.records.get(endpoint).map(|r| r.clone())
    }

    /// All records sorted by endpoint.
    pub fn snapshot(&self) -> Vec<EndpointHealth> {
        let mut out: Vec<EndpointHealth> = self.records.iter().map(|r| r.value().clone()).collect();
        out.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        out
    }
}
