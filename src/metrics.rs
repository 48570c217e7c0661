// =============================================================================
// Engine Metrics — lock-free counters plus a periodic operator report
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::connectivity::ConnectivityReport;

/// Coherence values kept for the rolling average.
const COHERENCE_HISTORY: usize = 100;
/// Weight of the previous latency average in the EWMA.
const LATENCY_DECAY: f64 = 0.9;

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub signals_received: AtomicU64,
    pub signals_processed: AtomicU64,
    pub signals_dropped: AtomicU64,
    pub decisions_fused: AtomicU64,
    pub decisions_executed: AtomicU64,
    pub decisions_rejected: AtomicU64,
    pub execution_failures: AtomicU64,
    pub circuit_breaker_activations: AtomicU64,
    pub fusion_failures: AtomicU64,
    ingest_latency_ms: Mutex<Option<f64>>,
    coherence: Mutex<VecDeque<f64>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub signals_received: u64,
    pub signals_processed: u64,
    pub signals_dropped: u64,
    pub decisions_fused: u64,
    pub decisions_executed: u64,
    pub decisions_rejected: u64,
    pub execution_failures: u64,
    pub circuit_breaker_activations: u64,
    pub fusion_failures: u64,
    pub avg_ingest_latency_ms: f64,
    pub avg_coherence: f64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one ingest latency (ms between signal timestamp and ingestion).
    pub fn record_ingest_latency(&self, sample: f64) {
        let mut avg = self.ingest_latency_ms.lock();
        *avg = Some(match *avg {
            Some(prev) => prev * LATENCY_DECAY + sample * (1.0 - LATENCY_DECAY),
            None => sample,
        });
    }

    pub fn record_coherence(&self, coherence: f64) {
        let mut history = self.coherence.lock();
        if history.len() == COHERENCE_HISTORY {
            history.pop_front();
        }
        history.push_back(coherence);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let avg_coherence = {
            let history = self.coherence.lock();
            if history.is_empty() {
                0.0
            } else {
                history.iter().sum::<f64>() / history.len() as f64
            }
        };
        MetricsSnapshot {
            signals_received: load(&self.signals_received),
            signals_processed: load(&self.signals_processed),
            signals_dropped: load(&self.signals_dropped),
            decisions_fused: load(&self.decisions_fused),
            decisions_executed: load(&self.decisions_executed),
            decisions_rejected: load(&self.decisions_rejected),
            execution_failures: load(&self.execution_failures),
            circuit_breaker_activations: load(&self.circuit_breaker_activations),
            fusion_failures: load(&self.fusion_failures),
            avg_ingest_latency_ms: self.ingest_latency_ms.lock().unwrap_or(0.0),
            avg_coherence,
        }
    }
}

// ---------------------------------------------------------------------------
// Operator report
// ---------------------------------------------------------------------------

/// Log one structured line for the engine and one per connectivity concern.
pub fn log_report(engine: &MetricsSnapshot, active_symbols: usize, connectivity: &ConnectivityReport) {
    info!(
        received = engine.signals_received,
        processed = engine.signals_processed,
        dropped = engine.signals_dropped,
        fused = engine.decisions_fused,
        executed = engine.decisions_executed,
        rejected = engine.decisions_rejected,
        execution_failures = engine.execution_failures,
        circuit_breakers = engine.circuit_breaker_activations,
        fusion_failures = engine.fusion_failures,
        avg_latency_ms = format!("{:.3}", engine.avg_ingest_latency_ms),
        avg_coherence = format!("{:.3}", engine.avg_coherence),
        active_symbols,
        "engine metrics"
    );

    info!(
        requests = connectivity.client.requests,
        failures = connectivity.client.failures,
        failovers = connectivity.client.failovers,
        quota_waits = connectivity.client.quota_waits,
        cache_entries = connectivity.cache_entries,
        cache_hits = connectivity.cache_hits,
        cache_misses = connectivity.cache_misses,
        address_changes = connectivity.address_changes,
        forced_reconnections = connectivity.forced_reconnections,
        "connectivity metrics"
    );

    for e in &connectivity.endpoints {
        info!(
            endpoint = %e.endpoint,
            status = ?e.status,
            success_rate = format!("{:.3}", e.success_rate()),
            avg_latency_ms = format!("{:.1}", e.average_latency_ms),
            "endpoint health"
        );
    }
    for q in &connectivity.quotas {
        info!(
            class = %q.class,
            quota = %q.quota,
            current = q.current,
            max = q.max,
            "quota usage"
        );
    }
    for s in &connectivity.streams {
        info!(
            topic = %s.topic,
            state = ?s.state,
            messages = s.messages,
            reconnects = s.reconnects,
            "stream status"
        );
    }
}
