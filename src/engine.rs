// =============================================================================
// Signal Fusion Engine — ingestion, periodic fusion and execution forwarding
// =============================================================================
//
// Ingestion (any thread, any rate):
//   raw signal -> normalise -> per-symbol buffer (age and count eviction)
//
// Fusion tick (one at a time, driven by the scheduler):
//   snapshot buffers -> per symbol: fuse -> risk -> validate -> decision
//   -> subscribers + decision cache -> EXECUTE decisions go to the executor
//
// A failure while fusing one symbol is logged and counted; the other symbols
// in the same tick are unaffected. Orders run on their own tasks after the
// tick lock is released, so a slow order never holds up later ticks. At most
// one order per symbol is in flight.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::decision::{DecisionCache, FusedDecision};
use crate::execution::{quantity_for, OrderExecutor, OrderRequest};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::observer::Subscribers;
use crate::risk::RiskModel;
use crate::runtime_config::FusionSettings;
use crate::signals::{fuse, Malformed, RawSignal, Signal, SignalBuffer};
use crate::types::Recommendation;

/// Recent execution failures kept for operators.
const MAX_RECENT_FAILURES: usize = 50;

// ---------------------------------------------------------------------------
// Producers
// ---------------------------------------------------------------------------

/// Handle producers use to push signals into the engine. Holding a sink does
/// not keep the engine alive.
#[derive(Clone)]
pub struct SignalSink {
    engine: Weak<SignalFusionEngine>,
}

impl SignalSink {
    /// Submit a raw signal. Returns `false` if it was dropped.
    pub fn emit(&self, raw: RawSignal) -> bool {
        match self.engine.upgrade() {
            Some(engine) => engine.ingest(raw).is_ok(),
            None => false,
        }
    }
}

/// Anything that reports signals (analyzers, stream adapters).
pub trait SignalProducer: Send + Sync {
    fn name(&self) -> &str;

    /// Called once on registration with the sink to report through.
    fn attach(&self, sink: SignalSink);
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionFailure {
    pub symbol: String,
    pub decision_id: String,
    pub error: String,
    pub at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Executed,
    Failed,
    Skipped,
}

/// Result of one fusion pass.
///
/// `tick` returns as soon as orders are handed to their tasks; `executed`
/// and `execution_failures` only cover those orders after [`settle`].
///
/// [`settle`]: TickReport::settle
#[derive(Debug, Default)]
pub struct TickReport {
    pub decisions: Vec<FusedDecision>,
    /// Orders handed to the executor.
    pub dispatched: usize,
    pub executed: usize,
    pub execution_failures: usize,
    /// EXECUTE decisions skipped because an order for the symbol was in
    /// flight or no executor is attached.
    pub skipped: usize,
    pub fusion_failures: usize,
    pending: Vec<JoinHandle<ExecOutcome>>,
}

impl TickReport {
    fn count(&mut self, outcome: ExecOutcome) {
        match outcome {
            ExecOutcome::Executed => self.executed += 1,
            ExecOutcome::Failed => self.execution_failures += 1,
            ExecOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Wait for this tick's orders to finish and fold their outcomes in.
    pub async fn settle(&mut self) {
        for handle in std::mem::take(&mut self.pending) {
            match handle.await {
                Ok(outcome) => self.count(outcome),
                Err(e) => {
                    error!(error = %e, "order task ended abnormally");
                    self.execution_failures += 1;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SignalFusionEngine {
    settings: FusionSettings,
    buffer: SignalBuffer,
    risk: RiskModel,
    decisions: DecisionCache,
    metrics: Arc<EngineMetrics>,
    subscribers: Subscribers<FusedDecision>,
    executor: RwLock<Option<Arc<dyn OrderExecutor>>>,
    producers: RwLock<Vec<Arc<dyn SignalProducer>>>,
    in_flight: Mutex<HashSet<String>>,
    recent_failures: Mutex<VecDeque<ExecutionFailure>>,
    tick_lock: tokio::sync::Mutex<()>,
}

/// Releases the symbol's in-flight slot on drop.
struct InFlight {
    engine: Arc<SignalFusionEngine>,
    symbol: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.engine.in_flight.lock().remove(&self.symbol);
    }
}

impl SignalFusionEngine {
    pub fn new(settings: FusionSettings, metrics: Arc<EngineMetrics>) -> Self {
        info!(
            max_signal_age_ms = settings.max_signal_age_ms,
            fusion_interval_ms = settings.fusion_interval_ms,
            risk_threshold = settings.risk_threshold,
            coherence_minimum = settings.coherence_minimum,
            "SignalFusionEngine initialised"
        );
        Self {
            buffer: SignalBuffer::new(settings.max_signal_age_ms, settings.max_signals_per_symbol),
            risk: RiskModel::new(&settings),
            decisions: DecisionCache::new(settings.decision_retention_ms),
            metrics,
            subscribers: Subscribers::new("fused_decisions"),
            executor: RwLock::new(None),
            producers: RwLock::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            recent_failures: Mutex::new(VecDeque::new()),
            tick_lock: tokio::sync::Mutex::new(()),
            settings,
        }
    }

    pub fn set_executor(&self, executor: Arc<dyn OrderExecutor>) {
        *self.executor.write() = Some(executor);
    }

    pub fn sink(self: &Arc<Self>) -> SignalSink {
        SignalSink {
            engine: Arc::downgrade(self),
        }
    }

    pub fn register_producer(self: &Arc<Self>, producer: Arc<dyn SignalProducer>) {
        info!(producer = producer.name(), "signal producer registered");
        producer.attach(self.sink());
        self.producers.write().push(producer);
    }

    pub fn producer_count(&self) -> usize {
        self.producers.read().len()
    }

    /// Receive every fused decision.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&FusedDecision) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(handler);
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    pub fn ingest(&self, raw: RawSignal) -> Result<(), Malformed> {
        self.ingest_at(raw, Utc::now().timestamp_millis())
    }

    pub fn ingest_at(&self, raw: RawSignal, now_ms: i64) -> Result<(), Malformed> {
        EngineMetrics::incr(&self.metrics.signals_received);

        let signal = match Signal::normalize(raw, now_ms) {
            Ok(s) => s,
            Err(e) => {
                EngineMetrics::incr(&self.metrics.signals_dropped);
                debug!(reason = %e, "malformed signal dropped");
                return Err(e);
            }
        };

        let latency_ms = signal.age_ms(now_ms) as f64;
        let evicted = self.buffer.push(signal, now_ms);
        if evicted > 0 {
            debug!(evicted, "signals evicted on ingest");
        }
        EngineMetrics::incr(&self.metrics.signals_processed);
        self.metrics.record_ingest_latency(latency_ms);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Fusion tick
    // -------------------------------------------------------------------------

    pub async fn tick(self: &Arc<Self>) -> TickReport {
        self.tick_at(Utc::now().timestamp_millis()).await
    }

    /// One fusion pass over every symbol as seen at `now_ms`.
    pub async fn tick_at(self: &Arc<Self>, now_ms: i64) -> TickReport {
        let mut report = TickReport::default();
        {
            let _serial = self.tick_lock.lock().await;
            let max_age = self.settings.max_signal_age_ms as i64;

            for (symbol, signals) in self.buffer.snapshot(now_ms) {
                let evaluated = catch_unwind(AssertUnwindSafe(|| self.evaluate(&symbol, &signals, now_ms, max_age)));
                match evaluated {
                    Ok(Some(decision)) => {
                        self.emit(&decision);
                        report.decisions.push(decision);
                    }
                    Ok(None) => {}
                    Err(_) => {
                        report.fusion_failures += 1;
                        EngineMetrics::incr(&self.metrics.fusion_failures);
                        error!(symbol = %symbol, "fusion failed for symbol");
                    }
                }
            }
        }

        let executable: Vec<FusedDecision> = report.decisions.iter().filter(|d| d.is_executable()).cloned().collect();
        for decision in executable {
            match self.dispatch(decision) {
                Ok(handle) => {
                    report.dispatched += 1;
                    report.pending.push(handle);
                }
                Err(outcome) => report.count(outcome),
            }
        }
        report
    }

    fn evaluate(&self, symbol: &str, signals: &[Signal], now_ms: i64, max_age: i64) -> Option<FusedDecision> {
        let fusion = fuse(signals, now_ms, max_age)?;
        let risk = self.risk.assess(fusion.confidence, fusion.coherence, fusion.market.volatility);
        if risk.circuit_breaker_triggered {
            EngineMetrics::incr(&self.metrics.circuit_breaker_activations);
            warn!(
                symbol,
                value_at_risk = risk.value_at_risk,
                volatility = risk.volatility,
                threshold = self.settings.risk_threshold,
                "circuit breaker triggered"
            );
        }
        let validation = self.risk.validate(&fusion, &risk);
        Some(FusedDecision::new(symbol, fusion, risk, validation, now_ms))
    }

    fn emit(&self, decision: &FusedDecision) {
        EngineMetrics::incr(&self.metrics.decisions_fused);
        self.metrics.record_coherence(decision.coherence);
        if decision.recommendation() == Recommendation::Reject {
            EngineMetrics::incr(&self.metrics.decisions_rejected);
        }

        if decision.is_executable() {
            info!(
                symbol = %decision.symbol,
                direction = %decision.direction,
                confidence = format!("{:.3}", decision.confidence),
                coherence = format!("{:.3}", decision.coherence),
                leverage = decision.risk.leverage,
                position = format!("{:.2}", decision.risk.position_size),
                "fused decision: EXECUTE"
            );
        } else {
            debug!(
                symbol = %decision.symbol,
                direction = %decision.direction,
                recommendation = %decision.recommendation(),
                failed = ?decision.validation.failed,
                "fused decision"
            );
        }

        self.decisions.store(decision.clone());
        self.subscribers.publish(decision);
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Claim the symbol's in-flight slot and start the order on its own task.
    /// Decisions that cannot be sent resolve immediately.
    fn dispatch(self: &Arc<Self>, decision: FusedDecision) -> Result<JoinHandle<ExecOutcome>, ExecOutcome> {
        let Some(executor) = self.executor.read().clone() else {
            debug!(symbol = %decision.symbol, "no executor attached, EXECUTE decision not forwarded");
            return Err(ExecOutcome::Skipped);
        };
        let Some(side) = decision.direction.side() else {
            return Err(self.record_failure(&decision, "decision has no side"));
        };
        let Some(quantity) = decision.market.price.and_then(|p| quantity_for(decision.risk.position_size, p)) else {
            return Err(self.record_failure(&decision, "no fused price"));
        };

        if !self.in_flight.lock().insert(decision.symbol.clone()) {
            info!(symbol = %decision.symbol, "order already in flight, skipping");
            return Err(ExecOutcome::Skipped);
        }
        let slot = InFlight {
            engine: self.clone(),
            symbol: decision.symbol.clone(),
        };

        let order = OrderRequest {
            symbol: decision.symbol.clone(),
            side,
            quantity,
            leverage: decision.risk.leverage,
            stop_loss_pct: decision.risk.stop_loss_pct,
            take_profit_pct: decision.risk.take_profit_pct,
            client_order_id: decision.client_order_id(),
        };
        let engine = self.clone();
        Ok(tokio::spawn(async move {
            let _slot = slot;
            let outcome = executor.execute_order(order).await;
            if outcome.success {
                EngineMetrics::incr(&engine.metrics.decisions_executed);
                info!(
                    symbol = %decision.symbol,
                    order_id = outcome.order_id.as_deref().unwrap_or(""),
                    "decision executed"
                );
                ExecOutcome::Executed
            } else {
                let error = outcome.error.unwrap_or_else(|| "unknown execution error".to_string());
                engine.record_failure(&decision, &error)
            }
        }))
    }

    fn record_failure(&self, decision: &FusedDecision, error: &str) -> ExecOutcome {
        EngineMetrics::incr(&self.metrics.execution_failures);
        warn!(symbol = %decision.symbol, decision_id = %decision.id, error, "execution failed");
        let mut failures = self.recent_failures.lock();
        if failures.len() == MAX_RECENT_FAILURES {
            failures.pop_front();
        }
        failures.push_back(ExecutionFailure {
            symbol: decision.symbol.clone(),
            decision_id: decision.id.clone(),
            error: error.to_string(),
            at: Utc::now().to_rfc3339(),
        });
        ExecOutcome::Failed
    }

    // -------------------------------------------------------------------------
    // Housekeeping and observation
    // -------------------------------------------------------------------------

    /// Drop expired signals and stale decisions.
    pub fn housekeeping(&self, now_ms: i64) {
        let signals = self.buffer.prune(now_ms);
        let decisions = self.decisions.purge(now_ms);
        if signals > 0 || decisions > 0 {
            debug!(signals, decisions, "housekeeping purged stale state");
        }
    }

    pub fn last_decision(&self, symbol: &str) -> Option<FusedDecision> {
        self.decisions.last_decision(symbol)
    }

    pub fn recent_failures(&self) -> Vec<ExecutionFailure> {
        self.recent_failures.lock().iter().cloned().collect()
    }

    pub fn active_symbols(&self) -> usize {
        self.buffer.active_symbols()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl std::fmt::Debug for SignalFusionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalFusionEngine")
            .field("settings", &self.settings)
            .field("active_symbols", &self.buffer.active_symbols())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
