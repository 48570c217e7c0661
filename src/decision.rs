// =============================================================================
// Fused Decision — the auditable output of one fusion pass for one symbol
// =============================================================================
//
// Decisions are immutable once emitted. The cache keeps the latest decision
// per symbol for operators and drops anything older than the retention
// window on housekeeping.
// =============================================================================

use dashmap::DashMap;
use serde::Serialize;

use crate::risk::{RiskAssessment, Validation};
use crate::signals::{FusedMarket, FusionMetrics, FusionOutput};
use crate::types::{Direction, Recommendation};

/// Complete record of one fused decision.
#[derive(Debug, Clone, Serialize)]
pub struct FusedDecision {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub strength: f64,
    pub confidence: f64,
    pub coherence: f64,
    pub market: FusedMarket,
    pub metrics: FusionMetrics,
    pub risk: RiskAssessment,
    pub validation: Validation,
    /// Epoch milliseconds of the fusion pass.
    pub timestamp: i64,
}

impl FusedDecision {
    pub fn new(
        symbol: impl Into<String>,
        fusion: FusionOutput,
        risk: RiskAssessment,
        validation: Validation,
        timestamp: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            direction: fusion.direction,
            strength: fusion.strength,
            confidence: fusion.confidence,
            coherence: fusion.coherence,
            market: fusion.market,
            metrics: fusion.metrics,
            risk,
            validation,
            timestamp,
        }
    }

    pub fn recommendation(&self) -> Recommendation {
        self.validation.recommendation
    }

    pub fn is_executable(&self) -> bool {
        self.validation.recommendation == Recommendation::Execute
    }

    /// Exchange-side client order id derived from the decision id, so a
    /// decision can place at most one order.
    pub fn client_order_id(&self) -> String {
        format!("sf{}", self.id.replace('-', ""))
    }
}

// ---------------------------------------------------------------------------
// Decision cache
// ---------------------------------------------------------------------------

pub struct DecisionCache {
    latest: DashMap<String, FusedDecision>,
    retention_ms: i64,
}

impl DecisionCache {
    pub fn new(retention_ms: u64) -> Self {
        Self {
            latest: DashMap::new(),
            retention_ms: retention_ms as i64,
        }
    }

    pub fn store(&self, decision: FusedDecision) {
        self.latest.insert(decision.symbol.clone(), decision);
    }

    pub fn last_decision(&self, symbol: &str) -> Option<FusedDecision> {
        self.latest.get(symbol).map(|d| d.clone())
    }

    /// Drop decisions older than the retention window. Returns the count.
    pub fn purge(&self, now_ms: i64) -> usize {
        let before = self.latest.len();
        let retention = self.retention_ms;
        self.latest.retain(|_, d| now_ms - d.timestamp <= retention);
        before.saturating_sub(self.latest.len())
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
