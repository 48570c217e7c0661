// =============================================================================
// Risk Model — sizing, leverage and the admission validator
// =============================================================================
//
// Risk assessment (per fused output):
//   volatility   fused volatility, or the configured default
//   VaR          volatility * 2.33
//   position     base * confidence * max(0.1, 1 - volatility * 10), <= base
//   leverage     floor(10 * (confidence + coherence)) in [1, max_leverage]
//   stop loss %  max(1, volatility * 200)
//   take profit% max(2, volatility * 400)
//
// Circuit breaker: VaR above the risk threshold or volatility above 0.15.
// A tripped breaker forces position 0 and leverage 1.
//
// Validation: five filters worth 0.2 each. A single failed filter rejects.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::runtime_config::FusionSettings;
use crate::signals::FusionOutput;
use crate::types::{Direction, Recommendation, ValidationState};

/// 99% one-tailed z-score.
const VAR_Z: f64 = 2.33;
/// Volatility above this always trips the breaker.
const VOLATILITY_CEILING: f64 = 0.15;
const FILTER_WEIGHT: f64 = 0.2;
const EXECUTE_SCORE: f64 = 0.8;
const HOLD_SCORE: f64 = 0.6;
/// Float slack so five 0.2 increments still reach 0.8 / 1.0.
const SCORE_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub value_at_risk: f64,
    pub volatility: f64,
    pub position_size: f64,
    pub leverage: u32,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub circuit_breaker_triggered: bool,
}

/// Outcome of every admission filter, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterResults {
    pub coherence: bool,
    pub confidence: bool,
    pub strength: bool,
    pub risk: bool,
    pub direction: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub state: ValidationState,
    pub is_valid: bool,
    pub score: f64,
    pub recommendation: Recommendation,
    pub passed: Vec<String>,
    pub failed: Vec<String>,
}

impl Default for Validation {
    fn default() -> Self {
        Self {
            state: ValidationState::Pending,
            is_valid: false,
            score: 0.0,
            recommendation: Recommendation::Reject,
            passed: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl Validation {
    /// Score the filter outcomes and derive the recommendation.
    pub fn from_filters(f: FilterResults) -> Self {
        let mut passed = Vec::new();
        let mut failed = Vec::new();
        let checks = [
            (f.coherence, "coherence_minimum", "coherence_minimum"),
            (f.confidence, "confidence_threshold", "confidence_threshold"),
            (f.strength, "strength_minimum", "strength_minimum"),
            (f.risk, "risk_acceptable", "risk_too_high"),
            (f.direction, "direction_clear", "direction_unclear"),
        ];
        for (ok, pass_name, fail_name) in checks {
            if ok {
                passed.push(pass_name.to_string());
            } else {
                failed.push(fail_name.to_string());
            }
        }

        let score = passed.len() as f64 * FILTER_WEIGHT;
        let clean = failed.is_empty();
        let recommendation = if clean && score + SCORE_EPSILON >= EXECUTE_SCORE {
            Recommendation::Execute
        } else if clean && score + SCORE_EPSILON >= HOLD_SCORE {
            Recommendation::Hold
        } else {
            Recommendation::Reject
        };
        let is_valid = clean && score + SCORE_EPSILON >= HOLD_SCORE;

        Self {
            state: if is_valid {
                ValidationState::Valid
            } else {
                ValidationState::Rejected
            },
            is_valid,
            score,
            recommendation,
            passed,
            failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Risk Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RiskModel {
    risk_threshold: f64,
    coherence_minimum: f64,
    min_confidence: f64,
    min_strength: f64,
    base_position_size: f64,
    max_leverage: u32,
    default_volatility: f64,
}

impl RiskModel {
    pub fn new(settings: &FusionSettings) -> Self {
        Self {
            risk_threshold: settings.risk_threshold,
            coherence_minimum: settings.coherence_minimum,
            min_confidence: settings.min_confidence,
            min_strength: settings.min_strength,
            base_position_size: settings.base_position_size,
            max_leverage: settings.max_leverage.max(1),
            default_volatility: settings.default_volatility,
        }
    }

    pub fn assess(&self, confidence: f64, coherence: f64, volatility: Option<f64>) -> RiskAssessment {
        let volatility = volatility.unwrap_or(self.default_volatility).abs();
        let value_at_risk = volatility * VAR_Z;
        let tripped = value_at_risk > self.risk_threshold || volatility > VOLATILITY_CEILING;

        let vol_factor = (1.0 - volatility * 10.0).max(0.1);
        let position_size = (self.base_position_size * confidence * vol_factor).min(self.base_position_size);

        let raw_leverage = (10.0 * (confidence + coherence)).floor().max(1.0);
        let leverage = (raw_leverage as u32).clamp(1, self.max_leverage);

        RiskAssessment {
            value_at_risk,
            volatility,
            position_size: if tripped { 0.0 } else { position_size.max(0.0) },
            leverage: if tripped { 1 } else { leverage },
            stop_loss_pct: (volatility * 200.0).max(1.0),
            take_profit_pct: (volatility * 400.0).max(2.0),
            circuit_breaker_triggered: tripped,
        }
    }

    pub fn filters(&self, fusion: &FusionOutput, risk: &RiskAssessment) -> FilterResults {
        FilterResults {
            coherence: fusion.coherence >= self.coherence_minimum,
            confidence: fusion.confidence >= self.min_confidence,
            strength: fusion.strength >= self.min_strength,
            risk: !risk.circuit_breaker_triggered,
            direction: fusion.direction != Direction::Neutral,
        }
    }

    pub fn validate(&self, fusion: &FusionOutput, risk: &RiskAssessment) -> Validation {
        Validation::from_filters(self.filters(fusion, risk))
    }
}
