// =============================================================================
// Signal — one weighted, timestamped observation from a producer
// =============================================================================
//
// Producers hand over a `RawSignal` (the ingestion schema). Normalisation
// turns it into an immutable `Signal` or rejects it as malformed.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Direction;

/// Optional opinion and market fields carried by a signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coherence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volatility: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_change: Option<f64>,
}

/// Signal exactly as a producer reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSignal {
    pub source: String,
    #[serde(default)]
    pub symbol: Option<String>,
    /// Epoch milliseconds. Missing means "now".
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub data: SignalPayload,
}

fn default_weight() -> f64 {
    1.0
}

/// Why a raw signal was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    MissingSymbol,
    InvalidWeight,
}

impl std::fmt::Display for Malformed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingSymbol => write!(f, "missing symbol"),
            Self::InvalidWeight => write!(f, "invalid weight"),
        }
    }
}

/// Normalised, immutable signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub source: String,
    pub symbol: String,
    pub timestamp: i64,
    /// Producer trust in [0, 1].
    pub weight: f64,
    pub payload: SignalPayload,
}

impl Signal {
    /// Normalise a raw signal received at `now_ms`.
    pub fn normalize(raw: RawSignal, now_ms: i64) -> Result<Self, Malformed> {
        let symbol = raw
            .symbol
            .as_deref()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .ok_or(Malformed::MissingSymbol)?;

        if !raw.weight.is_finite() {
            return Err(Malformed::InvalidWeight);
        }

        let source = match raw.source.trim() {
            "" => "unknown".to_string(),
            s => s.to_string(),
        };

        let d = raw.data;
        Ok(Self {
            source,
            symbol,
            timestamp: raw.timestamp.unwrap_or(now_ms),
            weight: raw.weight.clamp(0.0, 1.0),
            payload: SignalPayload {
                direction: d.direction,
                strength: unit(d.strength),
                confidence: unit(d.confidence),
                coherence: unit(d.coherence),
                price: finite(d.price),
                volume: finite(d.volume),
                volatility: finite(d.volatility).map(f64::abs),
                price_change: finite(d.price_change),
            },
        })
    }

    /// Age relative to `now_ms`; future timestamps count as zero.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.timestamp).max(0)
    }

    pub fn is_expired(&self, now_ms: i64, max_age_ms: i64) -> bool {
        self.age_ms(now_ms) > max_age_ms
    }
}

fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

fn unit(v: Option<f64>) -> Option<f64> {
    finite(v).map(|x| x.clamp(0.0, 1.0))
}
