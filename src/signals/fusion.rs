// =============================================================================
// Signal Fusion — weighted consensus over one symbol's live signals
// =============================================================================
//
// Pure functions: the same signals and clock always give the same result.
//
//   1. Prune signals older than the max age.
//   2. Normalise weights so they sum to 1 (equal shares if all are zero).
//   3. Market fields: weighted mean over the signals that carry each field.
//   4. Opinion fields: weighted mean of strength / confidence / coherence,
//      capped at 1. Direction is the bucket with the largest accumulated
//      `weight * strength`; any tie at the top resolves to NEUTRAL.
//      Signals without a direction add nothing to any bucket and are not
//      counted as a distinct direction.
//   5. Agreement `max(0, 1 - 0.3 * (distinct - 1))` and temporal decay
//      `max(0, 1 - mean_age / max_age)`.
//
// Fewer than two live signals never fuse.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::signal::{Signal, SignalPayload};
use crate::types::Direction;

/// Minimum live signals required to fuse a symbol.
pub const MIN_SIGNALS: usize = 2;

/// Agreement penalty per additional distinct direction.
const DISAGREEMENT_PENALTY: f64 = 0.3;

/// Bucket scores closer than this are a tie.
const TIE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FusedMarket {
    pub price: Option<f64>,
    pub volume: Option<f64>,
    pub volatility: Option<f64>,
    pub price_change: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionScores {
    pub long: f64,
    pub short: f64,
    pub neutral: f64,
}

impl DirectionScores {
    fn add(&mut self, direction: Direction, amount: f64) {
        match direction {
            Direction::Long => self.long += amount,
            Direction::Short => self.short += amount,
            Direction::Neutral => self.neutral += amount,
        }
    }

    /// Winning bucket; ties at the top and empty scores give NEUTRAL.
    pub fn winner(&self) -> Direction {
        let max = self.long.max(self.short).max(self.neutral);
        if max <= 0.0 {
            return Direction::Neutral;
        }
        let at_top = [self.long, self.short, self.neutral]
            .iter()
            .filter(|s| (max - **s).abs() <= TIE_EPSILON)
            .count();
        if at_top > 1 {
            return Direction::Neutral;
        }
        if (max - self.long).abs() <= TIE_EPSILON {
            Direction::Long
        } else if (max - self.short).abs() <= TIE_EPSILON {
            Direction::Short
        } else {
            Direction::Neutral
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FusionMetrics {
    pub signal_count: usize,
    pub distinct_directions: usize,
    pub agreement_level: f64,
    pub temporal_decay: f64,
    pub mean_age_ms: f64,
    /// Normalised weight contributed by each source.
    pub source_weights: BTreeMap<String, f64>,
    pub direction_scores: DirectionScores,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionOutput {
    pub direction: Direction,
    pub strength: f64,
    pub confidence: f64,
    pub coherence: f64,
    pub market: FusedMarket,
    pub metrics: FusionMetrics,
}

/// `weight_i / sum(weight)`; equal shares when every weight is zero.
pub fn normalized_weights(signals: &[Signal]) -> Vec<f64> {
    let total: f64 = signals.iter().map(|s| s.weight).sum();
    if total <= 0.0 {
        let n = signals.len().max(1) as f64;
        return vec![1.0 / n; signals.len()];
    }
    signals.iter().map(|s| s.weight / total).collect()
}

/// `max(0, 1 - 0.3 * (distinct - 1))`; 1.0 when nothing voted.
pub fn agreement_level(distinct_directions: usize) -> f64 {
    if distinct_directions <= 1 {
        return 1.0;
    }
    (1.0 - DISAGREEMENT_PENALTY * (distinct_directions - 1) as f64).max(0.0)
}

/// Weighted mean of `field` over the signals that carry it.
fn weighted_mean<F>(signals: &[Signal], weights: &[f64], field: F) -> Option<f64>
where
    F: Fn(&SignalPayload) -> Option<f64>,
{
    let mut sum = 0.0;
    let mut weight = 0.0;
    let mut plain = 0.0;
    let mut carriers = 0usize;
    for (s, w) in signals.iter().zip(weights) {
        if let Some(v) = field(&s.payload) {
            sum += w * v;
            weight += w;
            plain += v;
            carriers += 1;
        }
    }
    match carriers {
        0 => None,
        _ if weight > 0.0 => Some(sum / weight),
        n => Some(plain / n as f64),
    }
}

/// Fuse one symbol's signals as seen at `now_ms`.
///
/// A signal with no direction still feeds the market and opinion means but
/// casts no direction vote. It is not read as NEUTRAL.
pub fn fuse(signals: &[Signal], now_ms: i64, max_age_ms: i64) -> Option<FusionOutput> {
    let live: Vec<Signal> = signals
        .iter()
        .filter(|s| !s.is_expired(now_ms, max_age_ms))
        .cloned()
        .collect();
    if live.len() < MIN_SIGNALS {
        return None;
    }

    let weights = normalized_weights(&live);

    let market = FusedMarket {
        price: weighted_mean(&live, &weights, |p| p.price),
        volume: weighted_mean(&live, &weights, |p| p.volume),
        volatility: weighted_mean(&live, &weights, |p| p.volatility),
        price_change: weighted_mean(&live, &weights, |p| p.price_change),
    };

    let mut scores = DirectionScores::default();
    let mut seen = Vec::with_capacity(3);
    let mut source_weights = BTreeMap::new();
    for (s, w) in live.iter().zip(&weights) {
        *source_weights.entry(s.source.clone()).or_insert(0.0) += *w;
        if let Some(dir) = s.payload.direction {
            scores.add(dir, w * s.payload.strength.unwrap_or(1.0));
            if !seen.contains(&dir) {
                seen.push(dir);
            }
        }
    }

    let agreement = agreement_level(seen.len());
    let mean_age = live.iter().map(|s| s.age_ms(now_ms) as f64).sum::<f64>() / live.len() as f64;
    let temporal_decay = if max_age_ms > 0 {
        (1.0 - mean_age / max_age_ms as f64).max(0.0)
    } else {
        0.0
    };

    let strength = weighted_mean(&live, &weights, |p| p.strength).unwrap_or(0.0).min(1.0);
    let confidence = weighted_mean(&live, &weights, |p| p.confidence).unwrap_or(0.0).min(1.0);
    let coherence = weighted_mean(&live, &weights, |p| p.coherence)
        .unwrap_or(agreement)
        .min(1.0);

    Some(FusionOutput {
        direction: scores.winner(),
        strength,
        confidence,
        coherence,
        market,
        metrics: FusionMetrics {
            signal_count: live.len(),
            distinct_directions: seen.len(),
            agreement_level: agreement,
            temporal_decay,
            mean_age_ms: mean_age,
            source_weights,
            direction_scores: scores,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(source: &str, weight: f64, payload: SignalPayload) -> Signal {
        Signal {
            source: source.into(),
            symbol: "BTCUSD".into(),
            timestamp: 0,
            weight,
            payload,
        }
    }

    fn opinion(direction: Direction, strength: Option<f64>, confidence: Option<f64>) -> SignalPayload {
        SignalPayload {
            direction: Some(direction),
            strength,
            confidence,
            ..SignalPayload::default()
        }
    }

    #[test]
    fn directionless_signals_do_not_vote() {
        let quiet = SignalPayload {
            strength: Some(0.2),
            price: Some(100.0),
            ..SignalPayload::default()
        };
        let signals = vec![
            sig("a", 0.3, opinion(Direction::Long, Some(0.8), None)),
            sig("b", 0.7, quiet),
        ];
        let out = fuse(&signals, 0, 30_000).unwrap();
        assert_eq!(out.direction, Direction::Long);
        assert_eq!(out.metrics.distinct_directions, 1);
        assert_eq!(out.metrics.agreement_level, 1.0);
        assert_eq!(out.metrics.direction_scores.neutral, 0.0);
        assert_eq!(out.market.price, Some(100.0));
    }

    #[test]
    fn normalized_weights_sum_to_one() {
        let sets: Vec<Vec<f64>> = vec![
            vec![0.4, 0.6],
            vec![0.1, 0.2, 0.3, 0.9],
            vec![1e-9, 1.0],
            vec![0.33; 7],
        ];
        for ws in sets {
            let signals: Vec<Signal> = ws.iter().map(|w| sig("s", *w, SignalPayload::default())).collect();
            let total: f64 = normalized_weights(&signals).iter().sum();
            assert!((total - 1.0).abs() < 1e-9, "weights {ws:?} summed to {total}");
        }
    }

    #[test]
    fn zero_weights_get_equal_shares() {
        let signals = vec![sig("a", 0.0, SignalPayload::default()), sig("b", 0.0, SignalPayload::default())];
        assert_eq!(normalized_weights(&signals), vec![0.5, 0.5]);
    }

    #[test]
    fn single_live_signal_does_not_fuse() {
        let one = vec![sig("a", 1.0, opinion(Direction::Long, Some(0.9), Some(0.9)))];
        assert!(fuse(&one, 0, 30_000).is_none());

        // Two signals, but one expired.
        let mut stale = sig("b", 1.0, opinion(Direction::Long, Some(0.9), Some(0.9)));
        stale.timestamp = -40_000;
        let two = vec![one[0].clone(), stale];
        assert!(fuse(&two, 0, 30_000).is_none());
    }

    #[test]
    fn agreeing_longs_fuse_to_long_with_full_coherence() {
        let signals = vec![
            sig("a", 0.4, opinion(Direction::Long, Some(0.7), Some(0.8))),
            sig("b", 0.6, opinion(Direction::Long, Some(0.6), Some(0.9))),
        ];
        let out = fuse(&signals, 0, 30_000).unwrap();
        assert_eq!(out.direction, Direction::Long);
        assert!((out.confidence - 0.86).abs() < 1e-9);
        assert!((out.coherence - 1.0).abs() < 1e-12);
        assert!((out.strength - 0.64).abs() < 1e-9);
        assert_eq!(out.metrics.distinct_directions, 1);
        assert!((out.metrics.agreement_level - 1.0).abs() < 1e-12);
    }

    #[test]
    fn equal_long_and_short_is_neutral() {
        let signals = vec![
            sig("a", 0.5, opinion(Direction::Long, Some(0.6), None)),
            sig("b", 0.5, opinion(Direction::Short, Some(0.6), None)),
        ];
        let out = fuse(&signals, 0, 30_000).unwrap();
        assert_eq!(out.direction, Direction::Neutral);
        assert!((out.metrics.agreement_level - 0.7).abs() < 1e-12);
    }

    #[test]
    fn conflict_resolves_by_weighted_strength() {
        let signals = vec![
            sig("a", 0.5, opinion(Direction::Long, Some(0.4), None)),
            sig("b", 0.5, opinion(Direction::Short, Some(0.8), None)),
        ];
        let out = fuse(&signals, 0, 30_000).unwrap();
        assert_eq!(out.direction, Direction::Short);
        assert!((out.metrics.agreement_level - 0.7).abs() < 1e-12);
        assert!((out.coherence - 0.7).abs() < 1e-12);
        assert!((out.metrics.direction_scores.short - 0.4).abs() < 1e-12);
    }

    #[test]
    fn three_way_disagreement_penalised() {
        assert!((agreement_level(3) - 0.4).abs() < 1e-12);
        assert_eq!(agreement_level(0), 1.0);
        assert_eq!(agreement_level(5), 0.0);
    }

    #[test]
    fn market_fields_average_over_carriers_only() {
        let price_only = SignalPayload {
            price: Some(50_000.0),
            volume: Some(10.0),
            ..SignalPayload::default()
        };
        let other_price = SignalPayload {
            price: Some(50_100.0),
            ..SignalPayload::default()
        };
        let signals = vec![
            sig("stream", 0.25, price_only),
            sig("book", 0.75, other_price),
            sig("analyzer", 1.0, opinion(Direction::Long, Some(0.5), Some(0.5))),
        ];
        let out = fuse(&signals, 0, 30_000).unwrap();
        let price = out.market.price.unwrap();
        assert!((price - 50_075.0).abs() < 1e-6);
        assert_eq!(out.market.volume, Some(10.0));
        assert_eq!(out.market.volatility, None);
        // Market-only signals do not vote.
        assert_eq!(out.metrics.distinct_directions, 1);
        assert_eq!(out.direction, Direction::Long);
        assert!((out.metrics.source_weights["analyzer"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn temporal_decay_tracks_mean_age() {
        let mut a = sig("a", 1.0, opinion(Direction::Long, None, None));
        let mut b = sig("b", 1.0, opinion(Direction::Long, None, None));
        a.timestamp = 10_000;
        b.timestamp = 20_000;
        // Ages 20 s and 10 s, mean 15 s of a 30 s window.
        let out = fuse(&[a, b], 30_000, 30_000).unwrap();
        assert!((out.metrics.temporal_decay - 0.5).abs() < 1e-12);
    }

    #[test]
    fn absent_strength_votes_with_full_weight() {
        let signals = vec![
            sig("a", 0.3, opinion(Direction::Short, None, None)),
            sig("b", 0.7, opinion(Direction::Long, None, None)),
        ];
        let out = fuse(&signals, 0, 30_000).unwrap();
        assert_eq!(out.direction, Direction::Long);
        assert_eq!(out.strength, 0.0);
    }
}
