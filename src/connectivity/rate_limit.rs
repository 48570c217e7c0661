// =============================================================================
// Rate Limiter — fixed-window quota counters per endpoint class
// =============================================================================
//
// Binance enforces several independent limits per API family:
//   - Request weight: 1200 / minute (spot), 2400 / minute (futures).
//   - Order rate:     10 / 10 s (spot), 300 / 10 s (futures).
//
// Each (endpoint class, quota) pair owns one window `{current, max, reset_at}`
// in a sharded map, so reservations against one quota never contend with
// another. A reservation of cost `c` succeeds iff `current + c <= max` after
// resetting `current` when `now >= reset_at`.
//
// A cost larger than the quota's max can never fit and is refused outright
// rather than waited on.
//
// This is a fixed-window counter: a client may spend a full window's budget
// just before a boundary and another full budget just after it.
// =============================================================================

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::runtime_config::QuotaSettings;
use crate::types::EndpointClass;

/// Quota name for request weight.
pub const QUOTA_WEIGHT: &str = "weight";
/// Quota name for order placement.
pub const QUOTA_ORDERS: &str = "orders";

/// Utilisation above which a warning is logged.
const WARN_UTILISATION: f64 = 0.8;

#[derive(Debug)]
struct Window {
    current: u32,
    max: u32,
    window: Duration,
    reset_at: Instant,
}

impl Window {
    fn roll(&mut self, now: Instant) {
        if now >= self.reset_at {
            self.current = 0;
            self.reset_at = now + self.window;
        }
    }
}

/// Why a reservation did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaRefusal {
    /// The window is full; it resets after this long.
    Wait(Duration),
    /// The cost exceeds the window's max and will never fit.
    ExceedsQuota { cost: u32, max: u32 },
}

/// Serialisable view of one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub class: EndpointClass,
    pub quota: String,
    pub current: u32,
    pub max: u32,
    pub utilisation: f64,
    pub resets_in_ms: u64,
}

/// Thread-safe fixed-window rate limiter.
pub struct RateLimiter {
    windows: DashMap<(EndpointClass, String), Window>,
}

impl RateLimiter {
    /// Build a limiter with one window per configured quota.
    pub fn new(quotas: &[QuotaSettings]) -> Self {
        let now = Instant::now();
        let windows = DashMap::new();
        for q in quotas {
            let window = Duration::from_millis(q.window_ms);
            windows.insert(
                (q.class, q.quota.clone()),
                Window {
                    current: 0,
                    max: q.max,
                    window,
                    reset_at: now + window,
                },
            );
        }
        Self { windows }
    }

    // -------------------------------------------------------------------------
    // Reservations
    // -------------------------------------------------------------------------

    /// Try to reserve `cost` units of `quota` for `class`.
    ///
    /// Returns `Err(Wait(..))` with the time until the window resets when the
    /// reservation does not fit yet, `Err(ExceedsQuota { .. })` when it never
    /// will. Quotas that were never configured are unlimited.
    pub fn try_reserve(&self, class: EndpointClass, quota: &str, cost: u32) -> Result<(), QuotaRefusal> {
        self.try_reserve_at(class, quota, cost, Instant::now())
    }

    /// [`try_reserve`](Self::try_reserve) against an explicit clock reading.
    pub fn try_reserve_at(
        &self,
        class: EndpointClass,
        quota: &str,
        cost: u32,
        now: Instant,
    ) -> Result<(), QuotaRefusal> {
        let Some(mut w) = self.windows.get_mut(&(class, quota.to_string())) else {
            return Ok(());
        };
        if cost > w.max {
            warn!(class = %class, quota, cost, max = w.max, "reservation larger than the quota itself");
            return Err(QuotaRefusal::ExceedsQuota { cost, max: w.max });
        }
        w.roll(now);

        if w.current.saturating_add(cost) > w.max {
            let wait = w.reset_at.saturating_duration_since(now);
            debug!(
                class = %class,
                quota,
                current = w.current,
                max = w.max,
                cost,
                wait_ms = wait.as_millis() as u64,
                "reservation refused, quota exhausted"
            );
            return Err(QuotaRefusal::Wait(wait));
        }

        let before = w.current;
        w.current += cost;
        let threshold = (w.max as f64 * WARN_UTILISATION) as u32;
        if w.current >= threshold && before < threshold {
            warn!(
                class = %class,
                quota,
                current = w.current,
                max = w.max,
                "rate-limit usage crossed warning threshold"
            );
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    /// Reconcile the weight window with the exchange's own accounting
    /// (`X-MBX-USED-WEIGHT-1M`). Only ever raises local usage.
    pub fn observe_used_weight(&self, class: EndpointClass, used: u32) {
        if let Some(mut w) = self.windows.get_mut(&(class, QUOTA_WEIGHT.to_string())) {
            w.roll(Instant::now());
            if used > w.current {
                debug!(class = %class, local = w.current, remote = used, "weight window synced from header");
                w.current = used.min(w.max);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> Vec<QuotaSnapshot> {
        let now = Instant::now();
        let mut out: Vec<QuotaSnapshot> = self
            .windows
            .iter()
            .map(|entry| {
                let (class, quota) = entry.key();
                let w = entry.value();
                // An elapsed window reads as empty without mutating it.
                let current = if now >= w.reset_at { 0 } else { w.current };
                QuotaSnapshot {
                    class: *class,
                    quota: quota.clone(),
                    current,
                    max: w.max,
                    utilisation: if w.max == 0 { 0.0 } else { current as f64 / w.max as f64 },
                    resets_in_ms: w.reset_at.saturating_duration_since(now).as_millis() as u64,
                }
            })
            .collect();
        out.sort_by(|a, b| (a.class as u8, &a.quota).cmp(&(b.class as u8, &b.quota)));
        out
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("windows", &self.windows.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(&[QuotaSettings::new(EndpointClass::Spot, QUOTA_WEIGHT, max, window_ms)])
    }

    #[test]
    fn reservation_never_exceeds_max() {
        let rl = limiter(10, 60_000);
        let now = Instant::now();
        assert!(rl.try_reserve_at(EndpointClass::Spot, QUOTA_WEIGHT, 6, now).is_ok());
        assert!(rl.try_reserve_at(EndpointClass::Spot, QUOTA_WEIGHT, 4, now).is_ok());
        match rl.try_reserve_at(EndpointClass::Spot, QUOTA_WEIGHT, 1, now) {
            Err(QuotaRefusal::Wait(wait)) => assert!(wait > Duration::ZERO),
            other => panic!("expected a wait, got {other:?}"),
        }
        assert_eq!(rl.snapshot()[0].current, 10);
    }

    #[test]
    fn window_resets_exactly_once() {
        let rl = limiter(3, 1_000);
        let start = Instant::now();
        for _ in 0..3 {
            rl.try_reserve_at(EndpointClass::Spot, QUOTA_WEIGHT, 1, start).unwrap();
        }
        assert!(rl.try_reserve_at(EndpointClass::Spot, QUOTA_WEIGHT, 1, start).is_err());

        // Several calls after the boundary: the first resets, the rest accumulate.
        let later = start + Duration::from_millis(2_500);
        rl.try_reserve_at(EndpointClass::Spot, QUOTA_WEIGHT, 1, later).unwrap();
        rl.try_reserve_at(EndpointClass::Spot, QUOTA_WEIGHT, 1, later + Duration::from_millis(1)).unwrap();
        rl.try_reserve_at(EndpointClass::Spot, QUOTA_WEIGHT, 1, later + Duration::from_millis(2)).unwrap();
        assert!(rl
            .try_reserve_at(EndpointClass::Spot, QUOTA_WEIGHT, 1, later + Duration::from_millis(3))
            .is_err());

        // The next window opens relative to the reset, not the original start.
        let next = later + Duration::from_millis(1_000);
        assert!(rl.try_reserve_at(EndpointClass::Spot, QUOTA_WEIGHT, 1, next).is_ok());
    }

    #[test]
    fn oversized_cost_is_refused_in_every_window() {
        let rl = limiter(5, 1_000);
        let start = Instant::now();
        for i in 0..5 {
            let at = start + Duration::from_secs(5 * i);
            assert_eq!(
                rl.try_reserve_at(EndpointClass::Spot, QUOTA_WEIGHT, 10, at),
                Err(QuotaRefusal::ExceedsQuota { cost: 10, max: 5 })
            );
        }
        // Nothing was consumed by the refusals.
        assert!(rl.try_reserve_at(EndpointClass::Spot, QUOTA_WEIGHT, 5, start).is_ok());
    }

    #[test]
    fn unknown_quota_is_unlimited() {
        let rl = limiter(1, 1_000);
        for _ in 0..100 {
            assert!(rl.try_reserve(EndpointClass::Futures, QUOTA_ORDERS, 5).is_ok());
        }
    }

    #[test]
    fn classes_are_independent() {
        let rl = RateLimiter::new(&[
            QuotaSettings::new(EndpointClass::Spot, QUOTA_WEIGHT, 1, 60_000),
            QuotaSettings::new(EndpointClass::Futures, QUOTA_WEIGHT, 1, 60_000),
        ]);
        assert!(rl.try_reserve(EndpointClass::Spot, QUOTA_WEIGHT, 1).is_ok());
        assert!(rl.try_reserve(EndpointClass::Spot, QUOTA_WEIGHT, 1).is_err());
        assert!(rl.try_reserve(EndpointClass::Futures, QUOTA_WEIGHT, 1).is_ok());
    }

    #[test]
    fn header_sync_only_raises_usage() {
        let rl = limiter(1200, 60_000);
        rl.try_reserve(EndpointClass::Spot, QUOTA_WEIGHT, 100).unwrap();
        rl.observe_used_weight(EndpointClass::Spot, 40);
        assert_eq!(rl.snapshot()[0].current, 100);
        rl.observe_used_weight(EndpointClass::Spot, 900);
        assert_eq!(rl.snapshot()[0].current, 900);
        assert!((rl.snapshot()[0].utilisation - 0.75).abs() < 1e-9);
    }
}
