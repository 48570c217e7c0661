// =============================================================================
// Secure Random — jitter and shuffling backed by the OS CSPRNG
// =============================================================================
//
// Every randomised delay (retry backoff, reconnect scheduling, tick jitter)
// and every endpoint/service shuffle goes through this module. Nothing in the
// crate draws from a statistical PRNG.
// =============================================================================

use std::time::Duration;

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;

/// Uniform random duration in `[min, max)`.
///
/// Returns `min` when the range is empty.
pub fn secure_jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let lo = min.as_millis() as u64;
    let hi = max.as_millis() as u64;
    if hi <= lo {
        return min;
    }
    Duration::from_millis(OsRng.gen_range(lo..hi))
}

/// Symmetric jitter around zero: a signed offset in `[-spread, +spread)`
/// milliseconds.
pub fn secure_offset_ms(spread: Duration) -> i64 {
    let spread_ms = spread.as_millis() as i64;
    if spread_ms == 0 {
        return 0;
    }
    OsRng.gen_range(-spread_ms..spread_ms)
}

/// Fisher-Yates shuffle in place using the OS random source.
pub fn secure_shuffle<T>(items: &mut [T]) {
    items.shuffle(&mut OsRng);
}
