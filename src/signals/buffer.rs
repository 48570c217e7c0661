// =============================================================================
// Signal Buffer — per-symbol signal collections with age eviction
// =============================================================================
//
// One shard-locked entry per symbol. `push` is safe under concurrent calls
// for the same or different symbols and prunes the touched symbol on the
// way in. `snapshot` prunes every symbol, drops the ones left empty, and
// returns owned copies so a fusion pass never sees later ingestion.
// =============================================================================

use dashmap::DashMap;

use super::signal::Signal;

pub struct SignalBuffer {
    symbols: DashMap<String, Vec<Signal>>,
    max_age_ms: i64,
    max_per_symbol: usize,
}

impl SignalBuffer {
    pub fn new(max_age_ms: u64, max_per_symbol: usize) -> Self {
        Self {
            symbols: DashMap::new(),
            max_age_ms: max_age_ms as i64,
            max_per_symbol: max_per_symbol.max(2),
        }
    }

    /// Append `signal`. Returns how many signals were evicted from that
    /// symbol in the process.
    pub fn push(&self, signal: Signal, now_ms: i64) -> usize {
        let max_age = self.max_age_ms;
        let mut entry = self.symbols.entry(signal.symbol.clone()).or_default();
        let before = entry.len();
        entry.retain(|s| !s.is_expired(now_ms, max_age));
        entry.push(signal);
        let overflow = entry.len().saturating_sub(self.max_per_symbol);
        if overflow > 0 {
            entry.drain(..overflow);
        }
        before + 1 - entry.len()
    }

    /// Prune every symbol and copy what is left.
    pub fn snapshot(&self, now_ms: i64) -> Vec<(String, Vec<Signal>)> {
        let max_age = self.max_age_ms;
        let mut out = Vec::new();
        self.symbols.retain(|symbol, signals| {
            signals.retain(|s| !s.is_expired(now_ms, max_age));
            if signals.is_empty() {
                return false;
            }
            out.push((symbol.clone(), signals.clone()));
            true
        });
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Evict expired signals everywhere. Returns how many were dropped.
    pub fn prune(&self, now_ms: i64) -> usize {
        let max_age = self.max_age_ms;
        let mut dropped = 0;
        self.symbols.retain(|_, signals| {
            let before = signals.len();
            signals.retain(|s| !s.is_expired(now_ms, max_age));
            dropped += before - signals.len();
            !signals.is_empty()
        });
        dropped
    }

    /// Symbols that currently hold at least one signal.
    pub fn active_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.symbols.get(symbol).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::signal::SignalPayload;
    use std::sync::Arc;

    fn sig(symbol: &str, ts: i64) -> Signal {
        Signal {
            source: "t".into(),
            symbol: symbol.into(),
            timestamp: ts,
            weight: 1.0,
            payload: SignalPayload::default(),
        }
    }

    #[test]
    fn snapshot_never_contains_expired_signals() {
        let buf = SignalBuffer::new(30_000, 100);
        buf.push(sig("BTCUSD", 0), 0);
        buf.push(sig("BTCUSD", 20_000), 20_000);
        buf.push(sig("ETHUSD", 1_000), 20_000);

        let now = 40_000;
        let snap = buf.snapshot(now);
        for (_, signals) in &snap {
            for s in signals {
                assert!(s.timestamp >= now - 30_000);
            }
        }
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].0, "BTCUSD");
        // ETHUSD emptied out and left the active set.
        assert_eq!(buf.active_symbols(), 1);
    }

    #[test]
    fn push_prunes_the_touched_symbol() {
        let buf = SignalBuffer::new(1_000, 100);
        buf.push(sig("A", 0), 0);
        buf.push(sig("A", 100), 100);
        let evicted = buf.push(sig("A", 5_000), 5_000);
        assert_eq!(evicted, 2);
        assert_eq!(buf.len("A"), 1);
    }

    #[test]
    fn per_symbol_cap_drops_oldest() {
        let buf = SignalBuffer::new(60_000, 3);
        for ts in 0..5 {
            buf.push(sig("A", ts), ts);
        }
        let snap = buf.snapshot(5);
        let ts: Vec<i64> = snap[0].1.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![2, 3, 4]);
    }

    #[test]
    fn prune_drops_expired_and_empty_symbols() {
        let buf = SignalBuffer::new(1_000, 100);
        buf.push(sig("A", 0), 0);
        buf.push(sig("B", 0), 0);
        buf.push(sig("B", 1_500), 0);
        assert_eq!(buf.prune(2_000), 2);
        assert_eq!(buf.active_symbols(), 1);
        assert_eq!(buf.len("B"), 1);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let buf = SignalBuffer::new(60_000, 100);
        buf.push(sig("A", 0), 0);
        let snap = buf.snapshot(0);
        buf.push(sig("A", 1), 1);
        assert_eq!(snap[0].1.len(), 1);
        assert_eq!(buf.len("A"), 2);
    }

    #[test]
    fn concurrent_pushes_to_one_symbol_are_all_kept() {
        let buf = Arc::new(SignalBuffer::new(60_000, 10_000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let buf = buf.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        buf.push(sig("BTCUSD", t * 1000 + i), 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(buf.len("BTCUSD"), 800);
    }
}
