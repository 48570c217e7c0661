// =============================================================================
// Trade Feed Producer — turns an aggTrade stream into fusion signals
// =============================================================================
//
// Each trade updates a small window (buy/sell notional, first/last price).
// Every `emit_every` trades the window becomes one signal:
//   price        last trade price
//   volume       window notional
//   priceChange  (last - first) / first
//   direction    LONG above 55% taker-buy notional, SHORT below 45%
//   strength     |buy_ratio - 0.5| * 2
//   confidence   0.5 + 0.5 * strength * min(trades / 20, 1)
//   coherence    0.7
// and the window resets.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, warn};

use crate::connectivity::{StreamError, StreamHandler};
use crate::engine::{SignalProducer, SignalSink};
use crate::signals::{RawSignal, SignalPayload};
use crate::types::Direction;

const LONG_RATIO: f64 = 0.55;
const SHORT_RATIO: f64 = 0.45;

/// Trades after which a window counts as fully deep.
const FULL_DEPTH_TRADES: f64 = 20.0;

/// Coherence carried by every flow signal.
const FLOW_COHERENCE: f64 = 0.7;

#[derive(Debug, Default)]
struct TradeWindow {
    buy_volume: f64,
    sell_volume: f64,
    first_price: Option<f64>,
    last_price: f64,
    trades: u64,
}

impl TradeWindow {
    fn record(&mut self, price: f64, quantity: f64, is_buyer_maker: bool) {
        let notional = price * quantity;
        if is_buyer_maker {
            // Buyer is maker => taker is selling.
            self.sell_volume += notional;
        } else {
            self.buy_volume += notional;
        }
        self.first_price.get_or_insert(price);
        self.last_price = price;
        self.trades += 1;
    }

    fn buy_ratio(&self) -> f64 {
        let total = self.buy_volume + self.sell_volume;
        if total > 0.0 {
            self.buy_volume / total
        } else {
            0.5
        }
    }

    fn payload(&self) -> SignalPayload {
        let ratio = self.buy_ratio();
        let direction = if ratio > LONG_RATIO {
            Direction::Long
        } else if ratio < SHORT_RATIO {
            Direction::Short
        } else {
            Direction::Neutral
        };
        let price_change = match self.first_price {
            Some(first) if first > 0.0 => Some((self.last_price - first) / first),
            _ => None,
        };
        let strength = ((ratio - 0.5).abs() * 2.0).min(1.0);
        let depth = (self.trades as f64 / FULL_DEPTH_TRADES).min(1.0);
        SignalPayload {
            direction: Some(direction),
            strength: Some(strength),
            confidence: Some(0.5 + 0.5 * strength * depth),
            coherence: Some(FLOW_COHERENCE),
            price: Some(self.last_price),
            volume: Some(self.buy_volume + self.sell_volume),
            price_change,
            ..SignalPayload::default()
        }
    }
}

pub struct TradeFeedProducer {
    source: String,
    symbol: String,
    weight: f64,
    emit_every: u64,
    sink: RwLock<Option<SignalSink>>,
    window: Mutex<TradeWindow>,
    trade_count: AtomicU64,
    emitted: AtomicU64,
    parse_errors: AtomicU64,
}

impl TradeFeedProducer {
    pub fn new(source: impl Into<String>, symbol: impl Into<String>, weight: f64, emit_every: u64) -> Self {
        Self {
            source: source.into(),
            symbol: symbol.into().to_uppercase(),
            weight,
            emit_every: emit_every.max(1),
            sink: RwLock::new(None),
            window: Mutex::new(TradeWindow::default()),
            trade_count: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        }
    }

    /// Stream topic for this symbol, e.g. `btcusdt@aggTrade`.
    pub fn topic(&self) -> String {
        format!("{}@aggTrade", self.symbol.to_lowercase())
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count.load(Ordering::Relaxed)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    /// Record one trade; emits a signal when the window is full.
    pub fn process_trade(&self, price: f64, quantity: f64, is_buyer_maker: bool) {
        self.trade_count.fetch_add(1, Ordering::Relaxed);
        let payload = {
            let mut window = self.window.lock();
            window.record(price, quantity, is_buyer_maker);
            if window.trades < self.emit_every {
                return;
            }
            let payload = window.payload();
            *window = TradeWindow::default();
            payload
        };

        let Some(sink) = self.sink.read().clone() else {
            debug!(source = %self.source, "trade window closed before producer was attached");
            return;
        };
        let raw = RawSignal {
            source: self.source.clone(),
            symbol: Some(self.symbol.clone()),
            timestamp: None,
            weight: self.weight,
            data: payload,
        };
        if sink.emit(raw) {
            self.emitted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl StreamHandler for TradeFeedProducer {
    fn on_message(&self, message: Value) {
        match parse_agg_trade(&message) {
            Ok((price, quantity, is_buyer_maker)) => self.process_trade(price, quantity, is_buyer_maker),
            Err(e) => {
                self.parse_errors.fetch_add(1, Ordering::Relaxed);
                warn!(source = %self.source, error = %e, "failed to parse aggTrade message");
            }
        }
    }

    fn on_error(&self, error: &StreamError) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
        warn!(source = %self.source, symbol = %self.symbol, error = %error, "trade stream error");
    }
}

impl SignalProducer for TradeFeedProducer {
    fn name(&self) -> &str {
        &self.source
    }

    fn attach(&self, sink: SignalSink) {
        *self.sink.write() = Some(sink);
    }
}

/// Parse an aggTrade message, bare or wrapped in a combined-stream envelope.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "m": true }
/// ```
fn parse_agg_trade(root: &Value) -> Result<(f64, f64, bool)> {
    let trade = root.get("data").unwrap_or(root);

    let price: f64 = trade["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;

    let quantity: f64 = trade["q"]
        .as_str()
        .context("missing field q")?
        .parse()
        .context("failed to parse quantity")?;

    let is_buyer_maker = trade["m"].as_bool().context("missing field m")?;

    Ok((price, quantity, is_buyer_maker))
}
