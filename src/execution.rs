// =============================================================================
// Execution Boundary — turns EXECUTE decisions into exchange orders
// =============================================================================
//
// The engine only knows `OrderExecutor`. `ExchangeOrderExecutor` is the
// production implementation:
//   - Demo mode simulates the fill locally and never touches the network.
//   - Live mode sets leverage, then submits a MARKET order. Both requests
//     are HMAC-SHA256 signed and go through the connectivity facade.
//     Leverage updates inherit retries and failover. The order itself is
//     sent once, tagged with `newClientOrderId`; when the outcome is unknown
//     (timeout, dropped connection) the order is looked up by that id with a
//     freshly signed query instead of being sent again.
//
// SECURITY: the secret key is never logged or serialised.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};
use uuid::Uuid;

use crate::connectivity::{ConnectivityFacade, RequestOptions};
use crate::types::{AccountMode, Side};

type HmacSha256 = Hmac<Sha256>;

/// recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5_000;
/// Exchange lot step for order quantities is 1 / QUANTITY_SCALE.
const QUANTITY_SCALE: f64 = 1_000.0;

const LEVERAGE_PATH: &str = "/fapi/v1/leverage";
const ORDER_PATH: &str = "/fapi/v1/order";

// ---------------------------------------------------------------------------
// Boundary types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub leverage: u32,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// Idempotency key sent as `newClientOrderId`.
    pub client_order_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrderOutcome {
    pub fn filled(order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn execute_order(&self, order: OrderRequest) -> OrderOutcome;
}

/// `position / price` floored to the lot step, never below one step.
/// `None` when the price is unusable.
pub fn quantity_for(position_size: f64, price: f64) -> Option<f64> {
    if !price.is_finite() || price <= 0.0 || !position_size.is_finite() {
        return None;
    }
    let steps = (position_size / price * QUANTITY_SCALE).floor();
    Some((steps / QUANTITY_SCALE).max(1.0 / QUANTITY_SCALE))
}

// ---------------------------------------------------------------------------
// Exchange executor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
        }
    }

    /// Read `SIGFUSE_API_KEY` / `SIGFUSE_API_SECRET`; `None` if either is unset.
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("SIGFUSE_API_KEY").ok().filter(|k| !k.is_empty())?;
        let secret = std::env::var("SIGFUSE_API_SECRET").ok().filter(|s| !s.is_empty())?;
        Some(Self::new(key, secret))
    }

    /// HMAC-SHA256 hex signature of `payload`.
    pub fn sign(&self, payload: &str) -> String {
        // HMAC-SHA256 accepts keys of any length; the error branch is unreachable.
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            return String::new();
        };
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &format!("{}***", &self.api_key.chars().take(4).collect::<String>()))
            .field("secret", &"<redacted>")
            .finish()
    }
}

pub struct ExchangeOrderExecutor {
    facade: Arc<ConnectivityFacade>,
    mode: AccountMode,
    credentials: Option<Credentials>,
}

impl ExchangeOrderExecutor {
    pub fn new(facade: Arc<ConnectivityFacade>, mode: AccountMode, credentials: Option<Credentials>) -> Self {
        Self {
            facade,
            mode,
            credentials,
        }
    }

    pub fn mode(&self) -> AccountMode {
        self.mode
    }

    /// Append timestamp, recvWindow and the signature over everything before it.
    fn signed(credentials: &Credentials, mut options: RequestOptions, timestamp_ms: i64) -> RequestOptions {
        options = options
            .query("timestamp", timestamp_ms.to_string())
            .query("recvWindow", RECV_WINDOW.to_string());
        let signature = credentials.sign(&options.query_string());
        options
            .query("signature", signature)
            .header("X-MBX-APIKEY", credentials.api_key.clone())
    }

    fn simulate(&self, order: &OrderRequest) -> OrderOutcome {
        let id = format!("demo-{}", Uuid::new_v4());
        info!(
            symbol = %order.symbol,
            side = %order.side,
            quantity = order.quantity,
            leverage = order.leverage,
            order_id = %id,
            "demo fill simulated"
        );
        OrderOutcome::filled(id)
    }

    async fn submit(&self, credentials: &Credentials, order: &OrderRequest) -> OrderOutcome {
        let leverage = Self::signed(
            credentials,
            RequestOptions::post()
                .query("symbol", order.symbol.clone())
                .query("leverage", order.leverage.to_string()),
            chrono::Utc::now().timestamp_millis(),
        );
        if let Err(e) = self.facade.request(LEVERAGE_PATH, leverage).await {
            warn!(symbol = %order.symbol, error = %e, "leverage update failed");
            return OrderOutcome::failed(format!("leverage update failed: {e}"));
        }

        let placement = Self::signed(
            credentials,
            RequestOptions::post()
                .query("symbol", order.symbol.clone())
                .query("side", order.side.to_string())
                .query("type", "MARKET")
                .query("quantity", format!("{:.3}", order.quantity))
                .query("newClientOrderId", order.client_order_id.clone())
                .once(),
            chrono::Utc::now().timestamp_millis(),
        );
        match self.facade.request(ORDER_PATH, placement).await {
            Ok(resp) => {
                let order_id = order_id_of(&resp);
                info!(symbol = %order.symbol, side = %order.side, order_id = %order_id, "live order placed");
                OrderOutcome::filled(order_id)
            }
            Err(e) if e.is_rejection() => {
                warn!(symbol = %order.symbol, side = %order.side, error = %e, "live order rejected");
                OrderOutcome::failed(format!("order placement failed: {e}"))
            }
            Err(e) => {
                warn!(
                    symbol = %order.symbol,
                    client_order_id = %order.client_order_id,
                    error = %e,
                    "order outcome unknown, looking it up"
                );
                self.confirm(credentials, order, &e.to_string()).await
            }
        }
    }

    /// Resolve an order whose placement response was lost.
    async fn confirm(&self, credentials: &Credentials, order: &OrderRequest, cause: &str) -> OrderOutcome {
        let lookup = Self::signed(
            credentials,
            RequestOptions::get()
                .query("symbol", order.symbol.clone())
                .query("origClientOrderId", order.client_order_id.clone())
                .no_cache(),
            chrono::Utc::now().timestamp_millis(),
        );
        match self.facade.request(ORDER_PATH, lookup).await {
            Ok(resp) if resp.get("orderId").is_some() => {
                let order_id = order_id_of(&resp);
                info!(symbol = %order.symbol, order_id = %order_id, "order found after lost response");
                OrderOutcome::filled(order_id)
            }
            Ok(_) => OrderOutcome::failed(format!("order placement failed: {cause}")),
            Err(e) => {
                warn!(symbol = %order.symbol, error = %e, "order lookup failed");
                OrderOutcome::failed(format!("order placement failed: {cause}; lookup failed: {e}"))
            }
        }
    }
}

fn order_id_of(resp: &serde_json::Value) -> String {
    resp.get("orderId")
        .map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}

#[async_trait]
impl OrderExecutor for ExchangeOrderExecutor {
    async fn execute_order(&self, order: OrderRequest) -> OrderOutcome {
        if !order.quantity.is_finite() || order.quantity <= 0.0 {
            return OrderOutcome::failed("invalid quantity");
        }
        match (self.mode, &self.credentials) {
            (AccountMode::Demo, _) => self.simulate(&order),
            (AccountMode::Live, Some(credentials)) => self.submit(credentials, &order).await,
            (AccountMode::Live, None) => {
                warn!(symbol = %order.symbol, "live mode without API credentials, order dropped");
                OrderOutcome::failed("missing API credentials")
            }
        }
    }
}

impl std::fmt::Debug for ExchangeOrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeOrderExecutor")
            .field("mode", &self.mode)
            .field("credentials", &self.credentials)
            .finish()
    }
}
