// =============================================================================
// Runtime Configuration — fusion, connectivity and address-monitor settings
// =============================================================================
//
// Every tunable parameter lives here. All fields carry
// `#[serde(default = "...")]` so a partial (or empty) JSON file loads with
// safe defaults, and every recognised option can be overridden through a
// `SIGFUSE_<NAME>` environment variable.
//
// Credentials are never part of this file: they are read from the
// environment by the composition root.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{AccountMode, EndpointClass};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_max_signal_age_ms() -> u64 {
    30_000
}

fn default_fusion_interval_ms() -> u64 {
    1_000
}

fn default_fusion_jitter_ms() -> u64 {
    100
}

fn default_risk_threshold() -> f64 {
    0.05
}

fn default_coherence_minimum() -> f64 {
    0.6
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_min_strength() -> f64 {
    0.3
}

fn default_base_position_size() -> f64 {
    100.0
}

fn default_max_leverage() -> u32 {
    20
}

fn default_volatility() -> f64 {
    0.02
}

fn default_max_signals_per_symbol() -> usize {
    256
}

fn default_decision_retention_ms() -> u64 {
    300_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_stream_timeout_ms() -> u64 {
    5_000
}

fn default_cache_ttl_ms() -> u64 {
    30_000
}

fn default_cache_max_entries() -> usize {
    1_000
}

fn default_spot_endpoints() -> EndpointSettings {
    EndpointSettings {
        primary: "https://api.binance.com".to_string(),
        backups: vec![
            "https://api1.binance.com".to_string(),
            "https://api2.binance.com".to_string(),
            "https://api3.binance.com".to_string(),
        ],
        stream_base: "wss://stream.binance.com:9443/ws".to_string(),
    }
}

fn default_futures_endpoints() -> EndpointSettings {
    EndpointSettings {
        primary: "https://fapi.binance.com".to_string(),
        backups: Vec::new(),
        stream_base: "wss://fstream.binance.com/ws".to_string(),
    }
}

fn default_quotas() -> Vec<QuotaSettings> {
    vec![
        QuotaSettings::new(EndpointClass::Spot, "weight", 1200, 60_000),
        QuotaSettings::new(EndpointClass::Spot, "orders", 10, 10_000),
        QuotaSettings::new(EndpointClass::Futures, "weight", 2400, 60_000),
        QuotaSettings::new(EndpointClass::Futures, "orders", 300, 10_000),
    ]
}

fn default_address_check_interval_ms() -> u64 {
    30_000
}

fn default_address_services() -> Vec<String> {
    vec![
        "https://api.ipify.org".to_string(),
        "https://icanhazip.com".to_string(),
        "https://ipecho.net/plain".to_string(),
        "https://myexternalip.com/raw".to_string(),
    ]
}

fn default_history_cap() -> usize {
    100
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_alert_threshold() -> usize {
    3
}

fn default_state_path() -> PathBuf {
    PathBuf::from("address_state.json")
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_metrics_interval_ms() -> u64 {
    5_000
}

// =============================================================================
// FusionSettings
// =============================================================================

/// Parameters of the fusion pipeline, risk model and validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionSettings {
    /// Signals older than this are evicted and never fused.
    #[serde(default = "default_max_signal_age_ms")]
    pub max_signal_age_ms: u64,

    #[serde(default = "default_fusion_interval_ms")]
    pub fusion_interval_ms: u64,

    /// Half-width of the random offset applied to every tick.
    #[serde(default = "default_fusion_jitter_ms")]
    pub fusion_jitter_ms: u64,

    /// VaR above this trips the circuit breaker.
    #[serde(default = "default_risk_threshold")]
    pub risk_threshold: f64,

    #[serde(default = "default_coherence_minimum")]
    pub coherence_minimum: f64,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_min_strength")]
    pub min_strength: f64,

    /// Position size (quote currency) at full confidence and zero volatility.
    #[serde(default = "default_base_position_size")]
    pub base_position_size: f64,

    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,

    /// Volatility assumed when no producer reports one.
    #[serde(default = "default_volatility")]
    pub default_volatility: f64,

    #[serde(default = "default_max_signals_per_symbol")]
    pub max_signals_per_symbol: usize,

    /// How long the last decision per symbol stays observable.
    #[serde(default = "default_decision_retention_ms")]
    pub decision_retention_ms: u64,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            max_signal_age_ms: default_max_signal_age_ms(),
            fusion_interval_ms: default_fusion_interval_ms(),
            fusion_jitter_ms: default_fusion_jitter_ms(),
            risk_threshold: default_risk_threshold(),
            coherence_minimum: default_coherence_minimum(),
            min_confidence: default_min_confidence(),
            min_strength: default_min_strength(),
            base_position_size: default_base_position_size(),
            max_leverage: default_max_leverage(),
            default_volatility: default_volatility(),
            max_signals_per_symbol: default_max_signals_per_symbol(),
            decision_retention_ms: default_decision_retention_ms(),
        }
    }
}

impl FusionSettings {
    pub fn fusion_interval(&self) -> Duration {
        Duration::from_millis(self.fusion_interval_ms)
    }

    pub fn fusion_jitter(&self) -> Duration {
        Duration::from_millis(self.fusion_jitter_ms)
    }
}

// =============================================================================
// ConnectivitySettings
// =============================================================================

/// REST and stream endpoints for one endpoint class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub primary: String,
    #[serde(default)]
    pub backups: Vec<String>,
    pub stream_base: String,
}

/// One fixed-window quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSettings {
    pub class: EndpointClass,
    pub quota: String,
    pub max: u32,
    pub window_ms: u64,
}

impl QuotaSettings {
    pub fn new(class: EndpointClass, quota: &str, max: u32, window_ms: u64) -> Self {
        Self {
            class,
            quota: quota.to_string(),
            max,
            window_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivitySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Handshake timeout for streaming connections.
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,

    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    #[serde(default = "default_spot_endpoints")]
    pub spot: EndpointSettings,

    #[serde(default = "default_futures_endpoints")]
    pub futures: EndpointSettings,

    #[serde(default = "default_quotas")]
    pub quotas: Vec<QuotaSettings>,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            request_timeout_ms: default_request_timeout_ms(),
            stream_timeout_ms: default_stream_timeout_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
            cache_max_entries: default_cache_max_entries(),
            spot: default_spot_endpoints(),
            futures: default_futures_endpoints(),
            quotas: default_quotas(),
        }
    }
}

impl ConnectivitySettings {
    pub fn endpoints(&self, class: EndpointClass) -> &EndpointSettings {
        match class {
            EndpointClass::Spot => &self.spot,
            EndpointClass::Futures => &self.futures,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

// =============================================================================
// AddressSettings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressSettings {
    #[serde(default = "default_address_check_interval_ms")]
    pub address_check_interval_ms: u64,

    /// Plain-text "what is my IP" services.
    #[serde(default = "default_address_services")]
    pub services: Vec<String>,

    #[serde(default = "default_history_cap")]
    pub history_cap: usize,

    /// Consecutive failed checks before an instability event.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Address changes within one hour that raise a frequent-change warning.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: usize,

    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

impl Default for AddressSettings {
    fn default() -> Self {
        Self {
            address_check_interval_ms: default_address_check_interval_ms(),
            services: default_address_services(),
            history_cap: default_history_cap(),
            failure_threshold: default_failure_threshold(),
            alert_threshold: default_alert_threshold(),
            state_path: default_state_path(),
        }
    }
}

impl AddressSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.address_check_interval_ms)
    }
}

// =============================================================================
// RuntimeSettings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Symbols whose trade streams feed the engine.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,

    /// Demo simulates fills locally; Live sends signed orders.
    #[serde(default)]
    pub account_mode: AccountMode,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            metrics_interval_ms: default_metrics_interval_ms(),
            account_mode: AccountMode::Demo,
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Complete configuration for one process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub fusion: FusionSettings,
    #[serde(default)]
    pub connectivity: ConnectivitySettings,
    #[serde(default)]
    pub address: AddressSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.runtime.symbols,
            account_mode = %config.runtime.account_mode,
            "config loaded"
        );

        Ok(config)
    }

    /// Apply `SIGFUSE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the environment in
    /// production, a map in tests). Unparseable values are ignored with a
    /// warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>, slot: &mut T) {
            if let Some(raw) = raw {
                match raw.trim().parse::<T>() {
                    Ok(v) => *slot = v,
                    Err(_) => warn!(key, value = %raw, "ignoring unparseable config override"),
                }
            }
        }

        let f = &mut self.fusion;
        parse("SIGFUSE_MAX_SIGNAL_AGE_MS", lookup("SIGFUSE_MAX_SIGNAL_AGE_MS"), &mut f.max_signal_age_ms);
        parse("SIGFUSE_FUSION_INTERVAL_MS", lookup("SIGFUSE_FUSION_INTERVAL_MS"), &mut f.fusion_interval_ms);
        parse("SIGFUSE_RISK_THRESHOLD", lookup("SIGFUSE_RISK_THRESHOLD"), &mut f.risk_threshold);
        parse("SIGFUSE_COHERENCE_MINIMUM", lookup("SIGFUSE_COHERENCE_MINIMUM"), &mut f.coherence_minimum);
        parse("SIGFUSE_BASE_POSITION_SIZE", lookup("SIGFUSE_BASE_POSITION_SIZE"), &mut f.base_position_size);
        parse("SIGFUSE_MAX_LEVERAGE", lookup("SIGFUSE_MAX_LEVERAGE"), &mut f.max_leverage);

        let c = &mut self.connectivity;
        parse("SIGFUSE_MAX_RETRIES", lookup("SIGFUSE_MAX_RETRIES"), &mut c.max_retries);
        parse("SIGFUSE_BACKOFF_BASE", lookup("SIGFUSE_BACKOFF_BASE"), &mut c.backoff_base);
        parse("SIGFUSE_REQUEST_TIMEOUT_MS", lookup("SIGFUSE_REQUEST_TIMEOUT_MS"), &mut c.request_timeout_ms);
        parse("SIGFUSE_STREAM_TIMEOUT_MS", lookup("SIGFUSE_STREAM_TIMEOUT_MS"), &mut c.stream_timeout_ms);
        parse("SIGFUSE_CACHE_TTL_MS", lookup("SIGFUSE_CACHE_TTL_MS"), &mut c.cache_ttl_ms);

        parse(
            "SIGFUSE_ADDRESS_CHECK_INTERVAL_MS",
            lookup("SIGFUSE_ADDRESS_CHECK_INTERVAL_MS"),
            &mut self.address.address_check_interval_ms,
        );
        parse(
            "SIGFUSE_METRICS_INTERVAL_MS",
            lookup("SIGFUSE_METRICS_INTERVAL_MS"),
            &mut self.runtime.metrics_interval_ms,
        );

        if let Some(syms) = lookup("SIGFUSE_SYMBOLS") {
            self.runtime.symbols = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(mode) = lookup("SIGFUSE_ACCOUNT_MODE") {
            match mode.trim().to_ascii_lowercase().as_str() {
                "live" => self.runtime.account_mode = AccountMode::Live,
                "demo" => self.runtime.account_mode = AccountMode::Demo,
                other => warn!(value = %other, "ignoring unknown account mode override"),
            }
        }
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        let f = &self.fusion;
        if f.max_signal_age_ms == 0 {
            bail!("max_signal_age_ms must be positive");
        }
        if f.fusion_interval_ms == 0 {
            bail!("fusion_interval_ms must be positive");
        }
        if f.fusion_jitter_ms >= f.fusion_interval_ms {
            bail!("fusion_jitter_ms must be smaller than fusion_interval_ms");
        }
        if !(0.0..=1.0).contains(&f.coherence_minimum) {
            bail!("coherence_minimum must be within [0, 1]");
        }
        if f.risk_threshold <= 0.0 {
            bail!("risk_threshold must be positive");
        }
        if f.max_leverage == 0 {
            bail!("max_leverage must be at least 1");
        }
        if f.base_position_size < 0.0 {
            bail!("base_position_size must not be negative");
        }
        let c = &self.connectivity;
        if c.backoff_base < 1.0 {
            bail!("backoff_base must be >= 1.0");
        }
        if c.request_timeout_ms == 0 || c.stream_timeout_ms == 0 {
            bail!("network timeouts must be positive");
        }
        if let Some(q) = c.quotas.iter().find(|q| q.max == 0 || q.window_ms == 0) {
            bail!("quota {}/{} needs a positive max and window", q.class, q.quota);
        }
        if self.address.address_check_interval_ms == 0 {
            bail!("address_check_interval_ms must be positive");
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.fusion.max_signal_age_ms, 30_000);
        assert_eq!(cfg.fusion.fusion_interval_ms, 1_000);
        assert!((cfg.fusion.risk_threshold - 0.05).abs() < f64::EPSILON);
        assert!((cfg.fusion.coherence_minimum - 0.6).abs() < f64::EPSILON);
        assert_eq!(cfg.connectivity.max_retries, 3);
        assert!((cfg.connectivity.backoff_base - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.connectivity.request_timeout_ms, 10_000);
        assert_eq!(cfg.connectivity.stream_timeout_ms, 5_000);
        assert_eq!(cfg.connectivity.cache_ttl_ms, 30_000);
        assert_eq!(cfg.address.address_check_interval_ms, 30_000);
        assert_eq!(cfg.runtime.account_mode, AccountMode::Demo);
        assert_eq!(cfg.connectivity.quotas.len(), 4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.fusion.max_signal_age_ms, 30_000);
        assert_eq!(cfg.connectivity.spot.primary, "https://api.binance.com");
        assert_eq!(cfg.connectivity.spot.backups.len(), 3);
        assert_eq!(cfg.address.services.len(), 4);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "fusion": { "risk_threshold": 0.1 }, "runtime": { "symbols": ["ETHUSDT"] } }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.fusion.risk_threshold - 0.1).abs() < f64::EPSILON);
        assert_eq!(cfg.fusion.max_signal_age_ms, 30_000);
        assert_eq!(cfg.runtime.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.runtime.metrics_interval_ms, 5_000);
    }

    #[test]
    fn overrides_apply_independently() {
        let env: HashMap<&str, &str> = [
            ("SIGFUSE_MAX_RETRIES", "5"),
            ("SIGFUSE_CACHE_TTL_MS", "1500"),
            ("SIGFUSE_SYMBOLS", "btcusdt, solusdt,"),
            ("SIGFUSE_RISK_THRESHOLD", "not-a-number"),
            ("SIGFUSE_ACCOUNT_MODE", "LIVE"),
        ]
        .into_iter()
        .collect();

        let mut cfg = AppConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.connectivity.max_retries, 5);
        assert_eq!(cfg.connectivity.cache_ttl_ms, 1500);
        assert_eq!(cfg.runtime.symbols, vec!["BTCUSDT", "SOLUSDT"]);
        // Bad value leaves the default in place.
        assert!((cfg.fusion.risk_threshold - 0.05).abs() < f64::EPSILON);
        assert_eq!(cfg.runtime.account_mode, AccountMode::Live);
        assert_eq!(cfg.connectivity.request_timeout_ms, 10_000);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = AppConfig::default();
        cfg.connectivity.backoff_base = 0.5;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.fusion.fusion_jitter_ms = cfg.fusion.fusion_interval_ms;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.fusion.max_leverage = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.connectivity.quotas[1].max = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_missing_file_is_error() {
        let path = std::env::temp_dir().join(format!("sigfuse-missing-{}.json", uuid::Uuid::new_v4()));
        assert!(AppConfig::load(&path).is_err());
    }
}
