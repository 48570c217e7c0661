// =============================================================================
// Address Monitor — external IP change and instability detection
// =============================================================================
//
// Every check queries a securely shuffled list of "what is my IP" services
// and accepts the first response that parses as an IPv4 or IPv6 address.
//
//   - A different address than the last known one emits `Changed`.
//   - `failure_threshold` consecutive failed checks emit one `Instability`.
//
// State (current / previous address, change count, bounded history) is
// persisted with an atomic tmp + rename write after every check and loaded
// on start, so a restart within one interval does not query immediately.
// =============================================================================

use std::collections::VecDeque;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::stream::stopped;
use crate::observer::Subscribers;
use crate::runtime_config::AddressSettings;
use crate::secure_random::secure_shuffle;

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// One external service reporting our public address as plain text.
#[async_trait]
pub trait AddressSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self) -> Result<String>;
}

pub struct HttpAddressSource {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpAddressSource {
    pub fn new(url: impl Into<String>, client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            client,
            timeout,
        }
    }
}

#[async_trait]
impl AddressSource for HttpAddressSource {
    fn name(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<String> {
        let resp = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("address query to {} failed", self.url))?;
        if !resp.status().is_success() {
            bail!("address query to {} returned HTTP {}", self.url, resp.status());
        }
        resp.text()
            .await
            .with_context(|| format!("failed to read body from {}", self.url))
    }
}

// ---------------------------------------------------------------------------
// State and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressChange {
    pub address: IpAddr,
    pub previous: Option<IpAddr>,
    pub at: DateTime<Utc>,
}

/// Persisted monitor state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressState {
    pub current: Option<IpAddr>,
    pub previous: Option<IpAddr>,
    #[serde(default)]
    pub change_count: u64,
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default = "default_stable")]
    pub stable: bool,
    #[serde(default)]
    pub history: VecDeque<AddressChange>,
}

fn default_stable() -> bool {
    true
}

impl Default for AddressState {
    fn default() -> Self {
        Self {
            current: None,
            previous: None,
            change_count: 0,
            last_check: None,
            stable: true,
            history: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AddressEvent {
    Changed {
        old: Option<IpAddr>,
        new: IpAddr,
        change_count: u64,
        at: DateTime<Utc>,
    },
    Instability {
        consecutive_failures: u32,
        last_error: String,
    },
}

/// Result of one check, mainly for tests and logs.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    First(IpAddr),
    Unchanged(IpAddr),
    Changed { old: IpAddr, new: IpAddr },
    Failed { consecutive_failures: u32 },
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct AddressMonitor {
    sources: Vec<Arc<dyn AddressSource>>,
    settings: AddressSettings,
    state: RwLock<AddressState>,
    consecutive_failures: RwLock<u32>,
    events: Subscribers<AddressEvent>,
}

impl AddressMonitor {
    pub fn new(sources: Vec<Arc<dyn AddressSource>>, settings: AddressSettings) -> Self {
        Self {
            sources,
            settings,
            state: RwLock::new(AddressState::default()),
            consecutive_failures: RwLock::new(0),
            events: Subscribers::new("address"),
        }
    }

    /// Build HTTP sources for every configured service URL.
    pub fn from_settings(settings: AddressSettings, client: reqwest::Client, timeout: Duration) -> Self {
        let sources = settings
            .services
            .iter()
            .map(|url| Arc::new(HttpAddressSource::new(url.clone(), client.clone(), timeout)) as Arc<dyn AddressSource>)
            .collect();
        Self::new(sources, settings)
    }

    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&AddressEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler);
    }

    pub fn state(&self) -> AddressState {
        self.state.read().clone()
    }

    pub fn change_count(&self) -> u64 {
        self.state.read().change_count
    }

    pub fn state_path(&self) -> &Path {
        &self.settings.state_path
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Load persisted state. A missing file leaves the state empty.
    pub fn load_state(&self) -> Result<()> {
        let path = &self.settings.state_path;
        if !path.exists() {
            debug!(path = %path.display(), "no persisted address state");
            return Ok(());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read address state from {}", path.display()))?;
        let mut loaded: AddressState = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse address state from {}", path.display()))?;
        while loaded.history.len() > self.settings.history_cap {
            loaded.history.pop_front();
        }
        info!(
            path = %path.display(),
            current = ?loaded.current,
            change_count = loaded.change_count,
            "address state restored"
        );
        *self.state.write() = loaded;
        Ok(())
    }

    /// Persist state atomically (write `.tmp`, then rename).
    pub async fn save_state(&self) -> Result<()> {
        let snapshot = self.state();
        write_atomic(&self.settings.state_path, &snapshot).await
    }

    /// Delay before the first check: zero unless the persisted state was
    /// checked less than one interval ago.
    pub fn initial_delay(&self, now: DateTime<Utc>) -> Duration {
        let interval = self.settings.check_interval();
        match self.state.read().last_check {
            Some(last) => {
                let since = (now - last).to_std().unwrap_or(Duration::ZERO);
                interval.saturating_sub(since)
            }
            None => Duration::ZERO,
        }
    }

    // -------------------------------------------------------------------------
    // Checking
    // -------------------------------------------------------------------------

    /// Query sources until one returns a valid address.
    async fn detect(&self) -> Result<IpAddr, String> {
        let mut order: Vec<Arc<dyn AddressSource>> = self.sources.clone();
        secure_shuffle(&mut order);

        let mut last_error = String::from("no address sources configured");
        for source in order {
            match source.fetch().await {
                Ok(body) => match body.trim().parse::<IpAddr>() {
                    Ok(ip) => return Ok(ip),
                    Err(_) => {
                        last_error = format!("{} returned an invalid address", source.name());
                        debug!(source = source.name(), "invalid address response");
                    }
                },
                Err(e) => {
                    last_error = format!("{e:#}");
                    debug!(source = source.name(), error = %last_error, "address source failed");
                }
            }
        }
        Err(last_error)
    }

    /// Run one check and emit any resulting event.
    #[instrument(skip(self), name = "address_check")]
    pub async fn check_once(&self) -> CheckOutcome {
        let now = Utc::now();
        let outcome = match self.detect().await {
            Ok(ip) => {
                *self.consecutive_failures.write() = 0;
                self.apply_address(ip, now)
            }
            Err(last_error) => {
                let failures = {
                    let mut f = self.consecutive_failures.write();
                    *f += 1;
                    *f
                };
                warn!(consecutive_failures = failures, error = %last_error, "address check failed");
                if failures == self.settings.failure_threshold {
                    self.state.write().stable = false;
                    warn!(consecutive_failures = failures, "network address unstable");
                    self.events.publish(&AddressEvent::Instability {
                        consecutive_failures: failures,
                        last_error,
                    });
                }
                CheckOutcome::Failed {
                    consecutive_failures: failures,
                }
            }
        };

        self.state.write().last_check = Some(now);
        if let Err(e) = self.save_state().await {
            warn!(error = %e, "failed to persist address state");
        }
        outcome
    }

    fn apply_address(&self, ip: IpAddr, now: DateTime<Utc>) -> CheckOutcome {
        let (outcome, event) = {
            let mut st = self.state.write();
            st.stable = true;
            match st.current {
                None => {
                    st.current = Some(ip);
                    push_history(&mut st.history, self.settings.history_cap, ip, None, now);
                    info!(address = %ip, "external address detected");
                    (CheckOutcome::First(ip), None)
                }
                Some(old) if old == ip => (CheckOutcome::Unchanged(ip), None),
                Some(old) => {
                    st.previous = Some(old);
                    st.current = Some(ip);
                    st.change_count += 1;
                    push_history(&mut st.history, self.settings.history_cap, ip, Some(old), now);
                    warn!(old = %old, new = %ip, change_count = st.change_count, "external address changed");

                    let recent = st
                        .history
                        .iter()
                        .filter(|c| c.previous.is_some() && now - c.at < chrono::Duration::hours(1))
                        .count();
                    if recent >= self.settings.alert_threshold {
                        warn!(changes_last_hour = recent, "external address changing frequently");
                    }

                    let event = AddressEvent::Changed {
                        old: Some(old),
                        new: ip,
                        change_count: st.change_count,
                        at: now,
                    };
                    (CheckOutcome::Changed { old, new: ip }, Some(event))
                }
            }
        };
        // Publish outside the state lock so handlers may read it.
        if let Some(event) = event {
            self.events.publish(&event);
        }
        outcome
    }

    /// Check on a fixed interval until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let first = self.initial_delay(Utc::now());
        if !first.is_zero() {
            info!(delay_ms = first.as_millis() as u64, "resuming address monitor from persisted state");
        }
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => return,
            _ = tokio::time::sleep(first) => {}
        }

        let mut ticker = tokio::time::interval(self.settings.check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
        info!("address monitor stopped");
    }
}

fn push_history(
    history: &mut VecDeque<AddressChange>,
    cap: usize,
    address: IpAddr,
    previous: Option<IpAddr>,
    at: DateTime<Utc>,
) {
    history.push_back(AddressChange { address, previous, at });
    while history.len() > cap {
        history.pop_front();
    }
}

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("failed to serialise address state")?;
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &content)
        .await
        .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("failed to rename tmp state to {}", path.display()))?;
    Ok(())
}
