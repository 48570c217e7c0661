// =============================================================================
// Application — composition root for the fusion engine and connectivity
// =============================================================================
//
// Builds every component from `AppConfig`, wires them together and hands the
// background work to the scheduler. Nothing here makes trading decisions.
//
//   address monitor --events--> connectivity facade --streams--> trade feeds
//   trade feeds --signals--> fusion engine --EXECUTE--> order executor
//   order executor --signed requests--> connectivity facade
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::connectivity::{
    AddressMonitor, ConnectivityFacade, EndpointHealthTracker, RateLimiter, ReqwestTransport,
    ResilientHttpClient, StreamConnector, Transport, TungsteniteConnector,
};
use crate::engine::SignalFusionEngine;
use crate::execution::{Credentials, ExchangeOrderExecutor};
use crate::market_data::TradeFeedProducer;
use crate::metrics::{log_report, EngineMetrics};
use crate::runtime_config::AppConfig;
use crate::scheduler::Scheduler;
use crate::types::{AccountMode, EndpointClass};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);
/// Trades aggregated into each trade-feed signal.
const TRADES_PER_SIGNAL: u64 = 20;

/// (class, source name, weight) for every trade feed started per symbol.
const TRADE_FEEDS: [(EndpointClass, &str, f64); 2] = [
    (EndpointClass::Spot, "spot-stream", 0.4),
    (EndpointClass::Futures, "futures-stream", 0.45),
];

pub struct App {
    config: AppConfig,
    engine: Arc<SignalFusionEngine>,
    facade: Arc<ConnectivityFacade>,
    monitor: Arc<AddressMonitor>,
    feeds: Vec<(EndpointClass, Arc<TradeFeedProducer>)>,
    scheduler: Scheduler,
}

impl App {
    /// Production wiring: reqwest transport, tungstenite streams, HTTP address
    /// services, credentials from the environment.
    pub fn build(config: AppConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new().context("failed to build HTTP transport")?);
        let address_client = reqwest::Client::builder()
            .build()
            .context("failed to build address lookup client")?;
        let monitor = AddressMonitor::from_settings(
            config.address.clone(),
            address_client,
            config.connectivity.request_timeout(),
        );
        Ok(Self::assemble(
            config,
            transport,
            Arc::new(TungsteniteConnector),
            monitor,
            Credentials::from_env(),
        ))
    }

    /// Wire pre-built leaf components together.
    pub fn assemble(
        config: AppConfig,
        transport: Arc<dyn Transport>,
        connector: Arc<dyn StreamConnector>,
        monitor: AddressMonitor,
        credentials: Option<Credentials>,
    ) -> Self {
        let client = Arc::new(ResilientHttpClient::new(
            transport,
            Arc::new(RateLimiter::new(&config.connectivity.quotas)),
            Arc::new(EndpointHealthTracker::new()),
            &config.connectivity,
        ));
        let facade = Arc::new(ConnectivityFacade::new(client, connector, &config.connectivity));

        if let Err(e) = monitor.load_state() {
            warn!(error = %e, "failed to restore address state, starting fresh");
        }
        let monitor = Arc::new(monitor);
        facade.attach_address_monitor(&monitor);

        let metrics = Arc::new(EngineMetrics::new());
        let engine = Arc::new(SignalFusionEngine::new(config.fusion.clone(), metrics));

        let mode = config.runtime.account_mode;
        if mode == AccountMode::Live && credentials.is_none() {
            warn!("live account mode without SIGFUSE_API_KEY / SIGFUSE_API_SECRET, orders will fail");
        }
        engine.set_executor(Arc::new(ExchangeOrderExecutor::new(facade.clone(), mode, credentials)));

        let mut feeds = Vec::new();
        for symbol in &config.runtime.symbols {
            for (class, source, weight) in TRADE_FEEDS {
                let feed = Arc::new(TradeFeedProducer::new(source, symbol, weight, TRADES_PER_SIGNAL));
                engine.register_producer(feed.clone());
                feeds.push((class, feed));
            }
        }

        info!(
            symbols = ?config.runtime.symbols,
            account_mode = %mode,
            producers = engine.producer_count(),
            "application assembled"
        );

        Self {
            config,
            engine,
            facade,
            monitor,
            feeds,
            scheduler: Scheduler::new(),
        }
    }

    pub fn engine(&self) -> &Arc<SignalFusionEngine> {
        &self.engine
    }

    pub fn facade(&self) -> &Arc<ConnectivityFacade> {
        &self.facade
    }

    pub fn monitor(&self) -> &Arc<AddressMonitor> {
        &self.monitor
    }

    /// Open the trade streams and start every periodic task.
    pub fn start(&self) {
        for (class, feed) in &self.feeds {
            self.facade.stream(*class, &feed.topic(), feed.clone());
        }

        let fusion = &self.config.fusion;
        let engine = self.engine.clone();
        self.scheduler
            .spawn_periodic("fusion", fusion.fusion_interval(), fusion.fusion_jitter(), move || {
                let engine = engine.clone();
                async move {
                    engine.tick().await;
                }
            });

        let engine = self.engine.clone();
        let facade = self.facade.clone();
        self.scheduler.spawn_periodic(
            "metrics",
            Duration::from_millis(self.config.runtime.metrics_interval_ms),
            Duration::ZERO,
            move || {
                log_report(&engine.metrics(), engine.active_symbols(), &facade.report());
                async {}
            },
        );

        let engine = self.engine.clone();
        let facade = self.facade.clone();
        self.scheduler
            .spawn_periodic("housekeeping", HOUSEKEEPING_INTERVAL, Duration::ZERO, move || {
                engine.housekeeping(Utc::now().timestamp_millis());
                facade.purge_cache();
                async {}
            });

        let monitor = self.monitor.clone();
        self.scheduler.spawn("address-monitor", move |shutdown| monitor.run(shutdown));

        info!(
            streams = self.feeds.len(),
            tasks = self.scheduler.task_count(),
            "application started"
        );
    }

    /// Stop periodic work, close streams and persist address state.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.scheduler.shutdown().await;
        self.facade.shutdown().await;
        if let Err(e) = self.monitor.save_state().await {
            warn!(error = %e, "failed to persist address state");
        }
        let m = self.engine.metrics();
        info!(
            fused = m.decisions_fused,
            executed = m.decisions_executed,
            rejected = m.decisions_rejected,
            "shutdown complete"
        );
    }
}
