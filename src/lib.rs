// =============================================================================
// sigfuse — signal fusion engine over a resilient exchange connectivity layer
// =============================================================================

pub mod app;
pub mod connectivity;
pub mod decision;
pub mod engine;
pub mod execution;
pub mod market_data;
pub mod metrics;
pub mod observer;
pub mod risk;
pub mod runtime_config;
pub mod scheduler;
pub mod secure_random;
pub mod signals;
pub mod types;

pub use app::App;
pub use decision::FusedDecision;
pub use engine::{SignalFusionEngine, SignalProducer, SignalSink, TickReport};
pub use execution::{OrderExecutor, OrderOutcome, OrderRequest};
pub use runtime_config::AppConfig;
