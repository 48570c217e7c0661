// =============================================================================
// Signals Module
// =============================================================================
//
// Signal ingestion and fusion:
// - Normalisation of producer reports into immutable signals
// - Per-symbol buffering with age and count eviction
// - Weighted consensus fusion

pub mod buffer;
pub mod fusion;
pub mod signal;

pub use buffer::SignalBuffer;
pub use fusion::{fuse, FusedMarket, FusionMetrics, FusionOutput};
pub use signal::{Malformed, RawSignal, Signal, SignalPayload};
