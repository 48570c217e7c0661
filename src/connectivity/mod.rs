// =============================================================================
// Connectivity — resilient access to the rate-limited exchange API
// =============================================================================

pub mod address_monitor;
pub mod cache;
pub mod client;
pub mod error;
pub mod facade;
pub mod health;
pub mod rate_limit;
pub mod retry;
pub mod stream;
pub mod transport;

pub use address_monitor::{AddressEvent, AddressMonitor, AddressSource};
pub use client::ResilientHttpClient;
pub use error::{ConnectivityError, StreamError, TransportError};
pub use facade::{ConnectivityFacade, ConnectivityReport};
pub use health::EndpointHealthTracker;
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
pub use stream::{PersistentStreamSupervisor, StreamConnector, StreamHandler, TungsteniteConnector};
pub use transport::{ReqwestTransport, RequestOptions, Transport};
