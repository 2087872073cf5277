// Order execution: exchange connectors, rate limiting and retried placement
pub mod connector;
pub mod executor;
pub mod paper;
pub mod rate_limiter;

pub use connector::{Balance, ConnectorRegistry, ExchangeConnector, OrderRequest, PlacementResult};
pub use executor::OrderExecutor;
pub use paper::PaperConnector;
pub use rate_limiter::{LimiterSnapshot, RateLimiter, RateLimiterRegistry};
