use thiserror::Error;

/// Errors surfaced by the trading engine.
///
/// Gate refusals (cooldown, phase, slot limits) and capacity refusals are not
/// errors; they are returned as typed outcomes by the components that apply
/// them.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Exchange connector error: {0}")]
    Connector(String),

    #[error("No connector registered for exchange {0}")]
    UnknownExchange(String),

    #[error("Duplicate order submission: {0}")]
    DuplicateOrder(String),

    #[error("Exchange {exchange} rejected order {order_id} after {attempts} attempts: {message}")]
    ExchangeRejection {
        exchange: String,
        order_id: uuid::Uuid,
        attempts: u32,
        message: String,
    },

    #[error("Order {order_id} on {exchange} has an unknown outcome: {message}")]
    UnknownOrderOutcome {
        exchange: String,
        order_id: uuid::Uuid,
        message: String,
    },

    #[error("Engine startup failed for connection {connection}: {reason}")]
    Startup { connection: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl EngineError {
    /// True for failures that are expected to clear up on a later cycle
    /// (database hiccups, dropped connections, exchange timeouts).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Database(_)
                | EngineError::Redis(_)
                | EngineError::Connector(_)
                | EngineError::Timeout(_)
        )
    }
}
