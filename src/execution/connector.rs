use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{OrderSide, OrderStatus, OrderType};
use crate::{EngineError, Result};

/// Generic order placement request
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub connection_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Limit price; ignored for market orders
    pub price: Option<f64>,
    pub leverage: u32,
    pub reduce_only: bool,
}

/// What the exchange answered to a placement
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_quantity: Option<f64>,
    pub avg_price: Option<f64>,
    pub error: Option<String>,
}

impl PlacementResult {
    pub fn filled(order_id: String, quantity: f64, price: f64) -> Self {
        Self {
            success: true,
            order_id: Some(order_id),
            status: OrderStatus::Filled,
            filled_quantity: Some(quantity),
            avg_price: Some(price),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            status: OrderStatus::Failed,
            filled_quantity: None,
            avg_price: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balance {
    pub total_balance: f64,
}

/// Exchange-specific plumbing behind one common signature.
///
/// `Err` means the call itself failed (network, timeout); an exchange that
/// answered but refused the order returns `Ok` with `success = false`.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Lowercase exchange name, also the rate-limiter key
    fn exchange(&self) -> &str;

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacementResult>;

    async fn get_balance(&self) -> Result<Balance>;

    /// Latest traded price for `symbol`
    async fn ticker_price(&self, symbol: &str) -> Result<f64>;
}

/// Connectors registered by exchange name
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn ExchangeConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn ExchangeConnector>) {
        let name = connector.exchange().to_lowercase();
        tracing::debug!(exchange = %name, "Registered exchange connector");
        self.connectors.insert(name, connector);
    }

    pub fn get(&self, exchange: &str) -> Result<Arc<dyn ExchangeConnector>> {
        self.connectors
            .get(&exchange.to_lowercase())
            .cloned()
            .ok_or_else(|| EngineError::UnknownExchange(exchange.to_string()))
    }

    pub fn exchanges(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaperConfig;
    use crate::execution::PaperConnector;

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(PaperConnector::new("paper", PaperConfig::default(), 7)));

        assert!(registry.get("PAPER").is_ok());
        assert!(matches!(
            registry.get("kraken"),
            Err(EngineError::UnknownExchange(name)) if name == "kraken"
        ));
        assert_eq!(registry.exchanges(), vec!["paper".to_string()]);
    }
}
