use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::connector::{Balance, ExchangeConnector, OrderRequest, PlacementResult};
use crate::config::PaperConfig;
use crate::models::{OrderSide, OrderType};
use crate::Result;

struct PaperState {
    rng: StdRng,
    prices: HashMap<String, f64>,
    balance: f64,
    next_order: u64,
}

/// Simulated exchange: every symbol follows its own bounded random walk and
/// market orders fill immediately with a fixed slippage.
pub struct PaperConnector {
    exchange: String,
    config: PaperConfig,
    state: Mutex<PaperState>,
}

impl PaperConnector {
    /// Create a connector with a seed for reproducible prices
    pub fn new(exchange: &str, config: PaperConfig, seed: u64) -> Self {
        Self {
            exchange: exchange.to_lowercase(),
            state: Mutex::new(PaperState {
                rng: StdRng::seed_from_u64(seed),
                prices: HashMap::new(),
                balance: config.initial_balance,
                next_order: 1,
            }),
            config,
        }
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Pin the current price of a symbol
    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state().prices.insert(symbol.to_string(), price);
    }

    pub fn current_price(&self, symbol: &str) -> Option<f64> {
        self.state().prices.get(symbol).copied()
    }

    /// Apply one random-walk step to `symbol` and return the new price
    fn step(&self, symbol: &str) -> f64 {
        let amplitude = self.config.volatility_bps / 10_000.0;
        let start = self.config.start_price;
        let mut state = self.state();
        let change = if amplitude > 0.0 {
            state.rng.gen_range(-amplitude..=amplitude)
        } else {
            0.0
        };
        let price = state.prices.entry(symbol.to_string()).or_insert(start);
        // Keep the walk strictly positive
        *price = (*price * (1.0 + change)).max(start * 0.01);
        *price
    }
}

#[async_trait]
impl ExchangeConnector for PaperConnector {
    fn exchange(&self) -> &str {
        &self.exchange
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacementResult> {
        if request.quantity <= 0.0 {
            return Ok(PlacementResult::rejected("quantity must be positive"));
        }

        let mut state = self.state();
        let reference = state
            .prices
            .get(&request.symbol)
            .copied()
            .unwrap_or(self.config.start_price);

        let slippage = self.config.slippage_bps / 10_000.0;
        let fill_price = match (request.order_type, request.price) {
            (OrderType::Limit, Some(limit)) => limit,
            _ => match request.side {
                OrderSide::Buy => reference * (1.0 + slippage),
                OrderSide::Sell => reference * (1.0 - slippage),
            },
        };

        let order_id = format!("paper-{}", state.next_order);
        state.next_order += 1;

        tracing::debug!(
            exchange = %self.exchange,
            symbol = %request.symbol,
            side = %request.side,
            quantity = request.quantity,
            price = fill_price,
            "Paper order filled"
        );

        Ok(PlacementResult::filled(order_id, request.quantity, fill_price))
    }

    async fn get_balance(&self) -> Result<Balance> {
        Ok(Balance {
            total_balance: self.state().balance,
        })
    }

    async fn ticker_price(&self, symbol: &str) -> Result<f64> {
        Ok(self.step(symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;

    fn request(side: OrderSide, quantity: f64) -> OrderRequest {
        OrderRequest {
            connection_id: "paper-1".into(),
            symbol: "BTCUSDT".into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            leverage: 10,
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn test_random_walk_is_seeded() {
        let a = PaperConnector::new("paper", PaperConfig::default(), 42);
        let b = PaperConnector::new("paper", PaperConfig::default(), 42);

        for _ in 0..20 {
            let pa = a.ticker_price("BTCUSDT").await.unwrap();
            let pb = b.ticker_price("BTCUSDT").await.unwrap();
            assert_eq!(pa, pb);
            assert!(pa > 0.0);
        }
    }

    #[tokio::test]
    async fn test_market_fill_includes_slippage() {
        let paper = PaperConnector::new("paper", PaperConfig::default(), 1);
        paper.set_price("BTCUSDT", 100.0);

        let buy = paper.place_order(&request(OrderSide::Buy, 1.0)).await.unwrap();
        assert!(buy.success);
        assert_eq!(buy.status, OrderStatus::Filled);
        assert!((buy.avg_price.unwrap() - 100.02).abs() < 1e-9);

        let sell = paper.place_order(&request(OrderSide::Sell, 1.0)).await.unwrap();
        assert!((sell.avg_price.unwrap() - 99.98).abs() < 1e-9);
        assert_ne!(buy.order_id, sell.order_id);
    }

    #[tokio::test]
    async fn test_rejects_empty_orders() {
        let paper = PaperConnector::new("paper", PaperConfig::default(), 1);
        let result = paper.place_order(&request(OrderSide::Buy, 0.0)).await.unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(paper.get_balance().await.unwrap().total_balance, 10_000.0);
    }
}
