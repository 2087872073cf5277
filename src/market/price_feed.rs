use chrono::Utc;
use std::sync::Arc;

use super::PriceCache;
use crate::execution::{ExchangeConnector, RateLimiter};
use crate::models::PriceTick;
use crate::{EngineError, Result};

/// Pulls ticker prices for one connection into the price history.
///
/// Ticker requests share the exchange's rate limiter with order placement.
pub struct MarketSampler {
    connection_id: String,
    connector: Arc<dyn ExchangeConnector>,
    limiter: Arc<RateLimiter>,
    cache: Arc<PriceCache>,
}

impl MarketSampler {
    pub fn new(
        connection_id: &str,
        connector: Arc<dyn ExchangeConnector>,
        limiter: Arc<RateLimiter>,
        cache: Arc<PriceCache>,
    ) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            connector,
            limiter,
            cache,
        }
    }

    /// Fetch the current price, append it to the history and drop the cached
    /// series so the next read sees it
    pub async fn sample(&self, symbol: &str) -> Result<PriceTick> {
        let price = self
            .limiter
            .execute(|| self.connector.ticker_price(symbol))
            .await?;

        if !price.is_finite() || price <= 0.0 {
            return Err(EngineError::Connector(format!(
                "{} returned invalid price {} for {}",
                self.connector.exchange(),
                price,
                symbol
            )));
        }

        let tick = PriceTick::new(price, Utc::now());
        self.cache
            .history()
            .record(&self.connection_id, symbol, tick)
            .await?;
        self.cache.invalidate(&self.connection_id, symbol);

        tracing::debug!(
            connection = %self.connection_id,
            symbol = %symbol,
            price = %price,
            "Fetched price snapshot"
        );

        Ok(tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PaperConfig, RateLimitConfig};
    use crate::execution::PaperConnector;
    use crate::persistence::MemoryPriceHistory;
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_sample_appends_and_invalidates() {
        let paper = Arc::new(PaperConnector::new("paper", PaperConfig::default(), 3));
        paper.set_price("BTCUSDT", 250.0);
        let history = Arc::new(MemoryPriceHistory::new(100));
        let cache = Arc::new(PriceCache::new(history, Duration::from_secs(60), 100));
        let limiter = Arc::new(RateLimiter::new("paper", RateLimitConfig::default()));
        let sampler = MarketSampler::new("c", paper, limiter, cache.clone());

        assert!(cache.series("c", "BTCUSDT").await.unwrap().is_empty());

        let first = sampler.sample("BTCUSDT").await.unwrap();
        let second = sampler.sample("BTCUSDT").await.unwrap();

        let series = cache.series("c", "BTCUSDT").await.unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].price, first.price);
        assert_eq!(series[1].price, second.price);
    }
}
