use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Duration, Instant};

use crate::models::PriceTick;
use crate::persistence::PriceHistory;
use crate::Result;

struct CachedSeries {
    loaded_at: Instant,
    ticks: Arc<Vec<PriceTick>>,
}

/// TTL-bounded read cache of recent price series per (connection, symbol).
///
/// Every indication parameter of a symbol reads the same series within one
/// tick, so the history store is hit at most once per TTL.
pub struct PriceCache {
    history: Arc<dyn PriceHistory>,
    ttl: Duration,
    series_length: usize,
    entries: Mutex<HashMap<(String, String), CachedSeries>>,
}

impl PriceCache {
    pub fn new(history: Arc<dyn PriceHistory>, ttl: Duration, series_length: usize) -> Self {
        Self {
            history,
            ttl,
            series_length,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<(String, String), CachedSeries>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn history(&self) -> &Arc<dyn PriceHistory> {
        &self.history
    }

    /// Recent ticks, oldest first
    pub async fn series(&self, connection_id: &str, symbol: &str) -> Result<Arc<Vec<PriceTick>>> {
        let key = (connection_id.to_string(), symbol.to_string());
        if let Some(cached) = self.entries().get(&key) {
            if cached.loaded_at.elapsed() < self.ttl {
                return Ok(cached.ticks.clone());
            }
        }

        let ticks = Arc::new(
            self.history
                .recent(connection_id, symbol, self.series_length)
                .await?,
        );
        self.entries().insert(
            key,
            CachedSeries {
                loaded_at: Instant::now(),
                ticks: ticks.clone(),
            },
        );
        Ok(ticks)
    }

    /// Latest price, served from the cached series when it is fresh
    pub async fn latest_price(&self, connection_id: &str, symbol: &str) -> Result<Option<f64>> {
        Ok(self
            .series(connection_id, symbol)
            .await?
            .last()
            .map(|tick| tick.price))
    }

    pub fn invalidate(&self, connection_id: &str, symbol: &str) {
        self.entries()
            .remove(&(connection_id.to_string(), symbol.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPriceHistory;
    use chrono::Utc;

    #[tokio::test]
    async fn test_cache_serves_stale_until_invalidated() {
        let history = Arc::new(MemoryPriceHistory::new(100));
        let cache = PriceCache::new(history.clone(), Duration::from_secs(60), 50);

        history.record("c", "BTCUSDT", PriceTick::new(100.0, Utc::now())).await.unwrap();
        assert_eq!(cache.latest_price("c", "BTCUSDT").await.unwrap(), Some(100.0));

        history.record("c", "BTCUSDT", PriceTick::new(101.0, Utc::now())).await.unwrap();
        // Still within TTL
        assert_eq!(cache.latest_price("c", "BTCUSDT").await.unwrap(), Some(100.0));

        cache.invalidate("c", "BTCUSDT");
        assert_eq!(cache.latest_price("c", "BTCUSDT").await.unwrap(), Some(101.0));
        assert_eq!(cache.series("c", "BTCUSDT").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cache_expires_after_ttl() {
        let history = Arc::new(MemoryPriceHistory::new(100));
        let cache = PriceCache::new(history.clone(), Duration::from_millis(20), 50);

        history.record("c", "ETHUSDT", PriceTick::new(10.0, Utc::now())).await.unwrap();
        cache.series("c", "ETHUSDT").await.unwrap();
        history.record("c", "ETHUSDT", PriceTick::new(11.0, Utc::now())).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.latest_price("c", "ETHUSDT").await.unwrap(), Some(11.0));
    }
}
