use crate::models::PriceTick;
use crate::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::time::{timeout, Duration};

/// Time-ordered price history per (connection, symbol).
///
/// The market-data sampler appends, the detectors and trial marking read.
#[async_trait]
pub trait PriceHistory: Send + Sync {
    async fn record(&self, connection_id: &str, symbol: &str, tick: PriceTick) -> Result<()>;

    /// The `limit` most recent ticks, oldest first
    async fn recent(&self, connection_id: &str, symbol: &str, limit: usize)
        -> Result<Vec<PriceTick>>;

    async fn latest(&self, connection_id: &str, symbol: &str) -> Result<Option<PriceTick>> {
        Ok(self.recent(connection_id, symbol, 1).await?.pop())
    }

    /// Drop ticks older than `cutoff`, returning how many were removed
    async fn prune_before(
        &self,
        connection_id: &str,
        symbol: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;
}

fn history_key(connection_id: &str, symbol: &str) -> String {
    format!("snapshots:{}:{}", connection_id, symbol)
}

/// Simple snapshot for Redis storage
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    price: f64,
    timestamp: DateTime<Utc>,
}

/// Redis persistence for price snapshots
///
/// Uses sorted sets with millisecond timestamps as scores for time-range
/// queries
pub struct RedisPersistence {
    conn: ConnectionManager,
}

impl RedisPersistence {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| EngineError::Timeout("Redis connection timeout after 5 seconds".into()))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    /// Get count of stored snapshots for a symbol
    pub async fn count_snapshots(&self, connection_id: &str, symbol: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let count: usize = conn.zcard(history_key(connection_id, symbol)).await?;
        Ok(count)
    }
}

#[async_trait]
impl PriceHistory for RedisPersistence {
    async fn record(&self, connection_id: &str, symbol: &str, tick: PriceTick) -> Result<()> {
        let key = history_key(connection_id, symbol);
        let snapshot = StoredSnapshot {
            price: tick.price,
            timestamp: tick.timestamp,
        };

        let value = serde_json::to_string(&snapshot)?;
        let score = tick.timestamp.timestamp_millis() as f64;

        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(&key, value, score).await?;
        Ok(())
    }

    async fn recent(
        &self,
        connection_id: &str,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<PriceTick>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let key = history_key(connection_id, symbol);
        let mut conn = self.conn.clone();

        // Newest first out of Redis
        let results: Vec<String> = conn.zrevrange(&key, 0, limit as isize - 1).await?;

        let mut ticks = Vec::with_capacity(results.len());
        for json_str in results.iter().rev() {
            let snapshot: StoredSnapshot = serde_json::from_str(json_str)?;
            ticks.push(PriceTick::new(snapshot.price, snapshot.timestamp));
        }

        Ok(ticks)
    }

    async fn prune_before(
        &self,
        connection_id: &str,
        symbol: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let key = history_key(connection_id, symbol);
        let max_score = cutoff.timestamp_millis() as f64;
        let mut conn = self.conn.clone();

        let removed: u64 = conn.zrembyscore(&key, "-inf", format!("({}", max_score)).await?;

        if removed > 0 {
            tracing::debug!("Cleaned up {} old snapshots for {}", removed, symbol);
        }

        Ok(removed)
    }
}

/// In-process history used for dry runs and tests, capped per symbol
pub struct MemoryPriceHistory {
    max_len: usize,
    series: Mutex<HashMap<String, VecDeque<PriceTick>>>,
}

impl MemoryPriceHistory {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Append many ticks at once, oldest first
    pub fn extend(&self, connection_id: &str, symbol: &str, ticks: &[PriceTick]) {
        let mut series = self.series.lock().unwrap_or_else(|p| p.into_inner());
        let entry = series.entry(history_key(connection_id, symbol)).or_default();
        for tick in ticks {
            entry.push_back(*tick);
            if entry.len() > self.max_len {
                entry.pop_front();
            }
        }
    }
}

#[async_trait]
impl PriceHistory for MemoryPriceHistory {
    async fn record(&self, connection_id: &str, symbol: &str, tick: PriceTick) -> Result<()> {
        self.extend(connection_id, symbol, &[tick]);
        Ok(())
    }

    async fn recent(
        &self,
        connection_id: &str,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<PriceTick>> {
        let series = self.series.lock().unwrap_or_else(|p| p.into_inner());
        Ok(series
            .get(&history_key(connection_id, symbol))
            .map(|ticks| {
                let skip = ticks.len().saturating_sub(limit);
                ticks.iter().skip(skip).copied().collect()
            })
            .unwrap_or_default())
    }

    async fn prune_before(
        &self,
        connection_id: &str,
        symbol: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut series = self.series.lock().unwrap_or_else(|p| p.into_inner());
        let Some(ticks) = series.get_mut(&history_key(connection_id, symbol)) else {
            return Ok(0);
        };
        let before = ticks.len();
        ticks.retain(|t| t.timestamp >= cutoff);
        Ok((before - ticks.len()) as u64)
    }
}
