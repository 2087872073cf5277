use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

use super::connector::{ExchangeConnector, OrderRequest, PlacementResult};
use super::rate_limiter::RateLimiter;
use crate::config::ExecutorConfig;
use crate::db::Store;
use crate::models::{OrderRecord, OrderStatus};
use crate::{EngineError, Result};

/// Holds a dedup key in the in-flight set until dropped
struct InFlightKey {
    keys: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlightKey {
    fn claim(keys: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
        let mut set = keys.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            keys: keys.clone(),
            key: key.to_string(),
        })
    }
}

impl Drop for InFlightKey {
    fn drop(&mut self) {
        let mut set = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.key);
    }
}

/// Idempotent, retried order placement for one exchange connection.
///
/// Every order is persisted as `pending` before the first attempt, so an
/// interrupted retry sequence still leaves an auditable row.
pub struct OrderExecutor {
    store: Arc<dyn Store>,
    connector: Arc<dyn ExchangeConnector>,
    limiter: Arc<RateLimiter>,
    config: ExecutorConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl OrderExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        connector: Arc<dyn ExchangeConnector>,
        limiter: Arc<RateLimiter>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            connector,
            limiter,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn exchange(&self) -> &str {
        self.connector.exchange()
    }

    pub fn connector(&self) -> &Arc<dyn ExchangeConnector> {
        &self.connector
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Dedup key for a submission.
    ///
    /// With `dedup_include_timestamp` the submission time is part of the key,
    /// so only a resubmission within the same millisecond is caught.
    pub fn dedup_key(&self, request: &OrderRequest) -> String {
        let base = format!(
            "{}-{}-{}-{:.8}",
            request.connection_id, request.symbol, request.side, request.quantity
        );
        if self.config.dedup_include_timestamp {
            format!("{}-{}", base, Utc::now().timestamp_millis())
        } else {
            base
        }
    }

    /// Place an order, retrying up to `max_retries` times with linear backoff.
    ///
    /// Returns the final order row on success; on exhaustion the row is marked
    /// `failed` and `ExchangeRejection` is returned. Only definite rejections
    /// are retried: a placement that outlives `order_timeout_ms` leaves the row
    /// `unknown` and returns `UnknownOrderOutcome` at once.
    pub async fn execute_order(&self, request: OrderRequest) -> Result<OrderRecord> {
        let dedup_key = self.dedup_key(&request);
        let _guard = InFlightKey::claim(&self.in_flight, &dedup_key)
            .ok_or_else(|| EngineError::DuplicateOrder(dedup_key.clone()))?;

        let now = Utc::now();
        let mut order = OrderRecord {
            id: Uuid::new_v4(),
            connection_id: request.connection_id.clone(),
            exchange: self.connector.exchange().to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            leverage: request.leverage,
            reduce_only: request.reduce_only,
            status: OrderStatus::Pending,
            retries: 0,
            exchange_order_id: None,
            filled_quantity: None,
            avg_price: None,
            error_message: None,
            dedup_key,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_order(&order).await?;

        let max_attempts = self.config.max_retries.max(1);
        let order_timeout = Duration::from_millis(self.config.order_timeout_ms);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            let outcome = self
                .limiter
                .execute(|| timeout(order_timeout, self.connector.place_order(&request)))
                .await;

            order.retries = attempt;
            match outcome {
                Ok(Ok(placed)) if placed.success => {
                    self.record_fill(&mut order, placed);
                    self.store.update_order(&order).await?;

                    tracing::info!(
                        order_id = %order.id,
                        exchange = %order.exchange,
                        symbol = %order.symbol,
                        side = %order.side,
                        quantity = order.quantity,
                        attempt,
                        "Order placed"
                    );
                    return Ok(order);
                }
                Ok(Ok(placed)) => {
                    last_error = placed
                        .error
                        .unwrap_or_else(|| "order rejected by exchange".to_string());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    // The exchange may already hold this order
                    let message = format!("placement timed out after {}ms", self.config.order_timeout_ms);
                    order.status = OrderStatus::Unknown;
                    order.error_message = Some(message.clone());
                    self.store.update_order(&order).await?;

                    tracing::error!(
                        order_id = %order.id,
                        exchange = %order.exchange,
                        symbol = %order.symbol,
                        attempt,
                        error = %message,
                        "Order outcome unknown, not retrying"
                    );
                    return Err(EngineError::UnknownOrderOutcome {
                        exchange: order.exchange.clone(),
                        order_id: order.id,
                        message,
                    });
                }
            }

            tracing::warn!(
                order_id = %order.id,
                symbol = %order.symbol,
                attempt,
                max_attempts,
                error = %last_error,
                "Order attempt failed"
            );

            if attempt < max_attempts {
                sleep(Duration::from_millis(self.config.retry_delay_ms * attempt as u64)).await;
            }
        }

        order.status = OrderStatus::Failed;
        order.error_message = Some(last_error.clone());
        self.store.update_order(&order).await?;

        tracing::error!(
            order_id = %order.id,
            exchange = %order.exchange,
            symbol = %order.symbol,
            attempts = max_attempts,
            error = %last_error,
            "Order failed after all retries"
        );

        Err(EngineError::ExchangeRejection {
            exchange: order.exchange.clone(),
            order_id: order.id,
            attempts: max_attempts,
            message: last_error,
        })
    }

    fn record_fill(&self, order: &mut OrderRecord, placed: PlacementResult) {
        order.status = placed.status;
        order.exchange_order_id = placed.order_id;
        order.filled_quantity = placed.filled_quantity;
        order.avg_price = placed.avg_price;
        order.error_message = None;
    }
}
