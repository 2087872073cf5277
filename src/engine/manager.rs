use super::{EngineServices, TradeEngine};
use crate::config::{ConnectionConfig, EngineConfig};
use crate::models::EngineStatus;
use crate::{EngineError, Result};

/// Owns one engine per connection. A connection that fails to start is
/// recorded with `error` status and skipped; the others keep running.
pub struct EngineManager {
    config: EngineConfig,
    services: EngineServices,
    engines: Vec<TradeEngine>,
}

impl EngineManager {
    pub fn new(config: EngineConfig, services: EngineServices) -> Self {
        Self {
            config,
            services,
            engines: Vec::new(),
        }
    }

    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    /// Ids of the connections currently running
    pub fn running(&self) -> Vec<String> {
        self.engines
            .iter()
            .filter(|e| e.is_running())
            .map(|e| e.connection_id().to_string())
            .collect()
    }

    /// Start every connection; returns the failures, which never abort the
    /// remaining connections
    pub async fn start_all(&mut self, connections: &[ConnectionConfig]) -> Vec<EngineError> {
        let mut failures = Vec::new();
        for connection in connections {
            if let Err(e) = self.start_one(connection).await {
                tracing::error!(connection = %connection.id, error = %e, "Engine failed to start");
                if let Err(status_err) = self
                    .services
                    .store
                    .set_engine_status(&connection.id, EngineStatus::Error, Some(&e.to_string()))
                    .await
                {
                    tracing::warn!(connection = %connection.id, error = %status_err, "Could not record engine error");
                }
                failures.push(e);
            }
        }
        tracing::info!(
            started = self.engines.len(),
            failed = failures.len(),
            "Connections started"
        );
        failures
    }

    async fn start_one(&mut self, connection: &ConnectionConfig) -> Result<()> {
        if self.engines.iter().any(|e| e.connection_id() == connection.id) {
            return Err(EngineError::InvalidState(format!(
                "connection {} started twice",
                connection.id
            )));
        }
        let mut engine = TradeEngine::new(connection, &self.config, &self.services)?;
        engine.start().await?;
        self.engines.push(engine);
        Ok(())
    }

    pub async fn stop_all(&mut self) {
        for engine in &mut self.engines {
            if let Err(e) = engine.stop().await {
                tracing::warn!(connection = %engine.connection_id(), error = %e, "Engine stop failed");
            }
        }
        self.engines.clear();
    }
}
