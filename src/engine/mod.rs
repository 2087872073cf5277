//! Connection engines.
//!
//! A `TradeEngine` runs the preset, main and real loops of one exchange
//! connection. Each loop is its own task; the three never wait on each other
//! and only meet in the store.

pub mod health;
pub mod loops;
pub mod manager;
pub mod scheduler;

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{ConnectionConfig, EngineConfig, LoopConfig};
use crate::db::Store;
use crate::execution::{ConnectorRegistry, RateLimiterRegistry};
use crate::models::{EngineStatus, LoopKind};
use crate::persistence::PriceHistory;
use crate::{EngineError, Result};

pub use loops::ConnectionContext;
pub use manager::EngineManager;
pub use scheduler::{CycleOutcome, InFlightSymbols};

/// Process-wide services shared by every connection
#[derive(Clone)]
pub struct EngineServices {
    pub store: Arc<dyn Store>,
    pub history: Arc<dyn PriceHistory>,
    pub connectors: Arc<ConnectorRegistry>,
    pub limiters: Arc<RateLimiterRegistry>,
}

pub struct TradeEngine {
    context: Arc<ConnectionContext>,
    loops: LoopConfig,
    shutdown: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl TradeEngine {
    pub fn new(connection: &ConnectionConfig, config: &EngineConfig, services: &EngineServices) -> Result<Self> {
        let context = ConnectionContext::build(connection, config, services).map_err(|e| EngineError::Startup {
            connection: connection.id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            context: Arc::new(context),
            loops: config.engine.clone(),
            shutdown: None,
            handles: Vec::new(),
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.context.connection_id
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Initialize engine state and spawn the three loops
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(EngineError::InvalidState(format!(
                "engine for {} already running",
                self.connection_id()
            )));
        }

        let store = self.context.store.clone();
        let connection_id = self.context.connection_id.clone();
        store
            .init_engine_state(&connection_id)
            .await
            .map_err(|e| EngineError::Startup {
                connection: connection_id.clone(),
                reason: e.to_string(),
            })?;
        store
            .set_engine_status(&connection_id, EngineStatus::Running, None)
            .await?;

        let (tx, rx) = watch::channel(false);
        for (kind, interval) in [
            (LoopKind::Preset, self.loops.preset_interval()),
            (LoopKind::Main, self.loops.main_interval()),
            (LoopKind::Real, self.loops.real_interval()),
        ] {
            let context = self.context.clone();
            let handle = tokio::spawn(scheduler::run_loop(
                kind,
                connection_id.clone(),
                interval,
                self.loops.health_window,
                store.clone(),
                rx.clone(),
                move || {
                    let context = context.clone();
                    async move { context.run_cycle(kind).await }
                },
            ));
            self.handles.push(handle);
        }
        self.shutdown = Some(tx);

        tracing::info!(
            connection = %connection_id,
            symbols = self.context.symbols.len(),
            "Engine started"
        );
        Ok(())
    }

    /// Signal every loop, wait for in-flight cycles and persist `stopped`
    pub async fn stop(&mut self) -> Result<()> {
        let Some(tx) = self.shutdown.take() else {
            return Ok(());
        };
        // Receivers may already be gone if a loop task panicked
        let _ = tx.send(true);

        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(connection = %self.context.connection_id, error = %e, "Loop task ended abnormally");
            }
        }

        self.context
            .store
            .set_engine_status(&self.context.connection_id, EngineStatus::Stopped, None)
            .await?;
        tracing::info!(connection = %self.context.connection_id, "Engine stopped");
        Ok(())
    }
}
