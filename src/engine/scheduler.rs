//! Non-overlapping interval loops with batched per-symbol fan-out.

use futures::future::join_all;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::health::LoopMetrics;
use crate::db::Store;
use crate::models::LoopKind;
use crate::Result;

/// Result of one cycle's symbol fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub symbols: usize,
    pub succeeded: usize,
    /// Symbols skipped because a previous invocation still held them
    pub skipped: usize,
}

/// Symbols currently being processed by one loop
#[derive(Clone, Default)]
pub struct InFlightSymbols {
    inner: Arc<Mutex<HashSet<String>>>,
}

/// Releases its symbol when dropped
pub struct SymbolGuard {
    inner: Arc<Mutex<HashSet<String>>>,
    symbol: String,
}

impl InFlightSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `symbol`; `None` while another invocation holds it
    pub fn try_claim(&self, symbol: &str) -> Option<SymbolGuard> {
        let mut set = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(symbol.to_string()) {
            return None;
        }
        Some(SymbolGuard {
            inner: self.inner.clone(),
            symbol: symbol.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SymbolGuard {
    fn drop(&mut self) {
        let mut set = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.symbol);
    }
}

/// Process `symbols` in batches of `max_concurrency`, each batch settling
/// completely before the next starts. A failing symbol is logged and
/// counted; it never stops its siblings.
pub async fn process_symbols<F, Fut>(
    kind: LoopKind,
    connection_id: &str,
    symbols: &[String],
    max_concurrency: usize,
    in_flight: &InFlightSymbols,
    task: F,
) -> CycleOutcome
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut outcome = CycleOutcome {
        symbols: symbols.len(),
        ..CycleOutcome::default()
    };

    for batch in symbols.chunks(max_concurrency.max(1)) {
        let runs = batch.iter().map(|symbol| {
            let guard = in_flight.try_claim(symbol);
            let fut = guard.as_ref().map(|_| task(symbol.clone()));
            async move {
                match fut {
                    Some(fut) => {
                        let result = fut.await;
                        drop(guard);
                        Some(result)
                    }
                    None => None,
                }
            }
        });

        for (symbol, result) in batch.iter().zip(join_all(runs).await) {
            match result {
                Some(Ok(())) => outcome.succeeded += 1,
                Some(Err(e)) => {
                    tracing::warn!(
                        loop_kind = %kind,
                        connection = %connection_id,
                        symbol = %symbol,
                        error = %e,
                        transient = e.is_transient(),
                        "Symbol processing failed"
                    );
                }
                None => {
                    outcome.skipped += 1;
                    tracing::debug!(loop_kind = %kind, symbol = %symbol, "Symbol still in flight, skipped");
                }
            }
        }
    }

    outcome
}

/// Run `cycle` until shutdown, sleeping `interval` after each completed
/// cycle. Cycle N+1 starts only after cycle N has fully resolved. Stats are
/// persisted after every cycle.
pub async fn run_loop<F, Fut>(
    kind: LoopKind,
    connection_id: String,
    interval: Duration,
    health_window: usize,
    store: Arc<dyn Store>,
    mut shutdown: watch::Receiver<bool>,
    mut cycle: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = CycleOutcome>,
{
    let mut metrics = LoopMetrics::new(interval, health_window);
    tracing::info!(loop_kind = %kind, connection = %connection_id, interval_ms = interval.as_millis() as u64, "Loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let started = Instant::now();
        let outcome = cycle().await;
        let stats = metrics.record(started.elapsed(), outcome.symbols, outcome.succeeded);

        if let Err(e) = store.save_loop_stats(&connection_id, kind, &stats).await {
            tracing::warn!(loop_kind = %kind, connection = %connection_id, error = %e, "Failed to persist loop stats");
        }
        tracing::debug!(
            loop_kind = %kind,
            connection = %connection_id,
            cycle = stats.cycle_count,
            duration_ms = stats.last_cycle_ms,
            health = %stats.health,
            "Cycle finished"
        );

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!(loop_kind = %kind, connection = %connection_id, cycles = metrics.snapshot().cycle_count, "Loop stopped");
}
