//! Storage bounds.
//!
//! Each sweep reorganizes every (table, connection) whose row count is past
//! its storage limit back down to the target, archiving the full row before
//! deleting it. When the database nears its size cap an aggressive pass
//! also drops old archives, stale price history and old cleanup-log rows.
//! Every operation leaves a cleanup-ledger entry.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::RetentionConfig;
use crate::db::Store;
use crate::models::{CleanupEntry, CleanupOperation, RetentionTable};
use crate::persistence::PriceHistory;
use crate::Result;

/// One reorganization performed by a sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reorganization {
    pub table: RetentionTable,
    pub connection_id: String,
    pub row_count: u64,
    pub archived: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggressivePurge {
    pub archives: u64,
    pub snapshots: u64,
    pub log_entries: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reorganized: Vec<Reorganization>,
    pub failures: usize,
    pub aggressive: Option<AggressivePurge>,
}

pub struct RetentionManager {
    store: Arc<dyn Store>,
    history: Arc<dyn PriceHistory>,
    config: RetentionConfig,
    /// (connection, symbol) pairs whose price history is pruned
    markets: Vec<(String, String)>,
}

impl RetentionManager {
    pub fn new(
        store: Arc<dyn Store>,
        history: Arc<dyn PriceHistory>,
        config: RetentionConfig,
        markets: Vec<(String, String)>,
    ) -> Self {
        Self {
            store,
            history,
            config,
            markets,
        }
    }

    /// Run one full retention pass
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for table in RetentionTable::all() {
            let ledger = self.config.ledger(table);
            for (connection_id, row_count) in self.store.row_counts(table).await? {
                if !ledger.exceeds(row_count) {
                    continue;
                }

                let mut entry = CleanupEntry::new(CleanupOperation::Reorganize);
                entry.table = Some(table);
                entry.connection_id = Some(connection_id.clone());

                match self
                    .store
                    .reorganize(table, &connection_id, ledger.target_count)
                    .await
                {
                    Ok(archived) => {
                        entry.rows_affected = archived;
                        tracing::info!(
                            table = %table,
                            connection = %connection_id,
                            row_count,
                            limit = ledger.storage_limit(),
                            archived,
                            "Reorganized table"
                        );
                        report.reorganized.push(Reorganization {
                            table,
                            connection_id: connection_id.clone(),
                            row_count,
                            archived,
                        });
                    }
                    Err(e) => {
                        entry.success = false;
                        entry.error = Some(e.to_string());
                        report.failures += 1;
                        tracing::error!(
                            table = %table,
                            connection = %connection_id,
                            error = %e,
                            "Reorganization failed"
                        );
                    }
                }
                self.store.record_cleanup(&entry).await?;
            }
        }

        let size = self.store.database_size_bytes().await?;
        let threshold = self.config.max_database_bytes as f64 * self.config.aggressive_ratio;
        if size as f64 > threshold {
            tracing::warn!(
                size_bytes = size,
                cap_bytes = self.config.max_database_bytes,
                "Database near its size cap, running aggressive cleanup"
            );
            report.aggressive = Some(self.aggressive_pass(now).await?);
        }

        Ok(report)
    }

    async fn aggressive_pass(&self, now: DateTime<Utc>) -> Result<AggressivePurge> {
        let mut purge = AggressivePurge::default();
        let mut entry = CleanupEntry::new(CleanupOperation::AggressivePurge);

        let outcome: Result<()> = async {
            purge.archives = self
                .store
                .purge_archives_before(now - Duration::days(self.config.archive_max_age_days))
                .await?;

            let snapshot_cutoff = now - Duration::days(self.config.market_data_max_age_days);
            for (connection_id, symbol) in &self.markets {
                purge.snapshots += self
                    .history
                    .prune_before(connection_id, symbol, snapshot_cutoff)
                    .await?;
            }

            purge.log_entries = self
                .store
                .purge_cleanup_log_before(now - Duration::days(self.config.log_max_age_days))
                .await?;
            Ok(())
        }
        .await;

        entry.rows_affected = purge.archives + purge.snapshots + purge.log_entries;
        if let Err(e) = &outcome {
            entry.success = false;
            entry.error = Some(e.to_string());
        }
        self.store.record_cleanup(&entry).await?;
        outcome?;

        tracing::info!(
            archives = purge.archives,
            snapshots = purge.snapshots,
            log_entries = purge.log_entries,
            "Aggressive cleanup finished"
        );
        Ok(purge)
    }

    /// Sweep every `interval_secs` until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval();
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sweep(Utc::now()).await {
                tracing::warn!(error = %e, "Retention sweep failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Retention manager stopped");
    }
}
