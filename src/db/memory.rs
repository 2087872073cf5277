use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{Store, TrialInsert};
use crate::models::{
    ArchivedRow, BasePositionAggregate, CleanupEntry, ConfigKey, EngineStatus, ExchangePosition,
    ExchangePositionStatus, LoopKind, LoopStats, OrderRecord, Phase, PseudoPositionTrial,
    RealPseudoPosition, RealStatus, RetentionTable, TrialLevel, TrialStatus,
};
use crate::{EngineError, Result};

/// Rough per-row footprint used to report a database size
const ESTIMATED_ROW_BYTES: u64 = 1024;

#[derive(Debug, Clone)]
pub struct EngineStateRow {
    pub status: EngineStatus,
    pub error: Option<String>,
    pub loops: HashMap<LoopKind, LoopStats>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    aggregates: Vec<BasePositionAggregate>,
    trials: Vec<PseudoPositionTrial>,
    reals: Vec<RealPseudoPosition>,
    exchange_positions: Vec<ExchangePosition>,
    indication_states: HashMap<String, DateTime<Utc>>,
    orders: Vec<OrderRecord>,
    engine_state: HashMap<String, EngineStateRow>,
    archive: Vec<ArchivedRow>,
    cleanup_log: Vec<CleanupEntry>,
    reported_size: Option<u64>,
    refuse_exchange_positions: bool,
}

impl Tables {
    fn row_count(&self) -> u64 {
        (self.aggregates.len()
            + self.trials.len()
            + self.reals.len()
            + self.exchange_positions.len()
            + self.orders.len()
            + self.archive.len()
            + self.cleanup_log.len()) as u64
    }
}

/// In-process store used for dry runs and tests.
///
/// Every operation runs under one lock, which makes each conditional write
/// atomic the same way the Postgres transactions are.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ==================== INSPECTION ====================

    pub fn aggregates(&self) -> Vec<BasePositionAggregate> {
        self.tables().aggregates.clone()
    }

    pub fn trials(&self) -> Vec<PseudoPositionTrial> {
        self.tables().trials.clone()
    }

    pub fn real_positions(&self) -> Vec<RealPseudoPosition> {
        self.tables().reals.clone()
    }

    pub fn exchange_positions(&self) -> Vec<ExchangePosition> {
        self.tables().exchange_positions.clone()
    }

    pub fn orders(&self) -> Vec<OrderRecord> {
        self.tables().orders.clone()
    }

    pub fn archived(&self, table: RetentionTable) -> Vec<ArchivedRow> {
        self.tables()
            .archive
            .iter()
            .filter(|row| row.source_table == table)
            .cloned()
            .collect()
    }

    pub fn cleanup_entries(&self) -> Vec<CleanupEntry> {
        self.tables().cleanup_log.clone()
    }

    pub fn engine_state(&self, connection_id: &str) -> Option<EngineStateRow> {
        self.tables().engine_state.get(connection_id).cloned()
    }

    /// Override the size reported by `database_size_bytes`
    pub fn set_reported_size(&self, bytes: Option<u64>) {
        self.tables().reported_size = bytes;
    }

    /// Make `insert_exchange_position` fail until switched back
    pub fn refuse_exchange_positions(&self, refuse: bool) {
        self.tables().refuse_exchange_positions = refuse;
    }

    /// Insert rows directly, bypassing every gate
    pub fn seed_aggregate(&self, aggregate: BasePositionAggregate) {
        self.tables().aggregates.push(aggregate);
    }

    pub fn seed_trial(&self, trial: PseudoPositionTrial) {
        self.tables().trials.push(trial);
    }

    pub fn seed_archive(&self, row: ArchivedRow) {
        self.tables().archive.push(row);
    }

    pub fn seed_cleanup(&self, entry: CleanupEntry) {
        self.tables().cleanup_log.push(entry);
    }
}

fn find_trial_mut<'a>(
    trials: &'a mut [PseudoPositionTrial],
    id: Uuid,
) -> Result<&'a mut PseudoPositionTrial> {
    trials
        .iter_mut()
        .find(|t| t.id == id)
        .ok_or_else(|| EngineError::NotFound(format!("trial {}", id)))
}

/// Rows to archive so that at most `target` remain.
///
/// Protected rows always stay and count against the target; the remaining
/// room goes to the newest unprotected rows. When protected rows alone
/// exceed the target every unprotected row goes and the surplus stays.
fn retention_victims<T>(
    rows: Vec<T>,
    target: usize,
    protected: impl Fn(&T) -> bool,
    created: impl Fn(&T) -> DateTime<Utc>,
) -> Vec<T> {
    let protected_count = rows.iter().filter(|row| protected(row)).count();
    let room = target.saturating_sub(protected_count);
    let mut candidates: Vec<T> = rows.into_iter().filter(|row| !protected(row)).collect();
    candidates.sort_by(|a, b| created(b).cmp(&created(a)));
    candidates.into_iter().skip(room).collect()
}

fn snapshot<T: serde::Serialize>(
    table: RetentionTable,
    connection_id: &str,
    row_id: Uuid,
    row: &T,
) -> Result<ArchivedRow> {
    Ok(ArchivedRow {
        source_table: table,
        connection_id: connection_id.to_string(),
        row_id,
        snapshot: serde_json::to_value(row)?,
        archived_at: Utc::now(),
    })
}

fn trial_in_table(trial: &PseudoPositionTrial, table: RetentionTable) -> bool {
    match table {
        RetentionTable::Main => trial.level != TrialLevel::Preset,
        RetentionTable::Preset => trial.level == TrialLevel::Preset,
        _ => false,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_or_create_aggregate(
        &self,
        key: &ConfigKey,
        capacity: u32,
    ) -> Result<BasePositionAggregate> {
        let fingerprint = key.fingerprint();
        let mut tables = self.tables();

        if let Some(existing) = tables
            .aggregates
            .iter()
            .find(|a| a.key.fingerprint() == fingerprint)
        {
            return Ok(existing.clone());
        }

        let aggregate = BasePositionAggregate::new(key.clone(), capacity);
        tables.aggregates.push(aggregate.clone());
        Ok(aggregate)
    }

    async fn get_aggregate(&self, id: Uuid) -> Result<Option<BasePositionAggregate>> {
        Ok(self.tables().aggregates.iter().find(|a| a.id == id).cloned())
    }

    async fn update_aggregate(&self, aggregate: &BasePositionAggregate) -> Result<()> {
        let mut tables = self.tables();
        let row = tables
            .aggregates
            .iter_mut()
            .find(|a| a.id == aggregate.id)
            .ok_or_else(|| EngineError::NotFound(format!("aggregate {}", aggregate.id)))?;
        // last_trial_at is owned by insert_trial
        let last_trial_at = row.last_trial_at;
        *row = aggregate.clone();
        row.last_trial_at = last_trial_at;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_trial(
        &self,
        trial: &PseudoPositionTrial,
        slot_limit: u32,
        capacity: Option<u32>,
    ) -> Result<TrialInsert> {
        let slot_key = trial.key.slot_key();
        let mut tables = self.tables();

        let active_in_slot = tables
            .trials
            .iter()
            .filter(|t| t.status.is_active() && t.level == trial.level && t.key.slot_key() == slot_key)
            .count() as u32;
        if active_in_slot >= slot_limit {
            return Ok(TrialInsert::SlotFull);
        }

        if let (Some(capacity), Some(aggregate_id)) = (capacity, trial.aggregate_id) {
            let owned = tables
                .trials
                .iter()
                .filter(|t| t.aggregate_id == Some(aggregate_id))
                .count() as u32;
            if owned >= capacity {
                return Ok(TrialInsert::CapacityReached);
            }
        }

        tables.trials.push(trial.clone());
        if let Some(aggregate_id) = trial.aggregate_id {
            if let Some(aggregate) = tables.aggregates.iter_mut().find(|a| a.id == aggregate_id) {
                aggregate.last_trial_at = Some(trial.created_at);
            }
        }
        Ok(TrialInsert::Inserted)
    }

    async fn insert_main_trial(&self, trial: &PseudoPositionTrial) -> Result<bool> {
        let mut tables = self.tables();
        let exists = tables.trials.iter().any(|t| {
            t.aggregate_id == trial.aggregate_id && t.status == TrialStatus::MainActive
        });
        if exists {
            return Ok(false);
        }
        tables.trials.push(trial.clone());
        Ok(true)
    }

    async fn count_active_in_slot(&self, slot_key: &str, level: TrialLevel) -> Result<u64> {
        Ok(self
            .tables()
            .trials
            .iter()
            .filter(|t| t.status.is_active() && t.level == level && t.key.slot_key() == slot_key)
            .count() as u64)
    }

    async fn open_trials(
        &self,
        connection_id: &str,
        symbol: &str,
        levels: &[TrialLevel],
    ) -> Result<Vec<PseudoPositionTrial>> {
        Ok(self
            .tables()
            .trials
            .iter()
            .filter(|t| {
                t.status.is_active()
                    && t.key.connection_id == connection_id
                    && t.key.symbol == symbol
                    && levels.contains(&t.level)
            })
            .cloned()
            .collect())
    }

    async fn update_trial_marks(&self, trial: &PseudoPositionTrial) -> Result<()> {
        let mut tables = self.tables();
        let row = find_trial_mut(&mut tables.trials, trial.id)?;
        row.current_price = trial.current_price;
        row.best_price = trial.best_price;
        row.trailing_active = trial.trailing_active;
        row.max_adverse_pct = trial.max_adverse_pct;
        Ok(())
    }

    async fn close_trial(&self, trial: &PseudoPositionTrial) -> Result<bool> {
        let mut tables = self.tables();
        let row = find_trial_mut(&mut tables.trials, trial.id)?;
        if !row.status.is_active() {
            return Ok(false);
        }
        *row = trial.clone();
        row.status = TrialStatus::Closed;
        Ok(true)
    }

    async fn closed_trials(
        &self,
        aggregate_id: Uuid,
        levels: &[TrialLevel],
        limit: usize,
    ) -> Result<Vec<PseudoPositionTrial>> {
        let tables = self.tables();
        let mut closed: Vec<PseudoPositionTrial> = tables
            .trials
            .iter()
            .filter(|t| {
                t.aggregate_id == Some(aggregate_id)
                    && t.status == TrialStatus::Closed
                    && levels.contains(&t.level)
            })
            .cloned()
            .collect();
        closed.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
        closed.truncate(limit);
        Ok(closed)
    }

    async fn count_closed_trials(&self, aggregate_id: Uuid, level: TrialLevel) -> Result<u64> {
        Ok(self
            .tables()
            .trials
            .iter()
            .filter(|t| {
                t.aggregate_id == Some(aggregate_id)
                    && t.level == level
                    && t.status == TrialStatus::Closed
            })
            .count() as u64)
    }

    async fn insert_real_position(&self, real: &RealPseudoPosition) -> Result<bool> {
        let mut tables = self.tables();
        if tables.reals.iter().any(|r| r.main_trial_id == real.main_trial_id) {
            return Ok(false);
        }
        tables.reals.push(real.clone());
        Ok(true)
    }

    async fn validated_real_positions(
        &self,
        connection_id: &str,
        limit: usize,
    ) -> Result<Vec<RealPseudoPosition>> {
        let tables = self.tables();
        let mut reals: Vec<RealPseudoPosition> = tables
            .reals
            .iter()
            .filter(|r| r.connection_id == connection_id && r.status == RealStatus::Validated)
            .cloned()
            .collect();
        reals.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        reals.truncate(limit);
        Ok(reals)
    }

    async fn defer_real_position(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables();
        if let Some(real) = tables
            .reals
            .iter_mut()
            .find(|r| r.id == id && r.status == RealStatus::Validated)
        {
            real.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn claim_real_position(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.tables();
        match tables
            .reals
            .iter_mut()
            .find(|r| r.id == id && r.status == RealStatus::Validated)
        {
            Some(real) => {
                real.status = RealStatus::Mirroring;
                real.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn finish_real_mirroring(&self, id: Uuid, status: RealStatus, attempts: u32) -> Result<()> {
        let mut tables = self.tables();
        let real = tables
            .reals
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("real position {}", id)))?;
        real.status = status;
        real.mirror_attempts = attempts;
        real.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_exchange_position(&self, position: &ExchangePosition) -> Result<()> {
        let mut tables = self.tables();
        if tables.refuse_exchange_positions {
            return Err(EngineError::InvalidState(format!(
                "exchange position {} refused",
                position.id
            )));
        }
        tables.exchange_positions.push(position.clone());
        Ok(())
    }

    async fn open_exchange_positions(
        &self,
        connection_id: &str,
        symbol: &str,
    ) -> Result<Vec<ExchangePosition>> {
        Ok(self
            .tables()
            .exchange_positions
            .iter()
            .filter(|p| {
                p.connection_id == connection_id
                    && p.symbol == symbol
                    && p.status == ExchangePositionStatus::Open
            })
            .cloned()
            .collect())
    }

    async fn update_exchange_position(&self, position: &ExchangePosition) -> Result<()> {
        let mut tables = self.tables();
        let row = tables
            .exchange_positions
            .iter_mut()
            .find(|p| p.id == position.id)
            .ok_or_else(|| EngineError::NotFound(format!("exchange position {}", position.id)))?;
        *row = position.clone();
        Ok(())
    }

    async fn indication_validated_at(&self, state_key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.tables().indication_states.get(state_key).copied())
    }

    async fn stamp_indication(&self, state_key: &str, at: DateTime<Utc>) -> Result<()> {
        self.tables()
            .indication_states
            .insert(state_key.to_string(), at);
        Ok(())
    }

    async fn insert_order(&self, order: &OrderRecord) -> Result<()> {
        self.tables().orders.push(order.clone());
        Ok(())
    }

    async fn update_order(&self, order: &OrderRecord) -> Result<()> {
        let mut tables = self.tables();
        let row = tables
            .orders
            .iter_mut()
            .find(|o| o.id == order.id)
            .ok_or_else(|| EngineError::NotFound(format!("order {}", order.id)))?;
        *row = order.clone();
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn init_engine_state(&self, connection_id: &str) -> Result<()> {
        self.tables().engine_state.insert(
            connection_id.to_string(),
            EngineStateRow {
                status: EngineStatus::Stopped,
                error: None,
                loops: HashMap::new(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn set_engine_status(
        &self,
        connection_id: &str,
        status: EngineStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut tables = self.tables();
        let row = tables
            .engine_state
            .entry(connection_id.to_string())
            .or_insert_with(|| EngineStateRow {
                status,
                error: None,
                loops: HashMap::new(),
                updated_at: Utc::now(),
            });
        row.status = status;
        row.error = error.map(str::to_string);
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn save_loop_stats(
        &self,
        connection_id: &str,
        kind: LoopKind,
        stats: &LoopStats,
    ) -> Result<()> {
        let mut tables = self.tables();
        let row = tables
            .engine_state
            .get_mut(connection_id)
            .ok_or_else(|| EngineError::NotFound(format!("engine state {}", connection_id)))?;
        row.loops.insert(kind, stats.clone());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn row_counts(&self, table: RetentionTable) -> Result<Vec<(String, u64)>> {
        let tables = self.tables();
        let mut counts: HashMap<String, u64> = HashMap::new();
        match table {
            RetentionTable::Base => {
                for aggregate in &tables.aggregates {
                    *counts.entry(aggregate.key.connection_id.clone()).or_default() += 1;
                }
            }
            RetentionTable::Main | RetentionTable::Preset => {
                for trial in tables.trials.iter().filter(|t| trial_in_table(t, table)) {
                    *counts.entry(trial.key.connection_id.clone()).or_default() += 1;
                }
            }
            RetentionTable::Real => {
                for real in &tables.reals {
                    *counts.entry(real.connection_id.clone()).or_default() += 1;
                }
            }
        }
        let mut counts: Vec<(String, u64)> = counts.into_iter().collect();
        counts.sort();
        Ok(counts)
    }

    async fn reorganize(
        &self,
        table: RetentionTable,
        connection_id: &str,
        target: u64,
    ) -> Result<u64> {
        let mut tables = self.tables();
        let target = target as usize;

        // Snapshots are pushed to the archive before the live rows go away
        let archived = match table {
            RetentionTable::Base => {
                let rows: Vec<BasePositionAggregate> = tables
                    .aggregates
                    .iter()
                    .filter(|a| a.key.connection_id == connection_id)
                    .cloned()
                    .collect();
                // Failed is terminal, and open trials still report into their aggregate
                let referenced: HashSet<Uuid> = tables
                    .trials
                    .iter()
                    .filter(|t| t.status.is_active())
                    .filter_map(|t| t.aggregate_id)
                    .collect();
                let victims = retention_victims(
                    rows,
                    target,
                    |a| a.phase == Phase::Failed || referenced.contains(&a.id),
                    |a| a.created_at,
                );
                for row in &victims {
                    let archived = snapshot(table, connection_id, row.id, row)?;
                    tables.archive.push(archived);
                }
                tables
                    .aggregates
                    .retain(|a| !victims.iter().any(|v| v.id == a.id));
                victims.len()
            }
            RetentionTable::Main | RetentionTable::Preset => {
                let rows: Vec<PseudoPositionTrial> = tables
                    .trials
                    .iter()
                    .filter(|t| t.key.connection_id == connection_id && trial_in_table(t, table))
                    .cloned()
                    .collect();
                let victims = retention_victims(rows, target, |t| t.status.is_active(), |t| t.created_at);
                for row in &victims {
                    let archived = snapshot(table, connection_id, row.id, row)?;
                    tables.archive.push(archived);
                }
                tables.trials.retain(|t| !victims.iter().any(|v| v.id == t.id));
                victims.len()
            }
            RetentionTable::Real => {
                let rows: Vec<RealPseudoPosition> = tables
                    .reals
                    .iter()
                    .filter(|r| r.connection_id == connection_id)
                    .cloned()
                    .collect();
                let victims = retention_victims(rows, target, |r| r.status.is_pending(), |r| r.created_at);
                for row in &victims {
                    let archived = snapshot(table, connection_id, row.id, row)?;
                    tables.archive.push(archived);
                }
                tables.reals.retain(|r| !victims.iter().any(|v| v.id == r.id));
                victims.len()
            }
        };

        Ok(archived as u64)
    }

    async fn database_size_bytes(&self) -> Result<u64> {
        let tables = self.tables();
        Ok(tables
            .reported_size
            .unwrap_or_else(|| tables.row_count() * ESTIMATED_ROW_BYTES))
    }

    async fn purge_archives_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables();
        let before = tables.archive.len();
        tables.archive.retain(|row| row.archived_at >= cutoff);
        Ok((before - tables.archive.len()) as u64)
    }

    async fn purge_cleanup_log_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables();
        let before = tables.cleanup_log.len();
        tables.cleanup_log.retain(|entry| entry.created_at >= cutoff);
        Ok((before - tables.cleanup_log.len()) as u64)
    }

    async fn record_cleanup(&self, entry: &CleanupEntry) -> Result<()> {
        self.tables().cleanup_log.push(entry.clone());
        Ok(())
    }
}
