//! Relational state of the engine.
//!
//! The database is the only synchronization point between loops, so every
//! capacity rule (slot limit, aggregate capacity, one main trial per
//! aggregate, one real position per main trial, mirror claims) is applied
//! inside the store as a single atomic conditional write.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    BasePositionAggregate, CleanupEntry, ConfigKey, EngineStatus, ExchangePosition, LoopKind,
    LoopStats, OrderRecord, PseudoPositionTrial, RealPseudoPosition, RealStatus, RetentionTable,
    TrialLevel,
};
use crate::Result;

pub use memory::MemoryStore;
pub use postgres::PostgresPersistence;

/// Result of a conditional trial insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialInsert {
    Inserted,
    /// The (connection, symbol, type, direction, TP, SL, trailing) slot
    /// already holds `max_positions_per_config` active trials
    SlotFull,
    /// The aggregate already owns `capacity` trial rows
    CapacityReached,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ==================== AGGREGATES ====================

    /// Return the aggregate for `key`, creating it in `evaluating` when absent
    async fn get_or_create_aggregate(
        &self,
        key: &ConfigKey,
        capacity: u32,
    ) -> Result<BasePositionAggregate>;

    async fn get_aggregate(&self, id: Uuid) -> Result<Option<BasePositionAggregate>>;

    /// Persist counters and phase
    async fn update_aggregate(&self, aggregate: &BasePositionAggregate) -> Result<()>;

    // ==================== TRIALS ====================

    /// Insert `trial` unless its slot already holds `slot_limit` active
    /// trials of the same level or, when `capacity` is given,
    /// its aggregate already owns that many rows. Stamps the aggregate's
    /// `last_trial_at` on success.
    async fn insert_trial(
        &self,
        trial: &PseudoPositionTrial,
        slot_limit: u32,
        capacity: Option<u32>,
    ) -> Result<TrialInsert>;

    /// Insert a main trial unless the aggregate already has one `main_active`
    async fn insert_main_trial(&self, trial: &PseudoPositionTrial) -> Result<bool>;

    /// Active trials of `level` in a slot
    async fn count_active_in_slot(&self, slot_key: &str, level: TrialLevel) -> Result<u64>;

    async fn open_trials(
        &self,
        connection_id: &str,
        symbol: &str,
        levels: &[TrialLevel],
    ) -> Result<Vec<PseudoPositionTrial>>;

    /// Persist running marks (current/best price, trailing, adverse excursion)
    async fn update_trial_marks(&self, trial: &PseudoPositionTrial) -> Result<()>;

    /// Persist the close of `trial`; false when it was already closed
    async fn close_trial(&self, trial: &PseudoPositionTrial) -> Result<bool>;

    /// Closed trials of an aggregate, most recently closed first
    async fn closed_trials(
        &self,
        aggregate_id: Uuid,
        levels: &[TrialLevel],
        limit: usize,
    ) -> Result<Vec<PseudoPositionTrial>>;

    async fn count_closed_trials(&self, aggregate_id: Uuid, level: TrialLevel) -> Result<u64>;

    // ==================== REAL POSITIONS ====================

    /// Insert unless a real position already exists for the main trial
    async fn insert_real_position(&self, real: &RealPseudoPosition) -> Result<bool>;

    /// `validated` real positions of a connection, least recently looked at first
    async fn validated_real_positions(
        &self,
        connection_id: &str,
        limit: usize,
    ) -> Result<Vec<RealPseudoPosition>>;

    /// Send a still-`validated` position to the back of the mirror queue
    async fn defer_real_position(&self, id: Uuid) -> Result<()>;

    /// Move `validated → mirroring`; false when another task got there first
    async fn claim_real_position(&self, id: Uuid) -> Result<bool>;

    /// Leave the `mirroring` state with the given status and attempt count
    async fn finish_real_mirroring(&self, id: Uuid, status: RealStatus, attempts: u32) -> Result<()>;

    // ==================== EXCHANGE POSITIONS ====================

    async fn insert_exchange_position(&self, position: &ExchangePosition) -> Result<()>;

    async fn open_exchange_positions(
        &self,
        connection_id: &str,
        symbol: &str,
    ) -> Result<Vec<ExchangePosition>>;

    async fn update_exchange_position(&self, position: &ExchangePosition) -> Result<()>;

    // ==================== INDICATION STATE ====================

    async fn indication_validated_at(&self, state_key: &str) -> Result<Option<DateTime<Utc>>>;

    async fn stamp_indication(&self, state_key: &str, at: DateTime<Utc>) -> Result<()>;

    // ==================== ORDERS ====================

    async fn insert_order(&self, order: &OrderRecord) -> Result<()>;

    async fn update_order(&self, order: &OrderRecord) -> Result<()>;

    // ==================== ENGINE STATE ====================

    /// Create (or reset) the engine-state row of a connection
    async fn init_engine_state(&self, connection_id: &str) -> Result<()>;

    async fn set_engine_status(
        &self,
        connection_id: &str,
        status: EngineStatus,
        error: Option<&str>,
    ) -> Result<()>;

    async fn save_loop_stats(
        &self,
        connection_id: &str,
        kind: LoopKind,
        stats: &LoopStats,
    ) -> Result<()>;

    // ==================== RETENTION ====================

    /// Row count per connection for a bounded table
    async fn row_counts(&self, table: RetentionTable) -> Result<Vec<(String, u64)>>;

    /// Archive then delete every row of (table, connection) outside the keep
    /// set (active rows first, then newest, up to `target`). Returns the
    /// number of rows moved to the archive.
    async fn reorganize(&self, table: RetentionTable, connection_id: &str, target: u64)
        -> Result<u64>;

    async fn database_size_bytes(&self) -> Result<u64>;

    async fn purge_archives_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn purge_cleanup_log_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn record_cleanup(&self, entry: &CleanupEntry) -> Result<()>;
}
