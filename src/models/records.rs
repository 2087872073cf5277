use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{text_enum, Direction};

/// Cooldown gate for one indication parameter combination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicationState {
    pub state_key: String,
    pub last_validated_at: DateTime<Utc>,
}

text_enum! {
    pub enum OrderSide {
        Buy => "buy",
        Sell => "sell",
    }
}

impl OrderSide {
    /// Side that opens a position in `direction`
    pub fn opening(direction: Direction) -> Self {
        match direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Side that closes a position in `direction`
    pub fn closing(direction: Direction) -> Self {
        Self::opening(direction.opposite())
    }
}

text_enum! {
    pub enum OrderType {
        Market => "market",
        Limit => "limit",
    }
}

text_enum! {
    /// `unknown` marks a placement that timed out; the exchange may hold it
    pub enum OrderStatus {
        Pending => "pending",
        Filled => "filled",
        PartiallyFilled => "partially_filled",
        Failed => "failed",
        Unknown => "unknown",
    }
}

/// Persisted order row; written as `pending` before the first placement
/// attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: Uuid,
    pub connection_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub leverage: u32,
    pub reduce_only: bool,
    pub status: OrderStatus,
    pub retries: u32,
    pub exchange_order_id: Option<String>,
    pub filled_quantity: Option<f64>,
    pub avg_price: Option<f64>,
    pub error_message: Option<String>,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

text_enum! {
    pub enum LoopKind {
        Preset => "preset",
        Main => "main",
        Real => "real",
    }
}

text_enum! {
    pub enum LoopHealth {
        Healthy => "healthy",
        Degraded => "degraded",
        Unhealthy => "unhealthy",
    }
}

text_enum! {
    pub enum EngineStatus {
        Running => "running",
        Stopped => "stopped",
        Error => "error",
    }
}

/// Observability snapshot for one loop, persisted after every cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopStats {
    pub cycle_count: u64,
    pub last_cycle_ms: u64,
    pub avg_cycle_ms: f64,
    pub symbol_count: usize,
    pub success_rate: f64,
    pub health: LoopHealth,
    pub last_cycle_at: DateTime<Utc>,
}

text_enum! {
    /// Tables bounded by the retention manager
    pub enum RetentionTable {
        Base => "base",
        Main => "main",
        Real => "real",
        Preset => "preset",
    }
}

impl RetentionTable {
    pub fn all() -> [RetentionTable; 4] {
        [
            RetentionTable::Base,
            RetentionTable::Main,
            RetentionTable::Real,
            RetentionTable::Preset,
        ]
    }
}

/// Row budget for one (table, connection)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetentionLedger {
    pub table: RetentionTable,
    pub target_count: u64,
    pub threshold_percent: f64,
}

impl RetentionLedger {
    /// ceil(target * (1 + threshold / 100))
    pub fn storage_limit(&self) -> u64 {
        let excess = (self.target_count as f64 * self.threshold_percent / 100.0).ceil();
        self.target_count + excess.max(0.0) as u64
    }

    pub fn exceeds(&self, row_count: u64) -> bool {
        row_count > self.storage_limit()
    }
}

/// Full snapshot of a row removed by reorganization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedRow {
    pub source_table: RetentionTable,
    pub connection_id: String,
    pub row_id: Uuid,
    pub snapshot: serde_json::Value,
    pub archived_at: DateTime<Utc>,
}

text_enum! {
    pub enum CleanupOperation {
        Reorganize => "reorganize",
        AggressivePurge => "aggressive_purge",
    }
}

/// One cleanup-ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupEntry {
    pub id: Uuid,
    pub operation: CleanupOperation,
    pub table: Option<RetentionTable>,
    pub connection_id: Option<String>,
    pub rows_affected: u64,
    pub success: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CleanupEntry {
    pub fn new(operation: CleanupOperation) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            table: None,
            connection_id: None,
            rows_affected: 0,
            success: true,
            error: None,
            created_at: Utc::now(),
        }
    }
}
