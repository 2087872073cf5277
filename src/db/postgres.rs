use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use super::{Store, TrialInsert};
use crate::models::{
    BasePositionAggregate, CleanupEntry, ConfigKey, EngineStatus, ExchangePosition, LoopKind,
    LoopStats, OrderRecord, PseudoPositionTrial, RealPseudoPosition, RealStatus, RetentionTable,
    TrialLevel,
};
use crate::{EngineError, Result};

const AGGREGATE_COLUMNS: &str = "id, config, phase, total_positions, winning_positions, \
    losing_positions, total_profit_loss, win_rate, avg_profit, avg_loss, max_drawdown, \
    recent_drawdown, capacity, last_trial_at, created_at, updated_at";

const TRIAL_COLUMNS: &str = "id, aggregate_id, level, connection_id, symbol, indication_type, \
    direction, slot_key, config, status, entry_price, current_price, take_profit_price, \
    stop_loss_price, trailing_active, best_price, max_adverse_pct, created_at, closed_at, \
    close_price, realized_pnl, close_reason";

const REAL_COLUMNS: &str = "id, connection_id, symbol, direction, main_trial_id, aggregate_id, \
    status, reference_price, take_profit_price, stop_loss_price, take_profit_pct, stop_loss_pct, \
    trailing_enabled, trail_start, trail_stop, profit_factor, avg_drawdown_hours, \
    mirror_attempts, created_at, updated_at";

const EXCHANGE_COLUMNS: &str = "id, real_id, connection_id, exchange, symbol, direction, \
    exchange_order_id, entry_price, volume, leverage, take_profit_price, stop_loss_price, \
    trailing_enabled, trail_start, trail_stop, trailing_active, best_price, current_price, \
    unrealized_pnl, max_profit_pct, max_loss_pct, status, sync_status, close_reason, \
    close_order_id, realized_pnl, opened_at, closed_at";

/// Where a bounded retention table lives and which of its rows are never
/// archived. `protected` is evaluated against the table aliased as `t`.
struct RetentionScope {
    sql_table: &'static str,
    scope: &'static str,
    protected: &'static str,
}

fn retention_scope(table: RetentionTable) -> RetentionScope {
    match table {
        RetentionTable::Base => RetentionScope {
            sql_table: "base_pseudo_positions",
            scope: "TRUE",
            protected: "t.phase = 'failed' OR EXISTS (\
                SELECT 1 FROM pseudo_positions p \
                WHERE p.aggregate_id = t.id AND p.status <> 'closed')",
        },
        RetentionTable::Main => RetentionScope {
            sql_table: "pseudo_positions",
            scope: "level <> 'preset'",
            protected: "t.status <> 'closed'",
        },
        RetentionTable::Real => RetentionScope {
            sql_table: "real_pseudo_positions",
            scope: "TRUE",
            protected: "t.status IN ('validated', 'mirroring', 'out_of_sync')",
        },
        RetentionTable::Preset => RetentionScope {
            sql_table: "pseudo_positions",
            scope: "level = 'preset'",
            protected: "t.status <> 'closed'",
        },
    }
}

// ==================== ROW DECODING ====================

fn decimal_to_f64(value: Decimal) -> Result<f64> {
    value
        .to_f64()
        .ok_or_else(|| EngineError::InvalidState(format!("numeric {} out of f64 range", value)))
}

fn num(row: &PgRow, column: &str) -> Result<f64> {
    decimal_to_f64(row.get::<Decimal, _>(column))
}

fn num_opt(row: &PgRow, column: &str) -> Result<Option<f64>> {
    row.get::<Option<Decimal>, _>(column)
        .map(decimal_to_f64)
        .transpose()
}

fn aggregate_from_row(row: &PgRow) -> Result<BasePositionAggregate> {
    let Json(key): Json<ConfigKey> = row.get("config");
    let phase: String = row.get("phase");
    Ok(BasePositionAggregate {
        id: row.get("id"),
        key,
        phase: phase.parse()?,
        total_positions: row.get::<i32, _>("total_positions") as u32,
        winning_positions: row.get::<i32, _>("winning_positions") as u32,
        losing_positions: row.get::<i32, _>("losing_positions") as u32,
        total_profit_loss: row.get("total_profit_loss"),
        win_rate: row.get("win_rate"),
        avg_profit: row.get("avg_profit"),
        avg_loss: row.get("avg_loss"),
        max_drawdown: row.get("max_drawdown"),
        recent_drawdown: row.get("recent_drawdown"),
        capacity: row.get::<i32, _>("capacity") as u32,
        last_trial_at: row.get("last_trial_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn trial_from_row(row: &PgRow) -> Result<PseudoPositionTrial> {
    let Json(key): Json<ConfigKey> = row.get("config");
    let level: String = row.get("level");
    let status: String = row.get("status");
    let close_reason: Option<String> = row.get("close_reason");
    Ok(PseudoPositionTrial {
        id: row.get("id"),
        aggregate_id: row.get("aggregate_id"),
        level: level.parse()?,
        key,
        status: status.parse()?,
        entry_price: num(row, "entry_price")?,
        current_price: num(row, "current_price")?,
        take_profit_price: num(row, "take_profit_price")?,
        stop_loss_price: num(row, "stop_loss_price")?,
        trailing_active: row.get("trailing_active"),
        best_price: num(row, "best_price")?,
        max_adverse_pct: row.get("max_adverse_pct"),
        created_at: row.get("created_at"),
        closed_at: row.get("closed_at"),
        close_price: num_opt(row, "close_price")?,
        realized_pnl: row.get("realized_pnl"),
        close_reason: close_reason.map(|r| r.parse()).transpose()?,
    })
}

fn real_from_row(row: &PgRow) -> Result<RealPseudoPosition> {
    let direction: String = row.get("direction");
    let status: String = row.get("status");
    Ok(RealPseudoPosition {
        id: row.get("id"),
        connection_id: row.get("connection_id"),
        symbol: row.get("symbol"),
        direction: direction.parse()?,
        main_trial_id: row.get("main_trial_id"),
        aggregate_id: row.get("aggregate_id"),
        status: status.parse()?,
        reference_price: num(row, "reference_price")?,
        take_profit_price: num(row, "take_profit_price")?,
        stop_loss_price: num(row, "stop_loss_price")?,
        take_profit_pct: row.get("take_profit_pct"),
        stop_loss_pct: row.get("stop_loss_pct"),
        trailing_enabled: row.get("trailing_enabled"),
        trail_start: row.get("trail_start"),
        trail_stop: row.get("trail_stop"),
        profit_factor: row.get("profit_factor"),
        avg_drawdown_hours: row.get("avg_drawdown_hours"),
        mirror_attempts: row.get::<i32, _>("mirror_attempts") as u32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn exchange_position_from_row(row: &PgRow) -> Result<ExchangePosition> {
    let direction: String = row.get("direction");
    let status: String = row.get("status");
    let sync_status: String = row.get("sync_status");
    let close_reason: Option<String> = row.get("close_reason");
    Ok(ExchangePosition {
        id: row.get("id"),
        real_id: row.get("real_id"),
        connection_id: row.get("connection_id"),
        exchange: row.get("exchange"),
        symbol: row.get("symbol"),
        direction: direction.parse()?,
        exchange_order_id: row.get("exchange_order_id"),
        entry_price: num(row, "entry_price")?,
        volume: num(row, "volume")?,
        leverage: row.get::<i32, _>("leverage") as u32,
        take_profit_price: num(row, "take_profit_price")?,
        stop_loss_price: num(row, "stop_loss_price")?,
        trailing_enabled: row.get("trailing_enabled"),
        trail_start: row.get("trail_start"),
        trail_stop: row.get("trail_stop"),
        trailing_active: row.get("trailing_active"),
        best_price: num(row, "best_price")?,
        current_price: num(row, "current_price")?,
        unrealized_pnl: num(row, "unrealized_pnl")?,
        max_profit_pct: row.get("max_profit_pct"),
        max_loss_pct: row.get("max_loss_pct"),
        status: status.parse()?,
        sync_status: sync_status.parse()?,
        close_reason: close_reason.map(|r| r.parse()).transpose()?,
        close_order_id: row.get("close_order_id"),
        realized_pnl: num_opt(row, "realized_pnl")?,
        opened_at: row.get("opened_at"),
        closed_at: row.get("closed_at"),
    })
}

/// INSERT statement for one trial row, with an optional conflict clause
fn trial_insert<'q>(sql: &'q str, trial: &PseudoPositionTrial) -> Query<'q, Postgres, PgArguments> {
    sqlx::query(sql)
        .bind(trial.id)
        .bind(trial.aggregate_id)
        .bind(trial.level.as_str())
        .bind(trial.key.connection_id.clone())
        .bind(trial.key.symbol.clone())
        .bind(trial.key.indication_type.as_str())
        .bind(trial.key.direction.as_str())
        .bind(trial.key.slot_key())
        .bind(Json(trial.key.clone()))
        .bind(trial.status.as_str())
        .bind(trial.entry_price)
        .bind(trial.current_price)
        .bind(trial.take_profit_price)
        .bind(trial.stop_loss_price)
        .bind(trial.trailing_active)
        .bind(trial.best_price)
        .bind(trial.max_adverse_pct)
        .bind(trial.created_at)
        .bind(trial.closed_at)
        .bind(trial.close_price)
        .bind(trial.realized_pnl)
        .bind(trial.close_reason.map(|r| r.as_str()))
}

fn trial_insert_sql(conflict: &str) -> String {
    format!(
        "INSERT INTO pseudo_positions ({}) VALUES \
         ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22) {}",
        TRIAL_COLUMNS, conflict
    )
}

/// Postgres-backed store
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Connect to Postgres and apply pending migrations
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres ({} max connections)", max_connections);

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete every row belonging to a connection (testing only)
    #[cfg(test)]
    pub async fn clear_connection(&self, connection_id: &str) -> Result<()> {
        for table in [
            "base_pseudo_positions",
            "pseudo_positions",
            "real_pseudo_positions",
            "active_exchange_positions",
            "orders",
            "trade_engine_state",
            "archived_rows",
        ] {
            sqlx::query(&format!("DELETE FROM {} WHERE connection_id = $1", table))
                .bind(connection_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresPersistence {
    // ==================== AGGREGATES ====================

    async fn get_or_create_aggregate(
        &self,
        key: &ConfigKey,
        capacity: u32,
    ) -> Result<BasePositionAggregate> {
        let fingerprint = key.fingerprint();

        sqlx::query(
            r#"
            INSERT INTO base_pseudo_positions (
                id, connection_id, symbol, indication_type, direction,
                fingerprint, config, phase, capacity
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'evaluating', $8)
            ON CONFLICT (fingerprint) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&key.connection_id)
        .bind(&key.symbol)
        .bind(key.indication_type.as_str())
        .bind(key.direction.as_str())
        .bind(&fingerprint)
        .bind(Json(key))
        .bind(capacity as i32)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM base_pseudo_positions WHERE fingerprint = $1",
            AGGREGATE_COLUMNS
        ))
        .bind(&fingerprint)
        .fetch_one(&self.pool)
        .await?;

        aggregate_from_row(&row)
    }

    async fn get_aggregate(&self, id: Uuid) -> Result<Option<BasePositionAggregate>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM base_pseudo_positions WHERE id = $1",
            AGGREGATE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(aggregate_from_row).transpose()
    }

    async fn update_aggregate(&self, aggregate: &BasePositionAggregate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE base_pseudo_positions SET
                phase = $2,
                total_positions = $3,
                winning_positions = $4,
                losing_positions = $5,
                total_profit_loss = $6,
                win_rate = $7,
                avg_profit = $8,
                avg_loss = $9,
                max_drawdown = $10,
                recent_drawdown = $11,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(aggregate.id)
        .bind(aggregate.phase.as_str())
        .bind(aggregate.total_positions as i32)
        .bind(aggregate.winning_positions as i32)
        .bind(aggregate.losing_positions as i32)
        .bind(aggregate.total_profit_loss)
        .bind(aggregate.win_rate)
        .bind(aggregate.avg_profit)
        .bind(aggregate.avg_loss)
        .bind(aggregate.max_drawdown)
        .bind(aggregate.recent_drawdown)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("aggregate {}", aggregate.id)));
        }
        Ok(())
    }

    // ==================== TRIALS ====================

    async fn insert_trial(
        &self,
        trial: &PseudoPositionTrial,
        slot_limit: u32,
        capacity: Option<u32>,
    ) -> Result<TrialInsert> {
        let slot_key = trial.key.slot_key();
        let mut tx = self.pool.begin().await?;

        // Serializes every writer competing for the same slot until commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&slot_key)
            .execute(&mut *tx)
            .await?;

        let active: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM pseudo_positions \
             WHERE slot_key = $1 AND level = $2 AND status <> 'closed'",
        )
        .bind(&slot_key)
        .bind(trial.level.as_str())
        .fetch_one(&mut *tx)
        .await?
        .get("n");

        if active >= slot_limit as i64 {
            tx.rollback().await?;
            return Ok(TrialInsert::SlotFull);
        }

        if let (Some(capacity), Some(aggregate_id)) = (capacity, trial.aggregate_id) {
            sqlx::query("SELECT id FROM base_pseudo_positions WHERE id = $1 FOR UPDATE")
                .bind(aggregate_id)
                .execute(&mut *tx)
                .await?;

            let owned: i64 = sqlx::query(
                "SELECT COUNT(*) AS n FROM pseudo_positions WHERE aggregate_id = $1",
            )
            .bind(aggregate_id)
            .fetch_one(&mut *tx)
            .await?
            .get("n");

            if owned >= capacity as i64 {
                tx.rollback().await?;
                return Ok(TrialInsert::CapacityReached);
            }
        }

        let sql = trial_insert_sql("");
        trial_insert(&sql, trial).execute(&mut *tx).await?;

        if let Some(aggregate_id) = trial.aggregate_id {
            sqlx::query("UPDATE base_pseudo_positions SET last_trial_at = $2 WHERE id = $1")
                .bind(aggregate_id)
                .bind(trial.created_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(TrialInsert::Inserted)
    }

    async fn insert_main_trial(&self, trial: &PseudoPositionTrial) -> Result<bool> {
        let sql = trial_insert_sql(
            "ON CONFLICT (aggregate_id) WHERE status = 'main_active' DO NOTHING",
        );
        let result = trial_insert(&sql, trial).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_active_in_slot(&self, slot_key: &str, level: TrialLevel) -> Result<u64> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM pseudo_positions \
             WHERE slot_key = $1 AND level = $2 AND status <> 'closed'",
        )
        .bind(slot_key)
        .bind(level.as_str())
        .fetch_one(&self.pool)
        .await?
        .get("n");
        Ok(count as u64)
    }

    async fn open_trials(
        &self,
        connection_id: &str,
        symbol: &str,
        levels: &[TrialLevel],
    ) -> Result<Vec<PseudoPositionTrial>> {
        let levels: Vec<String> = levels.iter().map(|l| l.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pseudo_positions \
             WHERE connection_id = $1 AND symbol = $2 AND level = ANY($3) AND status <> 'closed' \
             ORDER BY created_at ASC",
            TRIAL_COLUMNS
        ))
        .bind(connection_id)
        .bind(symbol)
        .bind(levels)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trial_from_row).collect()
    }

    async fn update_trial_marks(&self, trial: &PseudoPositionTrial) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pseudo_positions SET
                current_price = $2,
                best_price = $3,
                trailing_active = $4,
                max_adverse_pct = $5
            WHERE id = $1 AND status <> 'closed'
            "#,
        )
        .bind(trial.id)
        .bind(trial.current_price)
        .bind(trial.best_price)
        .bind(trial.trailing_active)
        .bind(trial.max_adverse_pct)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_trial(&self, trial: &PseudoPositionTrial) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pseudo_positions SET
                status = 'closed',
                current_price = $2,
                best_price = $3,
                trailing_active = $4,
                max_adverse_pct = $5,
                closed_at = $6,
                close_price = $7,
                realized_pnl = $8,
                close_reason = $9
            WHERE id = $1 AND status <> 'closed'
            "#,
        )
        .bind(trial.id)
        .bind(trial.current_price)
        .bind(trial.best_price)
        .bind(trial.trailing_active)
        .bind(trial.max_adverse_pct)
        .bind(trial.closed_at)
        .bind(trial.close_price)
        .bind(trial.realized_pnl)
        .bind(trial.close_reason.map(|r| r.as_str()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn closed_trials(
        &self,
        aggregate_id: Uuid,
        levels: &[TrialLevel],
        limit: usize,
    ) -> Result<Vec<PseudoPositionTrial>> {
        let levels: Vec<String> = levels.iter().map(|l| l.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pseudo_positions \
             WHERE aggregate_id = $1 AND level = ANY($2) AND status = 'closed' \
             ORDER BY closed_at DESC LIMIT $3",
            TRIAL_COLUMNS
        ))
        .bind(aggregate_id)
        .bind(levels)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trial_from_row).collect()
    }

    async fn count_closed_trials(&self, aggregate_id: Uuid, level: TrialLevel) -> Result<u64> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM pseudo_positions \
             WHERE aggregate_id = $1 AND level = $2 AND status = 'closed'",
        )
        .bind(aggregate_id)
        .bind(level.as_str())
        .fetch_one(&self.pool)
        .await?
        .get("n");
        Ok(count as u64)
    }

    // ==================== REAL POSITIONS ====================

    async fn insert_real_position(&self, real: &RealPseudoPosition) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO real_pseudo_positions ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20) \
             ON CONFLICT (main_trial_id) DO NOTHING",
            REAL_COLUMNS
        ))
        .bind(real.id)
        .bind(&real.connection_id)
        .bind(&real.symbol)
        .bind(real.direction.as_str())
        .bind(real.main_trial_id)
        .bind(real.aggregate_id)
        .bind(real.status.as_str())
        .bind(real.reference_price)
        .bind(real.take_profit_price)
        .bind(real.stop_loss_price)
        .bind(real.take_profit_pct)
        .bind(real.stop_loss_pct)
        .bind(real.trailing_enabled)
        .bind(real.trail_start)
        .bind(real.trail_stop)
        .bind(real.profit_factor)
        .bind(real.avg_drawdown_hours)
        .bind(real.mirror_attempts as i32)
        .bind(real.created_at)
        .bind(real.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn validated_real_positions(
        &self,
        connection_id: &str,
        limit: usize,
    ) -> Result<Vec<RealPseudoPosition>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM real_pseudo_positions \
             WHERE connection_id = $1 AND status = 'validated' \
             ORDER BY updated_at ASC, created_at ASC LIMIT $2",
            REAL_COLUMNS
        ))
        .bind(connection_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(real_from_row).collect()
    }

    async fn defer_real_position(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE real_pseudo_positions SET updated_at = NOW() \
             WHERE id = $1 AND status = 'validated'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_real_position(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE real_pseudo_positions SET status = 'mirroring', updated_at = NOW() \
             WHERE id = $1 AND status = 'validated'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish_real_mirroring(&self, id: Uuid, status: RealStatus, attempts: u32) -> Result<()> {
        sqlx::query(
            "UPDATE real_pseudo_positions SET status = $2, mirror_attempts = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(attempts as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== EXCHANGE POSITIONS ====================

    async fn insert_exchange_position(&self, position: &ExchangePosition) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO active_exchange_positions ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
              $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28)",
            EXCHANGE_COLUMNS
        ))
        .bind(position.id)
        .bind(position.real_id)
        .bind(&position.connection_id)
        .bind(&position.exchange)
        .bind(&position.symbol)
        .bind(position.direction.as_str())
        .bind(&position.exchange_order_id)
        .bind(position.entry_price)
        .bind(position.volume)
        .bind(position.leverage as i32)
        .bind(position.take_profit_price)
        .bind(position.stop_loss_price)
        .bind(position.trailing_enabled)
        .bind(position.trail_start)
        .bind(position.trail_stop)
        .bind(position.trailing_active)
        .bind(position.best_price)
        .bind(position.current_price)
        .bind(position.unrealized_pnl)
        .bind(position.max_profit_pct)
        .bind(position.max_loss_pct)
        .bind(position.status.as_str())
        .bind(position.sync_status.as_str())
        .bind(position.close_reason.map(|r| r.as_str()))
        .bind(&position.close_order_id)
        .bind(position.realized_pnl)
        .bind(position.opened_at)
        .bind(position.closed_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Saved exchange position {} for {} to Postgres",
            position.id,
            position.symbol
        );
        Ok(())
    }

    async fn open_exchange_positions(
        &self,
        connection_id: &str,
        symbol: &str,
    ) -> Result<Vec<ExchangePosition>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM active_exchange_positions \
             WHERE connection_id = $1 AND symbol = $2 AND status = 'open' \
             ORDER BY opened_at ASC",
            EXCHANGE_COLUMNS
        ))
        .bind(connection_id)
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(exchange_position_from_row).collect()
    }

    async fn update_exchange_position(&self, position: &ExchangePosition) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE active_exchange_positions SET
                trailing_active = $2,
                best_price = $3,
                current_price = $4,
                unrealized_pnl = $5,
                max_profit_pct = $6,
                max_loss_pct = $7,
                status = $8,
                sync_status = $9,
                close_reason = $10,
                close_order_id = $11,
                realized_pnl = $12,
                closed_at = $13
            WHERE id = $1
            "#,
        )
        .bind(position.id)
        .bind(position.trailing_active)
        .bind(position.best_price)
        .bind(position.current_price)
        .bind(position.unrealized_pnl)
        .bind(position.max_profit_pct)
        .bind(position.max_loss_pct)
        .bind(position.status.as_str())
        .bind(position.sync_status.as_str())
        .bind(position.close_reason.map(|r| r.as_str()))
        .bind(&position.close_order_id)
        .bind(position.realized_pnl)
        .bind(position.closed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== INDICATION STATE ====================

    async fn indication_validated_at(&self, state_key: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_validated_at FROM indication_states WHERE state_key = $1")
            .bind(state_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("last_validated_at")))
    }

    async fn stamp_indication(&self, state_key: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO indication_states (state_key, last_validated_at)
            VALUES ($1, $2)
            ON CONFLICT (state_key) DO UPDATE SET last_validated_at = EXCLUDED.last_validated_at
            "#,
        )
        .bind(state_key)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== ORDERS ====================

    async fn insert_order(&self, order: &OrderRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, connection_id, exchange, symbol, side, order_type, quantity, price,
                leverage, reduce_only, status, retries, exchange_order_id, filled_quantity,
                avg_price, error_message, dedup_key, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(order.id)
        .bind(&order.connection_id)
        .bind(&order.exchange)
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(order.quantity)
        .bind(order.price)
        .bind(order.leverage as i32)
        .bind(order.reduce_only)
        .bind(order.status.as_str())
        .bind(order.retries as i32)
        .bind(&order.exchange_order_id)
        .bind(order.filled_quantity)
        .bind(order.avg_price)
        .bind(&order.error_message)
        .bind(&order.dedup_key)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_order(&self, order: &OrderRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders SET
                status = $2,
                retries = $3,
                exchange_order_id = $4,
                filled_quantity = $5,
                avg_price = $6,
                error_message = $7,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order.id)
        .bind(order.status.as_str())
        .bind(order.retries as i32)
        .bind(&order.exchange_order_id)
        .bind(order.filled_quantity)
        .bind(order.avg_price)
        .bind(&order.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== ENGINE STATE ====================

    async fn init_engine_state(&self, connection_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_engine_state (connection_id, status)
            VALUES ($1, 'stopped')
            ON CONFLICT (connection_id) DO UPDATE SET
                status = 'stopped',
                error_message = NULL,
                updated_at = NOW()
            "#,
        )
        .bind(connection_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_engine_status(
        &self,
        connection_id: &str,
        status: EngineStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_engine_state (connection_id, status, error_message)
            VALUES ($1, $2, $3)
            ON CONFLICT (connection_id) DO UPDATE SET
                status = EXCLUDED.status,
                error_message = EXCLUDED.error_message,
                updated_at = NOW()
            "#,
        )
        .bind(connection_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_loop_stats(
        &self,
        connection_id: &str,
        kind: LoopKind,
        stats: &LoopStats,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trade_engine_state SET
                loop_stats = jsonb_set(loop_stats, ARRAY[$2::text], $3::jsonb, true),
                updated_at = NOW()
            WHERE connection_id = $1
            "#,
        )
        .bind(connection_id)
        .bind(kind.as_str())
        .bind(Json(stats))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== RETENTION ====================

    async fn row_counts(&self, table: RetentionTable) -> Result<Vec<(String, u64)>> {
        let scope = retention_scope(table);
        let rows = sqlx::query(&format!(
            "SELECT connection_id, COUNT(*) AS n FROM {} WHERE {} \
             GROUP BY connection_id ORDER BY connection_id",
            scope.sql_table, scope.scope
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let connection_id: String = row.get("connection_id");
                let count: i64 = row.get("n");
                (connection_id, count as u64)
            })
            .collect())
    }

    async fn reorganize(
        &self,
        table: RetentionTable,
        connection_id: &str,
        target: u64,
    ) -> Result<u64> {
        let scope = retention_scope(table);
        let mut tx = self.pool.begin().await?;

        let victims: Vec<Uuid> = sqlx::query(&format!(
            r#"
            WITH scoped AS (
                SELECT t.id, t.created_at, ({protected}) AS protected
                FROM {table} t
                WHERE t.connection_id = $1 AND {scope}
            ),
            ranked AS (
                SELECT id, ROW_NUMBER() OVER (ORDER BY created_at DESC) AS rn
                FROM scoped
                WHERE NOT protected
            )
            SELECT id FROM ranked
            WHERE rn > GREATEST($2 - (SELECT COUNT(*) FROM scoped WHERE protected), 0)
            "#,
            protected = scope.protected,
            table = scope.sql_table,
            scope = scope.scope,
        ))
        .bind(connection_id)
        .bind(target as i64)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.get::<Uuid, _>("id"))
        .collect();

        if victims.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        // Rows that became protected since the ranking stay put
        let archived = sqlx::query(&format!(
            r#"
            WITH gone AS (
                DELETE FROM {table} t
                WHERE t.id = ANY($2) AND NOT ({protected})
                RETURNING t.*
            )
            INSERT INTO archived_rows (source_table, connection_id, row_id, snapshot)
            SELECT $1, g.connection_id, g.id, to_jsonb(g) FROM gone g
            "#,
            table = scope.sql_table,
            protected = scope.protected,
        ))
        .bind(table.as_str())
        .bind(&victims)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(archived)
    }

    async fn database_size_bytes(&self) -> Result<u64> {
        let size: i64 = sqlx::query("SELECT pg_database_size(current_database()) AS size")
            .fetch_one(&self.pool)
            .await?
            .get("size");
        Ok(size.max(0) as u64)
    }

    async fn purge_archives_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM archived_rows WHERE archived_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_cleanup_log_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cleanup_log WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_cleanup(&self, entry: &CleanupEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cleanup_log (
                id, operation, table_name, connection_id, rows_affected, success, error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.operation.as_str())
        .bind(entry.table.map(|t| t.as_str()))
        .bind(&entry.connection_id)
        .bind(entry.rows_affected as i64)
        .bind(entry.success)
        .bind(&entry.error)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{sample_key, TrialStatus};

    async fn get_test_db() -> PostgresPersistence {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/trade_engine_test".to_string());

        PostgresPersistence::new(&database_url, 5)
            .await
            .expect("Failed to connect to test database")
    }

    #[test]
    fn test_decimal_columns_convert_exactly() {
        use std::str::FromStr;

        assert_eq!(decimal_to_f64(Decimal::from_str("101.05").unwrap()).unwrap(), 101.05);
        assert_eq!(decimal_to_f64(Decimal::from_str("-0.00012345").unwrap()).unwrap(), -0.00012345);
        assert_eq!(decimal_to_f64(Decimal::MAX).unwrap(), 7.922816251426434e28);
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_aggregate_upsert_and_load() {
        let db = get_test_db().await;
        let connection = format!("pg-agg-{}", Uuid::new_v4());
        let key = sample_key(&connection, "BTCUSDT");

        let first = db.get_or_create_aggregate(&key, 250).await.unwrap();
        let second = db.get_or_create_aggregate(&key, 250).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.key, key);

        let mut updated = second.clone();
        updated.total_positions = 4;
        updated.win_rate = 0.5;
        db.update_aggregate(&updated).await.unwrap();

        let loaded = db.get_aggregate(first.id).await.unwrap().unwrap();
        assert_eq!(loaded.total_positions, 4);
        assert_eq!(loaded.win_rate, 0.5);

        db.clear_connection(&connection).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_concurrent_inserts_respect_slot_limit() {
        let db = std::sync::Arc::new(get_test_db().await);
        let connection = format!("pg-slot-{}", Uuid::new_v4());
        let key = sample_key(&connection, "BTCUSDT");
        let aggregate_id = db.get_or_create_aggregate(&key, 250).await.unwrap().id;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let trial =
                    PseudoPositionTrial::open(TrialLevel::Base, Some(aggregate_id), key, 100.0, Utc::now());
                db.insert_trial(&trial, 1, Some(250)).await.unwrap()
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == TrialInsert::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(db.count_active_in_slot(&key.slot_key(), TrialLevel::Base).await.unwrap(), 1);

        db.clear_connection(&connection).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_one_main_trial_per_aggregate() {
        let db = get_test_db().await;
        let connection = format!("pg-main-{}", Uuid::new_v4());
        let key = sample_key(&connection, "ETHUSDT");
        let aggregate = db.get_or_create_aggregate(&key, 250).await.unwrap();

        let first = PseudoPositionTrial::open(TrialLevel::Main, Some(aggregate.id), key.clone(), 10.0, Utc::now());
        let second = PseudoPositionTrial::open(TrialLevel::Main, Some(aggregate.id), key, 10.0, Utc::now());
        assert!(db.insert_main_trial(&first).await.unwrap());
        assert!(!db.insert_main_trial(&second).await.unwrap());

        let mut closed = first.clone();
        closed.status = TrialStatus::Closed;
        closed.closed_at = Some(Utc::now());
        closed.close_price = Some(10.1);
        closed.realized_pnl = Some(1.0);
        assert!(db.close_trial(&closed).await.unwrap());
        assert!(db.insert_main_trial(&second).await.unwrap());

        db.clear_connection(&connection).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_reorganize_archives_before_delete() {
        let db = get_test_db().await;
        let connection = format!("pg-retention-{}", Uuid::new_v4());
        let key = sample_key(&connection, "SOLUSDT");

        for i in 0..12 {
            let mut trial = PseudoPositionTrial::open(
                TrialLevel::Base,
                None,
                key.clone(),
                100.0,
                Utc::now() - chrono::Duration::minutes(i),
            );
            trial.status = TrialStatus::Closed;
            trial.closed_at = Some(Utc::now());
            db.insert_trial(&trial, 100, None).await.unwrap();
        }

        let moved = db.reorganize(RetentionTable::Main, &connection, 10).await.unwrap();
        assert_eq!(moved, 2);

        let counts = db.row_counts(RetentionTable::Main).await.unwrap();
        let ours = counts.iter().find(|(c, _)| c == &connection).unwrap();
        assert_eq!(ours.1, 10);

        let archived: i64 = sqlx::query("SELECT COUNT(*) AS n FROM archived_rows WHERE connection_id = $1")
            .bind(&connection)
            .fetch_one(db.pool())
            .await
            .unwrap()
            .get("n");
        assert_eq!(archived, 2);

        db.clear_connection(&connection).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_base_reorganize_keeps_failed_and_referenced_aggregates() {
        let db = get_test_db().await;
        let connection = format!("pg-base-keep-{}", Uuid::new_v4());

        let mut failed = db
            .get_or_create_aggregate(&sample_key(&connection, "AAAUSDT"), 250)
            .await
            .unwrap();
        failed.phase = crate::models::Phase::Failed;
        db.update_aggregate(&failed).await.unwrap();

        let owner_key = sample_key(&connection, "BBBUSDT");
        let owner = db.get_or_create_aggregate(&owner_key, 250).await.unwrap();
        let open = PseudoPositionTrial::open(TrialLevel::Base, Some(owner.id), owner_key, 100.0, Utc::now());
        db.insert_trial(&open, 100, None).await.unwrap();

        for symbol in ["CCCUSDT", "DDDUSDT"] {
            db.get_or_create_aggregate(&sample_key(&connection, symbol), 250)
                .await
                .unwrap();
        }

        let moved = db.reorganize(RetentionTable::Base, &connection, 2).await.unwrap();
        assert_eq!(moved, 2);

        let kept = db.get_aggregate(failed.id).await.unwrap().unwrap();
        assert_eq!(kept.phase, crate::models::Phase::Failed);
        assert!(db.get_aggregate(owner.id).await.unwrap().is_some());

        db.clear_connection(&connection).await.unwrap();
    }
}
