//! Engine configuration
//!
//! Layered: built-in defaults, then `config/default.toml` and
//! `config/local.toml` (both optional, or an explicit file), then `ENGINE__*`
//! environment variables.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::models::{IndicationType, RetentionLedger, RetentionTable};
use crate::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub engine: LoopConfig,
    pub indication: IndicationConfig,
    pub pool: PoolConfig,
    pub graduation: GraduationConfig,
    pub sizing: SizingConfig,
    pub preset: PresetConfig,
    pub retention: RetentionConfig,
    pub executor: ExecutorConfig,
    pub rate_limits: RateLimitTable,
    pub paper: PaperConfig,
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/trade_engine".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Market data falls back to process memory when unset
    pub url: Option<String>,
}

/// Cadence and fan-out of the three per-connection loops
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub preset_interval_ms: u64,
    pub main_interval_ms: u64,
    pub real_interval_ms: u64,
    /// Symbols processed concurrently within one cycle
    pub max_concurrency: usize,
    /// Cycles kept for the rolling average and health sampling
    pub health_window: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            preset_interval_ms: 1500,
            main_interval_ms: 1000,
            real_interval_ms: 300,
            max_concurrency: 10,
            health_window: 20,
        }
    }
}

impl LoopConfig {
    pub fn preset_interval(&self) -> Duration {
        Duration::from_millis(self.preset_interval_ms)
    }

    pub fn main_interval(&self) -> Duration {
        Duration::from_millis(self.main_interval_ms)
    }

    pub fn real_interval(&self) -> Duration {
        Duration::from_millis(self.real_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingPreset {
    /// Profit (percent) at which trailing activates
    pub start: f64,
    /// Retracement (percent) from the best price that closes the trial
    pub stop: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicationConfig {
    pub validation_timeout_secs: u64,
    pub position_cooldown_ms: u64,
    pub max_positions_per_config: u32,
    pub enabled_types: Vec<IndicationType>,
    pub direction_ranges: Vec<u32>,
    pub move_ranges: Vec<u32>,
    pub active_thresholds: Vec<f64>,
    pub activity_ratios: Vec<f64>,
    pub time_windows_secs: Vec<u64>,
    pub optimal_ranges: Vec<u32>,
    pub drawdown_ratios: Vec<f64>,
    pub market_change_ranges: Vec<f64>,
    pub last_part_ratios: Vec<f64>,
    pub take_profit_factors: Vec<f64>,
    pub stop_loss_ratios: Vec<f64>,
    /// Trailing variants besides "no trailing", which is always included
    pub trailing_presets: Vec<TrailingPreset>,
    /// Combinations whose stop loss would be tighter than this are skipped
    pub min_stop_loss_pct: f64,
    pub parameter_batch_size: usize,
    /// Number of snapshots kept in the rolling series per symbol
    pub series_length: usize,
    pub price_cache_ttl_ms: u64,
}

impl Default for IndicationConfig {
    fn default() -> Self {
        Self {
            validation_timeout_secs: 15,
            position_cooldown_ms: 0,
            max_positions_per_config: 1,
            enabled_types: vec![
                IndicationType::Direction,
                IndicationType::Move,
                IndicationType::Active,
                IndicationType::ActiveAdvanced,
                IndicationType::Optimal,
            ],
            direction_ranges: (3..=30).collect(),
            move_ranges: (3..=30).collect(),
            active_thresholds: vec![0.5, 1.0, 1.5, 2.0, 2.5],
            activity_ratios: vec![0.1, 0.2, 0.3, 0.5, 0.75, 1.0],
            time_windows_secs: vec![5, 10, 15, 20, 30, 45, 60, 120],
            optimal_ranges: (3..=30).collect(),
            drawdown_ratios: vec![0.2, 0.3, 0.5],
            market_change_ranges: vec![0.2, 0.5, 1.0],
            last_part_ratios: vec![0.2, 0.3, 0.4],
            take_profit_factors: (1..=11).map(|i| (i * 2) as f64).collect(),
            stop_loss_ratios: (2..=22).map(|i| i as f64 / 10.0).collect(),
            trailing_presets: vec![
                TrailingPreset { start: 0.3, stop: 0.1 },
                TrailingPreset { start: 0.6, stop: 0.2 },
                TrailingPreset { start: 1.0, stop: 0.3 },
            ],
            min_stop_loss_pct: 0.05,
            parameter_batch_size: 5,
            series_length: 600,
            price_cache_ttl_ms: 1000,
        }
    }
}

impl IndicationConfig {
    pub fn validation_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.validation_timeout_secs as i64)
    }

    pub fn position_cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.position_cooldown_ms as i64)
    }

    pub fn is_enabled(&self, indication_type: IndicationType) -> bool {
        self.enabled_types.contains(&indication_type)
    }
}

/// Statistical gates of the base position pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub capacity: u32,
    /// Closed trials at which an under-performing aggregate fails
    pub failure_checkpoint: u32,
    /// Closed trials at which an aggregate is promoted or paused
    pub promotion_checkpoint: u32,
    pub min_win_rate: f64,
    pub activation_win_rate: f64,
    pub activation_profit_ratio: f64,
    pub resume_win_rate: f64,
    pub degrade_win_rate: f64,
    pub max_drawdown_pct: f64,
    /// Per-close decay applied to the recent drawdown before folding in a new close
    pub drawdown_decay: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 250,
            failure_checkpoint: 10,
            promotion_checkpoint: 50,
            min_win_rate: 0.40,
            activation_win_rate: 0.45,
            activation_profit_ratio: 1.2,
            resume_win_rate: 0.43,
            degrade_win_rate: 0.38,
            max_drawdown_pct: 30.0,
            drawdown_decay: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraduationConfig {
    pub main_min_profit_factor: f64,
    pub main_min_positions: u32,
    pub real_min_main_trials: u64,
    pub real_window: usize,
    pub real_min_profit_factor: f64,
    pub real_max_drawdown_hours: f64,
    pub mirror_window: usize,
    pub mirror_min_profit_factor: f64,
    pub mirror_batch_size: usize,
    pub max_mirror_attempts: u32,
}

impl Default for GraduationConfig {
    fn default() -> Self {
        Self {
            main_min_profit_factor: 0.5,
            main_min_positions: 10,
            real_min_main_trials: 10,
            real_window: 20,
            real_min_profit_factor: 0.6,
            real_max_drawdown_hours: 12.0,
            mirror_window: 30,
            mirror_min_profit_factor: 0.6,
            mirror_batch_size: 10,
            max_mirror_attempts: 3,
        }
    }
}

/// Volume and leverage of mirrored positions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Share of the account balance committed as margin per position
    pub position_cost_ratio: f64,
    pub leverage: u32,
    pub max_leverage: u32,
    /// Quantity step the exchange accepts
    pub volume_step: f64,
    pub min_volume: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            position_cost_ratio: 0.02,
            leverage: 10,
            max_leverage: 125,
            volume_step: 0.001,
            min_volume: 0.001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresetConfig {
    pub enabled: bool,
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub take_profit_factor: f64,
    pub stop_loss_ratio: f64,
}

impl Default for PresetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            ema_fast: 9,
            ema_slow: 21,
            take_profit_factor: 10.0,
            stop_loss_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TableBudget {
    pub target: u64,
    pub threshold_percent: f64,
}

impl Default for TableBudget {
    fn default() -> Self {
        Self {
            target: 250,
            threshold_percent: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub interval_secs: u64,
    pub base: TableBudget,
    pub main: TableBudget,
    pub real: TableBudget,
    pub preset: TableBudget,
    pub max_database_bytes: u64,
    /// Fraction of `max_database_bytes` that triggers the aggressive pass
    pub aggressive_ratio: f64,
    pub archive_max_age_days: i64,
    pub market_data_max_age_days: i64,
    pub log_max_age_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            base: TableBudget::default(),
            main: TableBudget::default(),
            real: TableBudget::default(),
            preset: TableBudget::default(),
            max_database_bytes: 20 * 1024 * 1024 * 1024,
            aggressive_ratio: 0.9,
            archive_max_age_days: 90,
            market_data_max_age_days: 30,
            log_max_age_days: 30,
        }
    }
}

impl RetentionConfig {
    pub fn ledger(&self, table: RetentionTable) -> RetentionLedger {
        let budget = match table {
            RetentionTable::Base => self.base,
            RetentionTable::Main => self.main,
            RetentionTable::Real => self.real,
            RetentionTable::Preset => self.preset,
        };
        RetentionLedger {
            table,
            target_count: budget.target,
            threshold_percent: budget.threshold_percent,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_retries: u32,
    /// Base delay; attempt N waits `retry_delay_ms * N`
    pub retry_delay_ms: u64,
    /// Include the submission time in the duplicate-detection key
    pub dedup_include_timestamp: bool,
    pub order_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            dedup_include_timestamp: true,
            order_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub per_second: u32,
    pub per_minute: u32,
    pub max_concurrent: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 10,
            per_minute: 600,
            max_concurrent: 5,
        }
    }
}

/// Rate limits per exchange; unknown exchanges use `default`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitTable {
    pub default: RateLimitConfig,
    pub exchanges: HashMap<String, RateLimitConfig>,
}

impl Default for RateLimitTable {
    fn default() -> Self {
        let exchanges = HashMap::from([
            (
                "bybit".to_string(),
                RateLimitConfig { per_second: 10, per_minute: 600, max_concurrent: 5 },
            ),
            (
                "binance".to_string(),
                RateLimitConfig { per_second: 20, per_minute: 1200, max_concurrent: 10 },
            ),
            (
                "bingx".to_string(),
                RateLimitConfig { per_second: 5, per_minute: 300, max_concurrent: 3 },
            ),
            (
                "paper".to_string(),
                RateLimitConfig { per_second: 50, per_minute: 3000, max_concurrent: 20 },
            ),
        ]);
        Self {
            default: RateLimitConfig::default(),
            exchanges,
        }
    }
}

impl RateLimitTable {
    pub fn for_exchange(&self, exchange: &str) -> RateLimitConfig {
        self.exchanges
            .get(&exchange.to_lowercase())
            .copied()
            .unwrap_or(self.default)
    }
}

/// Simulated exchange used in dry-run mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub initial_balance: f64,
    pub start_price: f64,
    /// Per-tick random walk amplitude in basis points
    pub volatility_bps: f64,
    pub slippage_bps: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            start_price: 100.0,
            volatility_bps: 8.0,
            slippage_bps: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub id: String,
    pub exchange: String,
    pub symbols: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl EngineConfig {
    /// Load configuration from the default file locations and environment
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, reading `path` instead of the default files when
    /// given
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(File::from(path)),
            None => builder
                .add_source(File::with_name("config/default").required(false))
                .add_source(File::with_name("config/local").required(false)),
        };

        let config = builder
            .add_source(
                Environment::with_prefix("ENGINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let engine_config: EngineConfig = config.try_deserialize()?;
        Ok(engine_config)
    }

    /// Connections that should run, optionally narrowed to `only`
    pub fn active_connections(&self, only: &[String]) -> Vec<ConnectionConfig> {
        self.connections
            .iter()
            .filter(|c| c.enabled)
            .filter(|c| only.is_empty() || only.contains(&c.id))
            .cloned()
            .collect()
    }

    /// One-line summary for startup logs
    pub fn digest(&self) -> String {
        format!(
            "connections={} intervals(preset/main/real)={}/{}/{}ms max_concurrency={} validation_timeout={}s max_positions_per_config={}",
            self.connections.len(),
            self.engine.preset_interval_ms,
            self.engine.main_interval_ms,
            self.engine.real_interval_ms,
            self.engine.max_concurrency,
            self.indication.validation_timeout_secs,
            self.indication.max_positions_per_config,
        )
    }
}
