use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio_test::assert_ok;

use trade_engine::config::{
    ConnectionConfig, EngineConfig, ExecutorConfig, GraduationConfig, IndicationConfig, PaperConfig,
    PoolConfig, SizingConfig,
};
use trade_engine::db::MemoryStore;
use trade_engine::engine::{EngineServices, TradeEngine};
use trade_engine::execution::{ConnectorRegistry, OrderExecutor, PaperConnector, RateLimiterRegistry};
use trade_engine::graduation::GraduationCoordinator;
use trade_engine::indication::IndicationDetector;
use trade_engine::persistence::{MemoryPriceHistory, PriceHistory};
use trade_engine::pool::PoolManager;
use trade_engine::{
    CloseReason, Direction, EngineStatus, ExchangePositionStatus, IndicationType, LoopKind,
    OrderStatus, Phase, PriceTick, RealStatus, TrialLevel, TrialStatus,
};

const CONNECTION: &str = "paper-1";
const SYMBOL: &str = "BTCUSDT";

fn indication_config() -> IndicationConfig {
    IndicationConfig {
        enabled_types: vec![IndicationType::Direction],
        direction_ranges: vec![3],
        take_profit_factors: vec![10.0],
        stop_loss_ratios: vec![1.0],
        trailing_presets: vec![],
        validation_timeout_secs: 0,
        ..IndicationConfig::default()
    }
}

fn quiet_paper() -> PaperConfig {
    PaperConfig {
        volatility_bps: 0.0,
        ..PaperConfig::default()
    }
}

fn rising(prices: &[f64], now: DateTime<Utc>) -> Vec<PriceTick> {
    let n = prices.len() as i64;
    prices
        .iter()
        .enumerate()
        .map(|(i, p)| PriceTick::new(*p, now - Duration::seconds(n - i as i64)))
        .collect()
}

struct Pipeline {
    store: Arc<MemoryStore>,
    connector: Arc<PaperConnector>,
    detector: IndicationDetector,
    coordinator: GraduationCoordinator,
}

fn pipeline() -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    let indication = indication_config();
    let pool = Arc::new(PoolManager::new(store.clone(), PoolConfig::default(), &indication));
    let detector = IndicationDetector::new(store.clone(), pool.clone(), indication);

    let connector = Arc::new(PaperConnector::new("paper", quiet_paper(), 1));
    let limiters = RateLimiterRegistry::new(EngineConfig::default().rate_limits);
    let executor = Arc::new(OrderExecutor::new(
        store.clone(),
        connector.clone(),
        limiters.for_exchange("paper"),
        ExecutorConfig::default(),
    ));
    let coordinator = GraduationCoordinator::new(
        store.clone(),
        pool,
        executor,
        GraduationConfig {
            main_min_positions: 2,
            real_min_main_trials: 1,
            ..GraduationConfig::default()
        },
        SizingConfig::default(),
    );

    Pipeline {
        store,
        connector,
        detector,
        coordinator,
    }
}

#[tokio::test]
async fn test_indication_to_exchange_and_back() {
    let p = pipeline();
    let now = Utc::now();
    let levels = [TrialLevel::Base, TrialLevel::Main];

    // Three rising steps fire a long Direction indication
    let detection = assert_ok!(
        p.detector
            .detect_symbol(CONNECTION, SYMBOL, &rising(&[100.0, 101.0, 102.0, 103.0], now), now)
            .await
    );
    assert_eq!(detection.fired, 1);
    assert_eq!(detection.trials_opened, 1);
    let trials = p.store.trials();
    assert_eq!(trials[0].level, TrialLevel::Base);
    assert_eq!(trials[0].direction(), Direction::Long);

    // The open slot refuses a second trial of the same configuration
    let again = assert_ok!(
        p.detector
            .detect_symbol(CONNECTION, SYMBOL, &rising(&[100.0, 101.0, 102.0, 103.0], now), now)
            .await
    );
    assert_eq!(again.trials_refused, 1);

    let marks = assert_ok!(p.coordinator.mark_trials(CONNECTION, SYMBOL, &levels, 105.0, now).await);
    assert_eq!(marks.closed, 1);
    assert_eq!(marks.promoted, 0);

    // Second winning base trial qualifies the configuration for main
    let later = now + Duration::seconds(5);
    assert_ok!(
        p.detector
            .detect_symbol(CONNECTION, SYMBOL, &rising(&[103.0, 104.0, 105.0, 106.0], later), later)
            .await
    );
    let marks = assert_ok!(p.coordinator.mark_trials(CONNECTION, SYMBOL, &levels, 108.0, later).await);
    assert_eq!(marks.closed, 1);
    assert_eq!(marks.promoted, 1);

    let aggregates = p.store.aggregates();
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].total_positions, 2);
    assert_eq!(aggregates[0].winning_positions, 2);
    assert_eq!(aggregates[0].phase, Phase::Evaluating);

    let main: Vec<_> = p
        .store
        .trials()
        .into_iter()
        .filter(|t| t.level == TrialLevel::Main)
        .collect();
    assert_eq!(main.len(), 1);
    assert_eq!(main[0].entry_price, 108.0);

    // The main trial takes profit and validates a real position
    let marks = assert_ok!(p.coordinator.mark_trials(CONNECTION, SYMBOL, &levels, 110.0, later).await);
    assert_eq!(marks.closed, 1);
    assert_eq!(marks.promoted, 1);
    let reals = p.store.real_positions();
    assert_eq!(reals.len(), 1);
    assert_eq!(reals[0].status, RealStatus::Validated);

    // Mirror onto the paper exchange
    p.connector.set_price(SYMBOL, 110.0);
    let mirror = assert_ok!(p.coordinator.mirror_sweep(CONNECTION).await);
    assert_eq!(mirror.mirrored, 1);
    assert_eq!(p.store.real_positions()[0].status, RealStatus::Mirrored);

    let positions = p.store.exchange_positions();
    assert_eq!(positions.len(), 1);
    let position = &positions[0];
    assert_eq!(position.status, ExchangePositionStatus::Open);
    assert!(position.volume > 0.0);
    assert_eq!(position.leverage, 10);

    // A second sweep finds nothing left to mirror
    let mirror = assert_ok!(p.coordinator.mirror_sweep(CONNECTION).await);
    assert_eq!(mirror.considered, 0);

    // Take profit on the exchange position
    let exit = position.take_profit_price * 1.001;
    p.connector.set_price(SYMBOL, exit);
    let marks = assert_ok!(p.coordinator.mark_exchange_positions(CONNECTION, SYMBOL, exit).await);
    assert_eq!(marks.closed, 1);

    let closed = &p.store.exchange_positions()[0];
    assert_eq!(closed.status, ExchangePositionStatus::Closed);
    assert_eq!(closed.close_reason, Some(CloseReason::TakeProfit));
    assert!(closed.realized_pnl.unwrap() > 0.0);

    let orders = p.store.orders();
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|o| o.status == OrderStatus::Filled));
    assert_eq!(orders.iter().filter(|o| o.reduce_only).count(), 1);

    assert!(p
        .store
        .trials()
        .iter()
        .all(|t| t.status == TrialStatus::Closed));
}

#[tokio::test]
async fn test_engine_runs_all_three_loops_on_paper_exchange() {
    let store = Arc::new(MemoryStore::new());
    let history = Arc::new(MemoryPriceHistory::new(600));

    let mut config = EngineConfig::default();
    config.engine.preset_interval_ms = 15;
    config.engine.main_interval_ms = 10;
    config.engine.real_interval_ms = 5;
    config.indication = indication_config();
    config.paper = PaperConfig {
        volatility_bps: 20.0,
        ..PaperConfig::default()
    };

    let mut connectors = ConnectorRegistry::new();
    connectors.register(Arc::new(PaperConnector::new("paper", config.paper.clone(), 42)));
    let services = EngineServices {
        store: store.clone(),
        history: history.clone(),
        connectors: Arc::new(connectors),
        limiters: Arc::new(RateLimiterRegistry::new(config.rate_limits.clone())),
    };

    let connection = ConnectionConfig {
        id: CONNECTION.to_string(),
        exchange: "paper".to_string(),
        symbols: vec![SYMBOL.to_string(), "ETHUSDT".to_string()],
        enabled: true,
    };

    let mut engine = assert_ok!(TradeEngine::new(&connection, &config, &services));
    assert_ok!(engine.start().await);
    assert!(engine.is_running());
    assert!(engine.start().await.is_err());

    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    assert_ok!(engine.stop().await);
    assert!(!engine.is_running());

    let state = store.engine_state(CONNECTION).unwrap();
    assert_eq!(state.status, EngineStatus::Stopped);
    for kind in [LoopKind::Preset, LoopKind::Main, LoopKind::Real] {
        let stats = &state.loops[&kind];
        assert!(stats.cycle_count >= 2, "{} loop ran {} cycles", kind, stats.cycle_count);
        assert_eq!(stats.symbol_count, 2);
    }
    assert_eq!(state.loops[&LoopKind::Main].success_rate, 1.0);

    // The main loop sampled both symbols into the price history
    assert!(history.recent(CONNECTION, SYMBOL, 10).await.unwrap().len() >= 2);
    assert!(history.recent(CONNECTION, "ETHUSDT", 10).await.unwrap().len() >= 2);
}
