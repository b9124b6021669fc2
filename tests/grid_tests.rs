// Grid session lifecycle integration tests

mod common;

use common::*;
use gridpilot::clients::{MarketDataFeed, SimGateway, TradingGateway};
use gridpilot::core::GridParams;
use gridpilot::{
    Database, ExecutionMode, Executor, GridEngine, MonitorLoop, RuntimeSettings, SessionStatus,
    StrategyLoop, TradingHours,
};
use std::sync::Arc;
use std::time::Duration;

struct GridRig {
    store: Arc<gridpilot::PositionStore>,
    queue: Arc<gridpilot::SignalQueue>,
    engine: Arc<GridEngine>,
    monitor: Arc<MonitorLoop>,
    strategy: Arc<StrategyLoop>,
    database: Arc<Database>,
}

fn build_rig() -> GridRig {
    let config = create_test_config();
    let store = create_test_store("600036", 10_000.0, 10.0, 10.0);
    let queue = create_test_queue();
    let database = create_test_database();
    let settings = Arc::new(RuntimeSettings::new(&config, true));
    let hours = TradingHours::parse(&config.hours.windows).unwrap();
    let gateway = Arc::new(SimGateway::new(1_000_000.0));

    let engine = Arc::new(GridEngine::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&database),
        config.grid.level_cooldown_secs,
        config.risk.lot_size,
    ));
    let executor = Arc::new(Executor::new(
        ExecutionMode::Simulated,
        Arc::clone(&gateway) as Arc<dyn TradingGateway>,
        Arc::clone(&store),
    ));
    let monitor = Arc::new(MonitorLoop::new(
        "test-account".to_string(),
        false,
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&engine),
        Arc::clone(&gateway) as Arc<dyn TradingGateway>,
        Arc::new(SimGateway::new(0.0)) as Arc<dyn MarketDataFeed>,
        Arc::clone(&settings),
        hours.clone(),
        1,
        Duration::from_millis(100),
    ));
    let strategy = Arc::new(StrategyLoop::new(
        Arc::clone(&queue),
        Arc::clone(&store),
        Arc::clone(&engine),
        executor,
        Arc::clone(&database),
        settings,
        hours,
        1,
        Duration::from_millis(10),
    ));

    GridRig {
        store,
        queue,
        engine,
        monitor,
        strategy,
        database,
    }
}

fn grid_params() -> GridParams {
    GridParams {
        price_interval: 0.05,
        sell_ratio: 0.2,
        buy_amount: 10_000.0,
        callback_ratio: 0.005,
        max_investment: 50_000.0,
        max_deviation: 0.20,
        target_profit: 0.15,
        stop_loss: -0.10,
        max_duration_days: 90,
    }
}

/// Drive one detection plus one execution round at the given price.
async fn step(rig: &GridRig, price: f64) {
    rig.store.update_price("600036", price);
    rig.monitor.run_once().await.unwrap();
    rig.strategy.run_once().await.unwrap();
}

#[tokio::test]
async fn test_full_session_lifecycle_sell_leg() {
    let rig = build_rig();

    let id = rig.engine.create_session("600036", grid_params()).unwrap();
    assert_eq!(
        rig.engine.session("600036").unwrap().status,
        SessionStatus::Pending
    );

    // The opening buy flows through validation and execution.
    rig.strategy.run_once().await.unwrap();
    let session = rig.engine.session("600036").unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.buy_count, 1);
    let (position, _) = rig.store.read("600036").unwrap();
    assert_eq!(position.held_volume, 11_000.0);

    // Rise through the upper level, peak, and call back past the ratio.
    step(&rig, 10.60).await;
    assert_eq!(rig.engine.session("600036").unwrap().trade_count, 1);
    step(&rig, 10.52).await;

    let session = rig.engine.session("600036").unwrap();
    assert_eq!(session.trade_count, 2);
    assert_eq!(session.sell_count, 1);
    // Rebuilt around the fill.
    assert!((session.current_center - 10.52).abs() < 1e-9);
    assert!((session.locked_center - 10.0).abs() < 1e-9);

    // 20% of the 11,000 held, lot-rounded.
    let (position, _) = rig.store.read("600036").unwrap();
    assert_eq!(position.held_volume, 8800.0);

    // Both fills are in the durable grid_trades table.
    let trades = gridpilot::db::grid::list_trades(rig.database.connection(), &id).unwrap();
    assert_eq!(trades.len(), 2);
    let sell = trades.iter().find(|t| t.side == "SELL").unwrap();
    assert!((sell.extremum_price - 10.60).abs() < 1e-9);
}

#[tokio::test]
async fn test_deviation_exit_liquidates_through_pipeline() {
    let rig = build_rig();
    let mut params = grid_params();
    params.max_deviation = 0.03;

    rig.engine.create_session("600036", params).unwrap();
    rig.strategy.run_once().await.unwrap();
    assert!(rig.engine.has_active("600036"));

    // Fall through the lower level, rebound: a grid buy fills at 9.55 and
    // moves the center 4.5% from the locked center, past the 3% cap.
    step(&rig, 9.45).await;
    step(&rig, 9.40).await;
    step(&rig, 9.55).await;

    // The rebuild happened, then the next tick sees the deviation.
    step(&rig, 9.55).await;

    let session = rig.engine.session("600036").unwrap();
    assert_eq!(session.status, SessionStatus::Exited);

    // The exit liquidation sold the session's net inventory.
    let trades =
        gridpilot::db::trade::list_recent(rig.database.connection(), 10).unwrap();
    assert!(trades.iter().any(|t| t.strategy == "GRID_EXIT"));
}

#[tokio::test]
async fn test_sessions_survive_restart_with_fresh_trackers() {
    let rig = build_rig();
    rig.engine.create_session("600036", grid_params()).unwrap();
    rig.strategy.run_once().await.unwrap();

    // Arm the tracker so there is watch state to lose.
    step(&rig, 10.60).await;

    // A new engine over the same database is a process restart.
    let engine2 = Arc::new(GridEngine::new(
        Arc::clone(&rig.store),
        create_test_queue(),
        Arc::clone(&rig.database),
        60,
        100.0,
    ));
    let restored = engine2.restore().unwrap();
    assert_eq!(restored, 1);

    let session = engine2.session("600036").unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.buy_count, 1);
    assert!((session.locked_center - 10.0).abs() < 1e-9);

    // The restored tracker has no memory of the 10.60 peak: a fresh 10.52
    // tick emits nothing even though the old watch would have sold.
    let queue2 = create_test_queue();
    let engine3 = Arc::new(GridEngine::new(
        Arc::clone(&rig.store),
        Arc::clone(&queue2),
        Arc::clone(&rig.database),
        60,
        100.0,
    ));
    engine3.restore().unwrap();
    engine3.tick("600036", 10.52, chrono::Utc::now());
    assert_eq!(queue2.pending_count(), 0);
}

#[tokio::test]
async fn test_operator_stop_is_terminal() {
    let rig = build_rig();
    rig.engine.create_session("600036", grid_params()).unwrap();
    rig.strategy.run_once().await.unwrap();

    rig.engine.stop_session("600036").unwrap();
    let session = rig.engine.session("600036").unwrap();
    assert_eq!(session.status, SessionStatus::ForceExited);

    // Terminal sessions ignore further ticks.
    step(&rig, 10.60).await;
    step(&rig, 10.52).await;
    assert_eq!(rig.engine.session("600036").unwrap().trade_count, 1);
    assert_eq!(rig.queue.pending_count(), 0);
}
