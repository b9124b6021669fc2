// Execution loop: drains the signal queue, arbitrates, validates, executes

use crate::config::{RuntimeSettings, TradingHours};
use crate::core::execution::Executor;
use crate::core::grid_engine::GridEngine;
use crate::core::grid_session::ExitReason;
use crate::core::position_store::PositionStore;
use crate::core::signal_queue::SignalQueue;
use crate::core::types::{Signal, SignalKind};
use crate::db::{self, Database};
use crate::error::ControllerResult;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Consumes the signal queue. This is the only place the global
/// trading-enable flag is consulted; detection upstream runs regardless.
pub struct StrategyLoop {
    queue: Arc<SignalQueue>,
    store: Arc<PositionStore>,
    engine: Arc<GridEngine>,
    executor: Arc<Executor>,
    database: Arc<Database>,
    settings: Arc<RuntimeSettings>,
    hours: TradingHours,
    idle_multiplier: u32,
    interval: Duration,
    stop: Arc<AtomicBool>,
}

impl StrategyLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<SignalQueue>,
        store: Arc<PositionStore>,
        engine: Arc<GridEngine>,
        executor: Arc<Executor>,
        database: Arc<Database>,
        settings: Arc<RuntimeSettings>,
        hours: TradingHours,
        idle_multiplier: u32,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            engine,
            executor,
            database,
            settings,
            hours,
            idle_multiplier,
            interval,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub async fn run(self: Arc<Self>) {
        debug!("strategy loop started");
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.run_once().await {
                error!("strategy iteration aborted: {}", e);
            }
            let sleep = if self.hours.is_open(Utc::now().time()) {
                self.interval
            } else {
                self.interval * self.idle_multiplier.max(1)
            };
            tokio::time::sleep(sleep).await;
        }
        debug!("strategy loop stopped");
    }

    /// Drain and process everything currently pending. Public so tests can
    /// drive single iterations.
    pub async fn run_once(&self) -> ControllerResult<()> {
        let signals = self.queue.drain();
        if signals.is_empty() {
            return Ok(());
        }

        // Priority arbitration: an instrument with a pending risk signal
        // drops its grid signals for this round, and its active grid
        // session is force-exited before the risk action runs.
        let risk_instruments: HashSet<String> = signals
            .iter()
            .filter(|s| s.kind.is_risk())
            .map(|s| s.instrument.clone())
            .collect();

        for signal in signals {
            if !signal.kind.is_risk() && risk_instruments.contains(&signal.instrument) {
                debug!(
                    "dropping {} for {}: risk signal pending",
                    signal.kind.as_str(),
                    signal.instrument
                );
                continue;
            }
            if signal.kind.is_risk() && self.engine.has_active(&signal.instrument) {
                self.engine
                    .force_exit(&signal.instrument, ExitReason::ForcedByRisk);
            }
            self.process(signal).await;
        }
        Ok(())
    }

    async fn process(&self, signal: Signal) {
        // A grid exit with nothing left to liquidate is bookkeeping only.
        if signal.kind == SignalKind::GridExit && signal.volume.is_none() {
            self.queue.mark_processed(&signal.instrument, signal.kind);
            info!("grid exit for {} completed (nothing to sell)", signal.instrument);
            return;
        }

        if let Err(rejection) = self.queue.validate(&signal, &self.store) {
            debug!(
                "{} for {} rejected: {}",
                signal.kind.as_str(),
                signal.instrument,
                rejection
            );
            return;
        }

        if !self.settings.trading_enabled() {
            debug!(
                "trading disabled, {} for {} detected but not executed",
                signal.kind.as_str(),
                signal.instrument
            );
            return;
        }

        match self.executor.execute(&signal).await {
            Ok(fill) => {
                self.queue.mark_processed(&signal.instrument, signal.kind);
                self.record_trade(&signal, &fill.order_id, fill.volume, fill.amount);
                self.after_fill(&signal, fill.price, fill.volume, fill.amount);
            }
            Err(e) if e.is_transient() => {
                // The order did not go through; the next detection cycle
                // will re-emit if the condition still holds.
                warn!(
                    "{} for {} not executed: {}",
                    signal.kind.as_str(),
                    signal.instrument,
                    e
                );
            }
            Err(e) => {
                error!(
                    "{} for {} failed: {}",
                    signal.kind.as_str(),
                    signal.instrument,
                    e
                );
            }
        }
    }

    fn record_trade(&self, signal: &Signal, order_id: &str, volume: f64, amount: f64) {
        let record = db::trade::TradeRecord {
            id: None,
            instrument: signal.instrument.clone(),
            side: signal.kind.side().as_str().to_string(),
            price: signal.price,
            volume,
            amount,
            order_id: order_id.to_string(),
            strategy: signal.kind.as_str().to_string(),
            created_at: None,
        };
        if let Err(e) = db::trade::insert(self.database.connection(), &record) {
            error!("failed to record trade for {}: {}", signal.instrument, e);
        }
    }

    /// Strategy-side state transitions that follow a successful fill.
    fn after_fill(&self, signal: &Signal, price: f64, volume: f64, amount: f64) {
        match signal.kind {
            SignalKind::InitialTakeProfit => {
                let result = self.store.mutate_durable(&signal.instrument, |d| {
                    d.profit_triggered = true;
                    d.highest_price = d.highest_price.max(price);
                });
                if let Err(e) = result {
                    error!("failed to mark profit trigger: {}", e);
                }
            }
            SignalKind::GridBuy | SignalKind::GridSell => {
                let buy = signal.kind == SignalKind::GridBuy;
                if let Err(e) = self
                    .engine
                    .record_fill(&signal.instrument, buy, price, volume, amount)
                {
                    // The session may have been force-exited between
                    // detection and fill; the trade record above still holds.
                    warn!("grid fill not recorded for {}: {}", signal.instrument, e);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::SimGateway;
    use crate::core::execution::ExecutionMode;
    use crate::core::grid_session::{GridParams, SessionStatus};
    use crate::core::types::PositionSnapshot;
    use crate::config::Config;

    struct Fixture {
        queue: Arc<SignalQueue>,
        store: Arc<PositionStore>,
        engine: Arc<GridEngine>,
        settings: Arc<RuntimeSettings>,
        strategy: Arc<StrategyLoop>,
        database: Arc<Database>,
    }

    fn fixture(trading_enabled: bool) -> Fixture {
        let config = Config::default();
        let store = Arc::new(PositionStore::new());
        store
            .sync(&[PositionSnapshot {
                instrument: "600036".to_string(),
                name: "CMB".to_string(),
                held_volume: 10_000.0,
                available_volume: 10_000.0,
                avg_cost: 10.0,
            }])
            .unwrap();
        store.update_price("600036", 10.0);

        let queue = Arc::new(SignalQueue::new(60, 300, 64));
        let database = Arc::new(Database::new_in_memory().unwrap());
        database.run_migrations().unwrap();
        let engine = Arc::new(GridEngine::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&database),
            60,
            100.0,
        ));
        let gateway = Arc::new(SimGateway::new(1_000_000.0));
        let executor = Arc::new(Executor::new(
            ExecutionMode::Simulated,
            gateway,
            Arc::clone(&store),
        ));
        let settings = Arc::new(RuntimeSettings::new(&config, trading_enabled));
        let hours = TradingHours::parse(&["00:00-23:59".to_string()]).unwrap();

        let strategy = Arc::new(StrategyLoop::new(
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::clone(&engine),
            executor,
            Arc::clone(&database),
            Arc::clone(&settings),
            hours,
            1,
            Duration::from_secs(1),
        ));

        Fixture {
            queue,
            store,
            engine,
            settings,
            strategy,
            database,
        }
    }

    #[tokio::test]
    async fn test_execution_disabled_leaves_positions_untouched() {
        let f = fixture(false);
        f.queue
            .enqueue(Signal::new("600036", SignalKind::StopLoss, Some(10_000.0), 9.2));

        f.strategy.run_once().await.unwrap();

        let (position, _) = f.store.read("600036").unwrap();
        assert_eq!(position.held_volume, 10_000.0);
        // Not marked processed: enabling trading later lets a fresh
        // detection execute immediately.
        f.queue
            .enqueue(Signal::new("600036", SignalKind::StopLoss, Some(10_000.0), 9.2));
        f.settings.set_trading_enabled(true);
        f.strategy.run_once().await.unwrap();
        let (position, _) = f.store.read("600036").unwrap();
        assert_eq!(position.held_volume, 0.0);
    }

    #[tokio::test]
    async fn test_risk_beats_grid_and_force_exits_session() {
        let f = fixture(true);

        // Stand up an active grid session.
        f.engine
            .create_session("600036", GridParams {
                price_interval: 0.05,
                sell_ratio: 0.2,
                buy_amount: 10_000.0,
                callback_ratio: 0.005,
                max_investment: 50_000.0,
                max_deviation: 0.20,
                target_profit: 0.15,
                stop_loss: -0.10,
                max_duration_days: 90,
            })
            .unwrap();
        let opening = f.queue.drain();
        f.engine
            .record_fill("600036", true, 10.0, opening[0].volume.unwrap(), 10_000.0)
            .unwrap();
        assert!(f.engine.has_active("600036"));

        // A grid sell and a stop loss arrive together.
        f.queue
            .enqueue(Signal::new("600036", SignalKind::GridSell, Some(2000.0), 10.5));
        f.queue
            .enqueue(Signal::new("600036", SignalKind::StopLoss, Some(10_000.0), 9.2));

        f.strategy.run_once().await.unwrap();

        // The stop loss won: grid session force-exited, position cleared.
        let session = f.engine.session("600036").unwrap();
        assert_eq!(session.status, SessionStatus::ForceExited);
        let (position, _) = f.store.read("600036").unwrap();
        assert_eq!(position.held_volume, 0.0);
    }

    #[tokio::test]
    async fn test_fill_records_trade_and_cooldown() {
        let f = fixture(true);
        f.queue
            .enqueue(Signal::new("600036", SignalKind::InitialTakeProfit, Some(5000.0), 11.0));

        f.strategy.run_once().await.unwrap();

        let (position, _) = f.store.read("600036").unwrap();
        assert_eq!(position.held_volume, 5000.0);
        assert!(position.durable.profit_triggered);

        let trades = db::trade::list_recent(f.database.connection(), 10).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].strategy, "INITIAL_TAKE_PROFIT");

        // An identical signal inside the cooldown window is rejected.
        f.queue
            .enqueue(Signal::new("600036", SignalKind::InitialTakeProfit, Some(5000.0), 11.0));
        f.strategy.run_once().await.unwrap();
        let (position, _) = f.store.read("600036").unwrap();
        assert_eq!(position.held_volume, 5000.0);
    }

    #[tokio::test]
    async fn test_grid_fill_rebuilds_session() {
        let f = fixture(true);
        f.engine
            .create_session("600036", GridParams {
                price_interval: 0.05,
                sell_ratio: 0.2,
                buy_amount: 10_000.0,
                callback_ratio: 0.005,
                max_investment: 50_000.0,
                max_deviation: 0.20,
                target_profit: 0.15,
                stop_loss: -0.10,
                max_duration_days: 90,
            })
            .unwrap();

        // Let the opening buy flow through the pipeline end to end.
        f.strategy.run_once().await.unwrap();

        let session = f.engine.session("600036").unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.buy_count, 1);
        assert!((session.current_center - 10.0).abs() < 1e-9);
    }
}
