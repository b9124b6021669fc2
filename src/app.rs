// Composition root: builds every component once and wires the loops

use crate::clients::{MarketDataFeed, TradingGateway};
use crate::config::{Config, RuntimeSettings, SettingKey, TradingHours};
use crate::core::execution::{ExecutionMode, Executor};
use crate::core::grid_engine::GridEngine;
use crate::core::grid_session::{GridParams, GridSession};
use crate::core::monitor::MonitorLoop;
use crate::core::position_store::{FlushLoop, PositionStore};
use crate::core::shutdown::{LoopHandle, ShutdownSequencer};
use crate::core::signal_queue::SignalQueue;
use crate::core::strategy::StrategyLoop;
use crate::core::supervisor::{RestartEvent, Supervisor, TaskSlot};
use crate::core::types::{AssetSnapshot, Position, Signal, SignalKind};
use crate::db::{self, Database};
use crate::error::{ControllerError, ControllerResult};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

/// The assembled controller. Components are constructed exactly once here
/// and handed to the loops explicitly; nothing reaches another component
/// through a global.
pub struct App {
    config: Config,
    settings: Arc<RuntimeSettings>,
    database: Arc<Database>,
    store: Arc<PositionStore>,
    queue: Arc<SignalQueue>,
    engine: Arc<GridEngine>,
    monitor: Arc<MonitorLoop>,
    strategy: Arc<StrategyLoop>,
    flusher: Arc<FlushLoop>,
    supervisor: Arc<Supervisor>,
    accepting: Arc<AtomicBool>,
}

impl App {
    pub fn build(
        config: Config,
        gateway: Arc<dyn TradingGateway>,
        feed: Arc<dyn MarketDataFeed>,
    ) -> ControllerResult<Self> {
        config
            .validate()
            .map_err(|e| ControllerError::Config(e.to_string()))?;

        let database = Arc::new(Database::new(&config.store.db_path)?);
        database.run_migrations()?;

        let settings = Arc::new(RuntimeSettings::new(&config, true));
        let hours = TradingHours::parse(&config.hours.windows)
            .map_err(ControllerError::Config)?;

        let store = Arc::new(PositionStore::new());
        let restored = db::position::load_all(database.connection())?;
        if !restored.is_empty() {
            info!("restored durable fields for {} instrument(s)", restored.len());
            store.restore(restored);
        }

        let queue = Arc::new(SignalQueue::new(
            config.signals.staleness_secs,
            config.signals.reprocess_cooldown_secs,
            config.signals.queue_capacity,
        ));

        let engine = Arc::new(GridEngine::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&database),
            config.grid.level_cooldown_secs,
            config.risk.lot_size,
        ));
        let reopened = engine.restore()?;
        if reopened > 0 {
            info!("restored {} open grid session(s)", reopened);
        }

        let mode = if config.account.mode == "live" {
            ExecutionMode::Live
        } else {
            ExecutionMode::Simulated
        };
        let executor = Arc::new(Executor::new(mode, Arc::clone(&gateway), Arc::clone(&store)));

        let monitor = Arc::new(MonitorLoop::new(
            config.account.account_id.clone(),
            mode == ExecutionMode::Live,
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&engine),
            Arc::clone(&gateway),
            feed,
            Arc::clone(&settings),
            hours.clone(),
            config.loops.idle_multiplier,
            Duration::from_secs(config.loops.gateway_timeout_secs),
        ));

        let strategy = Arc::new(StrategyLoop::new(
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::clone(&engine),
            executor,
            Arc::clone(&database),
            Arc::clone(&settings),
            hours,
            config.loops.idle_multiplier,
            Duration::from_secs(config.loops.strategy_interval_secs),
        ));

        let flusher = Arc::new(FlushLoop::new(
            Arc::clone(&store),
            Arc::clone(&database),
            Arc::clone(&settings),
        ));

        let supervisor = Arc::new(Supervisor::new(
            Duration::from_secs(config.loops.supervisor_interval_secs),
            Duration::from_secs(config.loops.supervisor_cooldown_secs),
        ));

        Ok(Self {
            config,
            settings,
            database,
            store,
            queue,
            engine,
            monitor,
            strategy,
            flusher,
            supervisor,
            accepting: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Outbound surface for the web/API layer.
    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            accepting: Arc::clone(&self.accepting),
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            engine: Arc::clone(&self.engine),
            settings: Arc::clone(&self.settings),
            database: Arc::clone(&self.database),
            supervisor: Arc::clone(&self.supervisor),
            gateway_ok: self.monitor.gateway_ok_flag(),
            asset: self.monitor.asset_slot(),
            grid_defaults: self.config.grid.clone(),
        }
    }

    /// Spawn every loop, supervise them, and block until shutdown is
    /// requested; then run the teardown sequence.
    pub async fn run(self) -> ControllerResult<()> {
        info!("controller starting (account {})", self.config.account.account_id);

        let monitor_slot = TaskSlot::new();
        let strategy_slot = TaskSlot::new();
        let flush_slot = TaskSlot::new();

        monitor_slot.set(tokio::spawn(Arc::clone(&self.monitor).run()));
        strategy_slot.set(tokio::spawn(Arc::clone(&self.strategy).run()));
        flush_slot.set(tokio::spawn(Arc::clone(&self.flusher).run()));

        let monitor = Arc::clone(&self.monitor);
        self.supervisor
            .register("monitor", monitor_slot.clone(), move || {
                tokio::spawn(Arc::clone(&monitor).run())
            });
        let strategy = Arc::clone(&self.strategy);
        self.supervisor
            .register("strategy", strategy_slot.clone(), move || {
                tokio::spawn(Arc::clone(&strategy).run())
            });
        let flusher = Arc::clone(&self.flusher);
        self.supervisor
            .register("durable-flush", flush_slot.clone(), move || {
                tokio::spawn(Arc::clone(&flusher).run())
            });

        let supervisor_slot = TaskSlot::new();
        supervisor_slot.set(tokio::spawn(Arc::clone(&self.supervisor).run()));

        info!("controller running, press Ctrl-C to stop");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", e);
        }

        let sequencer = ShutdownSequencer::new(
            Arc::clone(&self.accepting),
            self.supervisor.stop_flag(),
            supervisor_slot,
            vec![
                LoopHandle {
                    name: "monitor".to_string(),
                    stop: self.monitor.stop_flag(),
                    slot: monitor_slot,
                },
                LoopHandle {
                    name: "strategy".to_string(),
                    stop: self.strategy.stop_flag(),
                    slot: strategy_slot,
                },
                LoopHandle {
                    name: "durable-flush".to_string(),
                    stop: self.flusher.stop_flag(),
                    slot: flush_slot,
                },
            ],
            Arc::clone(&self.flusher),
            Duration::from_secs(self.config.loops.shutdown_join_secs),
        );
        sequencer.run().await;
        Ok(())
    }
}

/// Controller status as the API layer sees it. Failures surface here as
/// fields, not as errors.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub version: u64,
    pub trading_enabled: bool,
    pub gateway_connected: bool,
    pub pending_signals: usize,
    pub asset: Option<AssetSnapshot>,
    pub restarts: Vec<RestartEvent>,
}

/// Commands and reads exposed to the control plane. Every command maps 1:1
/// onto a core operation and none bypass validation; commands are refused
/// once shutdown has begun.
pub struct ControlHandle {
    accepting: Arc<AtomicBool>,
    store: Arc<PositionStore>,
    queue: Arc<SignalQueue>,
    engine: Arc<GridEngine>,
    settings: Arc<RuntimeSettings>,
    database: Arc<Database>,
    supervisor: Arc<Supervisor>,
    gateway_ok: Arc<AtomicBool>,
    asset: Arc<Mutex<Option<AssetSnapshot>>>,
    grid_defaults: crate::config::GridDefaults,
}

impl ControlHandle {
    fn guard(&self) -> ControllerResult<()> {
        if self.accepting.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(ControllerError::ShuttingDown)
        }
    }

    pub fn positions(&self) -> (Vec<Position>, u64) {
        self.store.read_all()
    }

    pub fn position(&self, instrument: &str) -> Option<(Position, u64)> {
        self.store.read(instrument)
    }

    /// Change-detection cursor for polling clients.
    pub fn version(&self) -> u64 {
        self.store.version()
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            version: self.store.version(),
            trading_enabled: self.settings.trading_enabled(),
            gateway_connected: self.gateway_ok.load(Ordering::Relaxed),
            pending_signals: self.queue.pending_count(),
            asset: self.asset.lock().unwrap().clone(),
            restarts: self.supervisor.restart_history(),
        }
    }

    /// Manual signal; it joins the queue like any detected one and passes
    /// through the same validation in the execution loop.
    pub fn submit_signal(
        &self,
        instrument: &str,
        kind: SignalKind,
        volume: Option<f64>,
        price: f64,
    ) -> ControllerResult<()> {
        self.guard()?;
        let accepted = self.queue.enqueue(Signal::new(instrument, kind, volume, price));
        if accepted {
            Ok(())
        } else {
            Err(ControllerError::Validation("signal queue full".to_string()))
        }
    }

    /// Operator confirmation of a new grid session. `params` defaults come
    /// from configuration and can be overridden per session.
    pub fn create_grid_session(
        &self,
        instrument: &str,
        params: Option<GridParams>,
    ) -> ControllerResult<String> {
        self.guard()?;
        let params = params.unwrap_or_else(|| GridParams {
            price_interval: self.grid_defaults.price_interval,
            sell_ratio: self.grid_defaults.sell_ratio,
            buy_amount: self.grid_defaults.buy_amount,
            callback_ratio: self.grid_defaults.callback_ratio,
            max_investment: self.grid_defaults.max_investment,
            max_deviation: self.grid_defaults.max_deviation,
            target_profit: self.grid_defaults.target_profit,
            stop_loss: self.grid_defaults.stop_loss,
            max_duration_days: self.grid_defaults.max_duration_days,
        });
        self.engine.create_session(instrument, params)
    }

    pub fn stop_grid_session(&self, instrument: &str) -> ControllerResult<()> {
        self.guard()?;
        self.engine.stop_session(instrument)
    }

    pub fn grid_sessions(&self) -> Vec<GridSession> {
        self.engine.sessions()
    }

    /// Hot-reload one setting through the typed registry; the change lands
    /// in the config history with its source.
    pub fn update_setting(&self, key: &str, value: &str, source: &str) -> ControllerResult<()> {
        self.guard()?;
        let setting = SettingKey::parse(key).ok_or_else(|| {
            ControllerError::Config(format!("'{}' is not hot-reloadable", key))
        })?;
        let (old, new) = self
            .settings
            .apply(setting, value)
            .map_err(|e| ControllerError::Config(e.to_string()))?;
        db::config_store::record_change(
            self.database.connection(),
            setting.as_str(),
            &old,
            &new,
            source,
        )?;
        info!("setting {} changed {} -> {} ({})", key, old, new, source);
        Ok(())
    }

    pub fn config_history(&self, limit: usize) -> ControllerResult<Vec<db::config_store::ConfigChange>> {
        Ok(db::config_store::history(self.database.connection(), limit)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::SimGateway;
    use crate::core::types::PositionSnapshot;

    fn app_fixture() -> App {
        let mut config = Config::default();
        config.store.db_path = ":memory:".to_string();
        let gateway = Arc::new(SimGateway::new(1_000_000.0));
        gateway.set_price("600036", 10.0);
        let app = App::build(
            config,
            Arc::clone(&gateway) as Arc<dyn TradingGateway>,
            gateway as Arc<dyn MarketDataFeed>,
        )
        .unwrap();
        app.store
            .sync(&[PositionSnapshot {
                instrument: "600036".to_string(),
                name: "CMB".to_string(),
                held_volume: 10_000.0,
                available_volume: 10_000.0,
                avg_cost: 10.0,
            }])
            .unwrap();
        app.store.update_price("600036", 10.0);
        app
    }

    #[tokio::test]
    async fn test_control_reads_and_version_cursor() {
        let app = app_fixture();
        let control = app.control();

        let v0 = control.version();
        app.store.update_price("600036", 10.1);
        assert!(control.version() > v0);

        let (positions, version) = control.positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(version, control.version());
        assert!(control.position("600036").is_some());
    }

    #[tokio::test]
    async fn test_update_setting_writes_history() {
        let app = app_fixture();
        let control = app.control();

        control.update_setting("trading_enabled", "false", "test").unwrap();
        assert!(!app.settings.trading_enabled());

        let history = control.config_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].key, "trading_enabled");
        assert_eq!(history[0].old_value, "true");
        assert_eq!(history[0].new_value, "false");

        let err = control.update_setting("db_path", "/tmp/x", "test").unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[tokio::test]
    async fn test_commands_refused_after_shutdown_begins() {
        let app = app_fixture();
        let control = app.control();

        app.accepting.store(false, Ordering::Relaxed);
        assert!(matches!(
            control.submit_signal("600036", SignalKind::StopLoss, Some(100.0), 9.2),
            Err(ControllerError::ShuttingDown)
        ));
        assert!(matches!(
            control.create_grid_session("600036", None),
            Err(ControllerError::ShuttingDown)
        ));
        // Reads stay available for the status page.
        let _ = control.status();
        let _ = control.positions();
    }

    #[tokio::test]
    async fn test_status_serializes_for_the_api_layer() {
        let app = app_fixture();
        let status = app.control().status();
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("trading_enabled"));
        assert!(json.contains("gateway_connected"));
    }

    #[tokio::test]
    async fn test_grid_session_through_control_plane() {
        let app = app_fixture();
        let control = app.control();

        let id = control.create_grid_session("600036", None).unwrap();
        assert_eq!(control.grid_sessions().len(), 1);
        assert_eq!(control.grid_sessions()[0].id, id);

        control.stop_grid_session("600036").unwrap();
        assert!(control.grid_sessions()[0].status.is_terminal());
    }
}
