// Monitor loop: gateway sync, price updates, and condition detection

use crate::clients::{MarketDataFeed, TradingGateway};
use crate::config::{RiskConfig, RuntimeSettings, TradingHours};
use crate::core::grid_engine::GridEngine;
use crate::core::position_store::PositionStore;
use crate::core::signal_queue::SignalQueue;
use crate::core::types::{round_to_lot, AssetSnapshot, Position, Signal, SignalKind};
use crate::error::{ControllerError, ControllerResult};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// The periodic detection loop. Reads external position/price state, writes
/// the store, and enqueues whatever conditions it finds. Detection never
/// consults the trading-enable flag; that decision belongs to the execution
/// loop alone.
pub struct MonitorLoop {
    account: String,
    /// Live mode syncs positions from the gateway every cycle; in simulated
    /// mode the store is authoritative and only prices are refreshed.
    sync_positions: bool,
    store: Arc<PositionStore>,
    queue: Arc<SignalQueue>,
    engine: Arc<GridEngine>,
    gateway: Arc<dyn TradingGateway>,
    feed: Arc<dyn MarketDataFeed>,
    settings: Arc<RuntimeSettings>,
    hours: TradingHours,
    idle_multiplier: u32,
    gateway_timeout: Duration,
    stop: Arc<AtomicBool>,
    /// Status surface for the control plane.
    gateway_ok: Arc<AtomicBool>,
    last_asset: Arc<Mutex<Option<AssetSnapshot>>>,
}

impl MonitorLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account: String,
        sync_positions: bool,
        store: Arc<PositionStore>,
        queue: Arc<SignalQueue>,
        engine: Arc<GridEngine>,
        gateway: Arc<dyn TradingGateway>,
        feed: Arc<dyn MarketDataFeed>,
        settings: Arc<RuntimeSettings>,
        hours: TradingHours,
        idle_multiplier: u32,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            account,
            sync_positions,
            store,
            queue,
            engine,
            gateway,
            feed,
            settings,
            hours,
            idle_multiplier,
            gateway_timeout,
            stop: Arc::new(AtomicBool::new(false)),
            gateway_ok: Arc::new(AtomicBool::new(true)),
            last_asset: Arc::new(Mutex::new(None)),
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn gateway_ok_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.gateway_ok)
    }

    pub fn asset_slot(&self) -> Arc<Mutex<Option<AssetSnapshot>>> {
        Arc::clone(&self.last_asset)
    }

    pub async fn run(self: Arc<Self>) {
        debug!("monitor loop started");
        while !self.stop.load(Ordering::Relaxed) {
            match self.run_once().await {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    warn!("monitor iteration skipped: {}", e);
                }
                Err(e) => {
                    // Defects abort the iteration, never the loop.
                    error!("monitor iteration aborted: {}", e);
                }
            }

            let base = self.settings.monitor_interval_secs().max(1);
            let secs = if self.hours.is_open(Utc::now().time()) {
                base
            } else {
                base * self.idle_multiplier.max(1) as u64
            };
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
        debug!("monitor loop stopped");
    }

    /// One full detection cycle. Public so tests can drive it directly.
    pub async fn run_once(&self) -> ControllerResult<()> {
        if self.sync_positions {
            // Gateway sync under a hard timeout; a slow or failing gateway
            // costs this iteration and nothing else.
            let snapshots = match timeout(
                self.gateway_timeout,
                self.gateway.query_positions(&self.account),
            )
            .await
            {
                Ok(Ok(snapshots)) => {
                    self.gateway_ok.store(true, Ordering::Relaxed);
                    snapshots
                }
                Ok(Err(e)) => {
                    self.gateway_ok.store(false, Ordering::Relaxed);
                    return Err(e);
                }
                Err(_) => {
                    self.gateway_ok.store(false, Ordering::Relaxed);
                    return Err(ControllerError::GatewayTimeout);
                }
            };
            self.store.sync(&snapshots)?;

            if let Ok(Ok(asset)) = timeout(
                self.gateway_timeout,
                self.gateway.query_asset(&self.account),
            )
            .await
            {
                *self.last_asset.lock().unwrap() = Some(asset);
            }
        }

        // Price refresh. A missing quote skips that instrument only.
        let (positions, _) = self.store.read_all();
        for position in &positions {
            if !position.is_held() {
                continue;
            }
            match self.feed.latest_price(&position.instrument).await {
                Ok(price) => self.store.update_price(&position.instrument, price),
                Err(e) => debug!("no quote for {}: {}", position.instrument, e),
            }
        }

        // Detection over the refreshed state.
        let risk = self.settings.risk();
        let (positions, _) = self.store.read_all();
        for position in &positions {
            if !position.is_held() || position.current_price <= 0.0 {
                continue;
            }
            self.maintain_durable_marks(position, &risk);
            for signal in detect_risk_signals(position, &risk) {
                self.queue.enqueue(signal);
            }
        }

        // Grid detection shares the same queue and the same cadence.
        let now = Utc::now();
        for instrument in self.engine.tracked_instruments() {
            if let Some((position, _)) = self.store.read(&instrument) {
                if position.current_price > 0.0 {
                    self.engine.tick(&instrument, position.current_price, now);
                }
            }
        }

        Ok(())
    }

    /// Keep the durable marks (high-water, stop price, breakout trail)
    /// current. Only writes when something actually moved.
    fn maintain_durable_marks(&self, position: &Position, risk: &RiskConfig) {
        let price = position.current_price;
        let stop_price = position.avg_cost * (1.0 + risk.stop_loss_ratio);
        let new_high = price > position.durable.highest_price;
        let stop_moved = (position.durable.stop_loss_price - stop_price).abs() > 1e-9;
        let arm_breakout =
            !position.durable.breakout_triggered && position.profit_ratio >= risk.breakout_ratio;
        let new_breakout_high =
            position.durable.breakout_triggered && price > position.durable.breakout_highest;

        if !(new_high || stop_moved || arm_breakout || new_breakout_high) {
            return;
        }
        let result = self.store.mutate_durable(&position.instrument, |d| {
            if new_high {
                d.highest_price = price;
            }
            if stop_moved {
                d.stop_loss_price = stop_price;
            }
            if arm_breakout {
                d.breakout_triggered = true;
                d.breakout_highest = price;
            } else if new_breakout_high {
                d.breakout_highest = price;
            }
        });
        if let Err(e) = result {
            error!("durable mark update failed: {}", e);
        }
    }
}

/// Pure risk detection for one position. Returns the signals to enqueue;
/// the caller enqueues them whether or not trading is enabled.
pub fn detect_risk_signals(position: &Position, risk: &RiskConfig) -> Vec<Signal> {
    let mut signals = Vec::new();
    let price = position.current_price;
    let sellable = round_to_lot(position.available_volume, risk.lot_size);

    // Stop loss sells everything sellable.
    if position.profit_ratio <= risk.stop_loss_ratio && sellable > 0.0 {
        signals.push(Signal::new(
            &position.instrument,
            SignalKind::StopLoss,
            Some(sellable),
            price,
        ));
        return signals;
    }

    // Initial take-profit sells a configured portion, once.
    if !position.durable.profit_triggered
        && position.profit_ratio >= risk.initial_take_profit_ratio
    {
        let volume = round_to_lot(
            position.available_volume * risk.initial_sell_ratio,
            risk.lot_size,
        );
        if volume > 0.0 {
            signals.push(Signal::new(
                &position.instrument,
                SignalKind::InitialTakeProfit,
                Some(volume),
                price,
            ));
        }
    }

    // Dynamic take-profit trails the high-water mark; after a breakout it
    // trails the breakout high with half the retrace.
    if position.durable.profit_triggered {
        let (reference, retrace) = if position.durable.breakout_triggered {
            (position.durable.breakout_highest, risk.take_profit_retrace / 2.0)
        } else {
            (position.durable.highest_price, risk.take_profit_retrace)
        };
        if reference > 0.0 && sellable > 0.0 {
            let drawdown = (reference - price) / reference;
            if drawdown >= retrace {
                signals.push(Signal::new(
                    &position.instrument,
                    SignalKind::DynamicTakeProfit,
                    Some(sellable),
                    price,
                ));
            }
        }
    }

    signals
}
