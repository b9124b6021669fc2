// Per-instrument grid engine: price tracking, level callbacks, exit checks

use crate::core::grid_session::{
    Direction, ExitReason, GridParams, GridSession, PriceTracker, SessionStatus, LEVEL_LOWER,
    LEVEL_UPPER,
};
use crate::core::position_store::PositionStore;
use crate::core::signal_queue::SignalQueue;
use crate::core::types::{round_to_lot, Signal, SignalKind};
use crate::db::{self, Database};
use crate::error::{ControllerError, ControllerResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

struct GridSlot {
    session: GridSession,
    tracker: PriceTracker,
}

/// Threshold comparison that tolerates f64 rounding: a callback of
/// (10.60 - 10.547) / 10.60 must count as 0.5%.
fn ratio_reached(value: f64, threshold: f64) -> bool {
    value + 1e-9 >= threshold
}

/// Evaluate the exit conditions in their fixed order and return the first
/// match. Deterministic: deviation, profit, loss, time, position-cleared.
pub fn evaluate_exit(
    session: &GridSession,
    price: f64,
    held_volume: f64,
    now: DateTime<Utc>,
) -> Option<ExitReason> {
    let deviation = (session.current_center - session.locked_center).abs() / session.locked_center;
    if deviation > session.params.max_deviation {
        return Some(ExitReason::Deviation);
    }
    let profit = session.profit_ratio(price);
    if session.buy_amount_total > 0.0 && profit >= session.params.target_profit {
        return Some(ExitReason::TargetProfit);
    }
    if session.buy_amount_total > 0.0 && profit <= session.params.stop_loss {
        return Some(ExitReason::StopLoss);
    }
    if now >= session.end_time {
        return Some(ExitReason::Expired);
    }
    if held_volume <= 0.0 {
        return Some(ExitReason::PositionCleared);
    }
    None
}

/// Owns every grid session and its tracker. Reads the position store and
/// emits into the signal queue; detection here runs whether or not trading
/// is enabled.
pub struct GridEngine {
    slots: Mutex<HashMap<String, GridSlot>>,
    store: Arc<PositionStore>,
    queue: Arc<SignalQueue>,
    database: Arc<Database>,
    level_cooldown_secs: i64,
    lot_size: f64,
}

impl GridEngine {
    pub fn new(
        store: Arc<PositionStore>,
        queue: Arc<SignalQueue>,
        database: Arc<Database>,
        level_cooldown_secs: i64,
        lot_size: f64,
    ) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            store,
            queue,
            database,
            level_cooldown_secs,
            lot_size,
        }
    }

    /// Reload non-terminal sessions from the durable layer. Trackers start
    /// fresh: watch state does not survive a restart.
    pub fn restore(&self) -> ControllerResult<usize> {
        let sessions = db::grid::load_open_sessions(self.database.connection())?;
        let count = sessions.len();
        let mut slots = self.slots.lock().unwrap();
        for session in sessions {
            slots.insert(
                session.instrument.clone(),
                GridSlot {
                    session,
                    tracker: PriceTracker::new(),
                },
            );
        }
        Ok(count)
    }

    /// Create a session on operator confirmation. The locked center comes
    /// from the instrument's post-entry high; the opening buy goes through
    /// the signal pipeline like every other trade.
    pub fn create_session(&self, instrument: &str, params: GridParams) -> ControllerResult<String> {
        let (position, _) = self.store.read(instrument).ok_or_else(|| {
            ControllerError::Session(format!("no position for {}", instrument))
        })?;
        if position.current_price <= 0.0 {
            return Err(ControllerError::Session(format!(
                "no price yet for {}",
                instrument
            )));
        }

        {
            let slots = self.slots.lock().unwrap();
            if let Some(slot) = slots.get(instrument) {
                if !slot.session.status.is_terminal() {
                    return Err(ControllerError::Session(format!(
                        "instrument {} already has session {} ({})",
                        instrument,
                        slot.session.id,
                        slot.session.status.as_str()
                    )));
                }
            }
        }

        let locked_center = if position.durable.highest_price > 0.0 {
            position.durable.highest_price
        } else {
            position.current_price
        };
        let opening_volume = round_to_lot(params.buy_amount / position.current_price, self.lot_size);
        if opening_volume <= 0.0 {
            return Err(ControllerError::Session(format!(
                "buy_amount {} buys less than one lot at {}",
                params.buy_amount, position.current_price
            )));
        }

        let session = GridSession::new(instrument, locked_center, params);
        let id = session.id.clone();
        self.persist(&session);
        info!(
            "grid session {} created for {} (locked center {:.3})",
            id, instrument, locked_center
        );

        {
            let mut slots = self.slots.lock().unwrap();
            slots.insert(
                instrument.to_string(),
                GridSlot {
                    session,
                    tracker: PriceTracker::new(),
                },
            );
        }

        // Opening fill; its execution activates the session.
        self.queue.enqueue(Signal::new(
            instrument,
            SignalKind::GridBuy,
            Some(opening_volume),
            position.current_price,
        ));
        Ok(id)
    }

    /// One price observation for one instrument. Runs exit evaluation, then
    /// the level/callback algorithm, and enqueues whatever it detects.
    pub fn tick(&self, instrument: &str, price: f64, now: DateTime<Utc>) {
        if price <= 0.0 {
            return;
        }
        let held_volume = self
            .store
            .read(instrument)
            .map(|(p, _)| p.held_volume)
            .unwrap_or(0.0);

        let mut emitted: Option<Signal> = None;
        let mut exited: Option<GridSession> = None;

        {
            let mut slots = self.slots.lock().unwrap();
            let Some(slot) = slots.get_mut(instrument) else {
                return;
            };
            if slot.session.status != SessionStatus::Active {
                slot.tracker.last_price = price;
                return;
            }

            if let Some(reason) = evaluate_exit(&slot.session, price, held_volume, now) {
                slot.session.exit(reason, false);
                info!(
                    "grid session {} exited: {}",
                    slot.session.id,
                    reason.as_str()
                );
                let liquidate = round_to_lot(
                    slot.session.net_volume().min(held_volume),
                    self.lot_size,
                );
                emitted = Some(Signal::new(
                    instrument,
                    SignalKind::GridExit,
                    (liquidate > 0.0).then_some(liquidate),
                    price,
                ));
                exited = Some(slot.session.clone());
            } else {
                emitted = self.track_price(slot, price, held_volume, now);
            }
        }

        if let Some(session) = exited {
            self.persist(&session);
        }
        if let Some(signal) = emitted {
            self.queue.enqueue(signal);
        }
    }

    /// The level/callback algorithm for one active slot. Returns a signal
    /// when a callback completes on a level that is out of cooldown.
    fn track_price(
        &self,
        slot: &mut GridSlot,
        price: f64,
        held_volume: f64,
        now: DateTime<Utc>,
    ) -> Option<Signal> {
        let session = &slot.session;
        let tracker = &mut slot.tracker;
        let [lower, _, upper] = session.levels();
        let mut signal = None;

        if !tracker.awaiting_callback {
            if price >= upper {
                tracker.direction = Direction::Rising;
                tracker.extremum = price;
                tracker.awaiting_callback = true;
                tracker.last_crossed_level = Some(LEVEL_UPPER);
                debug!(
                    "{} crossed upper level {:.3}, watching for callback",
                    session.instrument, upper
                );
            } else if price <= lower {
                tracker.direction = Direction::Falling;
                tracker.extremum = price;
                tracker.awaiting_callback = true;
                tracker.last_crossed_level = Some(LEVEL_LOWER);
                debug!(
                    "{} crossed lower level {:.3}, watching for rebound",
                    session.instrument, lower
                );
            }
        } else {
            match tracker.direction {
                Direction::Rising => {
                    if price > tracker.extremum {
                        tracker.extremum = price;
                    } else if tracker.extremum > 0.0 {
                        let callback = (tracker.extremum - price) / tracker.extremum;
                        if ratio_reached(callback, session.params.callback_ratio)
                            && !tracker.level_in_cooldown(LEVEL_UPPER, now, self.level_cooldown_secs)
                        {
                            let volume =
                                round_to_lot(held_volume * session.params.sell_ratio, self.lot_size);
                            if volume > 0.0 {
                                info!(
                                    "{} callback {:.4} from peak {:.3}, selling {}",
                                    session.instrument, callback, tracker.extremum, volume
                                );
                                tracker.mark_level_fired(LEVEL_UPPER, now);
                                signal = Some(Signal::new(
                                    &session.instrument,
                                    SignalKind::GridSell,
                                    Some(volume),
                                    price,
                                ));
                            }
                        }
                    }
                }
                Direction::Falling => {
                    if price < tracker.extremum {
                        tracker.extremum = price;
                    } else if tracker.extremum > 0.0 {
                        let rebound = (price - tracker.extremum) / tracker.extremum;
                        if ratio_reached(rebound, session.params.callback_ratio)
                            && !tracker.level_in_cooldown(LEVEL_LOWER, now, self.level_cooldown_secs)
                        {
                            let volume =
                                round_to_lot(session.params.buy_amount / price, self.lot_size);
                            let amount = volume * price;
                            if volume <= 0.0 {
                                // Buy amount does not cover a lot at this price.
                            } else if session.buy_amount_total + amount
                                > session.params.max_investment
                            {
                                warn!(
                                    "{} rebound buy skipped: {:.2} would exceed max investment",
                                    session.instrument,
                                    session.buy_amount_total + amount
                                );
                            } else {
                                info!(
                                    "{} rebound {:.4} from valley {:.3}, buying {}",
                                    session.instrument, rebound, tracker.extremum, volume
                                );
                                tracker.mark_level_fired(LEVEL_LOWER, now);
                                signal = Some(Signal::new(
                                    &session.instrument,
                                    SignalKind::GridBuy,
                                    Some(volume),
                                    price,
                                ));
                            }
                        }
                    }
                }
                Direction::None => {}
            }
        }

        tracker.last_price = price;
        signal
    }

    /// Record an executed grid fill: counters update, then the grid rebuilds
    /// around the fill price and the tracker starts over.
    pub fn record_fill(
        &self,
        instrument: &str,
        buy: bool,
        price: f64,
        volume: f64,
        amount: f64,
    ) -> ControllerResult<()> {
        let (session, trade) = {
            let mut slots = self.slots.lock().unwrap();
            let slot = slots.get_mut(instrument).ok_or_else(|| {
                ControllerError::Session(format!("no session for {}", instrument))
            })?;
            if slot.session.status.is_terminal() {
                return Err(ControllerError::Session(format!(
                    "session {} is already terminal",
                    slot.session.id
                )));
            }

            let level_price = match slot.tracker.last_crossed_level {
                Some(LEVEL_UPPER) => slot.session.levels()[2],
                Some(LEVEL_LOWER) => slot.session.levels()[0],
                _ => slot.session.current_center,
            };
            let extremum = slot.tracker.extremum;

            slot.session.record_fill(buy, price, volume, amount);
            slot.tracker.reset();

            let trade = db::grid::GridTrade {
                id: None,
                session_id: slot.session.id.clone(),
                side: if buy { "BUY" } else { "SELL" }.to_string(),
                level_price,
                fill_price: price,
                volume,
                extremum_price: extremum,
                created_at: None,
            };
            (slot.session.clone(), trade)
        };

        self.persist(&session);
        if let Err(e) = db::grid::insert_trade(self.database.connection(), &trade) {
            error!("failed to record grid trade for {}: {}", instrument, e);
        }
        debug!(
            "grid rebuilt for {} around {:.3} (trade #{})",
            instrument, price, session.trade_count
        );
        Ok(())
    }

    /// Force-exit the instrument's session ahead of a risk action. A pending
    /// session is cancelled, an active one goes to ForceExited. Returns true
    /// if a session transitioned.
    pub fn force_exit(&self, instrument: &str, reason: ExitReason) -> bool {
        let session = {
            let mut slots = self.slots.lock().unwrap();
            let Some(slot) = slots.get_mut(instrument) else {
                return false;
            };
            match slot.session.status {
                SessionStatus::Pending => {
                    slot.session.cancel();
                }
                SessionStatus::Active => {
                    slot.session.exit(reason, true);
                }
                _ => return false,
            }
            slot.session.clone()
        };
        warn!(
            "grid session {} force-exited ({})",
            session.id,
            reason.as_str()
        );
        self.persist(&session);
        true
    }

    /// Operator stop through the control plane.
    pub fn stop_session(&self, instrument: &str) -> ControllerResult<()> {
        if self.force_exit(instrument, ExitReason::Operator) {
            Ok(())
        } else {
            Err(ControllerError::Session(format!(
                "no running session for {}",
                instrument
            )))
        }
    }

    pub fn has_active(&self, instrument: &str) -> bool {
        let slots = self.slots.lock().unwrap();
        slots
            .get(instrument)
            .map(|s| s.session.status == SessionStatus::Active)
            .unwrap_or(false)
    }

    pub fn session(&self, instrument: &str) -> Option<GridSession> {
        let slots = self.slots.lock().unwrap();
        slots.get(instrument).map(|s| s.session.clone())
    }

    pub fn sessions(&self) -> Vec<GridSession> {
        let slots = self.slots.lock().unwrap();
        let mut sessions: Vec<GridSession> =
            slots.values().map(|s| s.session.clone()).collect();
        sessions.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        sessions
    }

    /// Instruments the monitor loop should tick.
    pub fn tracked_instruments(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap();
        slots.keys().cloned().collect()
    }

    fn persist(&self, session: &GridSession) {
        if let Err(e) = db::grid::upsert_session(self.database.connection(), session) {
            error!("failed to persist grid session {}: {}", session.id, e);
        }
    }
}
