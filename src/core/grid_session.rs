// Grid session entity, status machine, and per-session price tracker

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Pending,
    Active,
    Exited,
    ForceExited,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Exited | SessionStatus::ForceExited | SessionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Exited => "EXITED",
            SessionStatus::ForceExited => "FORCE_EXITED",
            SessionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "PENDING" => SessionStatus::Pending,
            "EXITED" => SessionStatus::Exited,
            "FORCE_EXITED" => SessionStatus::ForceExited,
            "CANCELLED" => SessionStatus::Cancelled,
            _ => SessionStatus::Active,
        }
    }
}

/// First matching exit condition, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Deviation,
    TargetProfit,
    StopLoss,
    Expired,
    PositionCleared,
    ForcedByRisk,
    Operator,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Deviation => "DEVIATION",
            ExitReason::TargetProfit => "TARGET_PROFIT",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::Expired => "EXPIRED",
            ExitReason::PositionCleared => "POSITION_CLEARED",
            ExitReason::ForcedByRisk => "FORCED_BY_RISK",
            ExitReason::Operator => "OPERATOR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DEVIATION" => Some(ExitReason::Deviation),
            "TARGET_PROFIT" => Some(ExitReason::TargetProfit),
            "STOP_LOSS" => Some(ExitReason::StopLoss),
            "EXPIRED" => Some(ExitReason::Expired),
            "POSITION_CLEARED" => Some(ExitReason::PositionCleared),
            "FORCED_BY_RISK" => Some(ExitReason::ForcedByRisk),
            "OPERATOR" => Some(ExitReason::Operator),
            _ => None,
        }
    }
}

/// Configuration snapshot taken at session creation. Later edits to the
/// grid defaults never affect a running session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridParams {
    pub price_interval: f64,
    /// Per-level sell size as a ratio of current holdings.
    pub sell_ratio: f64,
    /// Per-level buy size in currency.
    pub buy_amount: f64,
    pub callback_ratio: f64,
    pub max_investment: f64,
    pub max_deviation: f64,
    pub target_profit: f64,
    pub stop_loss: f64,
    pub max_duration_days: i64,
}

/// One grid automation instance for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSession {
    pub id: String,
    pub instrument: String,
    /// Immutable deviation reference, set at creation. Never touched by
    /// rebuilds.
    pub locked_center: f64,
    /// Reset to the fill price after every trade.
    pub current_center: f64,
    pub params: GridParams,
    pub status: SessionStatus,
    pub exit_reason: Option<ExitReason>,

    pub trade_count: u32,
    pub buy_count: u32,
    pub sell_count: u32,
    pub buy_amount_total: f64,
    pub sell_amount_total: f64,
    pub buy_volume_total: f64,
    pub sell_volume_total: f64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
}

impl GridSession {
    pub fn new(instrument: &str, locked_center: f64, params: GridParams) -> Self {
        let now = Utc::now();
        let end_time = now + Duration::days(params.max_duration_days);
        Self {
            id: Uuid::new_v4().to_string(),
            instrument: instrument.to_string(),
            locked_center,
            current_center: locked_center,
            params,
            status: SessionStatus::Pending,
            exit_reason: None,
            trade_count: 0,
            buy_count: 0,
            sell_count: 0,
            buy_amount_total: 0.0,
            sell_amount_total: 0.0,
            buy_volume_total: 0.0,
            sell_volume_total: 0.0,
            created_at: now,
            updated_at: now,
            exited_at: None,
            end_time,
        }
    }

    /// The three decision boundaries around the current center.
    pub fn levels(&self) -> [f64; 3] {
        [
            self.current_center * (1.0 - self.params.price_interval),
            self.current_center,
            self.current_center * (1.0 + self.params.price_interval),
        ]
    }

    /// Net grid inventory still held by this session.
    pub fn net_volume(&self) -> f64 {
        (self.buy_volume_total - self.sell_volume_total).max(0.0)
    }

    /// Session profit ratio at the given price, against cumulative amounts.
    pub fn profit_ratio(&self, price: f64) -> f64 {
        if self.buy_amount_total <= 0.0 {
            return 0.0;
        }
        let holding_value = self.net_volume() * price;
        (self.sell_amount_total + holding_value - self.buy_amount_total) / self.buy_amount_total
    }

    /// Record a filled trade: counters, then rebuild the grid around the
    /// fill price. The first fill activates a pending session.
    pub fn record_fill(&mut self, buy: bool, price: f64, volume: f64, amount: f64) {
        if self.status == SessionStatus::Pending {
            self.status = SessionStatus::Active;
        }
        self.trade_count += 1;
        if buy {
            self.buy_count += 1;
            self.buy_amount_total += amount;
            self.buy_volume_total += volume;
        } else {
            self.sell_count += 1;
            self.sell_amount_total += amount;
            self.sell_volume_total += volume;
        }
        self.current_center = price;
        self.updated_at = Utc::now();
    }

    /// Transition to a terminal exit state. Idempotent: re-exiting an
    /// already-terminal session keeps the first recorded reason.
    pub fn exit(&mut self, reason: ExitReason, forced: bool) {
        if self.status.is_terminal() {
            return;
        }
        self.status = if forced {
            SessionStatus::ForceExited
        } else {
            SessionStatus::Exited
        };
        self.exit_reason = Some(reason);
        let now = Utc::now();
        self.exited_at = Some(now);
        self.updated_at = now;
    }

    /// Cancel a session that never filled.
    pub fn cancel(&mut self) -> bool {
        if self.status != SessionStatus::Pending {
            return false;
        }
        self.status = SessionStatus::Cancelled;
        let now = Utc::now();
        self.exited_at = Some(now);
        self.updated_at = now;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rising,
    Falling,
    None,
}

/// Grid level indices used for cooldown keys.
pub const LEVEL_LOWER: i8 = -1;
pub const LEVEL_UPPER: i8 = 1;

/// Per-session, purely in-memory price tracker. Rebuilt from scratch
/// whenever the grid rebuilds or the process restarts.
#[derive(Debug, Clone)]
pub struct PriceTracker {
    pub last_price: f64,
    pub direction: Direction,
    /// Peak while rising, valley while falling.
    pub extremum: f64,
    pub awaiting_callback: bool,
    pub last_crossed_level: Option<i8>,
    level_cooldowns: HashMap<i8, DateTime<Utc>>,
}

impl PriceTracker {
    pub fn new() -> Self {
        Self {
            last_price: 0.0,
            direction: Direction::None,
            extremum: 0.0,
            awaiting_callback: false,
            last_crossed_level: None,
            level_cooldowns: HashMap::new(),
        }
    }

    /// Reset after a grid rebuild: watch state and level cooldowns cleared.
    pub fn reset(&mut self) {
        self.direction = Direction::None;
        self.extremum = 0.0;
        self.awaiting_callback = false;
        self.last_crossed_level = None;
        self.level_cooldowns.clear();
    }

    pub fn level_in_cooldown(&self, level: i8, now: DateTime<Utc>, cooldown_secs: i64) -> bool {
        match self.level_cooldowns.get(&level) {
            Some(fired_at) => (now - *fired_at).num_seconds() < cooldown_secs,
            None => false,
        }
    }

    pub fn mark_level_fired(&mut self, level: i8, now: DateTime<Utc>) {
        self.level_cooldowns.insert(level, now);
    }
}

impl Default for PriceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> GridParams {
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

    #[test]
    fn test_levels_around_center() {
        let session = GridSession::new("600036", 10.0, params());
        let [lower, center, upper] = session.levels();
        assert!((lower - 9.5).abs() < 1e-9);
        assert!((center - 10.0).abs() < 1e-9);
        assert!((upper - 10.5).abs() < 1e-9);
    }

    #[test]
    fn test_first_fill_activates() {
        let mut session = GridSession::new("600036", 10.0, params());
        assert_eq!(session.status, SessionStatus::Pending);

        session.record_fill(true, 9.98, 1000.0, 9980.0);
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.buy_count, 1);
        assert!((session.current_center - 9.98).abs() < 1e-9);
        // The deviation reference is untouched.
        assert!((session.locked_center - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_rebuild_invariants_hold_over_many_fills() {
        let mut session = GridSession::new("600036", 10.0, params());
        let fills = [9.8, 10.2, 9.6, 10.9, 10.1];
        for (i, price) in fills.iter().enumerate() {
            session.record_fill(i % 2 == 0, *price, 100.0, price * 100.0);
            let [lower, center, upper] = session.levels();
            assert!((center - price).abs() < 1e-9);
            assert!((lower - price * 0.95).abs() < 1e-9);
            assert!((upper - price * 1.05).abs() < 1e-9);
            assert!((session.locked_center - 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_exit_is_idempotent() {
        let mut session = GridSession::new("600036", 10.0, params());
        session.record_fill(true, 10.0, 1000.0, 10_000.0);

        session.exit(ExitReason::TargetProfit, false);
        assert_eq!(session.status, SessionStatus::Exited);

        // Re-evaluating a terminal session keeps the first reason.
        session.exit(ExitReason::Deviation, true);
        assert_eq!(session.status, SessionStatus::Exited);
        assert_eq!(session.exit_reason, Some(ExitReason::TargetProfit));
    }

    #[test]
    fn test_cancel_only_from_pending() {
        let mut session = GridSession::new("600036", 10.0, params());
        assert!(session.cancel());
        assert_eq!(session.status, SessionStatus::Cancelled);

        let mut active = GridSession::new("600036", 10.0, params());
        active.record_fill(true, 10.0, 100.0, 1000.0);
        assert!(!active.cancel());
        assert_eq!(active.status, SessionStatus::Active);
    }

    #[test]
    fn test_session_profit_ratio() {
        let mut session = GridSession::new("600036", 10.0, params());
        session.record_fill(true, 10.0, 1000.0, 10_000.0);
        session.record_fill(false, 10.5, 500.0, 5_250.0);

        // 500 still held at 10.5: (5250 + 5250 - 10000) / 10000 = 0.05
        assert!((session.profit_ratio(10.5) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_tracker_level_cooldown() {
        let mut tracker = PriceTracker::new();
        let now = Utc::now();

        assert!(!tracker.level_in_cooldown(LEVEL_UPPER, now, 60));
        tracker.mark_level_fired(LEVEL_UPPER, now);
        assert!(tracker.level_in_cooldown(LEVEL_UPPER, now, 60));
        // The other level is independent.
        assert!(!tracker.level_in_cooldown(LEVEL_LOWER, now, 60));

        let later = now + Duration::seconds(61);
        assert!(!tracker.level_in_cooldown(LEVEL_UPPER, later, 60));

        tracker.reset();
        assert!(!tracker.level_in_cooldown(LEVEL_UPPER, now, 60));
    }
}
