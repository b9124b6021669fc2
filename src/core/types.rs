// Shared domain types for the controller core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One tracked position per instrument.
///
/// Volatile fields come from the gateway on every sync, derived fields are
/// recomputed on every price update, durable fields are mutated only by
/// strategy logic and flushed to SQLite on the durable-sync interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    pub name: String,

    // Volatile fields (gateway-sourced)
    pub held_volume: f64,
    pub available_volume: f64,
    pub avg_cost: f64,
    pub current_price: f64,

    // Derived fields (recomputed under the store lock)
    pub market_value: f64,
    pub profit_ratio: f64,

    pub durable: DurableFields,
    pub updated_at: DateTime<Utc>,
}

/// Position attributes that survive process restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DurableFields {
    pub open_date: Option<DateTime<Utc>>,
    pub profit_triggered: bool,
    pub highest_price: f64,
    pub stop_loss_price: f64,
    pub breakout_triggered: bool,
    pub breakout_highest: f64,
}

impl Position {
    pub fn new(instrument: &str, name: &str) -> Self {
        Self {
            instrument: instrument.to_string(),
            name: name.to_string(),
            held_volume: 0.0,
            available_volume: 0.0,
            avg_cost: 0.0,
            current_price: 0.0,
            market_value: 0.0,
            profit_ratio: 0.0,
            durable: DurableFields::default(),
            updated_at: Utc::now(),
        }
    }

    /// Recompute the derived fields from the volatile ones. Callers hold the
    /// store's write lock so readers never see a half-updated record.
    pub fn recompute_derived(&mut self) {
        self.market_value = self.held_volume * self.current_price;
        self.profit_ratio = if self.avg_cost > 0.0 {
            (self.current_price - self.avg_cost) / self.avg_cost
        } else {
            0.0
        };
    }

    pub fn is_held(&self) -> bool {
        self.held_volume > 0.0
    }
}

/// Gateway-sourced snapshot of one position, merged by `PositionStore::sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub instrument: String,
    pub name: String,
    pub held_volume: f64,
    pub available_volume: f64,
    pub avg_cost: f64,
}

/// Gateway-sourced account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetSnapshot {
    pub total_value: f64,
    pub cash_available: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "SELL" => Side::Sell,
            _ => Side::Buy,
        }
    }
}

/// Detected trading condition classes.
///
/// Risk kinds (stop-loss and the take-profits) always win arbitration against
/// grid kinds on the same instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    StopLoss,
    InitialTakeProfit,
    DynamicTakeProfit,
    GridBuy,
    GridSell,
    GridExit,
}

impl SignalKind {
    pub fn is_risk(&self) -> bool {
        matches!(
            self,
            SignalKind::StopLoss | SignalKind::InitialTakeProfit | SignalKind::DynamicTakeProfit
        )
    }

    pub fn side(&self) -> Side {
        match self {
            SignalKind::GridBuy => Side::Buy,
            _ => Side::Sell,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::StopLoss => "STOP_LOSS",
            SignalKind::InitialTakeProfit => "INITIAL_TAKE_PROFIT",
            SignalKind::DynamicTakeProfit => "DYNAMIC_TAKE_PROFIT",
            SignalKind::GridBuy => "GRID_BUY",
            SignalKind::GridSell => "GRID_SELL",
            SignalKind::GridExit => "GRID_EXIT",
        }
    }
}

/// Ephemeral record of a detected condition awaiting validation/execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub instrument: String,
    pub kind: SignalKind,
    /// Target volume for the order; `None` means the executor sizes it.
    pub volume: Option<f64>,
    /// Reference price at detection time.
    pub price: f64,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(instrument: &str, kind: SignalKind, volume: Option<f64>, price: f64) -> Self {
        Self {
            instrument: instrument.to_string(),
            kind,
            volume,
            price,
            created_at: Utc::now(),
        }
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }
}

/// Result of a filled order at the execution boundary.
#[derive(Debug, Clone)]
pub struct Fill {
    pub instrument: String,
    pub side: Side,
    pub price: f64,
    pub volume: f64,
    pub amount: f64,
    pub order_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Round a volume down to the exchange lot size.
pub fn round_to_lot(volume: f64, lot_size: f64) -> f64 {
    if lot_size <= 0.0 {
        return volume.floor();
    }
    (volume / lot_size).floor() * lot_size
}
