// Gridpilot
//
// Unattended grid-trading controller: signal pipeline, dual-layer position
// store, per-instrument grid sessions, supervised control loops.

pub mod app;
pub mod clients;
pub mod config;
pub mod core;
pub mod db; // SQLite durable layer
pub mod error; // Unified error handling

// Re-export core runtime types
pub use core::{
    ExecutionMode, Executor, ExitReason, FlushLoop, GridEngine, GridParams, GridSession,
    MonitorLoop, Position, PositionStore, Rejection, SessionStatus, ShutdownSequencer, Side,
    Signal, SignalKind, SignalQueue, StrategyLoop, Supervisor, TaskSlot,
};

// Re-export error types
pub use error::{ControllerError, ControllerResult};

// Re-export configuration
pub use config::{Config, ConfigError, RuntimeSettings, SettingKey, TradingHours};

// Re-export client interfaces
pub use clients::{MarketDataFeed, SimGateway, TradingGateway};

// Re-export composition root
pub use app::{App, ControlHandle, ControllerStatus};

// Re-export database handle
pub use db::Database;
