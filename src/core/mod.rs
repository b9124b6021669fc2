// Controller core: store, queue, grid engine, loops, supervision

pub mod execution;
pub mod grid_engine;
pub mod grid_session;
pub mod monitor;
pub mod position_store;
pub mod shutdown;
pub mod signal_queue;
pub mod strategy;
pub mod supervisor;
pub mod types;

// Re-export commonly used types
pub use execution::{ExecutionMode, Executor};
pub use grid_engine::GridEngine;
pub use grid_session::{ExitReason, GridParams, GridSession, PriceTracker, SessionStatus};
pub use monitor::MonitorLoop;
pub use position_store::{FlushLoop, PositionStore};
pub use shutdown::{LoopHandle, ShutdownSequencer};
pub use signal_queue::{Rejection, SignalQueue};
pub use strategy::StrategyLoop;
pub use supervisor::{RestartEvent, Supervisor, TaskSlot};
pub use types::{DurableFields, Fill, Position, PositionSnapshot, Side, Signal, SignalKind};
