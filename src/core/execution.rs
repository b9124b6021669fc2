// Execution boundary: live gateway orders or direct simulated fills

use crate::clients::TradingGateway;
use crate::core::position_store::PositionStore;
use crate::core::types::{Fill, Side, Signal};
use crate::error::{ControllerError, ControllerResult};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Live,
    Simulated,
}

/// Turns validated signals into fills. In live mode orders go through the
/// gateway; in simulated mode the position store is mutated directly and
/// the fill gets a synthetic `SIM<timestamp><counter>` order id.
pub struct Executor {
    mode: ExecutionMode,
    gateway: Arc<dyn TradingGateway>,
    store: Arc<PositionStore>,
    sim_seq: AtomicU64,
}

impl Executor {
    pub fn new(
        mode: ExecutionMode,
        gateway: Arc<dyn TradingGateway>,
        store: Arc<PositionStore>,
    ) -> Self {
        Self {
            mode,
            gateway,
            store,
            sim_seq: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Execute a validated signal. The volume must have been resolved by the
    /// detector; signals without one are a defect at this point.
    pub async fn execute(&self, signal: &Signal) -> ControllerResult<Fill> {
        let volume = signal.volume.ok_or_else(|| {
            ControllerError::Invariant(format!(
                "{} signal for {} reached the executor without a volume",
                signal.kind.as_str(),
                signal.instrument
            ))
        })?;
        if volume <= 0.0 {
            return Err(ControllerError::Invariant(format!(
                "non-positive volume {} for {}",
                volume, signal.instrument
            )));
        }

        let side = signal.kind.side();
        let order_id = match self.mode {
            ExecutionMode::Live => {
                self.gateway
                    .place_order(&signal.instrument, side, volume, signal.price)
                    .await?
            }
            ExecutionMode::Simulated => {
                self.store.apply_sim_fill(
                    &signal.instrument,
                    side == Side::Buy,
                    signal.price,
                    volume,
                )?;
                self.next_sim_order_id()
            }
        };

        let fill = Fill {
            instrument: signal.instrument.clone(),
            side,
            price: signal.price,
            volume,
            amount: volume * signal.price,
            order_id,
            timestamp: Utc::now(),
        };
        info!(
            "executed {} {} {}@{:.3} ({})",
            side.as_str(),
            fill.instrument,
            fill.volume,
            fill.price,
            fill.order_id
        );
        Ok(fill)
    }

    fn next_sim_order_id(&self) -> String {
        let seq = self.sim_seq.fetch_add(1, Ordering::Relaxed) % 1000;
        format!("SIM{}{:03}", Utc::now().format("%Y%m%d%H%M%S"), seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::SimGateway;
    use crate::core::types::{PositionSnapshot, SignalKind};

    fn store_with_position() -> Arc<PositionStore> {
        let store = Arc::new(PositionStore::new());
        store
            .sync(&[PositionSnapshot {
                instrument: "600036".to_string(),
                name: "CMB".to_string(),
                held_volume: 1000.0,
                available_volume: 1000.0,
                avg_cost: 10.0,
            }])
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_simulated_fill_mutates_store() {
        let store = store_with_position();
        let gateway = Arc::new(SimGateway::new(0.0));
        let executor = Executor::new(ExecutionMode::Simulated, gateway, Arc::clone(&store));

        let signal = Signal::new("600036", SignalKind::GridSell, Some(400.0), 10.5);
        let fill = executor.execute(&signal).await.unwrap();

        assert!(fill.order_id.starts_with("SIM"));
        // SIM + yyyymmddhhmmss + 3-digit counter
        assert_eq!(fill.order_id.len(), 3 + 14 + 3);
        assert!((fill.amount - 4200.0).abs() < 1e-9);

        let (position, _) = store.read("600036").unwrap();
        assert_eq!(position.held_volume, 600.0);
    }

    #[tokio::test]
    async fn test_live_fill_goes_through_gateway() {
        let store = store_with_position();
        let gateway = Arc::new(SimGateway::new(100_000.0));
        gateway.set_price("600036", 10.0);
        let executor = Executor::new(ExecutionMode::Live, Arc::clone(&gateway) as Arc<dyn TradingGateway>, Arc::clone(&store));

        let signal = Signal::new("600036", SignalKind::GridBuy, Some(500.0), 10.0);
        let fill = executor.execute(&signal).await.unwrap();
        assert!(fill.order_id.starts_with("SIMGW"));

        // Live mode never touches the store directly; the next sync does.
        let (position, _) = store.read("600036").unwrap();
        assert_eq!(position.held_volume, 1000.0);
    }

    #[tokio::test]
    async fn test_missing_volume_is_an_invariant_defect() {
        let store = store_with_position();
        let gateway = Arc::new(SimGateway::new(0.0));
        let executor = Executor::new(ExecutionMode::Simulated, gateway, store);

        let signal = Signal::new("600036", SignalKind::StopLoss, None, 9.2);
        let err = executor.execute(&signal).await.unwrap_err();
        assert_eq!(err.category(), "invariant");
    }
}
