// External gateway interfaces: trading, market data, and the in-process sim

use crate::core::types::{AssetSnapshot, PositionSnapshot, Side};
use crate::error::ControllerResult;
use async_trait::async_trait;

pub mod sim;

pub use sim::SimGateway;

/// Brokerage trading gateway. Every call may fail or time out; the caller
/// treats failure as "skip this iteration", never as fatal.
#[async_trait]
pub trait TradingGateway: Send + Sync {
    /// Connector name for logging.
    fn name(&self) -> &str;

    async fn query_positions(&self, account: &str) -> ControllerResult<Vec<PositionSnapshot>>;

    async fn query_asset(&self, account: &str) -> ControllerResult<AssetSnapshot>;

    async fn place_order(
        &self,
        instrument: &str,
        side: Side,
        volume: f64,
        price: f64,
    ) -> ControllerResult<String>;

    async fn cancel_order(&self, order_id: &str) -> ControllerResult<()>;
}

/// Latest-price source. Unavailability is a transient condition.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    async fn latest_price(&self, instrument: &str) -> ControllerResult<f64>;
}
