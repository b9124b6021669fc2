// In-process simulated gateway and market data feed

use crate::clients::{MarketDataFeed, TradingGateway};
use crate::core::types::{AssetSnapshot, PositionSnapshot, Side};
use crate::error::{ControllerError, ControllerResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

struct SimBook {
    positions: HashMap<String, PositionSnapshot>,
    prices: HashMap<String, f64>,
    cash: f64,
}

/// A gateway that fills every order against its own book. Used for paper
/// trading and by the integration tests; the live connector implements the
/// same traits against the brokerage API.
pub struct SimGateway {
    book: Mutex<SimBook>,
    order_seq: AtomicU64,
}

impl SimGateway {
    pub fn new(cash: f64) -> Self {
        Self {
            book: Mutex::new(SimBook {
                positions: HashMap::new(),
                prices: HashMap::new(),
                cash,
            }),
            order_seq: AtomicU64::new(1),
        }
    }

    /// Seed or move an instrument's quote.
    pub fn set_price(&self, instrument: &str, price: f64) {
        let mut book = self.book.lock().unwrap();
        book.prices.insert(instrument.to_string(), price);
    }

    /// Seed a holding, e.g. an existing portfolio at startup.
    pub fn seed_position(&self, instrument: &str, name: &str, volume: f64, avg_cost: f64) {
        let mut book = self.book.lock().unwrap();
        book.positions.insert(
            instrument.to_string(),
            PositionSnapshot {
                instrument: instrument.to_string(),
                name: name.to_string(),
                held_volume: volume,
                available_volume: volume,
                avg_cost,
            },
        );
    }
}

#[async_trait]
impl TradingGateway for SimGateway {
    fn name(&self) -> &str {
        "sim"
    }

    async fn query_positions(&self, _account: &str) -> ControllerResult<Vec<PositionSnapshot>> {
        let book = self.book.lock().unwrap();
        Ok(book.positions.values().cloned().collect())
    }

    async fn query_asset(&self, _account: &str) -> ControllerResult<AssetSnapshot> {
        let book = self.book.lock().unwrap();
        let holdings: f64 = book
            .positions
            .values()
            .map(|p| p.held_volume * book.prices.get(&p.instrument).copied().unwrap_or(p.avg_cost))
            .sum();
        Ok(AssetSnapshot {
            total_value: book.cash + holdings,
            cash_available: book.cash,
        })
    }

    async fn place_order(
        &self,
        instrument: &str,
        side: Side,
        volume: f64,
        price: f64,
    ) -> ControllerResult<String> {
        if volume <= 0.0 || price <= 0.0 {
            return Err(ControllerError::Invariant(format!(
                "order for {} with volume {} at price {}",
                instrument, volume, price
            )));
        }

        let mut book = self.book.lock().unwrap();
        let amount = volume * price;
        match side {
            Side::Buy => {
                if book.cash < amount {
                    return Err(ControllerError::Gateway(format!(
                        "insufficient cash for {} buy",
                        instrument
                    )));
                }
                book.cash -= amount;
                let entry = book
                    .positions
                    .entry(instrument.to_string())
                    .or_insert_with(|| PositionSnapshot {
                        instrument: instrument.to_string(),
                        name: instrument.to_string(),
                        held_volume: 0.0,
                        available_volume: 0.0,
                        avg_cost: 0.0,
                    });
                let old_cost = entry.held_volume * entry.avg_cost;
                entry.held_volume += volume;
                entry.available_volume += volume;
                entry.avg_cost = (old_cost + amount) / entry.held_volume;
            }
            Side::Sell => {
                let entry = book.positions.get_mut(instrument).ok_or_else(|| {
                    ControllerError::Gateway(format!("no position to sell for {}", instrument))
                })?;
                if entry.available_volume < volume {
                    return Err(ControllerError::Gateway(format!(
                        "insufficient available volume for {} sell",
                        instrument
                    )));
                }
                entry.held_volume -= volume;
                entry.available_volume -= volume;
                book.cash += amount;
            }
        }

        let order_id = format!("SIMGW{:08}", self.order_seq.fetch_add(1, Ordering::Relaxed));
        debug!(
            "sim gateway filled {} {} {}@{} -> {}",
            side.as_str(),
            instrument,
            volume,
            price,
            order_id
        );
        Ok(order_id)
    }

    async fn cancel_order(&self, _order_id: &str) -> ControllerResult<()> {
        // Fills are immediate, so there is never anything to cancel.
        Ok(())
    }
}

#[async_trait]
impl MarketDataFeed for SimGateway {
    async fn latest_price(&self, instrument: &str) -> ControllerResult<f64> {
        let book = self.book.lock().unwrap();
        book.prices
            .get(instrument)
            .copied()
            .ok_or_else(|| ControllerError::MarketDataUnavailable(instrument.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sim_gateway_round_trip() {
        let gw = SimGateway::new(100_000.0);
        gw.set_price("600036", 10.0);

        gw.place_order("600036", Side::Buy, 1000.0, 10.0).await.unwrap();
        let positions = gw.query_positions("acct").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].held_volume, 1000.0);

        let asset = gw.query_asset("acct").await.unwrap();
        assert!((asset.cash_available - 90_000.0).abs() < 1e-9);

        gw.place_order("600036", Side::Sell, 400.0, 11.0).await.unwrap();
        let positions = gw.query_positions("acct").await.unwrap();
        assert_eq!(positions[0].held_volume, 600.0);
    }

    #[tokio::test]
    async fn test_sim_gateway_rejects_oversell() {
        let gw = SimGateway::new(1_000.0);
        let err = gw
            .place_order("600036", Side::Sell, 100.0, 10.0)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_feed_unavailable_price() {
        let gw = SimGateway::new(0.0);
        let err = gw.latest_price("600036").await.unwrap_err();
        assert!(err.is_transient());
    }
}
