// Common test utilities and helpers

use gridpilot::core::types::PositionSnapshot;
use gridpilot::{Config, Database, PositionStore, SignalQueue};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Create a test configuration with sensible defaults
pub fn create_test_config() -> Config {
    let mut config = Config::default();
    config.store.db_path = ":memory:".to_string();
    config.loops.monitor_interval_secs = 1;
    config.loops.gateway_timeout_secs = 1;
    config.hours.windows = vec!["00:00-23:59".to_string()];
    config
}

/// Create a temporary directory for test databases
pub fn create_temp_db_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("test.db");
    (temp_dir, db_path)
}

/// In-memory database with the schema applied
pub fn create_test_database() -> Arc<Database> {
    let db = Database::new_in_memory().expect("in-memory database");
    db.run_migrations().expect("migrations");
    Arc::new(db)
}

pub fn snapshot(instrument: &str, held: f64, available: f64, cost: f64) -> PositionSnapshot {
    PositionSnapshot {
        instrument: instrument.to_string(),
        name: instrument.to_string(),
        held_volume: held,
        available_volume: available,
        avg_cost: cost,
    }
}

/// Store pre-loaded with one position at the given price
pub fn create_test_store(instrument: &str, held: f64, cost: f64, price: f64) -> Arc<PositionStore> {
    let store = Arc::new(PositionStore::new());
    store
        .sync(&[snapshot(instrument, held, held, cost)])
        .expect("sync");
    store.update_price(instrument, price);
    store
}

pub fn create_test_queue() -> Arc<SignalQueue> {
    Arc::new(SignalQueue::new(60, 300, 64))
}

/// Generate a random walk of prices for soak-style tests
#[allow(dead_code)]
pub fn generate_test_prices(base_price: f64, count: usize, volatility: f64) -> Vec<f64> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let mut prices = Vec::with_capacity(count);
    let mut current_price = base_price;

    for _ in 0..count {
        let change_pct = rng.gen_range(-volatility..volatility);
        current_price *= 1.0 + change_pct;
        prices.push(current_price);
    }

    prices
}
