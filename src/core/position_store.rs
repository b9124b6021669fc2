// Dual-layer position store: fast in-memory view plus SQLite durable layer

use crate::core::types::{DurableFields, Position, PositionSnapshot};
use crate::db::{self, Database};
use crate::error::{ControllerError, ControllerResult};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, warn};

struct StoreInner {
    positions: HashMap<String, Position>,
    /// Monotonic change cursor. Bumped exactly once per observable mutation;
    /// consumers compare it, they never interpret it.
    version: u64,
}

/// The volatile layer. All per-instrument field updates happen inside one
/// critical section, so readers never observe a half-written record. The
/// durable layer is synchronized by `FlushLoop` on its own interval and
/// never blocks writers here.
pub struct PositionStore {
    inner: RwLock<StoreInner>,
    /// Instruments with durable fields awaiting a flush. Guarded separately
    /// so flush bookkeeping never extends the store's write section.
    dirty: Mutex<HashSet<String>>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                positions: HashMap::new(),
                version: 0,
            }),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    /// Seed the volatile layer with durable fields loaded from SQLite at
    /// startup. Does not mark anything dirty.
    pub fn restore(&self, rows: Vec<(String, String, DurableFields)>) {
        let mut inner = self.inner.write().unwrap();
        for (instrument, name, durable) in rows {
            let position = inner
                .positions
                .entry(instrument.clone())
                .or_insert_with(|| Position::new(&instrument, &name));
            position.durable = durable;
        }
        inner.version += 1;
    }

    /// Merge a gateway snapshot batch under one write-lock acquisition.
    ///
    /// Creates positions on first sight; a held volume of zero logically
    /// closes the position while keeping its durable fields for audit.
    /// The version is bumped once per call, not once per row.
    pub fn sync(&self, snapshots: &[PositionSnapshot]) -> ControllerResult<()> {
        for snapshot in snapshots {
            if snapshot.held_volume < 0.0 || snapshot.available_volume < 0.0 {
                return Err(ControllerError::Invariant(format!(
                    "negative volume for {} in gateway snapshot",
                    snapshot.instrument
                )));
            }
        }

        let now = Utc::now();
        let mut inner = self.inner.write().unwrap();
        for snapshot in snapshots {
            let position = inner
                .positions
                .entry(snapshot.instrument.clone())
                .or_insert_with(|| Position::new(&snapshot.instrument, &snapshot.name));

            if position.held_volume == 0.0 && snapshot.held_volume > 0.0 {
                position.durable.open_date.get_or_insert(now);
            }

            position.name = snapshot.name.clone();
            position.held_volume = snapshot.held_volume;
            position.available_volume = snapshot.available_volume;
            position.avg_cost = snapshot.avg_cost;
            position.recompute_derived();
            position.updated_at = now;
        }
        inner.version += 1;
        Ok(())
    }

    /// Recompute derived fields for one instrument at a new market price.
    /// Unknown instruments are ignored without a version bump.
    pub fn update_price(&self, instrument: &str, price: f64) {
        let mut inner = self.inner.write().unwrap();
        let Some(position) = inner.positions.get_mut(instrument) else {
            return;
        };
        position.current_price = price;
        position.recompute_derived();
        position.updated_at = Utc::now();
        inner.version += 1;
    }

    /// Apply a strategy-side mutation to the durable fields and schedule a
    /// flush. The closure runs inside the write section; the flush itself is
    /// deferred to the durable-sync loop.
    pub fn mutate_durable<F>(&self, instrument: &str, mutate: F) -> ControllerResult<()>
    where
        F: FnOnce(&mut DurableFields),
    {
        {
            let mut inner = self.inner.write().unwrap();
            let position = inner.positions.get_mut(instrument).ok_or_else(|| {
                ControllerError::Invariant(format!("unknown instrument: {}", instrument))
            })?;
            mutate(&mut position.durable);
            position.updated_at = Utc::now();
            inner.version += 1;
        }
        self.dirty.lock().unwrap().insert(instrument.to_string());
        Ok(())
    }

    /// Apply a simulated fill directly to the volatile layer. Used by the
    /// simulated execution boundary; one critical section, one version bump.
    pub fn apply_sim_fill(
        &self,
        instrument: &str,
        buy: bool,
        price: f64,
        volume: f64,
    ) -> ControllerResult<()> {
        let mut inner = self.inner.write().unwrap();
        let position = inner
            .positions
            .entry(instrument.to_string())
            .or_insert_with(|| Position::new(instrument, instrument));

        if buy {
            let old_cost = position.held_volume * position.avg_cost;
            position.held_volume += volume;
            position.available_volume += volume;
            if position.held_volume > 0.0 {
                position.avg_cost = (old_cost + volume * price) / position.held_volume;
            }
            position.durable.open_date.get_or_insert(Utc::now());
        } else {
            if position.available_volume < volume {
                return Err(ControllerError::Invariant(format!(
                    "sim sell of {} exceeds available volume for {}",
                    volume, instrument
                )));
            }
            position.held_volume -= volume;
            position.available_volume -= volume;
        }

        position.current_price = price;
        position.recompute_derived();
        position.updated_at = Utc::now();
        inner.version += 1;
        Ok(())
    }

    /// Point-in-time snapshot of one position plus the current version.
    pub fn read(&self, instrument: &str) -> Option<(Position, u64)> {
        let inner = self.inner.read().unwrap();
        inner
            .positions
            .get(instrument)
            .map(|p| (p.clone(), inner.version))
    }

    /// Point-in-time snapshot of every position plus the current version.
    pub fn read_all(&self) -> (Vec<Position>, u64) {
        let inner = self.inner.read().unwrap();
        let mut positions: Vec<Position> = inner.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        (positions, inner.version)
    }

    pub fn version(&self) -> u64 {
        self.inner.read().unwrap().version
    }

    /// Drain the dirty set together with the durable rows to flush.
    pub fn take_dirty(&self) -> Vec<(String, String, DurableFields)> {
        let instruments: Vec<String> = {
            let mut dirty = self.dirty.lock().unwrap();
            dirty.drain().collect()
        };
        if instruments.is_empty() {
            return Vec::new();
        }
        let inner = self.inner.read().unwrap();
        instruments
            .into_iter()
            .filter_map(|instrument| {
                inner
                    .positions
                    .get(&instrument)
                    .map(|p| (instrument, p.name.clone(), p.durable.clone()))
            })
            .collect()
    }

    /// Put instruments back on the dirty set after a failed flush so the
    /// next scheduled flush retries them.
    pub fn requeue_dirty(&self, instruments: impl IntoIterator<Item = String>) {
        let mut dirty = self.dirty.lock().unwrap();
        dirty.extend(instruments);
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().unwrap().len()
    }
}

impl Default for PositionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable-layer synchronization loop. Runs on its own interval, flushing
/// only the durable-field subset; a delayed or failed flush never blocks the
/// volatile path, and the dirty set makes later flushes supersede earlier
/// ones for the same instrument.
pub struct FlushLoop {
    store: Arc<PositionStore>,
    database: Arc<Database>,
    settings: Arc<crate::config::RuntimeSettings>,
    stop: Arc<AtomicBool>,
}

impl FlushLoop {
    pub fn new(
        store: Arc<PositionStore>,
        database: Arc<Database>,
        settings: Arc<crate::config::RuntimeSettings>,
    ) -> Self {
        Self {
            store,
            database,
            settings,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub async fn run(self: Arc<Self>) {
        debug!("durable flush loop started");
        while !self.stop.load(Ordering::Relaxed) {
            self.flush_once();
            let secs = self.settings.durable_sync_secs().max(1);
            tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
        }
        // Last chance before the loop exits; shutdown also flushes.
        self.flush_once();
        debug!("durable flush loop stopped");
    }

    /// Flush the current dirty set. At most one flush runs at a time because
    /// this is the only caller apart from the shutdown sequencer, which runs
    /// after this loop has stopped.
    pub fn flush_once(&self) {
        let batch = self.store.take_dirty();
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        let mut failed = Vec::new();
        for (instrument, name, durable) in batch {
            if let Err(e) =
                db::position::upsert(self.database.connection(), &instrument, &name, &durable)
            {
                error!("durable flush failed for {}: {}", instrument, e);
                failed.push(instrument);
            }
        }
        if failed.is_empty() {
            debug!("flushed durable fields for {} instrument(s)", count);
        } else {
            warn!("{} of {} durable flushes failed, will retry", failed.len(), count);
            self.store.requeue_dirty(failed);
        }
    }
}
