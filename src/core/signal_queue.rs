// Pending-signal queue with validation and reprocessing cooldown

use crate::core::position_store::PositionStore;
use crate::core::types::{Side, Signal, SignalKind};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

type SignalKey = (String, SignalKind);

struct QueueInner {
    pending: HashMap<SignalKey, Signal>,
    /// Last successful execution per (instrument, kind), consulted by the
    /// validator's cooldown check.
    processed: HashMap<SignalKey, DateTime<Utc>>,
}

/// Why the validator discarded a signal. Expected outcomes, logged at low
/// severity and surfaced to the control plane as status, never as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    PositionGone,
    Stale { age_secs: i64 },
    CoolingDown { since_secs: i64 },
    InsufficientVolume,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::PositionGone => write!(f, "position no longer held"),
            Rejection::Stale { age_secs } => write!(f, "signal is {}s old", age_secs),
            Rejection::CoolingDown { since_secs } => {
                write!(f, "same kind executed {}s ago", since_secs)
            }
            Rejection::InsufficientVolume => write!(f, "available volume insufficient"),
        }
    }
}

/// Bounded map of pending signals keyed by (instrument, kind).
///
/// Guarded by its own mutex, distinct from the position store's lock; the
/// two are never held at the same time.
pub struct SignalQueue {
    inner: Mutex<QueueInner>,
    staleness_secs: i64,
    cooldown_secs: i64,
    capacity: usize,
}

impl SignalQueue {
    pub fn new(staleness_secs: i64, cooldown_secs: i64, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: HashMap::new(),
                processed: HashMap::new(),
            }),
            staleness_secs,
            cooldown_secs,
            capacity,
        }
    }

    /// Enqueue a detected signal. A pending signal of the same
    /// (instrument, kind) is overwritten: a newer detection always
    /// supersedes an older undelivered one. Returns false when the queue is
    /// full and the key is not already present.
    pub fn enqueue(&self, signal: Signal) -> bool {
        let key = (signal.instrument.clone(), signal.kind);
        let mut inner = self.inner.lock().unwrap();
        if !inner.pending.contains_key(&key) && inner.pending.len() >= self.capacity {
            warn!(
                "signal queue full, dropping {} for {}",
                signal.kind.as_str(),
                signal.instrument
            );
            return false;
        }
        if inner.pending.insert(key, signal).is_some() {
            debug!("superseded pending signal (last-write-wins)");
        }
        true
    }

    /// Drain every pending signal. Risk signals sort ahead of grid signals
    /// so the executor handles them first.
    pub fn drain(&self) -> Vec<Signal> {
        let mut inner = self.inner.lock().unwrap();
        let mut signals: Vec<Signal> = inner.pending.drain().map(|(_, s)| s).collect();
        signals.sort_by(|a, b| {
            b.kind
                .is_risk()
                .cmp(&a.kind.is_risk())
                .then_with(|| a.instrument.cmp(&b.instrument))
        });
        signals
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Validate a signal against the current store state. Checks run in a
    /// fixed order and the first failure rejects:
    ///   1. position still exists with positive held volume
    ///   2. signal age within the staleness window
    ///   3. instrument outside its per-kind reprocessing cooldown
    ///   4. available volume covers the requested sell volume
    ///
    /// The store lock and the queue lock are taken sequentially, never
    /// nested.
    pub fn validate(&self, signal: &Signal, store: &PositionStore) -> Result<(), Rejection> {
        let now = Utc::now();

        let position = match store.read(&signal.instrument) {
            Some((position, _)) if position.is_held() => position,
            _ => return Err(Rejection::PositionGone),
        };

        let age = signal.age_secs(now);
        if age > self.staleness_secs {
            return Err(Rejection::Stale { age_secs: age });
        }

        {
            let inner = self.inner.lock().unwrap();
            let key = (signal.instrument.clone(), signal.kind);
            if let Some(processed_at) = inner.processed.get(&key) {
                let since = (now - *processed_at).num_seconds();
                if since < self.cooldown_secs {
                    return Err(Rejection::CoolingDown { since_secs: since });
                }
            }
        }

        if signal.kind.side() == Side::Sell {
            if let Some(volume) = signal.volume {
                if position.available_volume < volume {
                    return Err(Rejection::InsufficientVolume);
                }
            }
        }

        Ok(())
    }

    /// Record a successful execution so future identical signals hit the
    /// cooldown check.
    pub fn mark_processed(&self, instrument: &str, kind: SignalKind) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .processed
            .insert((instrument.to_string(), kind), Utc::now());
    }

    #[cfg(test)]
    pub fn mark_processed_at(&self, instrument: &str, kind: SignalKind, at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        inner.processed.insert((instrument.to_string(), kind), at);
    }
}
