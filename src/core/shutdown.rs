// Ordered, fault-isolated teardown of the controller runtime

use crate::core::position_store::FlushLoop;
use crate::core::supervisor::TaskSlot;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// A business loop as the sequencer sees it: a name, the stop flag it
/// checks at its iteration boundary, and the slot holding its task.
pub struct LoopHandle {
    pub name: String,
    pub stop: Arc<AtomicBool>,
    pub slot: TaskSlot,
}

/// Tears the runtime down in dependency order: refuse new external
/// commands, stop the supervisor (so deliberate stops are not mistaken for
/// crashes), stop and join the business loops, then flush and release
/// owned resources. A failing step is logged and never blocks the rest.
pub struct ShutdownSequencer {
    accepting: Arc<AtomicBool>,
    supervisor_stop: Arc<AtomicBool>,
    supervisor_slot: TaskSlot,
    loops: Vec<LoopHandle>,
    flusher: Arc<FlushLoop>,
    join_timeout: Duration,
}

impl ShutdownSequencer {
    pub fn new(
        accepting: Arc<AtomicBool>,
        supervisor_stop: Arc<AtomicBool>,
        supervisor_slot: TaskSlot,
        loops: Vec<LoopHandle>,
        flusher: Arc<FlushLoop>,
        join_timeout: Duration,
    ) -> Self {
        Self {
            accepting,
            supervisor_stop,
            supervisor_slot,
            loops,
            flusher,
            join_timeout,
        }
    }

    pub async fn run(mut self) {
        info!("shutdown sequence started");

        // 1. Stop accepting new external requests.
        self.accepting.store(false, Ordering::Relaxed);
        info!("control plane closed to new commands");

        // 2. Stop supervision before the loops it watches.
        self.supervisor_stop.store(true, Ordering::Relaxed);
        self.join("supervisor", self.supervisor_slot.take()).await;

        // 3. Signal every business loop, then join them with a bound.
        for handle in &self.loops {
            handle.stop.store(true, Ordering::Relaxed);
        }
        let loops = std::mem::take(&mut self.loops);
        for handle in loops {
            self.join(&handle.name, handle.slot.take()).await;
        }

        // 4. Close owned resources in reverse dependency order: the store's
        // dirty state reaches SQLite before the process exits.
        self.flusher.flush_once();
        info!("final durable flush complete");

        info!("shutdown sequence finished");
    }

    async fn join(&self, name: &str, handle: Option<tokio::task::JoinHandle<()>>) {
        let Some(handle) = handle else {
            return;
        };
        match timeout(self.join_timeout, handle).await {
            Ok(Ok(())) => info!("'{}' stopped", name),
            Ok(Err(e)) => error!("'{}' terminated abnormally: {}", name, e),
            Err(_) => {
                warn!(
                    "'{}' did not stop within {:?}, abandoning it",
                    name, self.join_timeout
                );
            }
        }
    }
}
