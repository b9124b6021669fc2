// Task supervisor: liveness checks and bounded restarts for control loops

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shared slot holding a loop's current join handle. The owning code writes
/// it on every (re)start and the liveness probe reads through it, so the
/// probe never sees a handle from before a restart.
#[derive(Clone)]
pub struct TaskSlot {
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self {
            handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set(&self, handle: JoinHandle<()>) {
        let mut slot = self.handle.lock().unwrap();
        *slot = Some(handle);
    }

    /// Re-resolved on every check; a slot that was never started counts as
    /// dead.
    pub fn is_alive(&self) -> bool {
        let slot = self.handle.lock().unwrap();
        slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Take the handle out for joining at shutdown.
    pub fn take(&self) -> Option<JoinHandle<()>> {
        self.handle.lock().unwrap().take()
    }
}

impl Default for TaskSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartEvent {
    pub name: String,
    pub at: DateTime<Utc>,
    pub reason: String,
}

type RestartFn = Box<dyn Fn() -> JoinHandle<()> + Send + Sync>;

struct Supervised {
    name: String,
    slot: TaskSlot,
    restart: RestartFn,
    last_restart: Option<Instant>,
}

/// Watches registered loops and restarts dead ones after a cooldown. Never
/// supervises itself, and stops independently of its charges so shutdown
/// can disable supervision before stopping the loops.
pub struct Supervisor {
    tasks: Mutex<Vec<Supervised>>,
    history: Mutex<VecDeque<RestartEvent>>,
    cooldown: Duration,
    interval: Duration,
    max_history: usize,
    stop: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(interval: Duration, cooldown: Duration) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            cooldown,
            interval,
            max_history: 100,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Register a named loop. The restart closure spawns a fresh task and
    /// returns its handle; the supervisor writes it back into the slot.
    pub fn register<F>(&self, name: &str, slot: TaskSlot, restart: F)
    where
        F: Fn() -> JoinHandle<()> + Send + Sync + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(Supervised {
            name: name.to_string(),
            slot,
            restart: Box::new(restart),
            last_restart: None,
        });
        debug!("supervising '{}'", name);
    }

    pub async fn run(self: Arc<Self>) {
        info!("supervisor started ({} task(s))", self.tasks.lock().unwrap().len());
        while !self.stop.load(Ordering::Relaxed) {
            self.check_once();
            tokio::time::sleep(self.interval).await;
        }
        info!("supervisor stopped");
    }

    /// One liveness sweep. Public so tests can drive checks directly.
    pub fn check_once(&self) {
        if self.stop.load(Ordering::Relaxed) {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap();
        for task in tasks.iter_mut() {
            if task.slot.is_alive() {
                continue;
            }
            if let Some(last) = task.last_restart {
                if last.elapsed() < self.cooldown {
                    debug!("'{}' is down but inside restart cooldown", task.name);
                    continue;
                }
            }

            warn!("'{}' is not alive, restarting", task.name);
            let handle = (task.restart)();
            task.slot.set(handle);
            task.last_restart = Some(Instant::now());

            let mut history = self.history.lock().unwrap();
            history.push_back(RestartEvent {
                name: task.name.clone(),
                at: Utc::now(),
                reason: "liveness probe reported not alive".to_string(),
            });
            while history.len() > self.max_history {
                history.pop_front();
            }
        }
    }

    pub fn restart_history(&self) -> Vec<RestartEvent> {
        self.history.lock().unwrap().iter().cloned().collect()
    }
}
