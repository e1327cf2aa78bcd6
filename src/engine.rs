//! The state engine: manager registry, ensure loop and change pruning.
//!
//! Managers register in dependency order (leaves before the task runner).
//! The loop fires at most once per ensure interval and can be brought
//! forward with [`Engine::ensure_before`], which coalesces to the earliest
//! pending wake.

use std::{
    sync::{Arc, Condvar, Mutex, Weak},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::{debug, error};

use crate::{
    constants::{ABORT_WAIT, ENSURE_INTERVAL, MAX_READY_CHANGES, PRUNE_INTERVAL, PRUNE_WAIT},
    error::DaemonError,
    state::{StateStore, taskrunner::TaskRunner},
};

/// A subsystem given a chance to make forward progress on every tick.
pub trait Manager: Send + Sync {
    /// Identifies the manager in logs.
    fn name(&self) -> &'static str;

    /// Performs one round of housekeeping.
    fn ensure(&self) -> Result<(), DaemonError>;
}

struct WakeState {
    next_ensure: Instant,
    next_prune: Instant,
    stopping: bool,
}

/// Owns the periodic ensure tick and drives registered managers.
pub struct Engine {
    weak: Weak<Engine>,
    store: Arc<StateStore>,
    runner: Arc<TaskRunner>,
    managers: Mutex<Vec<Arc<dyn Manager>>>,
    wake: Mutex<WakeState>,
    wake_cond: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Creates an engine over the shared store and task runner.
    pub fn new(store: Arc<StateStore>, runner: Arc<TaskRunner>) -> Arc<Engine> {
        let now = Instant::now();
        Arc::new_cyclic(|weak| Engine {
            weak: weak.clone(),
            store,
            runner,
            managers: Mutex::new(Vec::new()),
            wake: Mutex::new(WakeState {
                next_ensure: now,
                next_prune: now + PRUNE_INTERVAL,
                stopping: false,
            }),
            wake_cond: Condvar::new(),
            thread: Mutex::new(None),
        })
    }

    fn arc(&self) -> Arc<Engine> {
        self.weak.upgrade().expect("engine alive")
    }

    /// Registers a manager; registration order is ensure order.
    pub fn add_manager(&self, manager: Arc<dyn Manager>) {
        self.managers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(manager);
    }

    /// The shared state store.
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// The task runner driven by this engine.
    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    /// Starts the ensure loop thread.
    pub fn start(&self) {
        let engine = self.arc();
        let handle = thread::spawn(move || engine.run_loop());
        *self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    /// Brings the next ensure tick forward to at most `delay` from now.
    pub fn ensure_before(&self, delay: Duration) {
        let target = Instant::now() + delay;
        let mut wake = self
            .wake
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if target < wake.next_ensure {
            wake.next_ensure = target;
            self.wake_cond.notify_all();
        }
    }

    /// Runs one ensure pass synchronously on the calling thread.
    pub fn ensure_now(&self) {
        let managers: Vec<Arc<dyn Manager>> = self
            .managers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for manager in managers {
            debug!("Ensuring {}", manager.name());
            if let Err(err) = manager.ensure() {
                error!("Manager {} ensure failed: {err}", manager.name());
            }
        }
        self.runner.ensure();
    }

    /// Stops the loop, the task runner and joins the loop thread.
    pub fn stop(&self) {
        {
            let mut wake = self
                .wake
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            wake.stopping = true;
            self.wake_cond.notify_all();
        }
        if let Some(handle) = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            let _ = handle.join();
        }
        self.runner.stop();
    }

    fn run_loop(self: Arc<Self>) {
        loop {
            let due = {
                let mut wake = self
                    .wake
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                loop {
                    if wake.stopping {
                        return;
                    }
                    let now = Instant::now();
                    let next = wake.next_ensure.min(wake.next_prune);
                    if now >= next {
                        let ensure_due = now >= wake.next_ensure;
                        let prune_due = now >= wake.next_prune;
                        if ensure_due {
                            wake.next_ensure = now + ENSURE_INTERVAL;
                        }
                        if prune_due {
                            wake.next_prune = now + PRUNE_INTERVAL;
                        }
                        break (ensure_due, prune_due);
                    }
                    let (guard, _) = self
                        .wake_cond
                        .wait_timeout(wake, next - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    wake = guard;
                }
            };

            let (ensure_due, prune_due) = due;
            if ensure_due {
                self.ensure_now();
            }
            if prune_due {
                let mut st = self.store.lock();
                st.prune(Utc::now(), PRUNE_WAIT, ABORT_WAIT, MAX_READY_CHANGES);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingManager {
        hits: AtomicUsize,
    }

    impl Manager for CountingManager {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn ensure(&self) -> Result<(), DaemonError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn ensure_before_wakes_the_loop() {
        let store = Arc::new(StateStore::in_memory());
        let runner = TaskRunner::new(Arc::clone(&store));
        let engine = Engine::new(store, runner);

        let manager = Arc::new(CountingManager {
            hits: AtomicUsize::new(0),
        });
        engine.add_manager(Arc::clone(&manager) as Arc<dyn Manager>);

        engine.start();
        engine.ensure_before(Duration::ZERO);

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(manager.hits.load(Ordering::SeqCst) >= 1);

        engine.stop();
    }

    #[test]
    fn ensure_now_runs_managers_in_order() {
        let store = Arc::new(StateStore::in_memory());
        let runner = TaskRunner::new(Arc::clone(&store));
        let engine = Engine::new(store, runner);

        let first = Arc::new(CountingManager {
            hits: AtomicUsize::new(0),
        });
        let second = Arc::new(CountingManager {
            hits: AtomicUsize::new(0),
        });
        engine.add_manager(Arc::clone(&first) as Arc<dyn Manager>);
        engine.add_manager(Arc::clone(&second) as Arc<dyn Manager>);

        engine.ensure_now();
        assert_eq!(first.hits.load(Ordering::SeqCst), 1);
        assert_eq!(second.hits.load(Ordering::SeqCst), 1);
    }
}
