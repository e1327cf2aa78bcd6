//! Concurrent task dispatcher.
//!
//! The runner matches queued tasks to handlers registered by kind and runs
//! each on its own thread once every task it waits on is ready. Handlers
//! receive a tomb-style dying token; on abort they are expected to wind down
//! and return a cancellation error.

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, Weak},
    thread::{self, JoinHandle},
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::state::{StateStore, Status, Task};

/// Cancellation token shared between the runner and a handler.
#[derive(Clone, Default)]
pub struct Dying {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Dying {
    /// Creates a live token.
    pub fn new() -> Dying {
        Dying::default()
    }

    /// Flags the token; waiters wake immediately.
    pub fn kill(&self) {
        let (flag, cond) = &*self.inner;
        let mut dying = flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *dying = true;
        cond.notify_all();
    }

    /// True once the token was killed.
    pub fn is_dying(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleeps for up to `timeout`, returning `true` when killed meanwhile.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cond) = &*self.inner;
        let mut dying = flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let deadline = std::time::Instant::now() + timeout;
        while !*dying {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cond
                .wait_timeout(dying, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            dying = guard;
        }
        true
    }
}

/// Failure modes a handler may report.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task failed; the message lands in the task log.
    #[error("{0}")]
    Failed(String),

    /// The task observed its dying token and wound down.
    #[error("task aborted: {0}")]
    Aborted(String),

    /// The task cannot make progress yet and should be re-dispatched later.
    #[error("task will retry: {0}")]
    Retry(String),
}

/// Context handed to a handler invocation.
pub struct TaskContext {
    /// Shared state store.
    pub store: Arc<StateStore>,
    /// Snapshot of the task at dispatch time.
    pub task: Task,
    /// Cancellation token for this invocation.
    pub dying: Dying,
}

impl TaskContext {
    /// Appends an INFO line to this task's log.
    pub fn logf(&self, message: &str) {
        let mut st = self.store.lock();
        if let Err(err) = st.task_logf(&self.task.id, message) {
            warn!("Cannot log to task {}: {err}", self.task.id);
        }
    }

    /// Fetches a string value from the task data map.
    pub fn data_str(&self, key: &str) -> Option<String> {
        self.task
            .data
            .get(key)
            .and_then(|value| value.as_str().map(str::to_string))
    }
}

/// Handler invoked for a task kind.
pub type Handler = Arc<dyn Fn(&TaskContext) -> Result<(), TaskError> + Send + Sync>;

/// Dispatches runnable tasks onto worker threads.
pub struct TaskRunner {
    weak: Weak<TaskRunner>,
    store: Arc<StateStore>,
    handlers: Mutex<HashMap<String, Handler>>,
    fallback: Mutex<Option<Handler>>,
    running: Mutex<HashMap<String, Dying>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRunner {
    /// Creates a runner over the given store.
    pub fn new(store: Arc<StateStore>) -> Arc<TaskRunner> {
        Arc::new_cyclic(|weak| TaskRunner {
            weak: weak.clone(),
            store,
            handlers: Mutex::new(HashMap::new()),
            fallback: Mutex::new(None),
            running: Mutex::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
        })
    }

    fn arc(&self) -> Arc<TaskRunner> {
        self.weak.upgrade().expect("task runner alive")
    }

    /// Registers the handler for a task kind.
    pub fn add_handler(
        &self,
        kind: &str,
        handler: impl Fn(&TaskContext) -> Result<(), TaskError> + Send + Sync + 'static,
    ) {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(kind.to_string(), Arc::new(handler));
    }

    /// Registers the fallback invoked for unknown task kinds.
    ///
    /// Without a fallback, unknown kinds succeed silently so changes
    /// persisted by older daemons remain loadable.
    pub fn set_fallback(
        &self,
        handler: impl Fn(&TaskContext) -> Result<(), TaskError> + Send + Sync + 'static,
    ) {
        *self
            .fallback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(handler));
    }

    /// Dispatches every runnable task, including ones parked in `Wait`.
    pub fn ensure(&self) {
        self.dispatch(true);
        self.reap_finished_threads();
    }

    /// Kills the dying tokens of the given in-flight tasks.
    pub fn kill_tasks(&self, task_ids: &[String]) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for id in task_ids {
            if let Some(dying) = running.get(id) {
                dying.kill();
            }
        }
    }

    /// Kills every in-flight handler and joins the worker threads.
    pub fn stop(&self) {
        {
            let running = self
                .running
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for dying in running.values() {
                dying.kill();
            }
        }
        let threads: Vec<JoinHandle<()>> = self
            .threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for handle in threads {
            let _ = handle.join();
        }
    }

    /// Number of handlers currently running.
    pub fn active_count(&self) -> usize {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn dispatch(&self, include_wait: bool) {
        let candidates: Vec<Task> = {
            let st = self.store.lock();
            st.dispatchable_tasks()
        };

        for task in candidates {
            if task.status == Status::Wait && !include_wait {
                continue;
            }

            let handler = self.resolve_handler(&task.kind);
            let dying = Dying::new();
            {
                let mut running = self
                    .running
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if running.contains_key(&task.id) {
                    continue;
                }

                let mut st = self.store.lock();
                match st.task(&task.id) {
                    Ok(current)
                        if matches!(current.status, Status::Do | Status::Wait) => {}
                    _ => continue,
                }
                if st.set_task_status(&task.id, Status::Doing).is_err() {
                    continue;
                }
                running.insert(task.id.clone(), dying.clone());
            }

            debug!("Dispatching task {} ({})", task.id, task.kind);
            let runner = self.arc();
            let handle = thread::spawn(move || runner.run_task(task, handler, dying));
            self.threads
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(handle);
        }
    }

    fn resolve_handler(&self, kind: &str) -> Option<Handler> {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handler) = handlers.get(kind) {
            return Some(Arc::clone(handler));
        }
        drop(handlers);
        self.fallback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn run_task(self: Arc<Self>, task: Task, handler: Option<Handler>, dying: Dying) {
        let task_id = task.id.clone();
        let ctx = TaskContext {
            store: Arc::clone(&self.store),
            task,
            dying,
        };

        let result = match &handler {
            Some(handler) => handler(&ctx),
            // Unknown kind with no fallback: succeed silently for
            // forward-compatibility with old persisted changes.
            None => Ok(()),
        };

        {
            let mut st = self.store.lock();
            let aborting = matches!(
                st.task(&task_id).map(|t| t.status),
                Ok(Status::Aborting)
            );
            let status = if aborting {
                Status::Abort
            } else {
                match &result {
                    Ok(()) => Status::Done,
                    Err(TaskError::Retry(_)) => Status::Wait,
                    Err(TaskError::Aborted(_)) => Status::Abort,
                    Err(TaskError::Failed(message)) => {
                        if let Err(err) = st.task_errorf(&task_id, message) {
                            warn!("Cannot record task error: {err}");
                        }
                        Status::Error
                    }
                }
            };
            if let Err(err) = st.set_task_status(&task_id, status) {
                warn!("Cannot finish task {task_id}: {err}");
            }
        }

        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&task_id);

        // Cascade to tasks that were waiting on this one. Tasks parked in
        // Wait are left for the next ensure tick so a retrying handler does
        // not spin.
        self.dispatch(false);
    }

    fn reap_finished_threads(&self) {
        self.threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|handle| !handle.is_finished());
    }
}
