//! Service lifecycle engine.
//!
//! Each service is a record with its own state machine, protected by a
//! per-record mutex under the manager-level map lock. Starting a service
//! spawns the child, watches it through the okay-wait window, then hands the
//! exit channel to a monitor thread that applies the exit action table:
//! restarts go through the backoff schedule, `shutdown` tears down the
//! daemon, `ignore` leaves the service inactive. Stopping walks the
//! SIGTERM / kill-delay / SIGKILL / fail-wait ladder.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, Weak,
        mpsc::{Receiver, RecvTimeoutError, Sender},
    },
    thread,
    time::{Duration, Instant},
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;
use tracing::{debug, error, info, warn};

use crate::{
    constants::{FAIL_WAIT, OKAY_WAIT, RING_BUFFER_CAPACITY},
    engine::Manager,
    error::{DaemonError, ServiceError},
    logs::{OutputWriter, parse_entry},
    plan::{self, Plan, PlanManager, ServiceAction, ServiceConfig, Startup},
    reaper::Waiter,
    ringbuf::{LogIterator, RingBuffer},
    spawn::{SpawnSpec, spawn_child},
    state::{
        StateStore,
        taskrunner::{TaskContext, TaskError, TaskRunner},
    },
};

/// Intent delivered to the daemon main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    /// Stop services and exit cleanly.
    Stop,
    /// Stop services and exit with the restart sentinel.
    Restart,
}

/// Per-service lifecycle state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ServiceState {
    /// Known but never started.
    Initial,
    /// Spawned, inside the okay-wait window.
    Starting,
    /// Alive past the okay-wait window.
    Running,
    /// Exited, waiting out the restart backoff.
    BackoffWait,
    /// SIGTERM sent, waiting up to kill-delay.
    Terminating,
    /// SIGKILL sent, waiting up to fail-wait.
    Killing,
    /// Stopped on request.
    Stopped,
    /// Exited and left inactive.
    Exited,
}

impl ServiceState {
    /// True while the service holds (or is about to hold) a live process.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServiceState::Starting
                | ServiceState::Running
                | ServiceState::BackoffWait
                | ServiceState::Terminating
                | ServiceState::Killing
        )
    }
}

/// Read view of one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Service name.
    pub name: String,
    /// Autostart participation.
    pub startup: Startup,
    /// Current lifecycle state.
    pub current: ServiceState,
}

struct ServiceInner {
    config: ServiceConfig,
    state: ServiceState,
    pid: Option<u32>,
    started_at: Option<Instant>,
    backoff_index: u32,
    current_backoff: Duration,
    pending_action: Option<(ServiceAction, &'static str)>,
    generation: u64,
}

struct ServiceRecord {
    name: String,
    ring: RingBuffer,
    inner: Mutex<ServiceInner>,
    cond: Condvar,
}

impl ServiceRecord {
    fn new(name: &str, config: ServiceConfig) -> ServiceRecord {
        ServiceRecord {
            name: name.to_string(),
            ring: RingBuffer::new(RING_BUFFER_CAPACITY),
            inner: Mutex::new(ServiceInner {
                config,
                state: ServiceState::Initial,
                pid: None,
                started_at: None,
                backoff_index: 0,
                current_backoff: Duration::ZERO,
                pending_action: None,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServiceInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Computes the next backoff wait from the previous one.
pub fn next_backoff(config: &ServiceConfig, current: Duration) -> Duration {
    if current.is_zero() {
        config.backoff_delay()
    } else {
        config
            .backoff_limit()
            .min(current.mul_f64(config.backoff_factor()))
    }
}

fn jitter(base: Duration) -> Duration {
    let ratio = rand::thread_rng().gen_range(0.0..crate::constants::BACKOFF_JITTER_RATIO);
    base.mul_f64(ratio)
}

/// Owns every service record and drives their lifecycles.
pub struct ServiceManager {
    weak: Weak<ServiceManager>,
    store: Arc<StateStore>,
    planner: Arc<PlanManager>,
    waiter: Arc<dyn Waiter>,
    services: Mutex<HashMap<String, Arc<ServiceRecord>>>,
    extra_args: Mutex<HashMap<String, Vec<String>>>,
    shutdown_tx: Sender<ShutdownRequest>,
}

impl ServiceManager {
    /// Creates a manager over the shared store and plan.
    pub fn new(
        store: Arc<StateStore>,
        planner: Arc<PlanManager>,
        waiter: Arc<dyn Waiter>,
        shutdown_tx: Sender<ShutdownRequest>,
    ) -> Arc<ServiceManager> {
        Arc::new_cyclic(|weak| ServiceManager {
            weak: weak.clone(),
            store,
            planner,
            waiter,
            services: Mutex::new(HashMap::new()),
            extra_args: Mutex::new(HashMap::new()),
            shutdown_tx,
        })
    }

    fn arc(&self) -> Arc<ServiceManager> {
        self.weak.upgrade().expect("service manager alive")
    }

    /// Registers the start/stop task handlers with the runner.
    pub fn register_handlers(&self, runner: &TaskRunner) {
        let mgr = self.arc();
        runner.add_handler("start", move |ctx| mgr.start_handler(ctx));
        let mgr = self.arc();
        // Stopping is not safely cancellable; the handler ignores the
        // dying token on purpose.
        runner.add_handler("stop", move |ctx| mgr.stop_handler(ctx));
    }

    // ------------------------------------------------------------------
    // Change builders
    // ------------------------------------------------------------------

    /// Builds a start change over the dependency closure of `names`.
    pub fn start(&self, names: &[String]) -> Result<String, DaemonError> {
        let plan = self.planner.plan();
        let order = plan::start_order(&plan, names)?;

        let mut st = self.store.lock();
        let change_id = st.new_change("start", &operation_summary("Start", &order));
        let mut previous: Vec<String> = Vec::new();
        for name in &order {
            let task_id = st
                .new_task(
                    &change_id,
                    "start",
                    &format!("Start service \"{name}\""),
                    previous.clone(),
                    service_data(name),
                )
                .map_err(DaemonError::State)?;
            previous.push(task_id);
        }
        Ok(change_id)
    }

    /// Builds a stop change over `names` in reverse start order.
    pub fn stop(&self, names: &[String]) -> Result<String, DaemonError> {
        let plan = self.planner.plan();
        self.ensure_known(&plan, names)?;
        let order = self.stop_order(&plan, names);

        let mut st = self.store.lock();
        let change_id = st.new_change("stop", &operation_summary("Stop", &order));
        let mut previous: Vec<String> = Vec::new();
        for name in &order {
            let task_id = st
                .new_task(
                    &change_id,
                    "stop",
                    &format!("Stop service \"{name}\""),
                    previous.clone(),
                    service_data(name),
                )
                .map_err(DaemonError::State)?;
            previous.push(task_id);
        }
        Ok(change_id)
    }

    /// Builds a restart change: stop what runs, then start everything.
    pub fn restart(&self, names: &[String]) -> Result<String, DaemonError> {
        let plan = self.planner.plan();
        self.ensure_known(&plan, names)?;

        let active: Vec<String> = names
            .iter()
            .filter(|name| self.state_of(name).is_some_and(|s| s.is_active()))
            .cloned()
            .collect();
        let stop_order = self.stop_order(&plan, &active);
        let start_order = plan::start_order(&plan, names)?;

        let mut st = self.store.lock();
        let change_id =
            st.new_change("restart", &operation_summary("Restart", &start_order));
        let mut previous: Vec<String> = Vec::new();
        for name in &stop_order {
            let task_id = st
                .new_task(
                    &change_id,
                    "stop",
                    &format!("Stop service \"{name}\""),
                    previous.clone(),
                    service_data(name),
                )
                .map_err(DaemonError::State)?;
            previous.push(task_id);
        }
        for name in &start_order {
            let task_id = st
                .new_task(
                    &change_id,
                    "start",
                    &format!("Start service \"{name}\""),
                    previous.clone(),
                    service_data(name),
                )
                .map_err(DaemonError::State)?;
            previous.push(task_id);
        }
        Ok(change_id)
    }

    /// Builds a start change over every `startup: enabled` service.
    pub fn autostart(&self) -> Result<String, DaemonError> {
        let plan = self.planner.plan();
        let names = plan.autostart_names();
        if names.is_empty() {
            let mut st = self.store.lock();
            return Ok(st.new_change("autostart", "Autostart (no enabled services)"));
        }
        let order = plan::start_order(&plan, &names)?;

        let mut st = self.store.lock();
        let change_id =
            st.new_change("autostart", &operation_summary("Autostart", &order));
        let mut previous: Vec<String> = Vec::new();
        for name in &order {
            let task_id = st
                .new_task(
                    &change_id,
                    "start",
                    &format!("Start service \"{name}\""),
                    previous.clone(),
                    service_data(name),
                )
                .map_err(DaemonError::State)?;
            previous.push(task_id);
        }
        Ok(change_id)
    }

    /// Diffs running services against the current plan.
    ///
    /// Returns the services to stop (config changed or removed) and the
    /// services to start (autostart-enabled plus still-planned active ones),
    /// both in execution order.
    pub fn replan(&self) -> Result<(Vec<String>, Vec<String>), DaemonError> {
        let plan = self.planner.plan();

        let active: Vec<(String, ServiceConfig)> = {
            let services = self.lock_services();
            services
                .iter()
                .filter_map(|(name, record)| {
                    let inner = record.lock();
                    inner
                        .state
                        .is_active()
                        .then(|| (name.clone(), inner.config.clone()))
                })
                .collect()
        };

        let stops: Vec<String> = active
            .iter()
            .filter(|(name, config)| plan.services.get(name) != Some(config))
            .map(|(name, _)| name.clone())
            .collect();

        let mut start_set: BTreeSet<String> =
            plan.autostart_names().into_iter().collect();
        for (name, _) in &active {
            if plan.services.contains_key(name) {
                start_set.insert(name.clone());
            }
        }
        let start_names: Vec<String> = start_set.into_iter().collect();
        let starts = plan::start_order(&plan, &start_names)?;
        let stops = self.stop_order(&plan, &stops);

        Ok((stops, starts))
    }

    /// Builds the change for a replan: all stops, then all starts.
    pub fn replan_change(&self) -> Result<String, DaemonError> {
        let (stops, starts) = self.replan()?;

        let mut st = self.store.lock();
        let change_id = st.new_change("replan", &operation_summary("Replan", &starts));
        let mut previous: Vec<String> = Vec::new();
        for name in &stops {
            let task_id = st
                .new_task(
                    &change_id,
                    "stop",
                    &format!("Stop service \"{name}\""),
                    previous.clone(),
                    service_data(name),
                )
                .map_err(DaemonError::State)?;
            previous.push(task_id);
        }
        for name in &starts {
            let task_id = st
                .new_task(
                    &change_id,
                    "start",
                    &format!("Start service \"{name}\""),
                    previous.clone(),
                    service_data(name),
                )
                .map_err(DaemonError::State)?;
            previous.push(task_id);
        }
        Ok(change_id)
    }

    // ------------------------------------------------------------------
    // Read views
    // ------------------------------------------------------------------

    /// Lists services, optionally filtered by name.
    pub fn services(&self, filter: &[String]) -> Vec<ServiceInfo> {
        let plan = self.planner.plan();
        let services = self.lock_services();

        let mut names: BTreeSet<String> = plan.services.keys().cloned().collect();
        names.extend(services.keys().cloned());

        names
            .into_iter()
            .filter(|name| filter.is_empty() || filter.contains(name))
            .map(|name| {
                let startup = plan
                    .services
                    .get(&name)
                    .map(|svc| {
                        if svc.startup.is_unset() {
                            Startup::Disabled
                        } else {
                            svc.startup
                        }
                    })
                    .unwrap_or(Startup::Disabled);
                let current = services
                    .get(&name)
                    .map(|record| record.lock().state)
                    .unwrap_or(ServiceState::Initial);
                ServiceInfo {
                    name,
                    startup,
                    current,
                }
            })
            .collect()
    }

    /// Returns the effective configuration of one service: the running
    /// snapshot when the service was started, the plan entry otherwise.
    pub fn config(&self, name: &str) -> Result<ServiceConfig, ServiceError> {
        if let Some(record) = self.record(name) {
            return Ok(record.lock().config.clone());
        }
        self.planner
            .plan()
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    /// Current lifecycle state, if the service was ever materialized.
    pub fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.record(name).map(|record| record.lock().state)
    }

    /// Number of automatic restarts since the backoff schedule last reset.
    pub fn backoff_index(&self, name: &str) -> Option<u32> {
        self.record(name).map(|record| record.lock().backoff_index)
    }

    /// Opens one log iterator per requested service.
    ///
    /// `last` positions each iterator that many entries from the tail; a
    /// negative value starts at the tail for follow reads.
    pub fn service_logs(
        &self,
        names: &[String],
        last: i32,
    ) -> Result<Vec<(String, LogIterator)>, ServiceError> {
        let position = if last < 0 { None } else { Some(last as usize) };
        let services = self.lock_services();

        let selected: Vec<Arc<ServiceRecord>> = if names.is_empty() {
            services.values().cloned().collect()
        } else {
            let mut picked = Vec::with_capacity(names.len());
            for name in names {
                let record = services
                    .get(name)
                    .ok_or_else(|| ServiceError::NotFound(name.clone()))?;
                picked.push(Arc::clone(record));
            }
            picked
        };

        Ok(selected
            .into_iter()
            .map(|record| (record.name.clone(), record.ring.iterator(position)))
            .collect())
    }

    /// The ring buffer of a materialized service.
    pub fn ring(&self, name: &str) -> Option<RingBuffer> {
        self.record(name).map(|record| record.ring.clone())
    }

    /// Most recent output lines of a service, without framing.
    pub fn last_output(&self, name: &str, lines: usize) -> Vec<String> {
        let Some(record) = self.record(name) else {
            return Vec::new();
        };
        let mut iterator = record.ring.iterator(Some(lines));
        let mut buf = Vec::new();
        if iterator.write_to(&mut buf).is_err() {
            return Vec::new();
        }
        String::from_utf8_lossy(&buf)
            .lines()
            .map(|line| {
                parse_entry(line)
                    .map(|entry| entry.message)
                    .unwrap_or_else(|| line.to_string())
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Direct operations
    // ------------------------------------------------------------------

    /// Sends a signal to the process groups of the named running services.
    pub fn send_signal(&self, names: &[String], signal: &str) -> Result<(), ServiceError> {
        use std::str::FromStr;
        let signal = nix::sys::signal::Signal::from_str(signal).map_err(|_| {
            ServiceError::Internal(format!("unknown signal \"{signal}\""))
        })?;

        for name in names {
            let record = self
                .record(name)
                .ok_or_else(|| ServiceError::NotFound(name.clone()))?;
            let inner = record.lock();
            let Some(pid) = inner.pid else {
                return Err(ServiceError::Internal(format!(
                    "service \"{name}\" is not running"
                )));
            };
            signal_group(name, pid, signal)?;
        }
        Ok(())
    }

    /// Replaces the bracketed default arguments used on the next start of
    /// each given service.
    pub fn set_service_args(
        &self,
        args: &BTreeMap<String, Vec<String>>,
    ) -> Result<(), ServiceError> {
        let plan = self.planner.plan();
        for name in args.keys() {
            if !plan.services.contains_key(name) {
                return Err(ServiceError::NotFound(name.clone()));
            }
        }
        let mut extra = self
            .extra_args
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (name, values) in args {
            extra.insert(name.clone(), values.clone());
        }
        Ok(())
    }

    /// Applies `on-check-failure` policy after a check crossed its
    /// threshold: the configured action is parked on the record and the
    /// process group is SIGTERMed so the exit path applies it.
    pub fn check_failed(&self, check_name: &str) {
        let services = self.lock_services();
        for record in services.values() {
            let mut inner = record.lock();
            let Some(action) = inner.config.on_check_failure.get(check_name).copied()
            else {
                continue;
            };
            if inner.state != ServiceState::Running {
                continue;
            }

            info!(
                "Check \"{check_name}\" failed; applying {action:?} to service \"{}\"",
                record.name
            );
            inner.pending_action = Some((action, "on-check-failure"));
            if let Some(pid) = inner.pid
                && let Err(err) =
                    signal_group(&record.name, pid, nix::sys::signal::Signal::SIGTERM)
            {
                warn!("Cannot signal service \"{}\": {err}", record.name);
            }
        }
    }

    /// Stops every active service, in reverse start order. Used on daemon
    /// shutdown.
    pub fn stop_all_active(&self) {
        let plan = self.planner.plan();
        let active: Vec<String> = {
            let services = self.lock_services();
            services
                .iter()
                .filter(|(_, record)| record.lock().state.is_active())
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in self.stop_order(&plan, &active) {
            if let Err(err) = self.stop_service(&name) {
                warn!("Stopping service \"{name}\" on shutdown failed: {err}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle core
    // ------------------------------------------------------------------

    /// Starts one service synchronously, applying the okay-wait window.
    ///
    /// Starting an already-active service is a no-op. The configuration is
    /// re-read from the current plan so a replan-driven restart picks up
    /// the new command.
    pub fn start_service(&self, name: &str) -> Result<(), ServiceError> {
        let plan = self.planner.plan();
        let config = plan
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        let record = self.ensure_record(name, &config);

        {
            let mut inner = record.lock();
            match inner.state {
                ServiceState::Starting
                | ServiceState::Running
                | ServiceState::BackoffWait => return Ok(()),
                ServiceState::Terminating | ServiceState::Killing => {
                    return Err(ServiceError::Internal(format!(
                        "service \"{name}\" is being stopped"
                    )));
                }
                ServiceState::Initial
                | ServiceState::Stopped
                | ServiceState::Exited => {
                    inner.config = config.clone();
                    inner.state = ServiceState::Starting;
                    inner.backoff_index = 0;
                    inner.current_backoff = Duration::ZERO;
                    inner.pending_action = None;
                }
            }
        }

        let pid = match self.spawn_record(&record) {
            Ok(pid) => pid,
            Err(err) => {
                let mut inner = record.lock();
                inner.state = ServiceState::Exited;
                return Err(err);
            }
        };
        let exit_rx = self.waiter.watch(pid);
        {
            let mut inner = record.lock();
            inner.pid = Some(pid);
        }

        match exit_rx.recv_timeout(OKAY_WAIT) {
            Ok(code) => {
                let mut inner = record.lock();
                inner.pid = None;
                if matches!(
                    inner.state,
                    ServiceState::Terminating
                        | ServiceState::Killing
                        | ServiceState::Stopped
                ) {
                    inner.state = ServiceState::Stopped;
                    record.cond.notify_all();
                    return Ok(());
                }
                inner.state = ServiceState::Exited;
                Err(ServiceError::ExitedQuickly {
                    service: name.to_string(),
                    code,
                })
            }
            Err(RecvTimeoutError::Timeout) => {
                let mut inner = record.lock();
                if matches!(
                    inner.state,
                    ServiceState::Stopped | ServiceState::Exited
                ) {
                    // A stop raced the spawn window; tear the child down.
                    drop(inner);
                    let _ =
                        signal_group(name, pid, nix::sys::signal::Signal::SIGKILL);
                    return Ok(());
                }
                let generation = {
                    inner.generation += 1;
                    inner.generation
                };
                if inner.state == ServiceState::Starting {
                    inner.state = ServiceState::Running;
                    inner.started_at = Some(Instant::now());
                }
                drop(inner);

                let mgr = self.arc();
                let rec = Arc::clone(&record);
                thread::Builder::new()
                    .name(format!("svc-{name}"))
                    .spawn(move || mgr.monitor_exit(rec, exit_rx, generation))
                    .map_err(|source| ServiceError::StartError {
                        service: name.to_string(),
                        source,
                    })?;
                info!("Service \"{name}\" started");
                Ok(())
            }
            Err(RecvTimeoutError::Disconnected) => {
                let mut inner = record.lock();
                inner.pid = None;
                inner.state = ServiceState::Exited;
                Err(ServiceError::Internal(format!(
                    "exit watcher for service \"{name}\" went away"
                )))
            }
        }
    }

    /// Stops one service synchronously through the signal ladder.
    pub fn stop_service(&self, name: &str) -> Result<(), ServiceError> {
        let Some(record) = self.record(name) else {
            return Ok(());
        };

        let mut inner = record.lock();
        match inner.state {
            ServiceState::Initial | ServiceState::Stopped | ServiceState::Exited => {
                return Ok(());
            }
            ServiceState::BackoffWait => {
                inner.state = ServiceState::Stopped;
                record.cond.notify_all();
                info!("Service \"{name}\" stopped during backoff");
                return Ok(());
            }
            ServiceState::Starting | ServiceState::Running => {
                let kill_delay = inner.config.kill_delay();
                inner.state = ServiceState::Terminating;
                if let Some(pid) = inner.pid {
                    signal_group(name, pid, nix::sys::signal::Signal::SIGTERM)?;
                } else {
                    inner.state = ServiceState::Stopped;
                    record.cond.notify_all();
                    return Ok(());
                }

                let (guard, stopped) = wait_stopped(&record, inner, kill_delay);
                inner = guard;
                if stopped {
                    info!("Service \"{name}\" stopped");
                    return Ok(());
                }
            }
            ServiceState::Terminating | ServiceState::Killing => {
                let kill_delay = inner.config.kill_delay();
                let (guard, stopped) = wait_stopped(&record, inner, kill_delay);
                inner = guard;
                if stopped {
                    return Ok(());
                }
            }
        }

        // SIGTERM did not do it; escalate.
        inner.state = ServiceState::Killing;
        if let Some(pid) = inner.pid {
            signal_group(name, pid, nix::sys::signal::Signal::SIGKILL)?;
        }
        let (guard, stopped) = wait_stopped(&record, inner, FAIL_WAIT);
        if stopped {
            info!("Service \"{name}\" stopped after SIGKILL");
            return Ok(());
        }
        drop(guard);

        // The service stays in `killing` so a later stop retries from here.
        Err(ServiceError::StopFailed {
            service: name.to_string(),
        })
    }

    fn spawn_record(&self, record: &Arc<ServiceRecord>) -> Result<u32, ServiceError> {
        let (config, extra) = {
            let inner = record.lock();
            let extra = self
                .extra_args
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&record.name)
                .cloned();
            (inner.config.clone(), extra)
        };

        let spec = SpawnSpec {
            name: &record.name,
            command: &config.command,
            extra_args: extra.as_deref(),
            environment: &config.environment,
            user: config.user.as_deref(),
            user_id: config.user_id,
            group: config.group.as_deref(),
            group_id: config.group_id,
            working_dir: config.working_dir.as_deref(),
        };
        let output = OutputWriter::new(&record.name, record.ring.clone());
        let child = spawn_child(&spec, &output)?;
        Ok(child.id())
    }

    /// Watches one running instance until it exits, applying the action
    /// table and looping through backoff restarts.
    fn monitor_exit(
        self: Arc<Self>,
        record: Arc<ServiceRecord>,
        mut exit_rx: Receiver<i32>,
        generation: u64,
    ) {
        loop {
            let Ok(code) = exit_rx.recv() else {
                debug!("Exit watcher for \"{}\" closed", record.name);
                return;
            };

            match self.handle_exit(&record, code, generation) {
                Some(next_rx) => exit_rx = next_rx,
                None => return,
            }
        }
    }

    fn handle_exit(
        &self,
        record: &Arc<ServiceRecord>,
        code: i32,
        generation: u64,
    ) -> Option<Receiver<i32>> {
        let mut inner = record.lock();
        if inner.generation != generation {
            return None;
        }
        inner.pid = None;

        match inner.state {
            ServiceState::Terminating | ServiceState::Killing => {
                inner.state = ServiceState::Stopped;
                record.cond.notify_all();
                return None;
            }
            ServiceState::Running => {}
            _ => return None,
        }

        let failed = code != 0;
        let (action, reason) = inner
            .pending_action
            .take()
            .unwrap_or_else(|| inner.config.exit_action(failed));
        info!(
            "Service \"{}\" exited with code {code}; {reason} action is {action:?}",
            record.name
        );

        // A quiet period at least as long as the last backoff resets the
        // schedule.
        if let Some(started) = inner.started_at
            && !inner.current_backoff.is_zero()
            && started.elapsed() > inner.current_backoff
        {
            inner.backoff_index = 0;
            inner.current_backoff = Duration::ZERO;
        }

        match action {
            ServiceAction::Ignore => {
                inner.state = ServiceState::Exited;
                None
            }
            ServiceAction::Shutdown => {
                inner.state = ServiceState::Exited;
                drop(inner);
                warn!(
                    "Service \"{}\" requested daemon shutdown on exit",
                    record.name
                );
                if self.shutdown_tx.send(ShutdownRequest::Stop).is_err() {
                    error!("Daemon shutdown channel is gone");
                }
                None
            }
            ServiceAction::Restart => {
                let computed = next_backoff(&inner.config, inner.current_backoff);
                inner.backoff_index += 1;
                inner.current_backoff = computed;
                let wait = computed + jitter(computed);
                inner.state = ServiceState::BackoffWait;
                debug!(
                    "Service \"{}\" backing off {wait:?} (index {})",
                    record.name, inner.backoff_index
                );

                let deadline = Instant::now() + wait;
                loop {
                    if inner.state != ServiceState::BackoffWait {
                        return None;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = record
                        .cond
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    inner = guard;
                }

                drop(inner);
                match self.spawn_record(record) {
                    Ok(pid) => {
                        let exit_rx = self.waiter.watch(pid);
                        let mut inner = record.lock();
                        if inner.state != ServiceState::BackoffWait {
                            // Stopped while we were spawning; tear the
                            // stray child down again.
                            let _ = signal_group(
                                &record.name,
                                pid,
                                nix::sys::signal::Signal::SIGKILL,
                            );
                            return None;
                        }
                        inner.pid = Some(pid);
                        inner.state = ServiceState::Running;
                        inner.started_at = Some(Instant::now());
                        info!(
                            "Service \"{}\" restarted (backoff index {})",
                            record.name, inner.backoff_index
                        );
                        Some(exit_rx)
                    }
                    Err(err) => {
                        error!("Cannot restart service \"{}\": {err}", record.name);
                        let mut inner = record.lock();
                        inner.state = ServiceState::Exited;
                        let mut st = self.store.lock();
                        st.warnf(format!(
                            "cannot restart service \"{}\": {err}",
                            record.name
                        ));
                        None
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Task handlers
    // ------------------------------------------------------------------

    fn start_handler(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let name = ctx
            .data_str("service-name")
            .ok_or_else(|| TaskError::Failed("task carries no service name".into()))?;

        match self.start_service(&name) {
            Ok(()) => Ok(()),
            Err(err @ ServiceError::ExitedQuickly { .. }) => {
                // The output forwarders race the exit notification; give
                // them a moment to land the last lines in the ring.
                let mut output = self
                    .last_output(&name, crate::constants::FAILED_START_OUTPUT_LINES);
                let deadline = Instant::now() + Duration::from_millis(300);
                while output.is_empty() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(10));
                    output = self
                        .last_output(&name, crate::constants::FAILED_START_OUTPUT_LINES);
                }
                if !output.is_empty() {
                    let mut text = String::from("Most recent service output:\n");
                    for line in &output {
                        text.push_str("    ");
                        text.push_str(line);
                        text.push('\n');
                    }
                    ctx.logf(text.trim_end());
                }
                Err(TaskError::Failed(err.to_string()))
            }
            Err(err) => Err(TaskError::Failed(err.to_string())),
        }
    }

    fn stop_handler(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let name = ctx
            .data_str("service-name")
            .ok_or_else(|| TaskError::Failed("task carries no service name".into()))?;
        self.stop_service(&name)
            .map_err(|err| TaskError::Failed(err.to_string()))
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn record(&self, name: &str) -> Option<Arc<ServiceRecord>> {
        self.lock_services().get(name).cloned()
    }

    fn ensure_record(&self, name: &str, config: &ServiceConfig) -> Arc<ServiceRecord> {
        let mut services = self
            .services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            services
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ServiceRecord::new(name, config.clone()))),
        )
    }

    fn lock_services(&self) -> MutexGuard<'_, HashMap<String, Arc<ServiceRecord>>> {
        self.services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_known(&self, plan: &Plan, names: &[String]) -> Result<(), DaemonError> {
        let services = self.lock_services();
        for name in names {
            if !plan.services.contains_key(name) && !services.contains_key(name) {
                return Err(DaemonError::Service(ServiceError::NotFound(name.clone())));
            }
        }
        Ok(())
    }

    /// Orders `names` for stopping: reverse start order for planned
    /// services, with removed services appended alphabetically.
    fn stop_order(&self, plan: &Plan, names: &[String]) -> Vec<String> {
        let known: Vec<String> = names
            .iter()
            .filter(|name| plan.services.contains_key(*name))
            .cloned()
            .collect();
        let all: Vec<String> = plan.services.keys().cloned().collect();
        let mut ordered: Vec<String> = match plan::start_order(plan, &all) {
            Ok(order) => order
                .into_iter()
                .rev()
                .filter(|name| known.contains(name))
                .collect(),
            Err(_) => known,
        };

        let mut removed: Vec<String> = names
            .iter()
            .filter(|name| !plan.services.contains_key(*name))
            .cloned()
            .collect();
        removed.sort();
        ordered.extend(removed);
        ordered
    }
}

impl Manager for ServiceManager {
    fn name(&self) -> &'static str {
        "service-manager"
    }

    fn ensure(&self) -> Result<(), DaemonError> {
        Ok(())
    }
}

fn wait_stopped<'a>(
    record: &'a ServiceRecord,
    mut inner: MutexGuard<'a, ServiceInner>,
    timeout: Duration,
) -> (MutexGuard<'a, ServiceInner>, bool) {
    let deadline = Instant::now() + timeout;
    loop {
        if inner.state == ServiceState::Stopped {
            return (inner, true);
        }
        let now = Instant::now();
        if now >= deadline {
            return (inner, false);
        }
        let (guard, _) = record
            .cond
            .wait_timeout(inner, deadline - now)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner = guard;
    }
}

fn signal_group(
    name: &str,
    pid: u32,
    signal: nix::sys::signal::Signal,
) -> Result<(), ServiceError> {
    use nix::{errno::Errno, sys::signal::killpg, unistd::Pid};
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(ServiceError::SignalError {
            service: name.to_string(),
            source,
        }),
    }
}

fn service_data(name: &str) -> BTreeMap<String, serde_json::Value> {
    let mut data = BTreeMap::new();
    data.insert(
        "service-name".to_string(),
        serde_json::Value::String(name.to_string()),
    );
    data
}

fn operation_summary(verb: &str, names: &[String]) -> String {
    match names {
        [] => format!("{verb} (no services)"),
        [single] => format!("{verb} service \"{single}\""),
        [first, rest @ ..] => {
            format!("{verb} service \"{first}\" and {} more", rest.len())
        }
    }
}
