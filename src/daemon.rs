//! Daemon wiring and control loop.
//!
//! Builds the manager stack over one warden directory, performs the boot
//! verification and autostart, then serves typed control requests on the
//! unix socket. Each connection is handled on its own thread so a log
//! follow cannot stall the control plane.

use std::{
    fs,
    io::{self, Write},
    os::unix::net::{UnixListener, UnixStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, Sender, TryRecvError, channel},
    },
    thread,
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    checks::CheckManager,
    constants::{DEFAULT_CHANGE_WAIT, DEFAULT_LOG_LINES},
    engine::{Engine, Manager},
    error::DaemonError,
    ipc::{self, ChangeInfo, ControlCommand, ControlResponse},
    logs::{self, LogManager},
    plan::{CheckLevel, Layer, PlanManager},
    reaper::{DirectWaiter, Reaper, Waiter},
    restart,
    ringbuf::LogIterator,
    runtime,
    service::{ServiceManager, ShutdownRequest},
    state::{StateStore, taskrunner::TaskRunner},
};

/// How the daemon finished its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Clean stop; exit code 0.
    Stop,
    /// Restart requested; exit with the restart sentinel.
    Restart,
}

/// Options controlling daemon construction.
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    /// Install the subreaper and SIGCHLD harvesting. Disable when running
    /// embedded in another process that owns child reaping.
    pub use_reaper: bool,
}

#[derive(Clone)]
struct Shared {
    store: Arc<StateStore>,
    planner: Arc<PlanManager>,
    engine: Arc<Engine>,
    services: Arc<ServiceManager>,
    checks: Arc<CheckManager>,
    shutdown_tx: Sender<ShutdownRequest>,
}

/// The assembled supervisor daemon.
pub struct Daemon {
    shared: Shared,
    logmgr: Arc<LogManager>,
    reaper: Option<Arc<Reaper>>,
    shutdown_rx: Receiver<ShutdownRequest>,
}

impl Daemon {
    /// Builds the daemon over the directory configured in [`runtime`].
    ///
    /// Verifies the pending-restart marker, loads state and layers, and
    /// wires managers into the engine (leaves before the task runner).
    pub fn new(options: DaemonOptions) -> Result<Daemon, DaemonError> {
        let dir = runtime::warden_dir();
        fs::create_dir_all(&dir)?;

        let reaper = if options.use_reaper {
            Some(Reaper::start()?)
        } else {
            None
        };
        let waiter: Arc<dyn Waiter> = match &reaper {
            Some(reaper) => Arc::clone(reaper) as Arc<dyn Waiter>,
            None => DirectWaiter::new(),
        };

        let store = Arc::new(StateStore::load(&runtime::state_path())?);
        restart::verify_boot(&store)?;

        let planner = Arc::new(PlanManager::load(&runtime::layers_dir())?);
        let (shutdown_tx, shutdown_rx) = channel();

        let runner = TaskRunner::new(Arc::clone(&store));
        let engine = Engine::new(Arc::clone(&store), Arc::clone(&runner));

        let services = ServiceManager::new(
            Arc::clone(&store),
            Arc::clone(&planner),
            waiter,
            shutdown_tx.clone(),
        );
        services.register_handlers(&runner);

        let checks = CheckManager::new();
        {
            let services = Arc::clone(&services);
            checks.set_failure_notifier(Arc::new(move |check_name: &str| {
                services.check_failed(check_name);
            }));
        }
        checks.plan_changed(&planner.plan());

        let logmgr = {
            let services = Arc::clone(&services);
            LogManager::new(Arc::new(move |name: &str| services.ring(name)))
        };
        logmgr.plan_changed(&planner.plan());

        {
            let checks = Arc::clone(&checks);
            let logmgr = Arc::clone(&logmgr);
            planner.add_change_listener(move |plan| {
                checks.plan_changed(plan);
                logmgr.plan_changed(plan);
            });
        }

        engine.add_manager(Arc::clone(&checks) as Arc<dyn Manager>);
        engine.add_manager(Arc::clone(&logmgr) as Arc<dyn Manager>);
        engine.add_manager(Arc::clone(&services) as Arc<dyn Manager>);

        Ok(Daemon {
            shared: Shared {
                store,
                planner,
                engine,
                services,
                checks,
                shutdown_tx,
            },
            logmgr,
            reaper,
            shutdown_rx,
        })
    }

    /// Channel end for external shutdown triggers (signal handlers).
    pub fn shutdown_sender(&self) -> Sender<ShutdownRequest> {
        self.shared.shutdown_tx.clone()
    }

    /// The shared state store.
    pub fn store(&self) -> &Arc<StateStore> {
        &self.shared.store
    }

    /// Runs the daemon until a shutdown request arrives.
    pub fn run(&self) -> Result<ExitReason, DaemonError> {
        self.shared.engine.start();

        let change_id = self.shared.services.autostart()?;
        self.shared.engine.ensure_before(Duration::ZERO);
        info!("Autostart submitted as change {change_id}");

        ipc::cleanup_socket()?;
        let socket = runtime::socket_path();
        let listener = UnixListener::bind(&socket)?;
        listener.set_nonblocking(true)?;
        info!("Daemon listening on {socket:?}");

        let reason = loop {
            match self.shutdown_rx.try_recv() {
                Ok(request) => break request,
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break ShutdownRequest::Stop,
            }

            match listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(err) = stream.set_nonblocking(false) {
                        warn!("Cannot configure client stream: {err}");
                        continue;
                    }
                    let shared = self.shared.clone();
                    thread::spawn(move || shared.serve_connection(stream));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("Control listener failed: {err}");
                    break ShutdownRequest::Stop;
                }
            }
        };

        info!("Shutting down");
        self.shared.services.stop_all_active();
        self.shared.checks.stop();
        self.logmgr.stop();
        self.shared.engine.stop();
        if let Some(reaper) = &self.reaper {
            reaper.stop();
        }
        ipc::cleanup_socket()?;

        Ok(match reason {
            ShutdownRequest::Stop => ExitReason::Stop,
            ShutdownRequest::Restart => ExitReason::Restart,
        })
    }
}

impl Shared {
    fn serve_connection(&self, stream: UnixStream) {
        let mut connection = ipc::Connection::new(stream);
        let command = match connection.receive() {
            Ok(command) => command,
            Err(err) => {
                warn!("Invalid control command: {err}");
                let _ = connection.respond(&ControlResponse::Error(err.to_string()));
                return;
            }
        };
        debug!("Control command: {command:?}");

        match command {
            ControlCommand::Logs {
                services,
                n,
                follow,
            } => self.serve_logs(connection, services, n, follow),
            other => {
                let response = self.dispatch(other);
                if let Err(err) = connection.respond(&response) {
                    warn!("Cannot write control response: {err}");
                }
            }
        }
    }

    fn dispatch(&self, command: ControlCommand) -> ControlResponse {
        self.dispatch_inner(command)
            .unwrap_or_else(|err| ControlResponse::Error(err.to_string()))
    }

    fn dispatch_inner(
        &self,
        command: ControlCommand,
    ) -> Result<ControlResponse, DaemonError> {
        match command {
            ControlCommand::Services { names } => {
                Ok(ControlResponse::Services(self.services.services(&names)))
            }
            ControlCommand::Start { names } => {
                let change_id = self.services.start(&names)?;
                self.engine.ensure_before(Duration::ZERO);
                Ok(ControlResponse::ChangeId(change_id))
            }
            ControlCommand::Stop { names } => {
                let change_id = self.services.stop(&names)?;
                self.engine.ensure_before(Duration::ZERO);
                Ok(ControlResponse::ChangeId(change_id))
            }
            ControlCommand::Restart { names } => {
                let change_id = self.services.restart(&names)?;
                self.engine.ensure_before(Duration::ZERO);
                Ok(ControlResponse::ChangeId(change_id))
            }
            ControlCommand::Autostart => {
                let change_id = self.services.autostart()?;
                self.engine.ensure_before(Duration::ZERO);
                Ok(ControlResponse::ChangeId(change_id))
            }
            ControlCommand::Replan => {
                let change_id = self.services.replan_change()?;
                self.engine.ensure_before(Duration::ZERO);
                Ok(ControlResponse::ChangeId(change_id))
            }
            ControlCommand::Plan => {
                let yaml = self.planner.plan().to_yaml()?;
                Ok(ControlResponse::PlanYaml(yaml))
            }
            ControlCommand::AddLayer {
                label,
                yaml,
                combine,
            } => {
                let layer = Layer::parse(&label, 0, &yaml)?;
                if combine {
                    self.planner.combine_layer(layer)?;
                } else {
                    self.planner.append_layer(layer)?;
                }
                Ok(ControlResponse::Ok)
            }
            ControlCommand::Checks { level, names } => {
                let infos = self
                    .checks
                    .checks()
                    .into_iter()
                    .filter(|info| names.is_empty() || names.contains(&info.name))
                    .filter(|info| match level {
                        None | Some(CheckLevel::Unset) => true,
                        Some(level) => info.level == level,
                    })
                    .collect();
                Ok(ControlResponse::Checks(infos))
            }
            ControlCommand::Health { level, names } => Ok(ControlResponse::Health {
                healthy: self.checks.healthy(level, &names),
            }),
            ControlCommand::SignalServices { signal, names } => {
                self.services.send_signal(&names, &signal)?;
                Ok(ControlResponse::Ok)
            }
            ControlCommand::Warnings { all } => {
                let mut st = self.store.lock();
                let warnings = if all {
                    st.all_warnings()
                } else {
                    st.pending_warnings()
                };
                Ok(ControlResponse::Warnings(warnings))
            }
            ControlCommand::OkayWarnings { timestamp } => {
                let mut st = self.store.lock();
                Ok(ControlResponse::OkayedWarnings(st.okay_warnings(timestamp)))
            }
            ControlCommand::Changes => {
                let st = self.store.lock();
                let mut infos = Vec::new();
                for change in st.changes() {
                    let tasks = st
                        .change_tasks(&change.id)
                        .map_err(DaemonError::State)?
                        .into_iter()
                        .cloned()
                        .collect();
                    infos.push(ChangeInfo {
                        change: change.clone(),
                        tasks,
                    });
                }
                Ok(ControlResponse::Changes(infos))
            }
            ControlCommand::Change { id } => {
                let st = self.store.lock();
                let change = st.change(&id).map_err(DaemonError::State)?.clone();
                let tasks = st
                    .change_tasks(&id)
                    .map_err(DaemonError::State)?
                    .into_iter()
                    .cloned()
                    .collect();
                Ok(ControlResponse::Change(Box::new(ChangeInfo {
                    change,
                    tasks,
                })))
            }
            ControlCommand::Abort { id } => {
                let aborting = {
                    let mut st = self.store.lock();
                    st.abort_change(&id).map_err(DaemonError::State)?
                };
                self.engine.runner().kill_tasks(&aborting);
                self.engine.ensure_before(Duration::ZERO);
                Ok(ControlResponse::Ok)
            }
            ControlCommand::WaitChange { id, timeout } => {
                let timeout = timeout.unwrap_or(DEFAULT_CHANGE_WAIT);
                let change = self
                    .store
                    .wait_change(&id, timeout)
                    .map_err(DaemonError::State)?;
                let tasks = {
                    let st = self.store.lock();
                    st.change_tasks(&id)
                        .map_err(DaemonError::State)?
                        .into_iter()
                        .cloned()
                        .collect()
                };
                Ok(ControlResponse::Change(Box::new(ChangeInfo {
                    change,
                    tasks,
                })))
            }
            ControlCommand::Shutdown { restart } => {
                let request = if restart {
                    ShutdownRequest::Restart
                } else {
                    ShutdownRequest::Stop
                };
                if self.shutdown_tx.send(request).is_err() {
                    return Ok(ControlResponse::Error(
                        "daemon is already shutting down".into(),
                    ));
                }
                Ok(ControlResponse::Message("Daemon shutting down".into()))
            }
            ControlCommand::Logs { .. } => Ok(ControlResponse::Error(
                "logs are served on a dedicated stream".into(),
            )),
        }
    }

    fn serve_logs(
        &self,
        mut connection: ipc::Connection,
        services: Vec<String>,
        n: Option<i32>,
        follow: bool,
    ) {
        let n = n.unwrap_or(DEFAULT_LOG_LINES as i32);
        let mut iterators: Vec<(String, LogIterator)> =
            match self.services.service_logs(&services, n) {
                Ok(iterators) => iterators,
                Err(err) => {
                    let _ =
                        connection.respond(&ControlResponse::Error(err.to_string()));
                    return;
                }
            };

        let limit = if n < 0 { 0 } else { n as usize };
        let backlog = logs::collect_tail(&mut iterators, limit);
        if connection.respond(&ControlResponse::Logs(backlog)).is_err() {
            return;
        }
        if !follow {
            return;
        }

        // Stream new entries as JSON lines until the client goes away.
        let cancel = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(Mutex::new(JsonEntryWriter::new(connection.into_stream())));
        let handles = logs::follow(iterators, sink, Arc::clone(&cancel));
        for handle in handles {
            let _ = handle.join();
        }
        cancel.store(true, Ordering::Relaxed);
    }
}

/// Adapts the raw formatted log stream into JSON-lines entries.
struct JsonEntryWriter {
    stream: UnixStream,
    pending: Vec<u8>,
}

impl JsonEntryWriter {
    fn new(stream: UnixStream) -> JsonEntryWriter {
        JsonEntryWriter {
            stream,
            pending: Vec::new(),
        }
    }
}

impl Write for JsonEntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);

        while let Some(at) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=at).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            let Some(entry) = logs::parse_entry(&text) else {
                continue;
            };
            let payload = serde_json::to_vec(&entry)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            self.stream.write_all(&payload)?;
            self.stream.write_all(b"\n")?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}
