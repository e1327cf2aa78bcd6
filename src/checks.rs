//! Periodic health checks.
//!
//! Every configured check runs on its own worker thread at its period,
//! executing one probe per tick. Consecutive failures are counted; crossing
//! the threshold flips the check down and fires the failure notifier, which
//! the service manager uses to apply `on-check-failure` policy. One
//! successful probe flips the check back up.

use std::{
    collections::HashMap,
    io::Read,
    net::{TcpStream, ToSocketAddrs},
    process::{Command, Stdio},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    constants::CHECK_DETAILS_LIMIT,
    engine::Manager,
    error::{CheckError, DaemonError},
    plan::{CheckConfig, CheckLevel, Plan},
    spawn::{SpawnSpec, resolve_credentials},
    state::taskrunner::Dying,
};

/// Up/down status of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// The check is passing.
    Up,
    /// The check crossed its failure threshold.
    Down,
}

/// Read view of one check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CheckInfo {
    /// Check name.
    pub name: String,
    /// Health level the check reports at.
    pub level: CheckLevel,
    /// Current status.
    pub status: CheckStatus,
    /// Consecutive failures observed.
    pub failures: u32,
    /// Configured failure threshold.
    pub threshold: u32,
    /// Details from the most recent probe, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Error from the most recent failing probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A single probe, kind-agnostic to the scheduler.
#[derive(Debug, Clone)]
pub enum Probe {
    /// GET a URL; failure iff transport error or status >= 400.
    Http {
        /// URL to fetch.
        url: String,
        /// Extra request headers.
        headers: Vec<(String, String)>,
    },
    /// Open and close a TCP connection.
    Tcp {
        /// Host, defaulting to localhost.
        host: String,
        /// Port to connect to.
        port: u16,
    },
    /// Run a command; failure iff non-zero exit.
    Exec {
        /// Command line.
        command: String,
        /// Environment overlay.
        environment: Vec<(String, String)>,
        /// User to run as.
        user: Option<String>,
        /// Group to run as.
        group: Option<String>,
        /// Working directory.
        working_dir: Option<String>,
    },
}

impl Probe {
    /// Builds the probe for a validated check config.
    pub fn from_config(config: &CheckConfig) -> Option<Probe> {
        if let Some(http) = &config.http {
            return Some(Probe::Http {
                url: http.url.clone(),
                headers: http
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            });
        }
        if let Some(tcp) = &config.tcp {
            let host = if tcp.host.is_empty() {
                "localhost".to_string()
            } else {
                tcp.host.clone()
            };
            return Some(Probe::Tcp {
                host,
                port: tcp.port,
            });
        }
        if let Some(exec) = &config.exec {
            return Some(Probe::Exec {
                command: exec.command.clone(),
                environment: exec
                    .environment
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                user: exec.user.clone(),
                group: exec.group.clone(),
                working_dir: exec.working_dir.clone(),
            });
        }
        None
    }

    /// Runs the probe once, returning optional details on success.
    pub fn run(&self, timeout: Duration) -> Result<Option<String>, CheckError> {
        match self {
            Probe::Http { url, headers } => probe_http(url, headers, timeout),
            Probe::Tcp { host, port } => probe_tcp(host, *port, timeout),
            Probe::Exec {
                command,
                environment,
                user,
                group,
                working_dir,
            } => probe_exec(command, environment, user, group, working_dir, timeout),
        }
    }
}

fn probe_http(
    url: &str,
    headers: &[(String, String)],
    timeout: Duration,
) -> Result<Option<String>, CheckError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| CheckError::Http(err.to_string()))?;

    let mut request = client.get(url);
    for (key, value) in headers {
        request = request.header(key, value);
    }

    let response = request.send().map_err(|err| {
        if err.is_timeout() {
            CheckError::Timeout(timeout)
        } else {
            CheckError::Http(err.to_string())
        }
    })?;

    let status = response.status();
    if status.as_u16() >= 400 {
        let body: String = response
            .text()
            .unwrap_or_default()
            .chars()
            .take(CHECK_DETAILS_LIMIT)
            .collect();
        let mut message = format!("server returned HTTP {}", status.as_u16());
        if !body.is_empty() {
            message.push_str(&format!("; body: {body}"));
        }
        return Err(CheckError::Http(message));
    }
    Ok(None)
}

fn probe_tcp(host: &str, port: u16, timeout: Duration) -> Result<Option<String>, CheckError> {
    let target = format!("{host}:{port}");
    let addrs: Vec<_> = target
        .to_socket_addrs()
        .map_err(|source| CheckError::Tcp {
            addr: target.clone(),
            source,
        })?
        .collect();

    let Some(addr) = addrs.first() else {
        return Err(CheckError::Tcp {
            addr: target,
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses resolved",
            ),
        });
    };

    let stream = TcpStream::connect_timeout(addr, timeout).map_err(|source| {
        CheckError::Tcp {
            addr: target,
            source,
        }
    })?;
    drop(stream);
    Ok(None)
}

fn probe_exec(
    command: &str,
    environment: &[(String, String)],
    user: &Option<String>,
    group: &Option<String>,
    working_dir: &Option<String>,
    timeout: Duration,
) -> Result<Option<String>, CheckError> {
    let env_map = environment.iter().cloned().collect();
    let spec = SpawnSpec {
        name: "check",
        command,
        extra_args: None,
        environment: &env_map,
        user: user.as_deref(),
        user_id: None,
        group: group.as_deref(),
        group_id: None,
        working_dir: working_dir.as_deref(),
    };

    let words = shlex::split(command)
        .filter(|w| !w.is_empty())
        .ok_or_else(|| CheckError::Exec("cannot split command".into()))?;
    let credentials =
        resolve_credentials(&spec).map_err(|err| CheckError::Exec(err.to_string()))?;

    let mut cmd = Command::new(&words[0]);
    cmd.args(&words[1..]);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::null());
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in environment {
        cmd.env(key, value);
    }
    if let Some(creds) = credentials {
        use std::os::unix::process::CommandExt;
        cmd.uid(creds.uid);
        cmd.gid(creds.gid);
    }

    let mut child = cmd
        .spawn()
        .map_err(|err| CheckError::Exec(err.to_string()))?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CheckError::Timeout(timeout));
                }
                thread::sleep(Duration::from_millis(20));
            }
            Err(err) => return Err(CheckError::Exec(err.to_string())),
        }
    };

    let mut details = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        let mut buf = vec![0u8; CHECK_DETAILS_LIMIT];
        if let Ok(n) = stdout.read(&mut buf) {
            details = String::from_utf8_lossy(&buf[..n]).trim_end().to_string();
        }
    }
    let details = (!details.is_empty()).then_some(details);

    if status.success() {
        Ok(details)
    } else {
        let mut message = format!("exit status {}", status.code().unwrap_or(-1));
        if let Some(details) = &details {
            message.push_str(&format!("; output: {details}"));
        }
        Err(CheckError::Exec(message))
    }
}

/// Callback fired when a check crosses its failure threshold.
pub type FailureNotifier = Arc<dyn Fn(&str) + Send + Sync>;

struct CheckState {
    level: CheckLevel,
    status: CheckStatus,
    failures: u32,
    threshold: u32,
    details: Option<String>,
    last_error: Option<String>,
}

struct ActiveCheck {
    config: CheckConfig,
    state: Arc<Mutex<CheckState>>,
    dying: Dying,
    _handle: JoinHandle<()>,
}

/// Schedules check workers and tracks their results.
pub struct CheckManager {
    checks: Mutex<HashMap<String, ActiveCheck>>,
    notifier: Arc<Mutex<Option<FailureNotifier>>>,
}

impl CheckManager {
    /// Creates an empty manager; checks arrive with the first plan.
    pub fn new() -> Arc<CheckManager> {
        Arc::new(CheckManager {
            checks: Mutex::new(HashMap::new()),
            notifier: Arc::new(Mutex::new(None)),
        })
    }

    /// Installs the threshold-crossing notifier.
    pub fn set_failure_notifier(&self, notifier: FailureNotifier) {
        *self
            .notifier
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(notifier);
    }

    /// Applies a new plan: removed or altered checks stop, added or altered
    /// ones start with a fresh failure count.
    pub fn plan_changed(&self, plan: &Plan) {
        let mut checks = self
            .checks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let stale: Vec<String> = checks
            .iter()
            .filter(|(name, active)| {
                plan.checks.get(*name).map(|c| c != &active.config).unwrap_or(true)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(active) = checks.remove(&name) {
                debug!("Stopping check \"{name}\"");
                active.dying.kill();
            }
        }

        for (name, config) in &plan.checks {
            if checks.contains_key(name) {
                continue;
            }
            let Some(probe) = Probe::from_config(config) else {
                warn!("Check \"{name}\" has no probe; skipping");
                continue;
            };
            debug!("Starting check \"{name}\"");
            let active = self.spawn_worker(name, config, probe);
            checks.insert(name.clone(), active);
        }
    }

    /// Read views of every check, sorted by name.
    pub fn checks(&self) -> Vec<CheckInfo> {
        let checks = self
            .checks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut infos: Vec<CheckInfo> = checks
            .iter()
            .map(|(name, active)| {
                let state = active
                    .state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                CheckInfo {
                    name: name.clone(),
                    level: state.level,
                    status: state.status,
                    failures: state.failures,
                    threshold: state.threshold,
                    details: state.details.clone(),
                    last_error: state.last_error.clone(),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Health verdict over the selected checks.
    ///
    /// Ready-level health counts both ready and alive checks; alive-level
    /// health ignores ready checks. Checks without a declared level count
    /// at every health level.
    pub fn healthy(&self, level: Option<CheckLevel>, names: &[String]) -> bool {
        self.checks()
            .iter()
            .filter(|info| names.is_empty() || names.contains(&info.name))
            .filter(|info| match level {
                None | Some(CheckLevel::Unset) => true,
                Some(CheckLevel::Alive) => {
                    matches!(info.level, CheckLevel::Alive | CheckLevel::Unset)
                }
                Some(CheckLevel::Ready) => true,
            })
            .all(|info| info.status == CheckStatus::Up)
    }

    /// Stops every check worker.
    pub fn stop(&self) {
        let mut checks = self
            .checks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, active) in checks.drain() {
            active.dying.kill();
        }
    }

    fn spawn_worker(&self, name: &str, config: &CheckConfig, probe: Probe) -> ActiveCheck {
        let state = Arc::new(Mutex::new(CheckState {
            level: config.level,
            status: CheckStatus::Up,
            failures: 0,
            threshold: config.threshold(),
            details: None,
            last_error: None,
        }));

        let dying = Dying::new();
        let period = config.period();
        let timeout = config.timeout();
        let threshold = config.threshold();
        let worker_state = Arc::clone(&state);
        let worker_dying = dying.clone();
        let worker_name = name.to_string();
        let notifier = Arc::clone(&self.notifier);

        let handle = thread::Builder::new()
            .name(format!("check-{worker_name}"))
            .spawn(move || {
                loop {
                    if worker_dying.wait(period) {
                        return;
                    }

                    let result = probe.run(timeout);
                    if worker_dying.is_dying() {
                        return;
                    }

                    let crossed = {
                        let mut state = worker_state
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        match result {
                            Ok(details) => {
                                if state.status == CheckStatus::Down {
                                    info!("Check \"{worker_name}\" is up again");
                                }
                                state.status = CheckStatus::Up;
                                state.failures = 0;
                                state.details = details;
                                state.last_error = None;
                                false
                            }
                            Err(err) => {
                                state.failures += 1;
                                state.last_error = Some(err.to_string());
                                debug!(
                                    "Check \"{worker_name}\" failure {} (threshold {threshold}): {err}",
                                    state.failures
                                );
                                if state.failures == threshold {
                                    state.status = CheckStatus::Down;
                                    true
                                } else {
                                    false
                                }
                            }
                        }
                    };

                    if crossed {
                        warn!("Check \"{worker_name}\" crossed its failure threshold");
                        let notifier = notifier
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .clone();
                        if let Some(notifier) = notifier {
                            notifier(&worker_name);
                        }
                    }
                }
            })
            .expect("spawn check worker");

        ActiveCheck {
            config: config.clone(),
            state,
            dying,
            _handle: handle,
        }
    }
}

impl Manager for CheckManager {
    fn name(&self) -> &'static str {
        "check-manager"
    }

    fn ensure(&self) -> Result<(), DaemonError> {
        Ok(())
    }
}
