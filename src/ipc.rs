use crate::{
    checks::CheckInfo,
    logs::LogEntry,
    plan::CheckLevel,
    runtime,
    service::ServiceInfo,
    state::{Change, Task, Warning},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::PathBuf,
    time::Duration,
};
use thiserror::Error;

/// Returns the unix socket path used to talk to the resident daemon,
/// creating the runtime directory if needed.
pub fn socket_path() -> Result<PathBuf, ControlError> {
    let dir = runtime::warden_dir();
    fs::create_dir_all(&dir)?;
    Ok(runtime::socket_path())
}

/// Typed request sent from CLI invocations to the resident daemon.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlCommand {
    /// List services, optionally filtered by name.
    Services {
        /// Names to include; empty selects all.
        names: Vec<String>,
    },
    /// Start services and their required dependencies.
    Start {
        /// Services to start.
        names: Vec<String>,
    },
    /// Stop services.
    Stop {
        /// Services to stop.
        names: Vec<String>,
    },
    /// Stop then start services.
    Restart {
        /// Services to restart.
        names: Vec<String>,
    },
    /// Start every `startup: enabled` service.
    Autostart,
    /// Apply the current plan: stop changed services, start planned ones.
    Replan,
    /// Fetch the flattened plan as YAML.
    Plan,
    /// Append or combine a configuration layer.
    AddLayer {
        /// Layer label.
        label: String,
        /// Layer body as YAML text.
        yaml: String,
        /// Merge into an existing label instead of failing on conflict.
        combine: bool,
    },
    /// List checks, optionally filtered.
    Checks {
        /// Level filter.
        level: Option<CheckLevel>,
        /// Names to include; empty selects all.
        names: Vec<String>,
    },
    /// Aggregate health over the selected checks.
    Health {
        /// Level filter.
        level: Option<CheckLevel>,
        /// Names to include; empty selects all.
        names: Vec<String>,
    },
    /// Fetch or follow service logs.
    Logs {
        /// Services to read; empty selects all.
        services: Vec<String>,
        /// Number of trailing entries per service.
        n: Option<i32>,
        /// Keep streaming new entries after the backlog.
        follow: bool,
    },
    /// Send a signal to running services.
    SignalServices {
        /// Signal name, e.g. "SIGHUP".
        signal: String,
        /// Target services.
        names: Vec<String>,
    },
    /// Fetch pending warnings.
    Warnings {
        /// Return every warning, not only the pending ones.
        all: bool,
    },
    /// Acknowledge warnings last seen at or before the timestamp.
    OkayWarnings {
        /// Acknowledgement cutoff.
        timestamp: DateTime<Utc>,
    },
    /// List changes with their tasks.
    Changes,
    /// Fetch one change with its tasks.
    Change {
        /// Change id.
        id: String,
    },
    /// Abort an in-flight change.
    Abort {
        /// Change id.
        id: String,
    },
    /// Block until a change is ready.
    WaitChange {
        /// Change id.
        id: String,
        /// Bounded wait; the daemon enforces a default when absent.
        #[serde(default, with = "humantime_serde")]
        timeout: Option<Duration>,
    },
    /// Shut the daemon down.
    Shutdown {
        /// Exit with the restart sentinel instead of cleanly.
        restart: bool,
    },
}

/// One change with its tasks embedded, as served to clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChangeInfo {
    /// The change itself.
    #[serde(flatten)]
    pub change: Change,
    /// Tasks in creation order.
    pub tasks: Vec<Task>,
}

/// Response sent by the daemon.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Command completed successfully.
    Ok,
    /// Command completed with a status message.
    Message(String),
    /// Command failed with an error message.
    Error(String),
    /// Async operation accepted; poll or wait on this change.
    ChangeId(String),
    /// Service listing payload.
    Services(Vec<ServiceInfo>),
    /// Flattened plan as YAML text.
    PlanYaml(String),
    /// Check listing payload.
    Checks(Vec<CheckInfo>),
    /// Aggregate health verdict.
    Health {
        /// True when every selected check is up.
        healthy: bool,
    },
    /// Bounded log read. For follow requests this carries the backlog and
    /// further entries stream as raw JSON lines on the same connection.
    Logs(Vec<LogEntry>),
    /// Warning listing payload.
    Warnings(Vec<Warning>),
    /// Number of warnings cleared by an acknowledgement.
    OkayedWarnings(usize),
    /// Change listing payload.
    Changes(Vec<ChangeInfo>),
    /// Single change payload.
    Change(Box<ChangeInfo>),
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Control socket I/O error.
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    /// Error serializing or deserializing control messages.
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),
    /// Daemon reported an error.
    #[error("daemon reported error: {0}")]
    Server(String),
    /// Peer hung up before a full message arrived.
    #[error("connection closed before a full message arrived")]
    Disconnected,
    /// Control socket not available or daemon not running.
    #[error("control socket not available")]
    NotAvailable,
}

// Both directions speak the same frame format: one serde_json document per
// line. The codec is shared so client and daemon cannot drift apart.

fn write_frame<T: Serialize>(stream: &mut UnixStream, message: &T) -> Result<(), ControlError> {
    serde_json::to_writer(&mut *stream, message)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

fn read_frame<T, R>(reader: &mut R) -> Result<Option<T>, ControlError>
where
    T: serde::de::DeserializeOwned,
    R: BufRead,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    let line = line.trim();
    if n == 0 || line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

/// Sends a command and waits for the daemon's response.
pub fn send_command(command: &ControlCommand) -> Result<ControlResponse, ControlError> {
    open_command(command).map(|(_reader, response)| response)
}

/// Sends a command and returns the reader alongside the first response so
/// callers can keep consuming a streamed body (log follow).
pub fn open_command(
    command: &ControlCommand,
) -> Result<(BufReader<UnixStream>, ControlResponse), ControlError> {
    let path = socket_path()?;
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = UnixStream::connect(path)?;
    write_frame(&mut stream, command)?;

    let mut reader = BufReader::new(stream);
    match read_frame(&mut reader)? {
        // A daemon that died between connect and respond looks the same to
        // the caller as one that was never there.
        None => Err(ControlError::NotAvailable),
        Some(ControlResponse::Error(message)) => Err(ControlError::Server(message)),
        Some(response) => Ok((reader, response)),
    }
}

/// One accepted control connection, as seen from the daemon.
///
/// The stream is wrapped in a single buffered reader for its whole life;
/// responses write through it so no buffered bytes are lost.
pub struct Connection {
    reader: BufReader<UnixStream>,
}

impl Connection {
    /// Wraps an accepted stream.
    pub fn new(stream: UnixStream) -> Connection {
        Connection {
            reader: BufReader::new(stream),
        }
    }

    /// Reads the client's command.
    pub fn receive(&mut self) -> Result<ControlCommand, ControlError> {
        read_frame(&mut self.reader)?.ok_or(ControlError::Disconnected)
    }

    /// Writes one response frame back to the client.
    pub fn respond(&mut self, response: &ControlResponse) -> Result<(), ControlError> {
        write_frame(self.reader.get_mut(), response)
    }

    /// Unwraps the raw stream for body streaming after the response frame.
    pub fn into_stream(self) -> UnixStream {
        self.reader.into_inner()
    }
}

/// Removes the socket file if present.
pub fn cleanup_socket() -> Result<(), ControlError> {
    let path = runtime::socket_path();
    if path.exists() {
        let _ = fs::remove_file(path);
    }
    Ok(())
}
