//! Error handling for warden.
use thiserror::Error;

/// Errors raised while reading, composing or validating the plan.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Error reading or writing a layer file.
    #[error("Failed to read layer file: {0}")]
    LayerReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid layer YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// A layer with the same label already exists.
    #[error("Layer \"{0}\" already exists")]
    LabelExists(String),

    /// A service declared an empty or unsplittable command.
    #[error("Service \"{service}\" has an invalid command: {reason}")]
    InvalidCommand {
        /// The offending service.
        service: String,
        /// Why the command was rejected.
        reason: String,
    },

    /// A field failed schema validation.
    #[error("Invalid value for {field} of {kind} \"{name}\": {reason}")]
    InvalidField {
        /// Entry kind ("service", "check" or "log target").
        kind: &'static str,
        /// Entry name.
        name: String,
        /// Offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// A name referenced by another entry is not defined in the plan.
    #[error("Service \"{service}\" references unknown {kind} \"{name}\"")]
    UnknownReference {
        /// The referencing service.
        service: String,
        /// Referenced entry kind ("service" or "check").
        kind: &'static str,
        /// The missing name.
        name: String,
    },

    /// The service dependency graph contains a cycle.
    #[error("Detected service dependency cycle: {cycle}")]
    DependencyCycle {
        /// Human-readable cycle description (e.g. `a -> b -> a`).
        cycle: String,
    },
}

/// Errors raised by the persistent state store.
#[derive(Debug, Error)]
pub enum StateError {
    /// Error reading or writing the state file.
    #[error("Failed to access state file: {0}")]
    Io(#[from] std::io::Error),

    /// Error serializing or parsing the state file.
    #[error("Failed to parse state file: {0}")]
    Parse(#[from] serde_json::Error),

    /// The state file was written by a newer daemon.
    #[error("State file patch level {found} is newer than supported level {supported}")]
    PatchLevel {
        /// Patch level found on disk.
        found: u32,
        /// Highest level this daemon understands.
        supported: u32,
    },

    /// Requested change id is unknown.
    #[error("Change \"{0}\" not found")]
    ChangeNotFound(String),

    /// Requested task id is unknown.
    #[error("Task \"{0}\" not found")]
    TaskNotFound(String),

    /// Waiting for a change to become ready exceeded the bounded wait.
    #[error("Timed out waiting for change \"{0}\" to settle")]
    WaitTimeout(String),
}

/// Errors raised by the service lifecycle engine.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Named service is not part of the current plan.
    #[error("Service \"{0}\" not found in plan")]
    NotFound(String),

    /// Error spawning a service process.
    #[error("Cannot start service \"{service}\": {source}")]
    StartError {
        /// The service name that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The child exited inside the okay-wait window.
    #[error("Cannot start service \"{service}\": exited quickly with code {code}")]
    ExitedQuickly {
        /// The service name that failed to start.
        service: String,
        /// The exit code observed inside the okay-wait window.
        code: i32,
    },

    /// The child survived both SIGTERM and SIGKILL.
    #[error(
        "Cannot stop service \"{service}\": process still running after SIGTERM and SIGKILL"
    )]
    StopFailed {
        /// The service that refused to die.
        service: String,
    },

    /// Error delivering a signal to a service process group.
    #[error("Cannot signal service \"{service}\": {source}")]
    SignalError {
        /// The target service.
        service: String,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },

    /// A group was configured without a user.
    #[error("Service \"{0}\" specifies a group without a user")]
    GroupWithoutUser(String),

    /// A configured user or group does not exist on this host.
    #[error("Service \"{service}\" references unknown {kind} \"{name}\"")]
    UnknownAccount {
        /// The service being spawned.
        service: String,
        /// "user" or "group".
        kind: &'static str,
        /// The account name that failed to resolve.
        name: String,
    },

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisoned(String),

    /// Invariant violation inside the lifecycle engine.
    #[error("Internal service error: {0}")]
    Internal(String),
}

impl<T> From<std::sync::PoisonError<T>> for ServiceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ServiceError::MutexPoisoned(err.to_string())
    }
}

/// Errors raised by a single health-check probe.
#[derive(Debug, Error)]
pub enum CheckError {
    /// HTTP transport failure or error status.
    #[error("{0}")]
    Http(String),

    /// TCP connection failure.
    #[error("Cannot connect to {addr}: {source}")]
    Tcp {
        /// Destination that refused the connection.
        addr: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Exec probe could not be spawned or waited on.
    #[error("Check command failed: {0}")]
    Exec(String),

    /// Probe exceeded its configured timeout.
    #[error("Check timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Top-level daemon error combining all subsystems.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Plan composition or validation failure.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// State persistence failure.
    #[error(transparent)]
    State(#[from] StateError),

    /// Service lifecycle failure.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Control socket failure.
    #[error(transparent)]
    Control(#[from] crate::ipc::ControlError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A requested system restart did not happen before this boot.
    #[error("Expected system restart did not happen (attempt {attempt})")]
    SystemRestartMissing {
        /// How many daemon starts observed the stale marker.
        attempt: u32,
    },
}
