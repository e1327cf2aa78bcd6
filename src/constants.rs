//! Constants and default values for the warden daemon.
//!
//! This module centralizes the timing defaults, capacity limits, and file
//! names used throughout the daemon to improve maintainability and clarity.

use std::time::Duration;

// ============================================================================
// File System Constants
// ============================================================================

/// Name of the persistent state file stored in the warden directory.
/// Contains tasks, changes, warnings and miscellaneous keyed data.
pub const STATE_FILE_NAME: &str = ".warden.state";

/// Lock file suffix for the state file to ensure exclusive access.
pub const STATE_LOCK_SUFFIX: &str = ".lock";

/// Name of the layer directory inside the warden directory.
pub const LAYERS_DIR_NAME: &str = "layers";

/// Name of the control socket inside the warden directory.
pub const SOCKET_FILE_NAME: &str = "warden.sock";

// ============================================================================
// Service Lifecycle Timing
// ============================================================================

/// Window after spawn during which an exit is treated as a failed start.
pub const OKAY_WAIT: Duration = Duration::from_secs(1);

/// Time between SIGTERM and SIGKILL when stopping a service.
pub const DEFAULT_KILL_DELAY: Duration = Duration::from_secs(5);

/// Time to wait after SIGKILL before declaring the stop failed.
pub const FAIL_WAIT: Duration = Duration::from_secs(5);

/// Initial wait before the first automatic restart of a service.
pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_millis(500);

/// Multiplier applied to the backoff wait after each restart.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Upper bound on the backoff wait between restarts.
pub const DEFAULT_BACKOFF_LIMIT: Duration = Duration::from_secs(30);

/// Fraction of the computed backoff added as random jitter.
pub const BACKOFF_JITTER_RATIO: f64 = 0.1;

// ============================================================================
// Health Check Defaults
// ============================================================================

/// Default interval between two runs of the same check.
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(10);

/// Default timeout applied to a single probe.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Default number of consecutive failures before a check goes down.
pub const DEFAULT_CHECK_THRESHOLD: u32 = 3;

/// Bytes of probe output retained as failure details.
pub const CHECK_DETAILS_LIMIT: usize = 1024;

// ============================================================================
// Task Engine Timing
// ============================================================================

/// Interval of the periodic ensure tick when nothing requests an earlier one.
pub const ENSURE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Interval of the change pruning pass.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Age after which a ready and clean change is pruned.
pub const PRUNE_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Age after which a change that never became ready is aborted and pruned.
pub const ABORT_WAIT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default bounded wait when a client blocks on a change.
pub const DEFAULT_CHANGE_WAIT: Duration = Duration::from_secs(30);

/// Maximum number of ready changes retained regardless of age.
pub const MAX_READY_CHANGES: usize = 500;

// ============================================================================
// Logging Constants
// ============================================================================

/// Byte capacity of each per-service log ring buffer.
pub const RING_BUFFER_CAPACITY: usize = 100 * 1024;

/// Number of trailing output lines attached to a failed start.
pub const FAILED_START_OUTPUT_LINES: usize = 20;

/// Default number of trailing lines returned by a log read.
pub const DEFAULT_LOG_LINES: usize = 30;

// ============================================================================
// Restart Handling
// ============================================================================

/// Attempts to tolerate a missing system restart before giving up.
pub const RESTART_MISSING_RETRIES: u32 = 3;

/// Process exit code signalling a requested daemon restart to the wrapper.
pub const EXIT_CODE_RESTART: i32 = 42;
