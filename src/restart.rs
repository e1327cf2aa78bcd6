//! Pending system restart tracking.
//!
//! When a system restart is requested, the current boot id is recorded in
//! the state store. On the next daemon start a matching boot id means the
//! machine never rebooted; the condition is tolerated a few times before
//! the marker is dropped with a warning.

use std::fs;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    constants::RESTART_MISSING_RETRIES,
    error::{DaemonError, StateError},
    state::StateStore,
};

const PENDING_RESTART_KEY: &str = "pending-restart";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct PendingRestart {
    boot_id: String,
    #[serde(default)]
    attempts: u32,
}

/// Best-effort identifier of the current boot.
pub fn boot_id() -> String {
    fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .map(|id| id.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Records that a system restart is expected before the next daemon start.
pub fn note_restart_pending(store: &StateStore) -> Result<(), StateError> {
    let mut st = store.lock();
    st.set(
        PENDING_RESTART_KEY,
        &PendingRestart {
            boot_id: boot_id(),
            attempts: 0,
        },
    )
}

/// Verifies the pending-restart marker against the running boot id.
///
/// A marker from a previous boot is simply cleared. A marker from this very
/// boot means the expected restart did not happen: the error is surfaced a
/// few times, then the marker is dropped so the daemon can proceed.
pub fn verify_boot(store: &StateStore) -> Result<(), DaemonError> {
    let mut st = store.lock();
    let Some(mut pending) = st.get::<PendingRestart>(PENDING_RESTART_KEY)? else {
        return Ok(());
    };

    if pending.boot_id != boot_id() {
        info!("System restart completed; clearing the pending-restart marker");
        st.unset(PENDING_RESTART_KEY);
        return Ok(());
    }

    pending.attempts += 1;
    if pending.attempts > RESTART_MISSING_RETRIES {
        warn!(
            "Expected system restart never happened after {} attempts; giving up",
            pending.attempts - 1
        );
        st.unset(PENDING_RESTART_KEY);
        return Ok(());
    }

    let attempt = pending.attempts;
    st.set(PENDING_RESTART_KEY, &pending)?;
    Err(DaemonError::SystemRestartMissing { attempt })
}
