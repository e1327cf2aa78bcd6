//! Helpers for resolving the warden directory based on the current privilege mode.
use std::{
    env,
    path::{Path, PathBuf},
    sync::{OnceLock, RwLock},
};

use crate::constants::{LAYERS_DIR_NAME, SOCKET_FILE_NAME, STATE_FILE_NAME};

/// Runtime mode that determines where state, layers and the socket live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Standard userspace mode; state lives under the invoking user's home directory.
    User,
    /// System mode; state is stored in system directories that require elevated privileges.
    System,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    mode: RuntimeMode,
    warden_dir: PathBuf,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_mode(RuntimeMode::User)))
}

impl RuntimeContext {
    fn from_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::User => Self::user_directories(),
            RuntimeMode::System => Self::system_directories(),
        }
    }

    fn user_directories() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self {
            mode: RuntimeMode::User,
            warden_dir: home.join(".local/share/warden"),
        }
    }

    fn system_directories() -> Self {
        Self {
            mode: RuntimeMode::System,
            warden_dir: PathBuf::from("/var/lib/warden"),
        }
    }
}

/// Updates the global runtime directories for the provided mode. Subsequent calls overwrite
/// the active configuration, allowing different invocations within the same process to
/// operate with the correct context.
pub fn init(mode: RuntimeMode) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_mode(mode);
}

/// Points the runtime at an explicit warden directory, overriding mode defaults.
pub fn init_with_dir(dir: &Path) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    guard.warden_dir = dir.to_path_buf();
}

/// Returns the current runtime mode.
pub fn mode() -> RuntimeMode {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .mode
}

/// Returns the warden directory holding state, layers and the control socket.
pub fn warden_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .warden_dir
        .clone()
}

/// Returns the path of the persistent state file.
pub fn state_path() -> PathBuf {
    warden_dir().join(STATE_FILE_NAME)
}

/// Returns the directory containing the ordered layer files.
pub fn layers_dir() -> PathBuf {
    warden_dir().join(LAYERS_DIR_NAME)
}

/// Returns the path of the control socket.
pub fn socket_path() -> PathBuf {
    warden_dir().join(SOCKET_FILE_NAME)
}
