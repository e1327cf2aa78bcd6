use std::sync::{Mutex, MutexGuard, OnceLock};

/// Global lock serializing environment mutation in tests.
/// Tests that touch process-wide state (HOME, the runtime context) must hold
/// this guard so parallel test threads do not race each other.
static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
