//! Zombie harvesting and child exit dispatch.
//!
//! The daemon marks itself a child subreaper so grandchildren re-parent to
//! it instead of init. A dedicated thread blocks on SIGCHLD and drains
//! `waitpid(-1, WNOHANG)`, delivering each exit code through the one-shot
//! channel registered for that pid. Exits reaped before anyone registered
//! are parked so a late watcher still receives the code.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, SyncSender, sync_channel},
    },
    thread,
};

use nix::{
    errno::Errno,
    sys::{
        signal::{SigSet, Signal, kill},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::{Pid, getpid},
};
use tracing::{debug, error, warn};

/// Source of child exit codes.
///
/// The service manager waits through this seam so tests can substitute a
/// synchronous implementation that does not require signal plumbing.
pub trait Waiter: Send + Sync {
    /// Registers interest in `pid`; the returned channel yields its exit
    /// code exactly once (128+signal for signalled exits).
    fn watch(&self, pid: u32) -> Receiver<i32>;
}

/// Subreaper-backed waiter driven by SIGCHLD.
pub struct Reaper {
    waiters: Mutex<HashMap<u32, SyncSender<i32>>>,
    orphans: Mutex<HashMap<u32, i32>>,
    stopping: Arc<AtomicBool>,
}

impl Reaper {
    /// Installs the subreaper attribute, blocks SIGCHLD for the process and
    /// starts the harvesting thread.
    ///
    /// Must run before other threads spawn so the signal mask is inherited
    /// everywhere.
    pub fn start() -> io::Result<Arc<Reaper>> {
        #[cfg(target_os = "linux")]
        {
            let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.thread_block().map_err(io::Error::from)?;

        let reaper = Arc::new(Reaper {
            waiters: Mutex::new(HashMap::new()),
            orphans: Mutex::new(HashMap::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        });

        let worker = Arc::clone(&reaper);
        thread::Builder::new()
            .name("reaper".into())
            .spawn(move || worker.run(mask))?;

        Ok(reaper)
    }

    /// Stops the harvesting thread.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        // Wake the sigwait loop.
        let _ = kill(getpid(), Signal::SIGCHLD);
    }

    fn run(&self, mask: SigSet) {
        loop {
            match mask.wait() {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    error!("Reaper signal wait failed: {err}");
                    return;
                }
            }
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            self.drain();
        }
    }

    fn drain(&self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.deliver(pid.as_raw() as u32, code);
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    self.deliver(pid.as_raw() as u32, 128 + signal as i32);
                }
                Ok(WaitStatus::StillAlive) => return,
                Ok(_) => continue,
                Err(Errno::ECHILD) => return,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!("Reaper waitpid failed: {err}");
                    return;
                }
            }
        }
    }

    fn deliver(&self, pid: u32, code: i32) {
        debug!("Reaped pid {pid} with exit code {code}");
        let sender = self
            .waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&pid);
        match sender {
            Some(sender) => {
                if sender.send(code).is_err() {
                    debug!("Watcher for pid {pid} went away");
                }
            }
            None => {
                self.orphans
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(pid, code);
            }
        }
    }
}

impl Waiter for Reaper {
    fn watch(&self, pid: u32) -> Receiver<i32> {
        let (tx, rx) = sync_channel(1);
        if let Some(code) = self
            .orphans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&pid)
        {
            let _ = tx.send(code);
            return rx;
        }
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(pid, tx);
        rx
    }
}

/// Waiter that blocks a dedicated thread in `waitpid` per watched child.
///
/// Used when the daemon does not own process reaping (tests, library use);
/// the calling process must be the direct parent of the watched pid.
#[derive(Default)]
pub struct DirectWaiter;

impl DirectWaiter {
    /// Creates a new direct waiter.
    pub fn new() -> Arc<DirectWaiter> {
        Arc::new(DirectWaiter)
    }
}

impl Waiter for DirectWaiter {
    fn watch(&self, pid: u32) -> Receiver<i32> {
        let (tx, rx) = sync_channel(1);
        thread::spawn(move || {
            let target = Pid::from_raw(pid as i32);
            loop {
                match waitpid(target, None) {
                    Ok(WaitStatus::Exited(_, code)) => {
                        let _ = tx.send(code);
                        return;
                    }
                    Ok(WaitStatus::Signaled(_, signal, _)) => {
                        let _ = tx.send(128 + signal as i32);
                        return;
                    }
                    Ok(_) => continue,
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => {
                        // Someone else reaped it; report a generic failure
                        // code rather than hanging the watcher.
                        let _ = tx.send(0);
                        return;
                    }
                    Err(err) => {
                        warn!("Direct wait for pid {pid} failed: {err}");
                        let _ = tx.send(-1);
                        return;
                    }
                }
            }
        });
        rx
    }
}
