//! Persistent task, change and warning state.
//!
//! The whole tree lives behind one process-wide lock. Every externally
//! visible mutation is checkpointed when the lock guard drops, by writing the
//! serialized tree to a temporary file and renaming it over the state file.
//! Readers never touch disk.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::{constants::STATE_LOCK_SUFFIX, error::StateError};

/// Changes and the tasks grouped under them.
pub mod change;

/// Concurrent dispatcher matching tasks to handlers.
pub mod taskrunner;

pub use change::{Change, Progress, Status, Task, aggregate_status};

/// Highest state file format level this daemon understands.
pub const PATCH_LEVEL: u32 = 1;

const WARNING_EXPIRE_AFTER: Duration = Duration::from_secs(28 * 24 * 60 * 60);
const WARNING_REPEAT_AFTER: Duration = Duration::from_secs(24 * 60 * 60);
const WARNINGS_DATA_KEY: &str = "warnings";

/// Timestamped warning with first/last seen tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Warning {
    /// The warning text; warnings are deduplicated by it.
    pub message: String,
    /// When this warning was first recorded.
    pub first_added: DateTime<Utc>,
    /// When this warning was most recently recorded.
    pub last_added: DateTime<Utc>,
    /// When this warning was last surfaced to a client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_shown: Option<DateTime<Utc>>,
    /// Dropped entirely once unrepeated for this long.
    #[serde(with = "humantime_serde")]
    pub expire_after: Duration,
    /// Not surfaced again until this long after `last_shown`.
    #[serde(with = "humantime_serde")]
    pub repeat_after: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct MarshalledState {
    #[serde(default)]
    data: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    changes: BTreeMap<String, Change>,
    #[serde(default)]
    tasks: BTreeMap<String, Task>,
    #[serde(default)]
    last_change_id: u64,
    #[serde(default)]
    last_task_id: u64,
    #[serde(default)]
    last_lane_id: u64,
    #[serde(default)]
    patch_level: u32,
}

/// In-memory state tree.
///
/// Obtained through [`StateStore::lock`]; mutating methods mark the tree
/// modified so the guard checkpoints it on drop.
#[derive(Debug, Default)]
pub struct State {
    data: BTreeMap<String, serde_json::Value>,
    changes: BTreeMap<String, Change>,
    tasks: BTreeMap<String, Task>,
    warnings: Vec<Warning>,
    last_change_id: u64,
    last_task_id: u64,
    last_lane_id: u64,
    modified: bool,
}

impl State {
    fn from_marshalled(mut m: MarshalledState) -> Result<State, StateError> {
        if m.patch_level > PATCH_LEVEL {
            return Err(StateError::PatchLevel {
                found: m.patch_level,
                supported: PATCH_LEVEL,
            });
        }

        let warnings = match m.data.remove(WARNINGS_DATA_KEY) {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };

        Ok(State {
            data: m.data,
            changes: m.changes,
            tasks: m.tasks,
            warnings,
            last_change_id: m.last_change_id,
            last_task_id: m.last_task_id,
            last_lane_id: m.last_lane_id,
            modified: false,
        })
    }

    /// Serializes the tree into its on-disk JSON form.
    pub fn serialize(&self) -> Result<Vec<u8>, StateError> {
        let mut data = self.data.clone();
        if !self.warnings.is_empty() {
            data.insert(
                WARNINGS_DATA_KEY.to_string(),
                serde_json::to_value(&self.warnings)?,
            );
        }
        let marshalled = MarshalledState {
            data,
            changes: self.changes.clone(),
            tasks: self.tasks.clone(),
            last_change_id: self.last_change_id,
            last_task_id: self.last_task_id,
            last_lane_id: self.last_lane_id,
            patch_level: PATCH_LEVEL,
        };
        Ok(serde_json::to_vec(&marshalled)?)
    }

    // ------------------------------------------------------------------
    // Misc keyed data
    // ------------------------------------------------------------------

    /// Stores a serializable value under `key`.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        let value = serde_json::to_value(value)?;
        self.data.insert(key.to_string(), value);
        self.modified = true;
        Ok(())
    }

    /// Fetches the value stored under `key`, if any.
    pub fn get<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StateError> {
        match self.data.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Removes the value stored under `key`.
    pub fn unset(&mut self, key: &str) {
        if self.data.remove(key).is_some() {
            self.modified = true;
        }
    }

    // ------------------------------------------------------------------
    // Changes and tasks
    // ------------------------------------------------------------------

    /// Creates a new change and returns its id.
    pub fn new_change(&mut self, kind: &str, summary: &str) -> String {
        self.last_change_id += 1;
        let id = self.last_change_id.to_string();
        self.changes.insert(
            id.clone(),
            Change {
                id: id.clone(),
                kind: kind.to_string(),
                summary: summary.to_string(),
                status: Status::Done,
                data: BTreeMap::new(),
                task_ids: Vec::new(),
                spawn_time: Utc::now(),
                ready_time: Some(Utc::now()),
            },
        );
        self.modified = true;
        id
    }

    /// Creates a new task under `change_id` and returns its id.
    pub fn new_task(
        &mut self,
        change_id: &str,
        kind: &str,
        summary: &str,
        wait_tasks: Vec<String>,
        data: BTreeMap<String, serde_json::Value>,
    ) -> Result<String, StateError> {
        if !self.changes.contains_key(change_id) {
            return Err(StateError::ChangeNotFound(change_id.to_string()));
        }

        self.last_task_id += 1;
        let id = self.last_task_id.to_string();
        self.tasks.insert(
            id.clone(),
            Task {
                id: id.clone(),
                kind: kind.to_string(),
                summary: summary.to_string(),
                status: Status::Do,
                progress: Progress::default(),
                log: Vec::new(),
                wait_tasks,
                data,
                change: change_id.to_string(),
                spawn_time: Utc::now(),
                ready_time: None,
            },
        );
        if let Some(change) = self.changes.get_mut(change_id) {
            change.task_ids.push(id.clone());
        }
        self.recompute_change(change_id);
        self.modified = true;
        Ok(id)
    }

    /// Attaches caller-supplied data to a change.
    pub fn set_change_data(
        &mut self,
        change_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StateError> {
        let change = self
            .changes
            .get_mut(change_id)
            .ok_or_else(|| StateError::ChangeNotFound(change_id.to_string()))?;
        change.data.insert(key.to_string(), value);
        self.modified = true;
        Ok(())
    }

    /// Returns the change with the given id.
    pub fn change(&self, id: &str) -> Result<&Change, StateError> {
        self.changes
            .get(id)
            .ok_or_else(|| StateError::ChangeNotFound(id.to_string()))
    }

    /// Returns all changes, oldest first.
    pub fn changes(&self) -> Vec<&Change> {
        let mut list: Vec<&Change> = self.changes.values().collect();
        list.sort_by(|a, b| {
            numeric_id(&a.id)
                .cmp(&numeric_id(&b.id))
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    /// Returns the task with the given id.
    pub fn task(&self, id: &str) -> Result<&Task, StateError> {
        self.tasks
            .get(id)
            .ok_or_else(|| StateError::TaskNotFound(id.to_string()))
    }

    /// Returns the tasks of a change in creation order.
    pub fn change_tasks(&self, change_id: &str) -> Result<Vec<&Task>, StateError> {
        let change = self.change(change_id)?;
        Ok(change
            .task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect())
    }

    /// Moves a task to a new status, recomputing its change.
    pub fn set_task_status(&mut self, id: &str, status: Status) -> Result<(), StateError> {
        let change_id = {
            let task = self
                .tasks
                .get_mut(id)
                .ok_or_else(|| StateError::TaskNotFound(id.to_string()))?;
            task.status = status;
            task.ready_time = status.is_ready().then(Utc::now);
            task.change.clone()
        };
        self.recompute_change(&change_id);
        self.modified = true;
        Ok(())
    }

    /// Appends an INFO line to a task log.
    pub fn task_logf(&mut self, id: &str, message: &str) -> Result<(), StateError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| StateError::TaskNotFound(id.to_string()))?;
        task.logf(message);
        self.modified = true;
        Ok(())
    }

    /// Appends an ERROR line to a task log.
    pub fn task_errorf(&mut self, id: &str, message: &str) -> Result<(), StateError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| StateError::TaskNotFound(id.to_string()))?;
        task.errorf(message);
        self.modified = true;
        Ok(())
    }

    /// Updates the numeric progress of a task.
    pub fn set_task_progress(
        &mut self,
        id: &str,
        progress: Progress,
    ) -> Result<(), StateError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| StateError::TaskNotFound(id.to_string()))?;
        task.progress = progress;
        self.modified = true;
        Ok(())
    }

    /// Tasks eligible for dispatch: queued with every waited-on task ready.
    pub fn dispatchable_tasks(&self) -> Vec<Task> {
        self.tasks
            .values()
            .filter(|task| matches!(task.status, Status::Do | Status::Wait))
            .filter(|task| {
                task.wait_tasks.iter().all(|dep| {
                    self.tasks
                        .get(dep)
                        .map(|t| t.status.is_ready())
                        .unwrap_or(true)
                })
            })
            .cloned()
            .collect()
    }

    /// Aborts a change: queued tasks move to `Abort`, running ones to
    /// `Aborting`. Returns the ids of tasks now aborting so their handlers
    /// can be killed.
    pub fn abort_change(&mut self, id: &str) -> Result<Vec<String>, StateError> {
        let task_ids = self.change(id)?.task_ids.clone();
        let mut aborting = Vec::new();
        for task_id in task_ids {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                match task.status {
                    Status::Do | Status::Wait | Status::Hold => {
                        task.status = Status::Abort;
                        task.ready_time = Some(Utc::now());
                    }
                    Status::Doing => {
                        task.status = Status::Aborting;
                        aborting.push(task_id);
                    }
                    _ => {}
                }
            }
        }
        self.recompute_change(id);
        self.modified = true;
        Ok(aborting)
    }

    /// Prunes old changes: ancient unready changes are aborted; ready ones
    /// are dropped once older than `prune_wait` or beyond `max_ready`.
    pub fn prune(
        &mut self,
        now: DateTime<Utc>,
        prune_wait: Duration,
        abort_wait: Duration,
        max_ready: usize,
    ) {
        let abort_cutoff = now - chrono::Duration::from_std(abort_wait).unwrap_or_default();
        let stale: Vec<String> = self
            .changes
            .values()
            .filter(|c| !c.is_ready() && c.spawn_time < abort_cutoff)
            .map(|c| c.id.clone())
            .collect();
        for id in stale {
            warn!("Aborting change {id} older than the abort window");
            let _ = self.abort_change(&id);
        }

        let prune_cutoff = now - chrono::Duration::from_std(prune_wait).unwrap_or_default();
        let mut ready: Vec<(String, DateTime<Utc>)> = self
            .changes
            .values()
            .filter(|c| c.is_ready())
            .map(|c| (c.id.clone(), c.ready_time.unwrap_or(c.spawn_time)))
            .collect();
        // Most recent first; the cap keeps the newest entries.
        ready.sort_by(|a, b| b.1.cmp(&a.1));

        for (index, (id, ready_time)) in ready.into_iter().enumerate() {
            if index >= max_ready || ready_time < prune_cutoff {
                self.drop_change(&id);
            }
        }
    }

    fn drop_change(&mut self, id: &str) {
        if let Some(change) = self.changes.remove(id) {
            for task_id in change.task_ids {
                self.tasks.remove(&task_id);
            }
            self.modified = true;
        }
    }

    fn recompute_change(&mut self, change_id: &str) {
        let Some(change) = self.changes.get(change_id) else {
            return;
        };
        let status = aggregate_status(
            change
                .task_ids
                .iter()
                .filter_map(|id| self.tasks.get(id))
                .map(|t| &t.status),
        );
        let was_ready = change.is_ready();
        if let Some(change) = self.changes.get_mut(change_id) {
            change.status = status;
            if status.is_ready() {
                if !was_ready || change.ready_time.is_none() {
                    change.ready_time = Some(Utc::now());
                }
            } else {
                change.ready_time = None;
            }
        }
    }

    // ------------------------------------------------------------------
    // Warnings
    // ------------------------------------------------------------------

    /// Records a warning, bumping `last_added` when the message repeats.
    pub fn warnf(&mut self, message: impl Into<String>) {
        let message = message.into();
        let now = Utc::now();
        if let Some(existing) = self.warnings.iter_mut().find(|w| w.message == message) {
            existing.last_added = now;
        } else {
            self.warnings.push(Warning {
                message,
                first_added: now,
                last_added: now,
                last_shown: None,
                expire_after: WARNING_EXPIRE_AFTER,
                repeat_after: WARNING_REPEAT_AFTER,
            });
        }
        self.modified = true;
    }

    /// Returns warnings due to be shown, marking them shown.
    pub fn pending_warnings(&mut self) -> Vec<Warning> {
        let now = Utc::now();
        self.expire_warnings(now);

        let mut pending = Vec::new();
        for warning in &mut self.warnings {
            let due = match warning.last_shown {
                None => true,
                Some(shown) => {
                    let repeat =
                        chrono::Duration::from_std(warning.repeat_after).unwrap_or_default();
                    shown + repeat <= now
                }
            };
            if due {
                warning.last_shown = Some(now);
                pending.push(warning.clone());
                self.modified = true;
            }
        }
        pending
    }

    /// Returns every retained warning without marking anything shown.
    pub fn all_warnings(&mut self) -> Vec<Warning> {
        self.expire_warnings(Utc::now());
        self.warnings.clone()
    }

    /// Drops warnings whose `last_added` is at or before `timestamp`.
    /// Returns how many were cleared.
    pub fn okay_warnings(&mut self, timestamp: DateTime<Utc>) -> usize {
        let before = self.warnings.len();
        self.warnings.retain(|w| w.last_added > timestamp);
        let cleared = before - self.warnings.len();
        if cleared > 0 {
            self.modified = true;
        }
        cleared
    }

    fn expire_warnings(&mut self, now: DateTime<Utc>) {
        let before = self.warnings.len();
        self.warnings.retain(|w| {
            let expire = chrono::Duration::from_std(w.expire_after).unwrap_or_default();
            w.last_added + expire > now
        });
        if self.warnings.len() != before {
            self.modified = true;
        }
    }
}

fn numeric_id(id: &str) -> u64 {
    id.parse().unwrap_or(u64::MAX)
}

struct FileBackend {
    path: PathBuf,
    _lock: File,
}

impl FileBackend {
    fn open(path: &Path) -> Result<FileBackend, StateError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_path = lock_path(path);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock.try_lock_exclusive()?;

        Ok(FileBackend {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    fn checkpoint(&self, bytes: &[u8]) -> Result<(), StateError> {
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;

        if let Some(parent) = self.path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(STATE_LOCK_SUFFIX);
    PathBuf::from(name)
}

/// Shared handle to the state tree with checkpoint-on-unlock semantics.
pub struct StateStore {
    state: Mutex<State>,
    backend: Option<FileBackend>,
    changed: Condvar,
}

impl StateStore {
    /// Loads (or initializes) the state file at `path`, taking the exclusive
    /// state lock for the life of this store.
    pub fn load(path: &Path) -> Result<StateStore, StateError> {
        let backend = FileBackend::open(path)?;
        let state = if path.exists() {
            let bytes = fs::read(path)?;
            let marshalled: MarshalledState = serde_json::from_slice(&bytes)?;
            State::from_marshalled(marshalled)?
        } else {
            State::default()
        };

        Ok(StateStore {
            state: Mutex::new(state),
            backend: Some(backend),
            changed: Condvar::new(),
        })
    }

    /// Creates a store with no disk backend. Used by tests.
    pub fn in_memory() -> StateStore {
        StateStore {
            state: Mutex::new(State::default()),
            backend: None,
            changed: Condvar::new(),
        }
    }

    /// Takes the process-wide state lock.
    ///
    /// Must not be held across blocking calls into the service manager or
    /// the task runner; long waits go through [`StateStore::wait_change`].
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            store: self,
            guard: Some(
                self.state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            ),
        }
    }

    /// Blocks until the change is ready or the timeout elapses.
    pub fn wait_change(
        &self,
        change_id: &str,
        timeout: Duration,
    ) -> Result<Change, StateError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        loop {
            let change = guard.change(change_id)?.clone();
            if change.is_ready() {
                return Ok(change);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StateError::WaitTimeout(change_id.to_string()));
            }
            let (g, _) = self
                .changed
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard = g;
        }
    }
}

/// Guard over the locked state; checkpoints on drop when modified.
pub struct StateGuard<'a> {
    store: &'a StateStore,
    guard: Option<MutexGuard<'a, State>>,
}

impl std::ops::Deref for StateGuard<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        self.guard.as_ref().expect("state guard taken")
    }
}

impl std::ops::DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut State {
        self.guard.as_mut().expect("state guard taken")
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        let Some(mut state) = self.guard.take() else {
            return;
        };
        if !state.modified {
            return;
        }
        state.modified = false;

        match state.serialize() {
            Ok(bytes) => {
                if let Some(backend) = &self.store.backend
                    && let Err(err) = backend.checkpoint(&bytes)
                {
                    error!("Failed to checkpoint state: {err}");
                }
            }
            Err(err) => error!("Failed to serialize state: {err}"),
        }

        drop(state);
        self.store.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn change_and_task_lifecycle() {
        let store = StateStore::in_memory();
        let mut st = store.lock();

        let change_id = st.new_change("start", "Start service \"web\"");
        let first = st
            .new_task(&change_id, "start", "Start service \"web\"", vec![], BTreeMap::new())
            .expect("task");
        let second = st
            .new_task(
                &change_id,
                "start",
                "Start service \"db\"",
                vec![first.clone()],
                BTreeMap::new(),
            )
            .expect("task");

        assert_eq!(st.change(&change_id).unwrap().status, Status::Do);
        assert!(!st.change(&change_id).unwrap().is_ready());

        // Only the first task is dispatchable while its successor waits.
        let dispatchable = st.dispatchable_tasks();
        assert_eq!(dispatchable.len(), 1);
        assert_eq!(dispatchable[0].id, first);

        st.set_task_status(&first, Status::Done).unwrap();
        let dispatchable = st.dispatchable_tasks();
        assert_eq!(dispatchable.len(), 1);
        assert_eq!(dispatchable[0].id, second);

        st.set_task_status(&second, Status::Done).unwrap();
        let change = st.change(&change_id).unwrap();
        assert_eq!(change.status, Status::Done);
        assert!(change.is_ready());
        assert!(change.ready_time.is_some());
    }

    #[test]
    fn error_task_fails_the_change() {
        let store = StateStore::in_memory();
        let mut st = store.lock();
        let change_id = st.new_change("start", "Start");
        let task = st
            .new_task(&change_id, "start", "t", vec![], BTreeMap::new())
            .unwrap();
        st.set_task_status(&task, Status::Error).unwrap();
        assert_eq!(st.change(&change_id).unwrap().status, Status::Error);
    }

    #[test]
    fn abort_change_parks_and_flags_tasks() {
        let store = StateStore::in_memory();
        let mut st = store.lock();
        let change_id = st.new_change("start", "Start");
        let queued = st
            .new_task(&change_id, "start", "queued", vec![], BTreeMap::new())
            .unwrap();
        let running = st
            .new_task(&change_id, "start", "running", vec![], BTreeMap::new())
            .unwrap();
        st.set_task_status(&running, Status::Doing).unwrap();

        let aborting = st.abort_change(&change_id).unwrap();
        assert_eq!(aborting, vec![running.clone()]);
        assert_eq!(st.task(&queued).unwrap().status, Status::Abort);
        assert_eq!(st.task(&running).unwrap().status, Status::Aborting);
        assert_eq!(st.change(&change_id).unwrap().status, Status::Aborting);
    }

    #[test]
    fn persistence_round_trip_is_stable() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".warden.state");

        {
            let store = StateStore::load(&path).expect("load");
            let mut st = store.lock();
            let change_id = st.new_change("start", "Start service \"web\"");
            let task = st
                .new_task(&change_id, "start", "t", vec![], BTreeMap::new())
                .unwrap();
            st.set_task_status(&task, Status::Done).unwrap();
            st.set("boot-id", &"abc123").unwrap();
            st.warnf("something odd");
        }

        let first = fs::read(&path).expect("state written");

        // Reload and rewrite without mutating; bytes must be identical.
        {
            let store = StateStore::load(&path).expect("reload");
            let st = store.lock();
            let bytes = st.serialize().expect("serialize");
            assert_eq!(bytes, first);
            // Touch nothing; guard drop must not rewrite.
            let _ = st.change("1").unwrap();
        }
        let second = fs::read(&path).expect("still there");
        assert_eq!(first, second);
    }

    #[test]
    fn state_lock_is_exclusive_across_stores() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".warden.state");
        let _store = StateStore::load(&path).expect("load");
        assert!(StateStore::load(&path).is_err());
    }

    #[test]
    fn prune_caps_and_expires_ready_changes() {
        let store = StateStore::in_memory();
        let mut st = store.lock();
        for i in 0..4 {
            let id = st.new_change("start", &format!("change {i}"));
            let task = st
                .new_task(&id, "start", "t", vec![], BTreeMap::new())
                .unwrap();
            st.set_task_status(&task, Status::Done).unwrap();
        }
        assert_eq!(st.changes().len(), 4);

        // The cap keeps only the two most recent ready changes.
        st.prune(
            Utc::now(),
            Duration::from_secs(3600),
            Duration::from_secs(7200),
            2,
        );
        assert_eq!(st.changes().len(), 2);

        // Everything ready expires once the prune window passes.
        st.prune(
            Utc::now() + chrono::Duration::hours(2),
            Duration::from_secs(3600),
            Duration::from_secs(7 * 24 * 3600),
            100,
        );
        assert_eq!(st.changes().len(), 0);
    }

    #[test]
    fn warnings_dedupe_and_clear() {
        let store = StateStore::in_memory();
        let mut st = store.lock();
        st.warnf("disk is small");
        st.warnf("disk is small");
        st.warnf("network is slow");
        assert_eq!(st.all_warnings().len(), 2);

        let pending = st.pending_warnings();
        assert_eq!(pending.len(), 2);
        // Just shown; not yet due again.
        assert!(st.pending_warnings().is_empty());

        let cleared = st.okay_warnings(Utc::now());
        assert_eq!(cleared, 2);
        assert!(st.all_warnings().is_empty());
    }
}
