//! Changes and the tasks they group.
//!
//! A change is the user-visible unit of work produced by one control-plane
//! operation. Its status is derived from the statuses of its tasks; a change
//! is ready exactly when every task has reached a terminal status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;

/// Status of a task, and by aggregation of a change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Status {
    /// Parked; will not be dispatched.
    Hold,
    /// Queued for dispatch.
    Do,
    /// Handler currently running.
    Doing,
    /// Finished successfully.
    Done,
    /// Cancelled before or during execution.
    Abort,
    /// Cancellation requested while the handler runs.
    Aborting,
    /// Finished with an error.
    Error,
    /// Tried and waiting to be re-dispatched.
    Wait,
}

impl Status {
    /// True for statuses that no longer change.
    pub fn is_ready(&self) -> bool {
        matches!(self, Status::Done | Status::Abort | Status::Error | Status::Hold)
    }
}

/// Numeric progress attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Short label describing the unit of progress.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    /// Completed units.
    #[serde(default)]
    pub done: i32,
    /// Total units.
    #[serde(default)]
    pub total: i32,
}

impl Progress {
    /// True when no progress has been recorded.
    pub fn is_empty(&self) -> bool {
        self.label.is_empty() && self.done == 0 && self.total == 0
    }
}

/// One unit of work driven by a single handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Task {
    /// Task id, unique across the state.
    pub id: String,
    /// Handler kind string.
    pub kind: String,
    /// Human-readable summary.
    pub summary: String,
    /// Current status.
    pub status: Status,
    /// Numeric progress.
    #[serde(default, skip_serializing_if = "Progress::is_empty")]
    pub progress: Progress,
    /// Append-only log lines.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
    /// Ids of tasks that must be ready before this one may start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_tasks: Vec<String>,
    /// Opaque per-task data.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
    /// Id of the owning change.
    pub change: String,
    /// Creation time.
    pub spawn_time: DateTime<Utc>,
    /// Time the task reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_time: Option<DateTime<Utc>>,
}

impl Task {
    /// Appends a timestamped log line at INFO level.
    pub fn logf(&mut self, message: impl AsRef<str>) {
        self.append_log("INFO", message.as_ref());
    }

    /// Appends a timestamped log line at ERROR level.
    pub fn errorf(&mut self, message: impl AsRef<str>) {
        self.append_log("ERROR", message.as_ref());
    }

    fn append_log(&mut self, level: &str, message: &str) {
        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        self.log.push(format!("{stamp} {level} {message}"));
    }
}

/// User-visible grouping of tasks produced by one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Change {
    /// Change id, unique across the state.
    pub id: String,
    /// Operation kind ("start", "stop", "restart", "replan", "autostart").
    pub kind: String,
    /// Human-readable summary.
    pub summary: String,
    /// Aggregate status, recomputed whenever a task mutates.
    pub status: Status,
    /// Opaque data supplied by the submitting caller.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
    /// Ids of the constituent tasks, in creation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_ids: Vec<String>,
    /// Creation time.
    pub spawn_time: DateTime<Utc>,
    /// Time the change became ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_time: Option<DateTime<Utc>>,
}

impl Change {
    /// True once every task reached a terminal status.
    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }
}

/// Derives the aggregate status of a change from its task statuses.
///
/// A change with all tasks terminal is `Error` if any task errored, `Abort`
/// if any was aborted, else `Done`. While tasks remain active the dominant
/// active status wins: `Aborting` over `Doing` over `Do` over `Wait`.
pub fn aggregate_status<'a>(statuses: impl Iterator<Item = &'a Status>) -> Status {
    let mut all_ready = true;
    let mut any_error = false;
    let mut any_abort = false;
    let mut any_aborting = false;
    let mut any_doing = false;
    let mut any_do = false;
    let mut any_hold = false;
    let mut seen = false;

    for status in statuses {
        seen = true;
        match status {
            Status::Done => {}
            Status::Error => any_error = true,
            Status::Abort => any_abort = true,
            Status::Hold => any_hold = true,
            Status::Aborting => {
                all_ready = false;
                any_aborting = true;
            }
            Status::Doing => {
                all_ready = false;
                any_doing = true;
            }
            Status::Do => {
                all_ready = false;
                any_do = true;
            }
            Status::Wait => {
                all_ready = false;
            }
        }
    }

    if !seen {
        return Status::Done;
    }

    if all_ready {
        if any_error {
            Status::Error
        } else if any_abort {
            Status::Abort
        } else if any_hold {
            Status::Hold
        } else {
            Status::Done
        }
    } else if any_aborting {
        Status::Aborting
    } else if any_doing {
        Status::Doing
    } else if any_do {
        Status::Do
    } else {
        Status::Wait
    }
}
