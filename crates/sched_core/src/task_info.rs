//! Per-PID virtual-time bookkeeping.

use std::collections::HashMap;
use std::sync::RwLock;

/// Scheduling statistics tracked for a single PID between enqueues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskInfo {
    /// Cumulative on-cpu runtime last observed for this task.
    pub prev_exec_runtime: u64,
    /// The task's current virtual runtime.
    pub vruntime: u64,
    /// Smoothed voluntary-context-switch rate, capped at
    /// [`crate::vtime::MAX_LATENCY_WEIGHT`].
    pub avg_nvcsw: u64,
    /// Voluntary context switches observed in the current 1-second window.
    pub nvcsw: u64,
    /// Timestamp (ns) the current voluntary-context-switch window opened.
    pub nvcsw_ts: u64,
}

/// A table of [`TaskInfo`] keyed by PID, with the entry created lazily on
/// first enqueue.
#[derive(Debug, Default)]
pub struct TaskInfoTable {
    entries: RwLock<HashMap<i32, TaskInfo>>,
}

impl TaskInfoTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the entry for `pid`, if present.
    #[must_use]
    pub fn get(&self, pid: i32) -> Option<TaskInfo> {
        self.entries
            .read()
            .expect("task info table lock poisoned")
            .get(&pid)
            .copied()
    }

    /// Removes the entry for `pid`. Called when the kernel reports the task
    /// has exited, so the table does not grow unbounded.
    pub fn remove(&self, pid: i32) {
        let _ = self
            .entries
            .write()
            .expect("task info table lock poisoned")
            .remove(&pid);
    }

    /// Inserts or overwrites the entry for `pid`.
    pub fn set(&self, pid: i32, info: TaskInfo) {
        let _ = self
            .entries
            .write()
            .expect("task info table lock poisoned")
            .insert(pid, info);
    }

    /// Number of tracked PIDs, mostly for diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("task info table lock poisoned").len()
    }

    /// Whether the table currently tracks no PIDs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let table = TaskInfoTable::new();
        let info = TaskInfo {
            vruntime: 42,
            ..Default::default()
        };
        table.set(7, info);
        assert_eq!(table.get(7), Some(info));
    }

    #[test]
    fn remove_drops_the_entry() {
        let table = TaskInfoTable::new();
        table.set(7, TaskInfo::default());
        table.remove(7);
        assert_eq!(table.get(7), None);
    }
}
