//! Tracks which CPUs priority tasks have run on recently, so non-priority
//! tasks can be steered away from them.

use std::collections::{HashSet, VecDeque};
use std::sync::RwLock;

/// Tracking window: entries older than this (relative to the timestamp
/// passed to [`PriorityCpuTracker::record`]) are pruned and ignored by
/// queries. One millisecond, matching the kernel side's own dispatch
/// granularity.
pub const TRACK_WINDOW_NS: u64 = 1_000_000;

/// Upper bound on retained entries, regardless of how recent they are, to
/// cap memory use under a burst of priority-task activity.
pub const MAX_TRACKED_ENTRIES: usize = 1000;

/// A single recorded use of a CPU by a priority task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    cpu: i32,
    timestamp_ns: u64,
    pid: i32,
}

/// Ring-bounded, time-windowed record of recent priority-task CPU usage.
#[derive(Debug, Default)]
pub struct PriorityCpuTracker {
    entries: RwLock<VecDeque<Entry>>,
}

impl PriorityCpuTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(MAX_TRACKED_ENTRIES)),
        }
    }

    /// Records that `pid` (a priority task) ran on `cpu` at `now_ns`, then
    /// prunes entries that have fallen out of [`TRACK_WINDOW_NS`] and
    /// truncates to [`MAX_TRACKED_ENTRIES`], keeping the most recent ones.
    pub fn record(&self, cpu: i32, pid: i32, now_ns: u64) {
        let mut entries = self.entries.write().expect("priority cpu tracker lock poisoned");
        entries.push_back(Entry {
            cpu,
            timestamp_ns: now_ns,
            pid,
        });

        let cutoff = now_ns.saturating_sub(TRACK_WINDOW_NS);
        while let Some(front) = entries.front() {
            if front.timestamp_ns < cutoff {
                let _ = entries.pop_front();
            } else {
                break;
            }
        }

        while entries.len() > MAX_TRACKED_ENTRIES {
            let _ = entries.pop_front();
        }
    }

    /// CPUs used by a priority task within the last [`TRACK_WINDOW_NS`] of
    /// `now_ns`.
    #[must_use]
    pub fn recent_priority_cpus(&self, now_ns: u64) -> HashSet<i32> {
        let cutoff = now_ns.saturating_sub(TRACK_WINDOW_NS);
        self.entries
            .read()
            .expect("priority cpu tracker lock poisoned")
            .iter()
            .filter(|e| e.timestamp_ns >= cutoff)
            .map(|e| e.cpu)
            .collect()
    }

    /// Whether `cpu` should be avoided for a non-priority task at `now_ns`.
    /// Priority tasks are never asked to avoid a CPU.
    #[must_use]
    pub fn should_avoid_cpu(&self, cpu: i32, is_priority_task: bool, now_ns: u64) -> bool {
        if is_priority_task {
            return false;
        }
        self.recent_priority_cpus(now_ns).contains(&cpu)
    }

    /// Returns the CPUs in `0..total_cpus` suitable for `pid`, steering a
    /// non-priority task away from recently-priority-used CPUs. Falls back
    /// to the full CPU range if avoidance would leave no CPU available, so
    /// a burst of priority activity never starves everything else.
    #[must_use]
    pub fn available_cpus_for_task(&self, is_priority_task: bool, total_cpus: i32, now_ns: u64) -> Vec<i32> {
        let avoided = self.recent_priority_cpus(now_ns);
        let candidates: Vec<i32> = (0..total_cpus)
            .filter(|cpu| is_priority_task || !avoided.contains(cpu))
            .collect();

        if candidates.is_empty() {
            (0..total_cpus).collect()
        } else {
            candidates
        }
    }

    /// Returns `(total tracked entries, entries within the current
    /// window)`, for diagnostics.
    #[must_use]
    pub fn stats(&self, now_ns: u64) -> (usize, usize) {
        let entries = self.entries.read().expect("priority cpu tracker lock poisoned");
        let cutoff = now_ns.saturating_sub(TRACK_WINDOW_NS);
        let recent = entries.iter().filter(|e| e.timestamp_ns >= cutoff).count();
        (entries.len(), recent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_entries_mark_their_cpu_as_recently_used() {
        let tracker = PriorityCpuTracker::new();
        tracker.record(3, 100, 1_000);
        assert!(tracker.recent_priority_cpus(1_500).contains(&3));
    }

    #[test]
    fn entries_outside_the_window_are_pruned_on_next_record() {
        let tracker = PriorityCpuTracker::new();
        tracker.record(3, 100, 0);
        tracker.record(4, 101, TRACK_WINDOW_NS * 10);
        assert!(!tracker.recent_priority_cpus(TRACK_WINDOW_NS * 10).contains(&3));
    }

    #[test]
    fn priority_tasks_never_avoid_a_cpu() {
        let tracker = PriorityCpuTracker::new();
        tracker.record(0, 1, 0);
        assert!(!tracker.should_avoid_cpu(0, true, 0));
        assert!(tracker.should_avoid_cpu(0, false, 0));
    }

    #[test]
    fn avoidance_falls_back_to_full_range_rather_than_starving() {
        let tracker = PriorityCpuTracker::new();
        tracker.record(0, 1, 0);
        tracker.record(1, 1, 0);
        let available = tracker.available_cpus_for_task(false, 2, 0);
        assert_eq!(available, vec![0, 1]);
    }

    #[test]
    fn entries_cap_at_max_tracked() {
        let tracker = PriorityCpuTracker::new();
        for i in 0..(MAX_TRACKED_ENTRIES + 50) {
            tracker.record(0, i as i32, i as u64);
        }
        let (total, _) = tracker.stats((MAX_TRACKED_ENTRIES + 50) as u64);
        assert!(total <= MAX_TRACKED_ENTRIES);
    }
}
