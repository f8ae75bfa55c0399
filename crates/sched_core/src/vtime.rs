//! The virtual-time engine: turns a freshly dequeued [`QueuedTask`] into a
//! vruntime-ordered deadline, boosting tasks with a high voluntary
//! context-switch rate so interactive work is scheduled ahead of batch
//! work.

use std::sync::atomic::{AtomicU64, Ordering};

use kernel_bridge::time::{calc_avg, saturating_sub};
use kernel_bridge::{QueuedTask, SCX_ENQ_WAKEUP};
use strategy::StrategyStore;

use crate::task_info::{TaskInfo, TaskInfoTable};

/// Ceiling on the latency-derived weight boost, matching the ceiling placed
/// on the smoothed voluntary-context-switch rate.
pub const MAX_LATENCY_WEIGHT: u64 = 1000;

/// One second in nanoseconds; the window over which the voluntary
/// context-switch rate is resampled.
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// The outcome of enqueueing a task: its updated bookkeeping, the deadline
/// to use for ready-pool ordering, and the vtime/flags to eventually hand
/// back to the kernel on dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// The task's updated [`TaskInfo`], already persisted to the table.
    pub info: TaskInfo,
    /// Deadline used to order this task in the ready pool. Always derived
    /// from the engine's own vruntime bookkeeping, never from a strategy
    /// override — the override only affects what is eventually dispatched.
    pub deadline: u64,
    /// Virtual time to report to the kernel at dispatch time, possibly
    /// pinned to the scheduler-wide floor by a priority strategy.
    pub vtime: u64,
    /// Dispatch flags to report to the kernel, possibly carrying the
    /// preempt bit set by a priority strategy.
    pub flags: u64,
    /// Whether a priority strategy applied to this task.
    pub is_priority: bool,
}

/// Holds the task-info table and the scheduler-wide minimum vruntime
/// watermark. Only the dispatcher thread calls [`VTimeEngine::enqueue`], so
/// `min_vruntime` is a plain atomic rather than a lock.
#[derive(Debug, Default)]
pub struct VTimeEngine {
    table: TaskInfoTable,
    min_vruntime: AtomicU64,
    slice_ns_default: AtomicU64,
}

impl VTimeEngine {
    /// Creates an engine with the given default time slice, in nanoseconds.
    #[must_use]
    pub fn new(slice_ns_default: u64) -> Self {
        Self {
            table: TaskInfoTable::new(),
            min_vruntime: AtomicU64::new(0),
            slice_ns_default: AtomicU64::new(slice_ns_default),
        }
    }

    /// Updates the default time slice used for newly tracked tasks and for
    /// the per-enqueue slice cap. Called when the control plane or the
    /// config file changes the scheduler's slice settings at runtime.
    pub fn set_slice_ns_default(&self, slice_ns_default: u64) {
        self.slice_ns_default.store(slice_ns_default, Ordering::Relaxed);
    }

    /// Current scheduler-wide minimum vruntime.
    #[must_use]
    pub fn min_vruntime(&self) -> u64 {
        self.min_vruntime.load(Ordering::Relaxed)
    }

    /// Read-only access to the task-info table, e.g. for diagnostics.
    #[must_use]
    pub fn table(&self) -> &TaskInfoTable {
        &self.table
    }

    /// Drops all bookkeeping for `pid`. Called once the kernel reports the
    /// task has exited.
    pub fn forget(&self, pid: i32) {
        self.table.remove(pid);
    }

    /// Enqueues `task`, updating its [`TaskInfo`], computing the deadline to
    /// use for ready-pool ordering, and applying any priority strategy
    /// override to the vtime/flags that will eventually be dispatched.
    ///
    /// `now_ns` must be a monotonically non-decreasing timestamp from the
    /// same clock as previous calls.
    pub fn enqueue(&self, task: &QueuedTask, now_ns: u64, strategy: &StrategyStore) -> EnqueueOutcome {
        // A weight of zero would divide by zero below; the kernel should
        // never report one, but a misbehaving task is clamped rather than
        // allowed to poison the vruntime scale.
        let weight = task.weight.max(1);
        let slice_ns_default = self.slice_ns_default.load(Ordering::Relaxed);

        let mut info = self.table.get(task.pid).unwrap_or(TaskInfo {
            prev_exec_runtime: task.sum_exec_runtime,
            vruntime: self.min_vruntime(),
            avg_nvcsw: 0,
            nvcsw: task.nvcsw,
            nvcsw_ts: now_ns,
        });

        let delta_t = saturating_sub(now_ns, info.nvcsw_ts);
        if delta_t >= NSEC_PER_SEC {
            let delta_nvcsw = saturating_sub(task.nvcsw, info.nvcsw);
            let sampled_rate = (delta_nvcsw.saturating_mul(NSEC_PER_SEC) / delta_t.max(1)).min(MAX_LATENCY_WEIGHT);
            info.nvcsw = task.nvcsw;
            info.nvcsw_ts = now_ns;
            info.avg_nvcsw = calc_avg(info.avg_nvcsw, sampled_rate);
        }

        // Used slice since the last enqueue, capped at the default slice.
        let slice = saturating_sub(task.sum_exec_runtime, info.prev_exec_runtime).min(slice_ns_default);
        info.prev_exec_runtime = task.sum_exec_runtime;

        // Latency-sensitive tasks (frequent voluntary switches, or woken
        // rather than requeued) are allowed to carry more unused vruntime
        // budget before being re-aligned to the global minimum.
        let base_weight = info.avg_nvcsw.min(MAX_LATENCY_WEIGHT);
        let weight_multiplier = if task.flags & SCX_ENQ_WAKEUP != 0 { 2 } else { 1 };
        let latency_weight = base_weight.saturating_mul(weight_multiplier) + 1;

        let min_vruntime_limit = saturating_sub(
            self.min_vruntime(),
            slice_ns_default.saturating_mul(latency_weight),
        );
        if info.vruntime < min_vruntime_limit {
            info.vruntime = min_vruntime_limit;
        }

        let vslice = slice.saturating_mul(100) / weight;
        info.vruntime = info.vruntime.saturating_add(vslice);
        let _ = self
            .min_vruntime
            .fetch_add(vslice, Ordering::Relaxed);

        self.table.set(task.pid, info);

        let deadline = info.vruntime.saturating_add(task.sum_exec_runtime.min(slice_ns_default.saturating_mul(100)));
        let (vtime, flags, is_priority) = strategy.apply_on_enqueue(task.pid, self.min_vruntime(), info.vruntime, task.flags);

        EnqueueOutcome {
            info,
            deadline,
            vtime,
            flags,
            is_priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(pid: i32, sum_exec_runtime: u64, weight: u64, flags: u64, nvcsw: u64) -> QueuedTask {
        QueuedTask {
            pid,
            cpu: -1,
            vtime: 0,
            sum_exec_runtime,
            start_ts: 0,
            stop_ts: 0,
            weight,
            nvcsw,
            nr_cpus_allowed: 1,
            flags,
        }
    }

    #[test]
    fn first_enqueue_starts_at_min_vruntime() {
        let engine = VTimeEngine::new(5_000_000);
        let strategy = StrategyStore::new();
        let outcome = engine.enqueue(&task(1, 0, 100, 0, 0), 0, &strategy);
        assert!(outcome.deadline >= engine.min_vruntime().saturating_sub(5_000_000));
    }

    #[test]
    fn zero_weight_is_clamped_instead_of_panicking() {
        let engine = VTimeEngine::new(5_000_000);
        let strategy = StrategyStore::new();
        let outcome = engine.enqueue(&task(1, 1_000_000, 0, 0, 0), 0, &strategy);
        // A weight of 1 is used in place of 0, so vslice is finite, not NaN/inf.
        assert!(outcome.deadline < u64::MAX);
    }

    #[test]
    fn higher_weight_accrues_less_vruntime_for_the_same_runtime() {
        let engine_low_weight = VTimeEngine::new(5_000_000);
        let engine_high_weight = VTimeEngine::new(5_000_000);
        let strategy = StrategyStore::new();

        let low = engine_low_weight.enqueue(&task(1, 1_000_000, 100, 0, 0), 0, &strategy);
        let high = engine_high_weight.enqueue(&task(1, 1_000_000, 400, 0, 0), 0, &strategy);

        assert!(high.deadline < low.deadline);
    }

    #[test]
    fn repeated_enqueues_track_runtime_deltas_not_totals() {
        let engine = VTimeEngine::new(5_000_000);
        let strategy = StrategyStore::new();
        let first = engine.enqueue(&task(1, 1_000_000, 100, 0, 0), 0, &strategy);
        let second = engine.enqueue(&task(1, 2_000_000, 100, 0, 0), 1, &strategy);
        assert!(second.deadline > first.deadline);
    }

    #[test]
    fn pid_has_no_special_cased_shortcut() {
        // Regression guard: no PID (including ones used as debug aids in
        // upstream forks) gets a zero deadline purely from its PID value.
        let engine = VTimeEngine::new(5_000_000);
        let strategy = StrategyStore::new();
        let outcome = engine.enqueue(&task(168_420, 1_000_000, 100, 0, 0), 0, &strategy);
        assert_ne!(outcome.deadline, 0);
    }

    #[test]
    fn deadline_ignores_strategy_override_but_dispatch_fields_reflect_it() {
        let engine = VTimeEngine::new(5_000_000);
        let strategy = StrategyStore::new();
        strategy.replace_all(vec![strategy::Strategy {
            pid: 9,
            priority: true,
            execution_time_ns: 0,
        }]);

        let unprivileged = engine.enqueue(&task(1, 1_000_000, 100, 0, 0), 0, &strategy);
        let privileged = engine.enqueue(&task(9, 1_000_000, 100, 0, 0), 0, &strategy);

        // The deadline formula is strategy-independent: it only depends on
        // the engine's own vruntime/runtime bookkeeping.
        assert_eq!(privileged.deadline, privileged.info.vruntime.saturating_add(1_000_000.min(500_000_000)));
        assert!(privileged.is_priority);
        assert!(!unprivileged.is_priority);
        assert_eq!(privileged.vtime, engine.min_vruntime());
        assert_ne!(privileged.flags & strategy::SCX_ENQ_PREEMPT, 0);
    }
}
