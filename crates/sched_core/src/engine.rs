//! The scheduling engine abstraction: a capability set implemented by two
//! variants built on the same [`kernel_bridge::KernelBridge`] and
//! [`strategy::StrategyStore`] collaborators — update vruntime on enqueue,
//! choose a time slice on dispatch, and answer strategy-override queries.
//! `Gthulhu` is the vruntime-ordered engine; `Simple` is a flatter FIFO
//! alternative kept for A/B comparison against it.

use std::sync::atomic::{AtomicU64, Ordering};

use kernel_bridge::QueuedTask;
use strategy::StrategyStore;

use crate::task_info::{TaskInfo, TaskInfoTable};
use crate::vtime::{EnqueueOutcome, VTimeEngine};

/// Which engine variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Vruntime-ordered, latency-boosted scheduling.
    #[default]
    Gthulhu,
    /// Plain FIFO ordering, no vruntime accounting.
    Simple,
}

/// A FIFO engine: tasks are ordered strictly by enqueue sequence, with no
/// vruntime bookkeeping. Kept for A/B comparison against the vruntime
/// engine; still honors strategy overrides, since those are a property of
/// dispatch, not of an engine's ordering scheme.
#[derive(Debug, Default)]
pub struct FifoEngine {
    table: TaskInfoTable,
    seq: AtomicU64,
}

impl FifoEngine {
    /// Creates an empty FIFO engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self, task: &QueuedTask, now_ns: u64, strategy: &StrategyStore) -> EnqueueOutcome {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let info = TaskInfo {
            prev_exec_runtime: task.sum_exec_runtime,
            vruntime: seq,
            avg_nvcsw: 0,
            nvcsw: task.nvcsw,
            nvcsw_ts: now_ns,
        };
        self.table.set(task.pid, info);

        let (vtime, flags, is_priority) = strategy.apply_on_enqueue(task.pid, 0, seq, task.flags);
        EnqueueOutcome {
            info,
            deadline: seq,
            vtime,
            flags,
            is_priority,
        }
    }
}

/// Tagged union over the available scheduling engines, each implementing
/// the same three operations.
#[derive(Debug)]
pub enum Engine {
    /// Vruntime-ordered engine.
    Gthulhu(VTimeEngine),
    /// FIFO engine.
    Simple(FifoEngine),
}

impl Engine {
    /// Builds the engine selected by `mode`.
    #[must_use]
    pub fn new(mode: Mode, slice_ns_default: u64) -> Self {
        match mode {
            Mode::Gthulhu => Self::Gthulhu(VTimeEngine::new(slice_ns_default)),
            Mode::Simple => Self::Simple(FifoEngine::new()),
        }
    }

    /// Enqueues `task`, updating whichever bookkeeping the active variant
    /// keeps and resolving any strategy override for the eventual dispatch.
    pub fn enqueue(&self, task: &QueuedTask, now_ns: u64, strategy: &StrategyStore) -> EnqueueOutcome {
        match self {
            Self::Gthulhu(engine) => engine.enqueue(task, now_ns, strategy),
            Self::Simple(engine) => engine.enqueue(task, now_ns, strategy),
        }
    }

    /// Drops all bookkeeping for `pid`. Called once the kernel reports the
    /// task has exited.
    pub fn forget(&self, pid: i32) {
        match self {
            Self::Gthulhu(engine) => engine.forget(pid),
            Self::Simple(engine) => engine.table.remove(pid),
        }
    }

    /// Chooses the time slice for a task about to be dispatched.
    ///
    /// With a strategy execution-time override present, both variants cap
    /// it at 110% of the task's last observed run window
    /// (`stop_ts - start_ts`). Absent an override, `Gthulhu` shrinks the
    /// default slice proportionally to the number of tasks currently
    /// pending (`pending = nr_queued + nr_scheduled + 1`), while `Simple`
    /// always grants the configured default — the flatter behavior the
    /// FIFO variant exists to provide as a comparison point.
    #[must_use]
    pub fn time_slice(
        &self,
        task: &QueuedTask,
        pending: u64,
        strategy: &StrategyStore,
        slice_ns_default: u64,
        slice_ns_min: u64,
    ) -> u64 {
        let window = task.stop_ts.saturating_sub(task.start_ts).saturating_mul(11) / 10;
        if let Some(ov) = strategy.execution_time_ns(task.pid) {
            return ov.min(window);
        }
        match self {
            Self::Gthulhu(_) => (slice_ns_default / pending.max(1)).max(slice_ns_min),
            Self::Simple(_) => slice_ns_default.max(slice_ns_min),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(pid: i32) -> QueuedTask {
        QueuedTask {
            pid,
            cpu: 0,
            vtime: 0,
            sum_exec_runtime: 1_000_000,
            start_ts: 0,
            stop_ts: 2_000_000,
            weight: 100,
            nvcsw: 0,
            nr_cpus_allowed: 1,
            flags: 0,
        }
    }

    #[test]
    fn simple_engine_orders_strictly_by_enqueue_sequence() {
        let engine = Engine::new(Mode::Simple, 5_000_000);
        let strategy = StrategyStore::new();
        let first = engine.enqueue(&task(1), 0, &strategy);
        let second = engine.enqueue(&task(2), 0, &strategy);
        assert!(second.deadline > first.deadline);
    }

    #[test]
    fn simple_engine_time_slice_ignores_pending_count() {
        let engine = Engine::new(Mode::Simple, 5_000_000);
        let strategy = StrategyStore::new();
        let busy = engine.time_slice(&task(1), 50, &strategy, 5_000_000, 500_000);
        let idle = engine.time_slice(&task(1), 1, &strategy, 5_000_000, 500_000);
        assert_eq!(busy, idle);
    }

    #[test]
    fn gthulhu_engine_time_slice_shrinks_with_pending_count() {
        let engine = Engine::new(Mode::Gthulhu, 5_000_000);
        let strategy = StrategyStore::new();
        let busy = engine.time_slice(&task(1), 50, &strategy, 5_000_000, 500_000);
        let idle = engine.time_slice(&task(1), 1, &strategy, 5_000_000, 500_000);
        assert!(busy < idle);
    }

    #[test]
    fn execution_time_override_caps_at_the_run_window() {
        let engine = Engine::new(Mode::Gthulhu, 5_000_000);
        let strategy = StrategyStore::new();
        strategy.replace_all(vec![strategy::Strategy {
            pid: 1,
            priority: false,
            execution_time_ns: 10_000_000,
        }]);
        // window = (2_000_000 - 0) * 11 / 10 = 2_200_000, below the override.
        let slice = engine.time_slice(&task(1), 1, &strategy, 5_000_000, 500_000);
        assert_eq!(slice, 2_200_000);
    }
}
