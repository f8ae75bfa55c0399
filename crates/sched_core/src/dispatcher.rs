//! The dispatcher loop: drains the kernel's queue into the ready pool,
//! drains exit notifications, picks the next task by deadline, sizes its
//! time slice and target CPU, and hands a dispatch decision back to the
//! kernel.

use std::sync::Arc;
use std::time::Duration;

use kernel_bridge::time::now_ns;
use kernel_bridge::{DispatchedTask, KernelBridge};
use strategy::{PriorityCpuTracker, StrategyStore};
use thiserror::Error;

use crate::engine::{Engine, Mode};
use crate::pool::{PoolEntry, PoolFull, ReadyPool};

/// How long [`KernelBridge::block_until_ready`] is allowed to block when the
/// ready pool is empty and nothing is waiting in the kernel's queue.
const IDLE_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Lifecycle of the dispatcher, surfaced to the process supervisor so it
/// can decide when shutdown is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Constructed but not yet attached to the kernel side.
    Init,
    /// Attached and ready to run the dispatch loop.
    Attached,
    /// Actively dispatching.
    Running,
    /// A shutdown has been requested; finishing in-flight work before
    /// exiting.
    Draining,
    /// Fully stopped.
    Exited,
}

/// What a single dispatcher iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A task was dispatched.
    Dispatched(DispatchedTask),
    /// The ready pool was empty and nothing new arrived before the idle
    /// poll timeout elapsed.
    Idle,
}

/// All the errors the dispatcher can report.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A kernel-bridge error that should be logged and does not stop the
    /// loop.
    #[error(transparent)]
    Transient(#[from] kernel_bridge::Error),
    /// The ready pool rejected an insertion because it is full; the task
    /// stays queued in the kernel and is retried next iteration.
    #[error(transparent)]
    PoolFull(#[from] PoolFull),
}

/// Configuration the dispatcher needs beyond the kernel bridge itself.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Time slice granted absent a strategy override, in nanoseconds.
    pub slice_ns_default: u64,
    /// Floor applied to every dispatched time slice, in nanoseconds.
    pub slice_ns_min: u64,
    /// Number of CPUs the priority-CPU tracker reasons about.
    pub total_cpus: i32,
}

/// Ties the kernel bridge, the scheduling engine, the ready pool, and the
/// strategy collaborators into the per-iteration dispatch algorithm.
pub struct Dispatcher<B: KernelBridge> {
    bridge: B,
    engine: Engine,
    pool: ReadyPool,
    strategy: Arc<StrategyStore>,
    priority_cpu_tracker: Arc<PriorityCpuTracker>,
    config: DispatcherConfig,
    state: DispatcherState,
}

impl<B: KernelBridge> Dispatcher<B> {
    /// Creates a dispatcher in [`DispatcherState::Init`], running `mode`'s
    /// engine.
    pub fn new(
        bridge: B,
        mode: Mode,
        slice_ns_default: u64,
        strategy: Arc<StrategyStore>,
        priority_cpu_tracker: Arc<PriorityCpuTracker>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            bridge,
            engine: Engine::new(mode, slice_ns_default),
            pool: ReadyPool::new(),
            strategy,
            priority_cpu_tracker,
            config,
            state: DispatcherState::Init,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DispatcherState {
        self.state
    }

    /// Marks the dispatcher attached, allowed to run. Also performs the
    /// kernel bridge's one-shot cache/NUMA topology initialization.
    pub fn mark_attached(&mut self) {
        if let Err(err) = self.bridge.init_cache_domains() {
            tracing::warn!(error = %err, "failed to initialize cache domains, CPU selection will use a flat topology");
        }
        self.state = DispatcherState::Attached;
    }

    /// Requests a graceful stop; the current iteration finishes normally
    /// and subsequent calls to [`Dispatcher::run_once`] transition straight
    /// to [`DispatcherState::Exited`] without touching the kernel bridge.
    pub fn begin_drain(&mut self) {
        if self.state == DispatcherState::Running || self.state == DispatcherState::Attached {
            self.state = DispatcherState::Draining;
        }
    }

    /// Read-only access to the scheduling engine, e.g. for metrics egress.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Reads the kernel bridge's current BSS counters, for metrics egress.
    pub fn read_bss(&self) -> Result<kernel_bridge::BssSnapshot, kernel_bridge::Error> {
        self.bridge.read_bss()
    }

    #[cfg(test)]
    fn bridge_mut_for_test(&mut self) -> &mut B {
        &mut self.bridge
    }

    /// Runs one iteration of the dispatch algorithm.
    ///
    /// Drains task-exit notifications, drains newly queued tasks into the
    /// ready pool, pops the task with the smallest deadline, sizes its
    /// slice and CPU, and dispatches it. Returns [`DispatchOutcome::Idle`]
    /// if there was nothing to do.
    pub fn run_once(&mut self) -> Result<DispatchOutcome, Error> {
        if self.state == DispatcherState::Draining {
            self.state = DispatcherState::Exited;
            return Ok(DispatchOutcome::Idle);
        }
        self.state = DispatcherState::Running;

        self.drain_exits()?;
        self.drain_into_pool()?;

        let Some(entry) = self.pool.pop() else {
            let _ = self.bridge.block_until_ready(IDLE_POLL_TIMEOUT);
            return Ok(DispatchOutcome::Idle);
        };

        let pid = entry.task.pid;
        let now = now_ns();
        let pending = self.bridge.nr_queued() + self.bridge.nr_scheduled() + 1;
        let slice_ns = self
            .engine
            .time_slice(&entry.task, pending, &self.strategy, self.config.slice_ns_default, self.config.slice_ns_min);

        let cpu = if entry.task.nr_cpus_allowed == 1 {
            entry.task.cpu
        } else {
            match self.bridge.select_cpu(&entry.task) {
                Ok(cpu) => cpu,
                Err(err) => {
                    tracing::warn!(pid, error = %err, "select_cpu failed, falling back to the task's last CPU");
                    entry.task.cpu
                }
            }
        };
        let cpu = if self.priority_cpu_tracker.should_avoid_cpu(cpu, entry.is_priority, now) {
            let candidates = self
                .priority_cpu_tracker
                .available_cpus_for_task(false, self.config.total_cpus, now);
            *candidates.first().unwrap_or(&cpu)
        } else {
            cpu
        };

        if entry.is_priority {
            self.priority_cpu_tracker.record(cpu, pid, now);
        }

        let dispatched = DispatchedTask {
            pid,
            cpu,
            vtime: entry.vtime,
            slice_ns,
            flags: entry.flags,
        };

        self.bridge.dispatch(dispatched)?;
        self.bridge.notify_complete(self.pool.len() as u64)?;

        Ok(DispatchOutcome::Dispatched(dispatched))
    }

    /// Drains pending task-exit notifications, dropping bookkeeping for
    /// each exited PID. Folded into the dispatcher's own thread rather than
    /// a separate worker because the kernel bridge cannot cross threads.
    fn drain_exits(&mut self) -> Result<(), Error> {
        while let Some(pid) = self.bridge.try_dequeue_exit()? {
            self.engine.forget(pid);
        }
        Ok(())
    }

    fn drain_into_pool(&mut self) -> Result<(), Error> {
        while let Some(task) = self.bridge.dequeue()? {
            if task.pid == -1 {
                break;
            }
            let now = now_ns();
            let outcome = self.engine.enqueue(&task, now, &self.strategy);
            match self.pool.insert(PoolEntry {
                task,
                deadline: outcome.deadline,
                timestamp: now,
                vtime: outcome.vtime,
                flags: outcome.flags,
                is_priority: outcome.is_priority,
            }) {
                Ok(()) => {}
                Err(PoolFull) => {
                    tracing::warn!(pid = task.pid, "ready pool full, dropping drain for this iteration");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_bridge::mock::MockKernelBridge;
    use kernel_bridge::{QueuedTask, SCX_ENQ_PREEMPT};

    fn queued(pid: i32) -> QueuedTask {
        QueuedTask {
            pid,
            cpu: 0,
            vtime: 0,
            sum_exec_runtime: 1_000_000,
            start_ts: 0,
            stop_ts: 1_000_000,
            weight: 100,
            nvcsw: 0,
            nr_cpus_allowed: 1,
            flags: 0,
        }
    }

    fn new_dispatcher(bridge: MockKernelBridge) -> Dispatcher<MockKernelBridge> {
        Dispatcher::new(
            bridge,
            Mode::Gthulhu,
            5_000_000,
            Arc::new(StrategyStore::new()),
            Arc::new(PriorityCpuTracker::new()),
            DispatcherConfig {
                slice_ns_default: 5_000_000,
                slice_ns_min: 500_000,
                total_cpus: 4,
            },
        )
    }

    #[test]
    fn idle_when_nothing_is_queued() {
        let mut dispatcher = new_dispatcher(MockKernelBridge::new());
        dispatcher.mark_attached();
        assert_eq!(dispatcher.run_once().unwrap(), DispatchOutcome::Idle);
    }

    #[test]
    fn dispatches_a_single_queued_task() {
        let mut bridge = MockKernelBridge::new();
        bridge.enqueue(queued(42));
        let mut dispatcher = new_dispatcher(bridge);
        dispatcher.mark_attached();

        match dispatcher.run_once().unwrap() {
            DispatchOutcome::Dispatched(task) => assert_eq!(task.pid, 42),
            DispatchOutcome::Idle => panic!("expected a dispatch"),
        }
    }

    #[test]
    fn priority_strategy_pins_vtime_to_min_vruntime_and_sets_preempt() {
        let mut bridge = MockKernelBridge::new();
        bridge.enqueue(queued(7));
        let strategy = Arc::new(StrategyStore::new());
        strategy.replace_all(vec![strategy::Strategy {
            pid: 7,
            priority: true,
            execution_time_ns: 0,
        }]);

        let mut dispatcher = Dispatcher::new(
            bridge,
            Mode::Gthulhu,
            5_000_000,
            strategy,
            Arc::new(PriorityCpuTracker::new()),
            DispatcherConfig {
                slice_ns_default: 5_000_000,
                slice_ns_min: 500_000,
                total_cpus: 4,
            },
        );
        dispatcher.mark_attached();

        match dispatcher.run_once().unwrap() {
            DispatchOutcome::Dispatched(task) => {
                assert_eq!(task.vtime, 0);
                assert_ne!(task.flags & SCX_ENQ_PREEMPT, 0);
            }
            DispatchOutcome::Idle => panic!("expected a dispatch"),
        }
    }

    #[test]
    fn fatal_kernel_error_propagates() {
        let mut bridge = MockKernelBridge::new();
        bridge.simulate_exit("unloaded");
        let mut dispatcher = new_dispatcher(bridge);
        dispatcher.mark_attached();
        assert!(dispatcher.run_once().is_err());
    }

    #[test]
    fn drain_begins_to_exit_on_next_iteration() {
        let mut dispatcher = new_dispatcher(MockKernelBridge::new());
        dispatcher.mark_attached();
        dispatcher.begin_drain();
        assert_eq!(dispatcher.run_once().unwrap(), DispatchOutcome::Idle);
        assert_eq!(dispatcher.state(), DispatcherState::Exited);
    }

    #[test]
    fn exit_notifications_drain_task_info_bookkeeping() {
        let mut bridge = MockKernelBridge::new();
        bridge.enqueue(queued(99));
        let mut dispatcher = new_dispatcher(bridge);
        dispatcher.mark_attached();
        let _ = dispatcher.run_once().unwrap();

        let has_info = |d: &Dispatcher<MockKernelBridge>| match d.engine() {
            Engine::Gthulhu(engine) => engine.table().get(99).is_some(),
            Engine::Simple(_) => false,
        };
        assert!(has_info(&dispatcher));

        dispatcher.bridge_mut_for_test().simulate_task_exit(99);
        let _ = dispatcher.run_once().unwrap();
        assert!(!has_info(&dispatcher));
    }
}
