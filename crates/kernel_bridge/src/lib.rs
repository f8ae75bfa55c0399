#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Typed access to the kernel-side scheduler class: a pair of ring buffers
//! (queued tasks in, dispatch decisions out) plus a BSS counters block,
//! abstracted behind a trait so the dispatch loop can run against a mock in
//! tests.

pub mod bpf;
pub mod mock;
pub mod time;

use thiserror::Error;

/// A task the kernel has enqueued and is waiting to be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedTask {
    /// Process id of the waiting task. -1 is the kernel's "no task ready"
    /// sentinel and never appears in a record returned from [`KernelBridge::dequeue`].
    pub pid: i32,
    /// CPU the task last ran on, or -1 if unknown.
    pub cpu: i32,
    /// The task's current virtual time, as last recorded by the kernel
    /// side.
    pub vtime: u64,
    /// Cumulative on-cpu runtime for the task, in nanoseconds, as of
    /// enqueue.
    pub sum_exec_runtime: u64,
    /// Start of the task's last run window, in nanoseconds.
    pub start_ts: u64,
    /// End of the task's last run window, in nanoseconds.
    pub stop_ts: u64,
    /// Scheduling weight (nice-derived); zero is invalid and is clamped to
    /// 1 by the virtual-time engine.
    pub weight: u64,
    /// Cumulative count of voluntary context switches for the task, as
    /// tracked by the kernel side.
    pub nvcsw: u64,
    /// Number of CPUs this task is allowed to run on. A value of 1 means
    /// the task is pinned and CPU selection can skip the kernel helper.
    pub nr_cpus_allowed: u32,
    /// Enqueue flags reported by the kernel (e.g. wakeup vs. requeue).
    pub flags: u64,
}

/// Flag set on a [`QueuedTask`] when it was enqueued due to a wakeup rather
/// than a requeue or a new fork.
pub const SCX_ENQ_WAKEUP: u64 = 1;

/// Flag multiplexed onto the queued-tasks ring buffer to mark a record as a
/// task-exit notification rather than a runnable enqueue. `pid` identifies
/// the task that exited; every other field is meaningless. Kept on the
/// single queued-tasks channel rather than a third ring buffer, matching
/// the two-ring-buffer wire contract.
pub const SCX_TASK_EXITED: u64 = 1 << 1;

/// Flag requesting that the kernel preempt the current task on the target
/// CPU in favor of the dispatched one.
pub const SCX_ENQ_PREEMPT: u64 = 1 << 32;

/// One-shot cache/NUMA topology snapshot, indexed by CPU number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuTopology {
    /// `llc_id[cpu]` is the last-level-cache domain `cpu` belongs to.
    pub llc_id: Vec<i32>,
    /// `numa_id[cpu]` is the NUMA node `cpu` belongs to.
    pub numa_id: Vec<i32>,
}

impl CpuTopology {
    /// Builds a trivial topology with every CPU in `0..nr_cpus` in its own
    /// single LLC/NUMA domain. Used when no finer-grained topology is
    /// available, which still gives `select_cpu` a consistent domain to
    /// reason about.
    #[must_use]
    pub fn flat(nr_cpus: usize) -> Self {
        Self {
            llc_id: vec![0; nr_cpus],
            numa_id: vec![0; nr_cpus],
        }
    }
}

/// A scheduling decision handed back to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchedTask {
    /// Process id being dispatched.
    pub pid: i32,
    /// Target CPU, or -1 to let the kernel pick one.
    pub cpu: i32,
    /// Virtual time assigned to the task for this dispatch.
    pub vtime: u64,
    /// Time slice granted, in nanoseconds.
    pub slice_ns: u64,
    /// Dispatch flags (e.g. [`SCX_ENQ_PREEMPT`]) forwarded to the kernel.
    pub flags: u64,
}

/// Snapshot of the kernel-maintained BSS counters, mirrored verbatim onto
/// the wire when reported to the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BssSnapshot {
    /// Monotonic timestamp of the last user-space scheduling run.
    pub usersched_last_run_at: u64,
    /// Number of tasks currently queued.
    pub nr_queued: u64,
    /// Number of tasks currently scheduled (dispatched, not yet run).
    pub nr_scheduled: u64,
    /// Number of tasks currently running.
    pub nr_running: u64,
    /// Number of online CPUs known to the kernel side.
    pub nr_online_cpus: u64,
    /// Count of dispatches decided in user space.
    pub nr_user_dispatches: u64,
    /// Count of dispatches decided by the kernel's fallback path.
    pub nr_kernel_dispatches: u64,
    /// Count of dispatches cancelled before being consumed.
    pub nr_cancel_dispatches: u64,
    /// Count of dispatches bounced back to user space.
    pub nr_bounce_dispatches: u64,
    /// Count of dispatches that failed outright.
    pub nr_failed_dispatches: u64,
    /// Count of times the scheduler was judged congested.
    pub nr_sched_congested: u64,
}

/// All the errors this crate can report.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A transient failure talking to the kernel side; the caller should
    /// log and keep running.
    #[error("transient kernel bridge error on {operation}: {reason}")]
    Transient {
        /// The operation that failed (`dequeue`, `dispatch`, `notify_complete`, ...).
        operation: &'static str,
        /// Human-readable cause.
        reason: String,
    },
    /// A fatal failure; the kernel side is gone or has rejected the
    /// connection and the process must exit.
    #[error("fatal kernel bridge error: {reason} (exit_code={exit_code})")]
    Fatal {
        /// Human-readable cause, typically the kernel's own exit message.
        reason: String,
        /// Exit code reported by the kernel side, if any.
        exit_code: i32,
    },
}

/// Abstraction over the kernel-side ring buffers and BSS block.
///
/// A real implementation talks to a loaded scheduler class program (backed
/// by a ring-buffer map for each direction); [`mock::MockKernelBridge`]
/// provides a deterministic in-memory stand-in for tests.
pub trait KernelBridge {
    /// Pops the next queued task, if any are waiting. Returns `Ok(None)`
    /// when the queue is empty, which is not an error.
    fn dequeue(&mut self) -> Result<Option<QueuedTask>, Error>;

    /// Hands a scheduling decision back to the kernel.
    fn dispatch(&mut self, task: DispatchedTask) -> Result<(), Error>;

    /// Notifies the kernel that the current dispatch cycle completed,
    /// reporting `pending_count` (tasks still held in the user-space ready
    /// pool) so the kernel side can use it for backpressure and watchdogs.
    fn notify_complete(&mut self, pending_count: u64) -> Result<(), Error>;

    /// Reads the current BSS counters.
    fn read_bss(&self) -> Result<BssSnapshot, Error>;

    /// Blocks the calling thread until a new task is queued or `timeout`
    /// elapses, whichever comes first. Returns `true` if a task is likely
    /// waiting.
    fn block_until_ready(&mut self, timeout: std::time::Duration) -> bool;

    /// Returns the kernel's exit message if the scheduler class program has
    /// unloaded or exited, `None` while still attached.
    fn exit_info(&self) -> Option<String>;

    /// Number of tasks currently queued in the kernel, used for slice
    /// sizing.
    fn nr_queued(&self) -> u64;

    /// Number of tasks currently dispatched but not yet run, used for slice
    /// sizing.
    fn nr_scheduled(&self) -> u64;

    /// Asks the kernel's builtin idle-selection helper for a target CPU for
    /// `task`. On error, the caller should log and fall back to `task.cpu`.
    fn select_cpu(&mut self, task: &QueuedTask) -> Result<i32, Error>;

    /// One-shot initialization mapping CPUs to LLC/NUMA domains, used for
    /// cache-aware hints in [`KernelBridge::select_cpu`]. Idempotent.
    fn init_cache_domains(&mut self) -> Result<(), Error>;

    /// The topology computed by the last [`KernelBridge::init_cache_domains`]
    /// call, or an empty topology if that has not run yet.
    fn topology(&self) -> &CpuTopology;

    /// Pops the next pending task-exit notification, if any. `Ok(None)`
    /// means no task has exited since the last call.
    fn try_dequeue_exit(&mut self) -> Result<Option<i32>, Error>;
}

impl KernelBridge for Box<dyn KernelBridge> {
    fn dequeue(&mut self) -> Result<Option<QueuedTask>, Error> {
        (**self).dequeue()
    }

    fn dispatch(&mut self, task: DispatchedTask) -> Result<(), Error> {
        (**self).dispatch(task)
    }

    fn notify_complete(&mut self, pending_count: u64) -> Result<(), Error> {
        (**self).notify_complete(pending_count)
    }

    fn read_bss(&self) -> Result<BssSnapshot, Error> {
        (**self).read_bss()
    }

    fn block_until_ready(&mut self, timeout: std::time::Duration) -> bool {
        (**self).block_until_ready(timeout)
    }

    fn exit_info(&self) -> Option<String> {
        (**self).exit_info()
    }

    fn nr_queued(&self) -> u64 {
        (**self).nr_queued()
    }

    fn nr_scheduled(&self) -> u64 {
        (**self).nr_scheduled()
    }

    fn select_cpu(&mut self, task: &QueuedTask) -> Result<i32, Error> {
        (**self).select_cpu(task)
    }

    fn init_cache_domains(&mut self) -> Result<(), Error> {
        (**self).init_cache_domains()
    }

    fn topology(&self) -> &CpuTopology {
        (**self).topology()
    }

    fn try_dequeue_exit(&mut self) -> Result<Option<i32>, Error> {
        (**self).try_dequeue_exit()
    }
}
