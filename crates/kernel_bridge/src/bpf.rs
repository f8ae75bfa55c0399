//! A [`KernelBridge`] backed by a loaded scheduler-class BPF object: one
//! ring buffer carrying queued tasks out of the kernel, one carrying
//! dispatch decisions back in, and a BSS map holding the counters block.
//!
//! Building and loading the BPF object itself (the kernel-side scheduler
//! class) is not this crate's job; callers hand in an already-opened and
//! attached [`libbpf_rs::Object`] produced by whatever loader the
//! deployment uses.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use libbpf_rs::{MapCore, Object, RingBuffer, RingBufferBuilder};
use plain::Plain;

use crate::{BssSnapshot, CpuTopology, DispatchedTask, Error, KernelBridge, QueuedTask, SCX_TASK_EXITED};

/// Name of the ring-buffer map carrying tasks the kernel wants scheduled.
pub const QUEUED_TASKS_MAP: &str = "queued_tasks";
/// Name of the ring-buffer map carrying dispatch decisions into the kernel.
pub const DISPATCHED_TASKS_MAP: &str = "dispatched_tasks";
/// Name of the BSS map holding the counters block.
pub const BSS_MAP: &str = "bss";

/// On-the-wire layout of a queued task as written by the kernel side into
/// [`QUEUED_TASKS_MAP`]. Records with `flags & SCX_TASK_EXITED` set carry a
/// task-exit notification instead of an enqueue; every field but `pid` is
/// meaningless in that case.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawQueuedTask {
    pid: i32,
    cpu: i32,
    vtime: u64,
    sum_exec_runtime: u64,
    start_ts: u64,
    stop_ts: u64,
    weight: u64,
    nvcsw: u64,
    nr_cpus_allowed: u32,
    flags: u64,
}

unsafe impl plain::Plain for RawQueuedTask {}

/// On-the-wire layout of a dispatch decision written into
/// [`DISPATCHED_TASKS_MAP`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawDispatchedTask {
    pid: i32,
    cpu: i32,
    vtime: u64,
    slice_ns: u64,
    flags: u64,
}

unsafe impl plain::Plain for RawDispatchedTask {}

/// On-the-wire layout of the BSS counters block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawBss {
    usersched_last_run_at: u64,
    nr_queued: u64,
    nr_scheduled: u64,
    nr_running: u64,
    nr_online_cpus: u64,
    nr_user_dispatches: u64,
    nr_kernel_dispatches: u64,
    nr_cancel_dispatches: u64,
    nr_bounce_dispatches: u64,
    nr_failed_dispatches: u64,
    nr_sched_congested: u64,
}

unsafe impl plain::Plain for RawBss {}

impl From<RawQueuedTask> for QueuedTask {
    fn from(raw: RawQueuedTask) -> Self {
        Self {
            pid: raw.pid,
            cpu: raw.cpu,
            vtime: raw.vtime,
            sum_exec_runtime: raw.sum_exec_runtime,
            start_ts: raw.start_ts,
            stop_ts: raw.stop_ts,
            weight: raw.weight,
            nvcsw: raw.nvcsw,
            nr_cpus_allowed: raw.nr_cpus_allowed,
            flags: raw.flags,
        }
    }
}

impl From<RawBss> for BssSnapshot {
    fn from(raw: RawBss) -> Self {
        Self {
            usersched_last_run_at: raw.usersched_last_run_at,
            nr_queued: raw.nr_queued,
            nr_scheduled: raw.nr_scheduled,
            nr_running: raw.nr_running,
            nr_online_cpus: raw.nr_online_cpus,
            nr_user_dispatches: raw.nr_user_dispatches,
            nr_kernel_dispatches: raw.nr_kernel_dispatches,
            nr_cancel_dispatches: raw.nr_cancel_dispatches,
            nr_bounce_dispatches: raw.nr_bounce_dispatches,
            nr_failed_dispatches: raw.nr_failed_dispatches,
            nr_sched_congested: raw.nr_sched_congested,
        }
    }
}

/// A [`KernelBridge`] backed by a loaded and attached BPF object.
pub struct BpfKernelBridge {
    object: Object,
    incoming: Rc<RefCell<VecDeque<QueuedTask>>>,
    exited: Rc<RefCell<VecDeque<i32>>>,
    ring_buffer: RingBuffer<'static>,
    exit_info: Option<String>,
    topology: CpuTopology,
}

impl BpfKernelBridge {
    /// Opens, loads, and attaches the scheduler-class object at `path`,
    /// then wraps it. Attachment (making the scheduler class active for
    /// the whole system) happens as a side effect of loading a `SEC("struct_ops")`
    /// program; there is no separate attach step to call here.
    pub fn load(path: &std::path::Path) -> Result<Self, Error> {
        let object = libbpf_rs::ObjectBuilder::default()
            .open_file(path)
            .map_err(|source| Error::Fatal {
                reason: format!("failed to open {}: {source}", path.display()),
                exit_code: 1,
            })?
            .load()
            .map_err(|source| Error::Fatal {
                reason: format!("failed to load {}: {source}", path.display()),
                exit_code: 1,
            })?;
        Self::new(object)
    }

    /// Wraps an already-loaded-and-attached BPF object, wiring up the
    /// queued-tasks ring buffer consumer. Records carrying
    /// [`SCX_TASK_EXITED`] are routed to the exit queue instead of the
    /// ordinary incoming queue.
    pub fn new(object: Object) -> Result<Self, Error> {
        let incoming = Rc::new(RefCell::new(VecDeque::new()));
        let exited = Rc::new(RefCell::new(VecDeque::new()));
        let incoming_for_cb = Rc::clone(&incoming);
        let exited_for_cb = Rc::clone(&exited);

        let map = object
            .maps()
            .find(|m| m.name().to_string_lossy() == QUEUED_TASKS_MAP)
            .ok_or_else(|| Error::Fatal {
                reason: format!("BPF object has no map named {QUEUED_TASKS_MAP}"),
                exit_code: 1,
            })?;

        let mut builder = RingBufferBuilder::new();
        builder
            .add(&map, move |data: &[u8]| {
                let mut raw = RawQueuedTask::default();
                if plain::copy_from_bytes(&mut raw, data).is_ok() {
                    if raw.flags & SCX_TASK_EXITED != 0 {
                        exited_for_cb.borrow_mut().push_back(raw.pid);
                    } else {
                        incoming_for_cb.borrow_mut().push_back(raw.into());
                    }
                }
                0
            })
            .map_err(|source| Error::Fatal {
                reason: format!("failed to attach ring buffer callback: {source}"),
                exit_code: 1,
            })?;

        let ring_buffer = builder.build().map_err(|source| Error::Fatal {
            reason: format!("failed to build ring buffer: {source}"),
            exit_code: 1,
        })?;

        tracing::info!("attached to queued-tasks ring buffer, kernel bridge ready");

        Ok(Self {
            object,
            incoming,
            exited,
            ring_buffer,
            exit_info: None,
            topology: CpuTopology::default(),
        })
    }

    fn bss_bytes(&self) -> Result<RawBss, Error> {
        let map = self
            .object
            .maps()
            .find(|m| m.name().to_string_lossy() == BSS_MAP)
            .ok_or_else(|| Error::Transient {
                operation: "read_bss",
                reason: format!("no map named {BSS_MAP}"),
            })?;

        let mut raw = RawBss::default();
        if let Some(bytes) = map
            .lookup(&[0; 4], libbpf_rs::MapFlags::ANY)
            .map_err(|source| Error::Transient {
                operation: "read_bss",
                reason: source.to_string(),
            })?
        {
            let _ = plain::copy_from_bytes(&mut raw, &bytes);
        }
        Ok(raw)
    }
}

impl KernelBridge for BpfKernelBridge {
    fn dequeue(&mut self) -> Result<Option<QueuedTask>, Error> {
        if let Some(reason) = &self.exit_info {
            return Err(Error::Fatal {
                reason: reason.clone(),
                exit_code: 1,
            });
        }

        if self.incoming.borrow().is_empty() {
            let _ = self.ring_buffer.poll(Duration::from_millis(0));
        }
        Ok(self.incoming.borrow_mut().pop_front())
    }

    fn dispatch(&mut self, task: DispatchedTask) -> Result<(), Error> {
        let map = self
            .object
            .maps()
            .find(|m| m.name().to_string_lossy() == DISPATCHED_TASKS_MAP)
            .ok_or_else(|| Error::Transient {
                operation: "dispatch",
                reason: format!("no map named {DISPATCHED_TASKS_MAP}"),
            })?;

        let raw = RawDispatchedTask {
            pid: task.pid,
            cpu: task.cpu,
            vtime: task.vtime,
            slice_ns: task.slice_ns,
            flags: task.flags,
        };
        map.update(&[0; 4], raw.as_bytes(), libbpf_rs::MapFlags::ANY).map_err(|source| Error::Transient {
            operation: "dispatch",
            reason: source.to_string(),
        })
    }

    fn notify_complete(&mut self, _pending_count: u64) -> Result<(), Error> {
        let _ = self.ring_buffer.poll(Duration::from_millis(0));
        Ok(())
    }

    fn read_bss(&self) -> Result<BssSnapshot, Error> {
        self.bss_bytes().map(Into::into)
    }

    fn block_until_ready(&mut self, timeout: Duration) -> bool {
        self.ring_buffer.poll(timeout).is_ok() && !self.incoming.borrow().is_empty()
    }

    fn exit_info(&self) -> Option<String> {
        self.exit_info.clone()
    }

    fn nr_queued(&self) -> u64 {
        self.bss_bytes().map(|raw| raw.nr_queued).unwrap_or(0)
    }

    fn nr_scheduled(&self) -> u64 {
        self.bss_bytes().map(|raw| raw.nr_scheduled).unwrap_or(0)
    }

    /// The real scheduler class exposes CPU selection as a kfunc callable
    /// only from BPF context (`scx_bpf_select_cpu_dfl`), not through safe
    /// `libbpf-rs` map/prog accessors. Until this crate grows a syscall
    /// path into that kfunc, this falls back to the task's last CPU, which
    /// keeps sticky affinity without claiming real idle-CPU awareness.
    fn select_cpu(&mut self, task: &QueuedTask) -> Result<i32, Error> {
        Ok(if task.cpu >= 0 { task.cpu } else { 0 })
    }

    fn init_cache_domains(&mut self) -> Result<(), Error> {
        let nr_cpus = self.bss_bytes().map(|raw| raw.nr_online_cpus).unwrap_or(1).max(1) as usize;
        self.topology = CpuTopology::flat(nr_cpus);
        Ok(())
    }

    fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    fn try_dequeue_exit(&mut self) -> Result<Option<i32>, Error> {
        if self.exited.borrow().is_empty() {
            let _ = self.ring_buffer.poll(Duration::from_millis(0));
        }
        Ok(self.exited.borrow_mut().pop_front())
    }
}
