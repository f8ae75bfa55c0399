//! A deterministic, in-memory [`KernelBridge`] used by dispatcher tests and
//! by the property tests that exercise the virtual-time engine end to end.

use std::collections::VecDeque;
use std::time::Duration;

use crate::{BssSnapshot, CpuTopology, DispatchedTask, Error, KernelBridge, QueuedTask};

/// An in-memory kernel bridge backed by plain `VecDeque`s.
#[derive(Debug, Default)]
pub struct MockKernelBridge {
    incoming: VecDeque<QueuedTask>,
    exited: VecDeque<i32>,
    dispatched: Vec<DispatchedTask>,
    bss: BssSnapshot,
    exit_info: Option<String>,
    topology: CpuTopology,
}

impl MockKernelBridge {
    /// Creates an empty mock bridge.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a task as if the kernel had just enqueued it.
    pub fn enqueue(&mut self, task: QueuedTask) {
        self.incoming.push_back(task);
        self.bss.nr_queued += 1;
    }

    /// Simulates the kernel reporting that `pid` has exited.
    pub fn simulate_task_exit(&mut self, pid: i32) {
        self.exited.push_back(pid);
    }

    /// Returns every task dispatched so far, in order.
    #[must_use]
    pub fn dispatched(&self) -> &[DispatchedTask] {
        &self.dispatched
    }

    /// Simulates the kernel side unloading with the given message.
    pub fn simulate_exit(&mut self, reason: impl Into<String>) {
        self.exit_info = Some(reason.into());
    }
}

impl KernelBridge for MockKernelBridge {
    fn dequeue(&mut self) -> Result<Option<QueuedTask>, Error> {
        if let Some(reason) = &self.exit_info {
            return Err(Error::Fatal {
                reason: reason.clone(),
                exit_code: 1,
            });
        }
        let task = self.incoming.pop_front();
        if task.is_some() {
            self.bss.nr_queued = self.bss.nr_queued.saturating_sub(1);
        }
        Ok(task)
    }

    fn dispatch(&mut self, task: DispatchedTask) -> Result<(), Error> {
        self.dispatched.push(task);
        self.bss.nr_user_dispatches += 1;
        self.bss.nr_scheduled += 1;
        Ok(())
    }

    fn notify_complete(&mut self, _pending_count: u64) -> Result<(), Error> {
        Ok(())
    }

    fn read_bss(&self) -> Result<BssSnapshot, Error> {
        Ok(self.bss)
    }

    fn block_until_ready(&mut self, _timeout: Duration) -> bool {
        !self.incoming.is_empty()
    }

    fn exit_info(&self) -> Option<String> {
        self.exit_info.clone()
    }

    fn nr_queued(&self) -> u64 {
        self.bss.nr_queued
    }

    fn nr_scheduled(&self) -> u64 {
        self.bss.nr_scheduled
    }

    fn select_cpu(&mut self, task: &QueuedTask) -> Result<i32, Error> {
        Ok(if task.cpu >= 0 { task.cpu } else { 0 })
    }

    fn init_cache_domains(&mut self) -> Result<(), Error> {
        if self.topology.llc_id.is_empty() {
            self.topology = CpuTopology::flat(self.bss.nr_online_cpus.max(1) as usize);
        }
        Ok(())
    }

    fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    fn try_dequeue_exit(&mut self) -> Result<Option<i32>, Error> {
        Ok(self.exited.pop_front())
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
            sum_exec_runtime: 0,
            start_ts: 0,
            stop_ts: 0,
            weight: 100,
            nvcsw: 0,
            nr_cpus_allowed: 1,
            flags: 0,
        }
    }

    #[test]
    fn dequeue_returns_tasks_in_fifo_order() {
        let mut bridge = MockKernelBridge::new();
        bridge.enqueue(task(1));
        bridge.enqueue(task(2));

        assert_eq!(bridge.dequeue().unwrap().unwrap().pid, 1);
        assert_eq!(bridge.dequeue().unwrap().unwrap().pid, 2);
        assert!(bridge.dequeue().unwrap().is_none());
    }

    #[test]
    fn exit_info_makes_dequeue_fatal() {
        let mut bridge = MockKernelBridge::new();
        bridge.simulate_exit("scheduler class unloaded");
        match bridge.dequeue() {
            Err(Error::Fatal { reason, .. }) => assert_eq!(reason, "scheduler class unloaded"),
            other => panic!("expected a fatal error, got {other:?}"),
        }
    }

    #[test]
    fn simulated_task_exits_are_drained_fifo() {
        let mut bridge = MockKernelBridge::new();
        bridge.simulate_task_exit(7);
        bridge.simulate_task_exit(8);
        assert_eq!(bridge.try_dequeue_exit().unwrap(), Some(7));
        assert_eq!(bridge.try_dequeue_exit().unwrap(), Some(8));
        assert_eq!(bridge.try_dequeue_exit().unwrap(), None);
    }

    #[test]
    fn init_cache_domains_is_idempotent() {
        let mut bridge = MockKernelBridge::new();
        bridge.init_cache_domains().unwrap();
        let first = bridge.topology().clone();
        bridge.init_cache_domains().unwrap();
        assert_eq!(&first, bridge.topology());
    }
}
