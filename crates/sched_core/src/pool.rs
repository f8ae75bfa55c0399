//! The ready pool: a bounded, deadline-ordered buffer of tasks waiting to
//! be dispatched.

use kernel_bridge::QueuedTask;

/// Maximum number of tasks the ready pool holds at once. One slot is kept
/// free so head/tail never collide, matching the kernel-side ring buffer's
/// own sizing.
pub const POOL_CAPACITY: usize = 4096;

/// A task waiting in the ready pool, ordered by `(deadline, timestamp,
/// pid)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolEntry {
    /// The underlying queued task as reported by the kernel.
    pub task: QueuedTask,
    /// Virtual-time deadline computed by the virtual-time engine at
    /// enqueue; primary sort key.
    pub deadline: u64,
    /// Enqueue timestamp; tie-breaks entries with an equal deadline.
    pub timestamp: u64,
    /// Virtual time to report to the kernel at dispatch, already resolved
    /// against any strategy override at enqueue time.
    pub vtime: u64,
    /// Dispatch flags to report to the kernel, already resolved against any
    /// strategy override at enqueue time.
    pub flags: u64,
    /// Whether a priority strategy applied to this task at enqueue time.
    pub is_priority: bool,
}

impl PoolEntry {
    fn less_than(&self, other: &Self) -> bool {
        if self.deadline != other.deadline {
            return self.deadline < other.deadline;
        }
        if self.timestamp != other.timestamp {
            return self.timestamp < other.timestamp;
        }
        self.task.pid < other.task.pid
    }
}

/// Error returned when the pool cannot accept another entry.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("ready pool is full (capacity {POOL_CAPACITY})")]
pub struct PoolFull;

/// A bounded ring buffer holding [`PoolEntry`] values in ascending deadline
/// order. Insertion is O(n) in the worst case (shifting entries to keep the
/// buffer sorted), which is acceptable given the pool rarely approaches
/// [`POOL_CAPACITY`] in steady state.
#[derive(Debug)]
pub struct ReadyPool {
    entries: Vec<Option<PoolEntry>>,
    head: usize,
    tail: usize,
    count: usize,
}

impl Default for ReadyPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyPool {
    /// Creates an empty pool with [`POOL_CAPACITY`] slots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: vec![None; POOL_CAPACITY],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    /// Number of tasks currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the pool currently holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Inserts `entry` keeping the buffer sorted by `(deadline, timestamp,
    /// pid)`. Fails with [`PoolFull`] once [`POOL_CAPACITY`] - 1 entries are
    /// held, leaving one free slot as a sentinel (mirroring the kernel-side
    /// ring buffer's own head/tail convention).
    pub fn insert(&mut self, entry: PoolEntry) -> Result<(), PoolFull> {
        if self.count >= POOL_CAPACITY - 1 {
            return Err(PoolFull);
        }

        let mut insert_idx = self.tail;
        for i in 0..self.count {
            let idx = (self.head + i) % POOL_CAPACITY;
            let existing = self.entries[idx].expect("slot within [head, tail) must be occupied");
            if entry.less_than(&existing) {
                insert_idx = idx;
                break;
            }
        }

        let mut cur = self.tail;
        while cur != insert_idx {
            let prev = (cur + POOL_CAPACITY - 1) % POOL_CAPACITY;
            self.entries[cur] = self.entries[prev];
            cur = prev;
        }
        self.entries[insert_idx] = Some(entry);
        self.tail = (self.tail + 1) % POOL_CAPACITY;
        self.count += 1;
        Ok(())
    }

    /// Pops the entry with the smallest deadline, if any.
    pub fn pop(&mut self) -> Option<PoolEntry> {
        if self.head == self.tail && self.count == 0 {
            return None;
        }
        let entry = self.entries[self.head].take();
        self.head = (self.head + 1) % POOL_CAPACITY;
        self.count -= 1;
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: i32, deadline: u64, timestamp: u64) -> PoolEntry {
        PoolEntry {
            task: QueuedTask {
                pid,
                cpu: -1,
                vtime: 0,
                sum_exec_runtime: 0,
                start_ts: 0,
                stop_ts: 0,
                weight: 100,
                nvcsw: 0,
                nr_cpus_allowed: 1,
                flags: 0,
            },
            deadline,
            timestamp,
            vtime: deadline,
            flags: 0,
            is_priority: false,
        }
    }

    #[test]
    fn pops_in_deadline_order_regardless_of_insertion_order() {
        let mut pool = ReadyPool::new();
        pool.insert(entry(3, 300, 0)).unwrap();
        pool.insert(entry(1, 100, 0)).unwrap();
        pool.insert(entry(2, 200, 0)).unwrap();

        assert_eq!(pool.pop().unwrap().task.pid, 1);
        assert_eq!(pool.pop().unwrap().task.pid, 2);
        assert_eq!(pool.pop().unwrap().task.pid, 3);
        assert!(pool.pop().is_none());
    }

    #[test]
    fn ties_break_on_timestamp_then_pid() {
        let mut pool = ReadyPool::new();
        pool.insert(entry(9, 100, 5)).unwrap();
        pool.insert(entry(2, 100, 1)).unwrap();
        pool.insert(entry(5, 100, 1)).unwrap();

        assert_eq!(pool.pop().unwrap().task.pid, 2);
        assert_eq!(pool.pop().unwrap().task.pid, 5);
        assert_eq!(pool.pop().unwrap().task.pid, 9);
    }

    #[test]
    fn rejects_insertion_once_full() {
        let mut pool = ReadyPool::new();
        for i in 0..(POOL_CAPACITY - 1) {
            pool.insert(entry(i as i32, i as u64, 0)).unwrap();
        }
        assert_eq!(pool.insert(entry(99_999, 99_999, 0)), Err(PoolFull));
    }
}
