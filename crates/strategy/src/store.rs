//! A snapshot-swapped map of scheduling overrides, refreshed wholesale from
//! the control plane on a timer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::{Strategy, SCX_ENQ_PREEMPT};

/// Holds the current PID -> [`Strategy`] mapping. Readers (the dispatcher,
/// the priority-CPU tracker) see a consistent snapshot even while a refresh
/// is in flight, because updates replace the whole map rather than mutating
/// it in place.
#[derive(Debug, Default)]
pub struct StrategyStore {
    snapshot: RwLock<Arc<HashMap<i32, Strategy>>>,
}

impl StrategyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Replaces the whole map with `strategies`, keyed by their `pid`.
    /// Matches the control plane's "full refresh" contract: a refresh
    /// response is a complete list, not a diff.
    pub fn replace_all(&self, strategies: Vec<Strategy>) {
        let map: HashMap<i32, Strategy> = strategies.into_iter().map(|s| (s.pid, s)).collect();
        let count = map.len();
        *self.snapshot.write().expect("strategy store lock poisoned") = Arc::new(map);
        tracing::debug!(strategy_count = count, "replaced strategy snapshot");
    }

    /// Returns the strategy for `pid`, if the control plane has supplied
    /// one.
    #[must_use]
    pub fn get(&self, pid: i32) -> Option<Strategy> {
        self.snapshot
            .read()
            .expect("strategy store lock poisoned")
            .get(&pid)
            .copied()
    }

    /// Whether `pid` is currently marked as a priority task.
    #[must_use]
    pub fn is_priority(&self, pid: i32) -> bool {
        self.get(pid).is_some_and(|s| s.priority)
    }

    /// Custom execution time for `pid`, if one was set and is non-zero.
    #[must_use]
    pub fn execution_time_ns(&self, pid: i32) -> Option<u64> {
        self.get(pid).filter(|s| s.execution_time_ns > 0).map(|s| s.execution_time_ns)
    }

    /// Applies any priority override for `pid` to the vtime/flags an engine
    /// is about to hand off for ready-pool dispatch. A priority task is
    /// pinned to `min_vruntime` and gains the kernel preempt flag; anything
    /// else passes `vtime`/`flags` through unchanged. Returns
    /// `(vtime, flags, is_priority)`.
    #[must_use]
    pub fn apply_on_enqueue(&self, pid: i32, min_vruntime: u64, vtime: u64, flags: u64) -> (u64, u64, bool) {
        if self.is_priority(pid) {
            (min_vruntime, flags | SCX_ENQ_PREEMPT, true)
        } else {
            (vtime, flags, false)
        }
    }

    /// Number of PIDs currently carrying an override.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.read().expect("strategy store lock poisoned").len()
    }

    /// Whether the store currently holds no overrides.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_all_makes_overrides_visible() {
        let store = StrategyStore::new();
        store.replace_all(vec![Strategy {
            pid: 42,
            priority: true,
            execution_time_ns: 2_000_000,
        }]);

        assert!(store.is_priority(42));
        assert_eq!(store.execution_time_ns(42), Some(2_000_000));
        assert!(!store.is_priority(7));
    }

    #[test]
    fn a_later_refresh_fully_replaces_the_earlier_one() {
        let store = StrategyStore::new();
        store.replace_all(vec![Strategy {
            pid: 1,
            priority: true,
            execution_time_ns: 0,
        }]);
        store.replace_all(vec![Strategy {
            pid: 2,
            priority: true,
            execution_time_ns: 0,
        }]);

        assert!(!store.is_priority(1));
        assert!(store.is_priority(2));
    }

    #[test]
    fn apply_on_enqueue_pins_priority_tasks_to_the_floor() {
        let store = StrategyStore::new();
        store.replace_all(vec![Strategy {
            pid: 7,
            priority: true,
            execution_time_ns: 0,
        }]);

        let (vtime, flags, is_priority) = store.apply_on_enqueue(7, 1_000, 9_999, 0);
        assert_eq!(vtime, 1_000);
        assert_ne!(flags & SCX_ENQ_PREEMPT, 0);
        assert!(is_priority);

        let (vtime, flags, is_priority) = store.apply_on_enqueue(8, 1_000, 9_999, 0);
        assert_eq!(vtime, 9_999);
        assert_eq!(flags & SCX_ENQ_PREEMPT, 0);
        assert!(!is_priority);
    }

    #[test]
    fn zero_execution_time_means_no_override() {
        let store = StrategyStore::new();
        store.replace_all(vec![Strategy {
            pid: 1,
            priority: false,
            execution_time_ns: 0,
        }]);
        assert_eq!(store.execution_time_ns(1), None);
    }
}
