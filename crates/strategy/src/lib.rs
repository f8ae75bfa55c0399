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

//! Externally supplied per-PID scheduling overrides, and the recent
//! priority-CPU tracker used to keep non-priority tasks off CPUs a
//! priority task just used.

pub mod priority_cpu_tracker;
pub mod store;

pub use priority_cpu_tracker::PriorityCpuTracker;
pub use store::StrategyStore;

use serde::{Deserialize, Serialize};

/// Flag requesting the kernel preempt the current task on the target CPU.
pub const SCX_ENQ_PREEMPT: u64 = 1 << 32;

/// A per-PID scheduling override fetched from the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    /// Process id this strategy applies to.
    pub pid: i32,
    /// When true, the task is pinned to the global minimum vruntime and
    /// dispatched with the kernel preempt flag set.
    #[serde(default)]
    pub priority: bool,
    /// Custom time slice for this task, in nanoseconds. Zero means "use
    /// the scheduler default".
    #[serde(default, rename = "execution_time")]
    pub execution_time_ns: u64,
}
