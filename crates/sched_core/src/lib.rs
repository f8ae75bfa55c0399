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

//! The scheduling core: virtual-time bookkeeping, the ready pool, and the
//! dispatcher loop that ties them to a [`kernel_bridge::KernelBridge`] and a
//! [`strategy::StrategyStore`].

pub mod dispatcher;
pub mod engine;
pub mod pool;
pub mod task_info;
pub mod vtime;

pub use dispatcher::{Dispatcher, DispatcherState};
pub use engine::{Engine, Mode};
pub use pool::{PoolEntry, PoolFull, ReadyPool};
pub use task_info::{TaskInfo, TaskInfoTable};
pub use vtime::{EnqueueOutcome, VTimeEngine};
