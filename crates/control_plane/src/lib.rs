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

//! HTTP/JSON client for the control plane: JWT authentication, scheduling
//! strategy fetches, metrics egress, and pod/PID lookups.

pub mod auth;
pub mod client;
mod error;

pub use auth::{AuthClient, AuthToken, Secret};
pub use client::{Client, PodPidEntry, PodProcess};
pub use error::Error;
