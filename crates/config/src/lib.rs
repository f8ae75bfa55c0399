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

//! YAML configuration for the scheduling agent: slice tuning, the
//! control-plane endpoint, and optional mTLS. A missing config file falls
//! back to [`Config::default`]; a present-but-malformed one is a hard
//! error.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

/// All the errors this crate can report.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that could not be read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file exists but is not valid YAML for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: String,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },
    /// The config parsed but failed validation.
    #[error("invalid config in {path}: {reason}")]
    Invalid {
        /// Path of the offending config file.
        path: String,
        /// Description of the validation failure.
        reason: String,
    },
}

/// Which virtual-time algorithm the dispatcher uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// The full vruntime + latency-boost + priority-override algorithm.
    #[default]
    Gthulhu,
    /// A plain FIFO-by-arrival fallback, useful for A/B comparisons.
    Simple,
}

fn default_slice_ns_default() -> u64 {
    5_000_000
}

fn default_slice_ns_min() -> u64 {
    500_000
}

/// Tuning for the virtual-time engine and dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SchedulerConfig {
    /// Default time slice, in nanoseconds, absent a strategy override.
    #[serde(default = "default_slice_ns_default")]
    #[validate(range(min = 1))]
    pub slice_ns_default: u64,
    /// Minimum time slice ever dispatched, in nanoseconds.
    #[serde(default = "default_slice_ns_min")]
    #[validate(range(min = 1))]
    pub slice_ns_min: u64,
    /// Which scheduling algorithm to run.
    #[serde(default)]
    pub mode: SchedulerMode,
    /// Forwarded to the kernel bridge: run fully in-kernel, bypassing
    /// user-space decisions.
    #[serde(default)]
    pub kernel_mode: bool,
    /// Forwarded to the kernel bridge: enable the kernel's max-time
    /// watchdog.
    #[serde(default)]
    pub max_time_watchdog: bool,
    /// Path to a prebuilt scheduler-class BPF object to load. When unset,
    /// the agent runs against an in-memory mock kernel bridge instead of a
    /// real kernel side, which is useful for development but dispatches
    /// nothing a real workload will ever see.
    #[serde(default)]
    pub bpf_object_path: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slice_ns_default: default_slice_ns_default(),
            slice_ns_min: default_slice_ns_min(),
            mode: SchedulerMode::default(),
            kernel_mode: false,
            max_time_watchdog: false,
            bpf_object_path: None,
        }
    }
}

/// Optional mutual-TLS material for the control-plane connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MtlsConfig {
    /// Whether mTLS is required for the control-plane connection.
    #[serde(default)]
    pub enable: bool,
    /// Path to the client certificate, PEM-encoded.
    #[serde(default)]
    pub cert_pem: Option<String>,
    /// Path to the client private key, PEM-encoded.
    #[serde(default)]
    pub key_pem: Option<String>,
    /// Path to the CA bundle used to validate the control plane's
    /// certificate.
    #[serde(default)]
    pub ca_pem: Option<String>,
}

fn default_api_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_api_interval_secs() -> u64 {
    5
}

/// Control-plane connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ApiConfig {
    /// Whether the strategy-refresh and metrics-egress workers run at all.
    #[serde(default)]
    pub enabled: bool,
    /// Base URL of the control plane.
    #[serde(default = "default_api_url")]
    pub url: String,
    /// How often strategies are refreshed and metrics are posted, in
    /// seconds.
    #[serde(default = "default_api_interval_secs")]
    #[validate(range(min = 1))]
    pub interval_secs: u64,
    /// Whether requests carry a bearer token obtained via the public-key
    /// auth flow.
    #[serde(default)]
    pub auth_enabled: bool,
    /// Path to the PEM-encoded public key used to authenticate.
    #[serde(default)]
    pub public_key_path: Option<String>,
    /// Optional mutual-TLS settings.
    #[serde(default)]
    pub mtls: MtlsConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_api_url(),
            interval_secs: default_api_interval_secs(),
            auth_enabled: false,
            public_key_path: None,
            mtls: MtlsConfig::default(),
        }
    }
}

/// Top-level configuration for the scheduling agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    /// Enables verbose kernel-bridge debug logging.
    #[serde(default)]
    pub debug: bool,
    /// Forwarded to the kernel bridge: process tasks before the full
    /// pipeline is warmed up.
    #[serde(default)]
    pub early_processing: bool,
    /// Forwarded to the kernel bridge: let the kernel's built-in idle
    /// selection logic run alongside ours.
    #[serde(default)]
    pub builtin_idle: bool,
    /// Virtual-time engine and dispatcher tuning.
    #[serde(default)]
    #[validate]
    pub scheduler: SchedulerConfig,
    /// Control-plane connection settings.
    #[serde(default)]
    #[validate]
    pub api: ApiConfig,
}

impl Config {
    /// Loads configuration from `path`. A missing file yields
    /// [`Config::default`]; a present file that fails to parse or fails
    /// validation is an error.
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;

        let config: Config = serde_yaml::from_str(&raw).map_err(|source| Error::Parse {
            path: path.display().to_string(),
            source,
        })?;

        config.validate().map_err(|source| Error::Invalid {
            path: path.display().to_string(),
            reason: source.to_string(),
        })?;

        if config.scheduler.slice_ns_min > config.scheduler.slice_ns_default {
            return Err(Error::Invalid {
                path: path.display().to_string(),
                reason: "scheduler.slice_ns_min must not exceed scheduler.slice_ns_default".to_string(),
            });
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/path/does-not-exist.yaml")).unwrap();
        assert_eq!(config.scheduler.slice_ns_default, 5_000_000);
        assert!(!config.api.enabled);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"scheduler: [this, is, not, a, map]").unwrap();
        assert!(matches!(Config::load(file.path()), Err(Error::Parse { .. })));
    }

    #[test]
    fn slice_min_above_default_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"scheduler:\n  slice_ns_default: 1000\n  slice_ns_min: 2000\n")
            .unwrap();
        assert!(matches!(Config::load(file.path()), Err(Error::Invalid { .. })));
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"api:\n  enabled: true\n  url: \"https://example.test\"\n")
            .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert!(config.api.enabled);
        assert_eq!(config.api.url, "https://example.test");
        assert_eq!(config.scheduler.slice_ns_default, 5_000_000);
    }
}
