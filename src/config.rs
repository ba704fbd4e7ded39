//! Configuration file support
//!
//! Loads configuration from ~/.config/speedprobe/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::endpoint::{EndpointEntry, EndpointTable};
use crate::error::EndpointError;
use crate::ping::ProbeMethod;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub probe: ProbeDefaults,

    #[serde(default)]
    pub transfer: TransferDefaults,

    /// Log file path (e.g., "~/.config/speedprobe/speedprobe.log")
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,

    /// Replaces the built-in server table when non-empty
    #[serde(default)]
    pub endpoints: Vec<EndpointEntry>,
}

/// Default settings for latency probing
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProbeDefaults {
    /// Per-probe timeout in milliseconds
    pub timeout_ms: Option<u64>,

    /// Probe primitive (tcp, system)
    pub method: Option<ProbeMethod>,

    /// Address family preference (ipv4, ipv6, dual)
    pub address_family: Option<String>,
}

/// Default settings for the download
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransferDefaults {
    /// Nominal payload size (e.g., "100M", "1G", or bytes)
    pub expected_size: Option<String>,

    /// Minimum gap between progress updates in milliseconds; 0 for every chunk
    pub progress_interval_ms: Option<u64>,

    /// Fail the download after this many seconds without data
    pub stall_timeout_secs: Option<u64>,

    /// Optional cap on the whole download in seconds; unset means no cap
    pub request_timeout_secs: Option<u64>,

    /// Keep the downloaded file instead of deleting it
    pub keep_file: Option<bool>,

    /// Directory for the downloaded file (defaults to the temp dir)
    pub output_dir: Option<String>,
}

impl Config {
    /// Load configuration from the default path.
    /// Returns default config if file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("speedprobe")
            .join("config.toml")
    }

    /// The candidate table: the configured one, or the built-in default
    pub fn endpoint_table(&self) -> Result<EndpointTable, EndpointError> {
        if self.endpoints.is_empty() {
            Ok(EndpointTable::builtin())
        } else {
            EndpointTable::from_entries(&self.endpoints)
        }
    }

    pub fn probe_timeout(&self) -> Option<Duration> {
        self.probe.timeout_ms.map(Duration::from_millis)
    }

    pub fn progress_interval(&self) -> Option<Duration> {
        self.transfer.progress_interval_ms.map(Duration::from_millis)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.transfer.stall_timeout_secs.map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.transfer.request_timeout_secs.map(Duration::from_secs)
    }
}
