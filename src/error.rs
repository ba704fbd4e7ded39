//! Error taxonomy
//!
//! Probe failures are values carried inside [`ProbeResult`](crate::probe::ProbeResult);
//! transfer and run failures are returned to the caller.

use std::time::Duration;

use thiserror::Error;

/// Why a candidate endpoint could not be built
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("URL '{0}' has no host")]
    MissingHost(String),

    #[error("unsupported scheme '{scheme}' in '{url}' (expected http or https)")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("duplicate endpoint name '{0}'")]
    DuplicateName(String),
}

/// Why a single latency probe produced no measurement
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("ping command failed: {0}")]
    Command(String),

    #[error("probe cancelled")]
    Cancelled,
}

/// Terminal failure of a transfer session
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("server returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("download stream interrupted after {received} bytes: {reason}")]
    Stream { received: u64, reason: String },

    #[error("writing to sink failed after {received} bytes: {source}")]
    Sink {
        received: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("transfer cancelled after {received} bytes")]
    Cancelled { received: u64 },

    #[error("transfer session already finished")]
    AlreadyFinished,
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled { .. })
    }
}

/// Terminal failure of a full select-then-measure run
#[derive(Error, Debug)]
pub enum TestError {
    #[error("no reachable endpoint among {candidates} candidate(s)")]
    NoReachableEndpoint { candidates: usize },

    #[error("unknown server '{0}'")]
    UnknownServer(String),

    #[error("test cancelled")]
    Cancelled,

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl TestError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            TestError::Cancelled => true,
            TestError::Transfer(e) => e.is_cancelled(),
            _ => false,
        }
    }
}
