//! speedprobe - Latency-based server selection and download speed testing
//!
//! Probes a set of candidate servers concurrently, picks the one with the
//! lowest latency, then streams a download from it while reporting live and
//! average throughput.
//!
//! # Library Usage
//!
//! ```ignore
//! use speedprobe::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::new(ClientConfig::default())?;
//!     let mut sink = tokio::io::sink();
//!     let report = client.run(&mut sink, None).await?;
//!
//!     println!("{}: {:.2} Mbps", report.server, report.transfer.avg_mbps);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`probe`] - Concurrent latency probing and server selection
//! - [`meter`] - Streaming download measurement
//! - [`client`] - Select-then-measure orchestration
//! - [`ping`] - Probe primitives (TCP connect, system ping)
//! - [`session`] - Transfer state and snapshots
//! - [`stats`] - Rate math and formatting

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod meter;
pub mod net;
pub mod output;
pub mod ping;
pub mod probe;
pub mod session;
pub mod stats;

pub use client::{CancelGuard, Client, ClientConfig, TestEvent, TestReport};
pub use endpoint::{Endpoint, EndpointTable};
pub use error::{ProbeFailure, TestError, TransferError};
pub use meter::{MeterConfig, TransferEvent, TransferMeter};
pub use probe::{ProbeResult, SelectionOutcome, probe_all, probe_one, select_best};
pub use session::{ProgressSnapshot, TransferResult, TransferState};
