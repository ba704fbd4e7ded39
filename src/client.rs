//! Client mode implementation
//!
//! Picks a server by latency, then measures a download from it.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endpoint::{DEFAULT_EXPECTED_SIZE, Endpoint, EndpointTable};
use crate::error::{TestError, TransferError};
use crate::meter::{MeterConfig, TransferEvent, TransferMeter, cancelled};
use crate::net::AddressFamily;
use crate::ping::{PingerKind, ProbeMethod};
use crate::probe::{ProbeResult, ProbeSummary, Prober, SelectionOutcome, select_best};
use crate::session::TransferResult;

/// Capacity of the internal transfer event channel
const TRANSFER_EVENT_BUFFER: usize = 64;

#[derive(Clone)]
pub struct ClientConfig {
    /// Candidate servers, in tie-break order
    pub endpoints: EndpointTable,
    /// Skip selection and use this named server
    pub server: Option<String>,
    /// Skip selection and download from this URL
    pub url: Option<String>,
    /// Nominal payload size in bytes
    pub expected_bytes: u64,
    pub probe_method: ProbeMethod,
    /// Per-probe timeout; `None` uses the prober default
    pub probe_timeout: Option<Duration>,
    /// Address family preference for TCP probes
    pub address_family: AddressFamily,
    pub meter: MeterConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointTable::builtin(),
            server: None,
            url: None,
            expected_bytes: DEFAULT_EXPECTED_SIZE,
            probe_method: ProbeMethod::default(),
            probe_timeout: None,
            address_family: AddressFamily::default(),
            meter: MeterConfig::default(),
        }
    }
}

/// Progress of a full test, as seen by an observer
#[derive(Debug, Clone)]
pub enum TestEvent {
    /// Every candidate has been probed
    ProbesFinished(Vec<ProbeSummary>),
    /// The server the transfer will use
    Selected { server: String, url: String },
    /// Ping time of the selected server, `None` if the probe failed
    Latency(Option<u64>),
    Transfer(TransferEvent),
}

/// The server chosen for a test and how it was chosen
#[derive(Debug, Clone)]
pub struct Selection {
    pub endpoint: Endpoint,
    /// Per-candidate latencies; empty when the server was named
    pub probes: Vec<ProbeSummary>,
}

/// Outcome of one select-then-measure run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub server: String,
    pub url: String,
    pub latency_ms: Option<u64>,
    /// Empty when the server was chosen explicitly
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub probes: Vec<ProbeSummary>,
    pub transfer: TransferResult,
}

pub struct Client {
    config: ClientConfig,
    prober: Prober<PingerKind>,
    meter: TransferMeter,
    /// Signals the running test to stop
    cancel_tx: Arc<Mutex<Option<watch::Sender<bool>>>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, TestError> {
        let prober = Prober::new(PingerKind::new(config.probe_method, config.address_family))
            .with_timeout(config.probe_timeout);
        let meter = TransferMeter::new(config.meter.clone())?;

        Ok(Self {
            config,
            prober,
            meter,
            cancel_tx: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Probe every candidate and return the results in table order
    pub async fn survey(&self) -> Vec<ProbeResult> {
        self.prober.survey(&self.config.endpoints, None).await
    }

    /// Run the full test: choose a server, ping it, then download into `sink`.
    pub async fn run<W>(
        &self,
        sink: &mut W,
        progress_tx: Option<mpsc::Sender<TestEvent>>,
    ) -> Result<TestReport, TestError>
    where
        W: AsyncWrite + Unpin,
    {
        let (cancel_rx, owner) = self.arm();
        let result = match self.choose(progress_tx.as_ref(), cancel_rx.clone()).await {
            Ok(selection) => {
                self.measure_selected(selection, sink, progress_tx, cancel_rx)
                    .await
            }
            Err(e) => Err(e),
        };
        self.disarm(owner);
        result
    }

    /// Choose the server to test against.
    ///
    /// An explicit URL or server name wins; otherwise every candidate is
    /// probed and the lowest latency is selected.
    pub async fn select(
        &self,
        progress_tx: Option<&mpsc::Sender<TestEvent>>,
    ) -> Result<Selection, TestError> {
        let (cancel_rx, owner) = self.arm();
        let result = self.choose(progress_tx, cancel_rx).await;
        self.disarm(owner);
        result
    }

    /// Ping the selected server, then download from it into `sink`
    pub async fn measure<W>(
        &self,
        selection: Selection,
        sink: &mut W,
        progress_tx: Option<mpsc::Sender<TestEvent>>,
    ) -> Result<TestReport, TestError>
    where
        W: AsyncWrite + Unpin,
    {
        let (cancel_rx, owner) = self.arm();
        let result = self
            .measure_selected(selection, sink, progress_tx, cancel_rx)
            .await;
        self.disarm(owner);
        result
    }

    /// Keep the cancel signal armed until the guard drops.
    ///
    /// Lets a caller that runs [`select`](Self::select) and
    /// [`measure`](Self::measure) separately cancel between the two.
    pub fn hold(&self) -> CancelGuard<'_> {
        let (rx, owner) = self.arm();
        CancelGuard {
            client: self,
            owner,
            _rx: rx,
        }
    }

    /// Subscribe to the running test's cancel signal, starting one if needed.
    /// The flag is true when this call owns the signal.
    fn arm(&self) -> (watch::Receiver<bool>, bool) {
        let mut slot = self.cancel_tx.lock();
        if let Some(tx) = slot.as_ref() {
            return (tx.subscribe(), false);
        }
        let (tx, rx) = watch::channel(false);
        *slot = Some(tx);
        (rx, true)
    }

    fn disarm(&self, owner: bool) {
        if owner {
            *self.cancel_tx.lock() = None;
        }
    }

    async fn choose(
        &self,
        progress_tx: Option<&mpsc::Sender<TestEvent>>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<Selection, TestError> {
        let selection = if let Some(url) = &self.config.url {
            let endpoint = Endpoint::new("custom", url)?;
            debug!("Using explicit URL {}", endpoint.url());
            Selection {
                endpoint,
                probes: Vec::new(),
            }
        } else if let Some(name) = &self.config.server {
            let endpoint = self
                .config
                .endpoints
                .get(name)
                .cloned()
                .ok_or_else(|| TestError::UnknownServer(name.clone()))?;
            debug!("Using named server {}", endpoint);
            Selection {
                endpoint,
                probes: Vec::new(),
            }
        } else {
            self.probe_and_select(progress_tx, cancel_rx).await?
        };

        if let Some(tx) = progress_tx {
            let _ = tx
                .send(TestEvent::Selected {
                    server: selection.endpoint.name().to_string(),
                    url: selection.endpoint.url().to_string(),
                })
                .await;
        }
        Ok(selection)
    }

    async fn probe_and_select(
        &self,
        progress_tx: Option<&mpsc::Sender<TestEvent>>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<Selection, TestError> {
        let results = self
            .prober
            .survey(&self.config.endpoints, Some(cancel_rx.clone()))
            .await;
        let probes: Vec<ProbeSummary> = results.iter().map(ProbeSummary::from).collect();

        if let Some(tx) = progress_tx {
            let _ = tx.send(TestEvent::ProbesFinished(probes.clone())).await;
        }

        if *cancel_rx.borrow() {
            return Err(TestError::Cancelled);
        }

        match select_best(&results) {
            SelectionOutcome::Selected {
                endpoint,
                latency_ms,
            } => {
                info!("Selected {} ({} ms)", endpoint.name(), latency_ms);
                Ok(Selection { endpoint, probes })
            }
            SelectionOutcome::NoReachableEndpoint => {
                warn!("None of {} servers answered", self.config.endpoints.len());
                Err(TestError::NoReachableEndpoint {
                    candidates: self.config.endpoints.len(),
                })
            }
        }
    }

    async fn measure_selected<W>(
        &self,
        selection: Selection,
        sink: &mut W,
        progress_tx: Option<mpsc::Sender<TestEvent>>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<TestReport, TestError>
    where
        W: AsyncWrite + Unpin,
    {
        let Selection { endpoint, probes } = selection;

        let mut cancel = cancel_rx.clone();
        let latency_ms = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return Err(TestError::Cancelled),
            result = self.prober.probe_endpoint(&endpoint) => result.latency_ms(),
        };
        match latency_ms {
            Some(ms) => info!("Ping to {}: {} ms", endpoint.name(), ms),
            None => warn!("Ping to {} failed", endpoint.name()),
        }
        if let Some(tx) = &progress_tx {
            let _ = tx.send(TestEvent::Latency(latency_ms)).await;
        }

        if *cancel_rx.borrow() {
            return Err(TestError::Cancelled);
        }

        let transfer = self
            .transfer(&endpoint, sink, progress_tx, cancel_rx)
            .await?;

        Ok(TestReport {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            server: endpoint.name().to_string(),
            url: endpoint.url().to_string(),
            latency_ms,
            probes,
            transfer,
        })
    }

    /// Measure the download, relaying transfer events to the test observer
    async fn transfer<W>(
        &self,
        endpoint: &Endpoint,
        sink: &mut W,
        progress_tx: Option<mpsc::Sender<TestEvent>>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<TransferResult, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(test_tx) = progress_tx else {
            return self
                .meter
                .measure_until(endpoint, self.config.expected_bytes, sink, None, cancel_rx)
                .await;
        };

        let (tx, mut rx) = mpsc::channel::<TransferEvent>(TRANSFER_EVENT_BUFFER);
        let relay = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.is_terminal() {
                    let _ = test_tx.send(TestEvent::Transfer(event)).await;
                } else {
                    let _ = test_tx.try_send(TestEvent::Transfer(event));
                }
            }
        });

        let result = self
            .meter
            .measure_until(endpoint, self.config.expected_bytes, sink, Some(tx), cancel_rx)
            .await;

        // The meter's sender is gone, so the relay drains and exits
        if let Err(e) = relay.await {
            warn!("Event relay failed: {}", e);
        }
        result
    }

    /// Cancel the running test.
    ///
    /// Outstanding probes are abandoned; a running transfer stops with the
    /// bytes received so far left in the sink.
    pub fn cancel(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.cancel_tx.lock().as_ref() {
            tx.send_replace(true);
            Ok(())
        } else {
            Err(anyhow::anyhow!("No test is currently running"))
        }
    }
}

/// Returned by [`Client::hold`]
pub struct CancelGuard<'a> {
    client: &'a Client,
    owner: bool,
    _rx: watch::Receiver<bool>,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        self.client.disarm(self.owner);
    }
}
