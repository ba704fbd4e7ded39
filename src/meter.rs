//! Transfer metering
//!
//! Streams an HTTP download into a caller-owned sink while timing it. Progress
//! is pushed to an optional observer channel; the read loop never waits on the
//! observer for interim ticks, only for the single terminal event.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::TransferError;
use crate::session::{ProgressSnapshot, TransferResult, TransferSession};
use crate::stats::{bytes_to_human, mbps_to_human};

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Something an observer sees during a transfer.
///
/// Exactly one of `Completed`, `Failed` or `Cancelled` ends every session, and
/// nothing follows it.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress(ProgressSnapshot),
    Completed {
        snapshot: ProgressSnapshot,
        result: TransferResult,
    },
    Failed {
        snapshot: ProgressSnapshot,
        reason: String,
    },
    Cancelled {
        snapshot: ProgressSnapshot,
    },
}

impl TransferEvent {
    pub fn snapshot(&self) -> &ProgressSnapshot {
        match self {
            TransferEvent::Progress(snapshot)
            | TransferEvent::Completed { snapshot, .. }
            | TransferEvent::Failed { snapshot, .. }
            | TransferEvent::Cancelled { snapshot } => snapshot,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferEvent::Progress(_))
    }
}

/// Rate-limited, non-blocking progress publisher
pub struct ProgressEmitter {
    tx: Option<mpsc::Sender<TransferEvent>>,
    interval: Duration,
    last_sent: Option<Instant>,
}

impl ProgressEmitter {
    /// `interval` is the minimum gap between interim ticks; zero sends every one
    pub fn new(tx: Option<mpsc::Sender<TransferEvent>>, interval: Duration) -> Self {
        Self {
            tx,
            interval,
            last_sent: None,
        }
    }

    /// Offer an interim snapshot. Dropped if too soon or the observer is behind.
    pub fn progress(&mut self, snapshot: ProgressSnapshot) {
        let Some(tx) = &self.tx else {
            return;
        };
        let now = Instant::now();
        if let Some(last) = self.last_sent
            && now.duration_since(last) < self.interval
        {
            return;
        }
        match tx.try_send(TransferEvent::Progress(snapshot)) {
            Ok(()) => self.last_sent = Some(now),
            Err(TrySendError::Full(_)) => debug!("Observer is behind; dropped a progress tick"),
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Deliver the terminal event, waiting for channel space if needed
    pub async fn finish(&self, event: TransferEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Minimum gap between interim progress events
    pub progress_interval: Duration,
    /// Longest gap allowed between reads before the transfer fails
    pub stall_timeout: Duration,
    /// Optional cap on the whole request, body included
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            request_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Downloads from an endpoint and measures throughput
pub struct TransferMeter {
    http: reqwest::Client,
    config: MeterConfig,
    /// Signals the running transfer to stop
    cancel_tx: Arc<Mutex<Option<watch::Sender<bool>>>>,
}

impl TransferMeter {
    pub fn new(config: MeterConfig) -> Result<Self, TransferError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.stall_timeout)
            .user_agent(concat!("speedprobe/", env!("CARGO_PKG_VERSION")));
        if let Some(limit) = config.request_timeout {
            builder = builder.timeout(limit);
        }
        let http = builder
            .build()
            .map_err(|e| TransferError::Client(error_chain(&e)))?;

        Ok(Self {
            http,
            config,
            cancel_tx: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    /// Download `endpoint` into `sink`, reporting progress on `progress_tx`.
    ///
    /// `expected_bytes` is the nominal payload size: it is the percent
    /// denominator and the numerator of the average rate, whatever the server
    /// actually sends. Concurrent measures on one meter share a cancel signal.
    pub async fn measure<W>(
        &self,
        endpoint: &Endpoint,
        expected_bytes: u64,
        sink: &mut W,
        progress_tx: Option<mpsc::Sender<TransferEvent>>,
    ) -> Result<TransferResult, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let (cancel_rx, owner) = self.arm();
        let result = self
            .measure_until(endpoint, expected_bytes, sink, progress_tx, cancel_rx)
            .await;
        self.disarm(owner);
        result
    }

    /// Join the running cancel signal or start one; true when this call owns it
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

    /// Like [`measure`](Self::measure), but stops when the caller's `cancel`
    /// flips to `true` instead of on [`cancel`](Self::cancel).
    pub async fn measure_until<W>(
        &self,
        endpoint: &Endpoint,
        expected_bytes: u64,
        sink: &mut W,
        progress_tx: Option<mpsc::Sender<TransferEvent>>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<TransferResult, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        info!(
            "Downloading {} from {}",
            bytes_to_human(expected_bytes),
            endpoint
        );

        let mut events = ProgressEmitter::new(progress_tx, self.config.progress_interval);
        let mut session = TransferSession::new(endpoint.clone(), expected_bytes, Instant::now());
        let url = endpoint.url().to_string();

        let request = self.http.get(endpoint.url().clone()).send();
        let response = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                return cancel_session(&mut session, sink, &events).await;
            }
            response = request => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let reason = error_chain(&e);
                fail_session(&mut session, &events, &reason).await;
                return Err(TransferError::Connect { url, reason });
            }
        };

        let status = response.status();
        if !status.is_success() {
            fail_session(&mut session, &events, &format!("HTTP {}", status)).await;
            return Err(TransferError::Status {
                url,
                status: status.as_u16(),
            });
        }

        if let Some(announced) = response.content_length()
            && announced != expected_bytes
        {
            debug!(
                "Server announces {} bytes, measuring against nominal {} bytes",
                announced, expected_bytes
            );
        }

        meter_stream(
            &mut session,
            response.bytes_stream(),
            sink,
            &mut events,
            cancel,
        )
        .await
    }

    /// Cancel the running transfer.
    ///
    /// The sink keeps the bytes written so far and the observer receives one
    /// `Cancelled` event.
    pub fn cancel(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.cancel_tx.lock().as_ref() {
            tx.send_replace(true);
            Ok(())
        } else {
            Err(anyhow::anyhow!("No transfer is currently running"))
        }
    }
}

/// Drive `stream` into `sink`, updating `session` and emitting events.
///
/// The clock stops when the nominal size is reached, but the rest of the body
/// is still written to `sink`. Ends when the stream ends, an error occurs or
/// `cancel` flips to `true`.
pub async fn meter_stream<S, B, E, W>(
    session: &mut TransferSession,
    stream: S,
    sink: &mut W,
    events: &mut ProgressEmitter,
    mut cancel: watch::Receiver<bool>,
) -> Result<TransferResult, TransferError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error,
    W: AsyncWrite + Unpin,
{
    let mut stream = std::pin::pin!(stream);
    let mut draining = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                return cancel_session(session, sink, events).await;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                let bytes = chunk.as_ref();
                if let Err(e) = sink.write_all(bytes).await {
                    let received = session.bytes_received();
                    fail_session(session, events, &e.to_string()).await;
                    return Err(TransferError::Sink {
                        received,
                        source: e,
                    });
                }

                let snapshot = session.record(bytes.len() as u64, Instant::now())?;
                if session.reached_expected() {
                    if !draining {
                        debug!("Reached nominal size at {} bytes", snapshot.bytes_received);
                        draining = true;
                    }
                    continue;
                }
                events.progress(snapshot);
            }
            Some(Err(e)) => {
                let received = session.bytes_received();
                let reason = error_chain(&e);
                fail_session(session, events, &reason).await;
                return Err(TransferError::Stream { received, reason });
            }
            None => {
                debug!("Stream ended at {} bytes", session.bytes_received());
                break;
            }
        }
    }

    if let Err(e) = sink.flush().await {
        let received = session.bytes_received();
        fail_session(session, events, &e.to_string()).await;
        return Err(TransferError::Sink {
            received,
            source: e,
        });
    }

    let (snapshot, result) = session.complete(Instant::now())?;
    info!(
        "Transfer complete: {} in {:.2}s, average {:.2} MB/s ({})",
        bytes_to_human(result.bytes_received),
        result.duration_ms as f64 / 1000.0,
        result.avg_mbytes_per_sec,
        mbps_to_human(result.avg_mbps)
    );
    events
        .finish(TransferEvent::Completed {
            snapshot,
            result: result.clone(),
        })
        .await;
    Ok(result)
}

/// `outer: inner: root` rendering of an error and its sources
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !rendered.ends_with(&text) {
            rendered.push_str(": ");
            rendered.push_str(&text);
        }
        source = cause.source();
    }
    rendered
}

/// Resolves once `cancel` reads `true`; never resolves if the sender is gone
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn fail_session(session: &mut TransferSession, events: &ProgressEmitter, reason: &str) {
    if let Ok(snapshot) = session.fail(Instant::now()) {
        warn!(
            "Transfer from {} failed after {} bytes: {}",
            session.endpoint().name(),
            snapshot.bytes_received,
            reason
        );
        events
            .finish(TransferEvent::Failed {
                snapshot,
                reason: reason.to_string(),
            })
            .await;
    }
}

async fn cancel_session<W>(
    session: &mut TransferSession,
    sink: &mut W,
    events: &ProgressEmitter,
) -> Result<TransferResult, TransferError>
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = sink.flush().await {
        warn!("Flushing sink after cancel failed: {}", e);
    }
    let received = session.bytes_received();
    if let Ok(snapshot) = session.cancel(Instant::now()) {
        info!("Transfer cancelled after {} bytes", received);
        events.finish(TransferEvent::Cancelled { snapshot }).await;
    }
    Err(TransferError::Cancelled { received })
}
