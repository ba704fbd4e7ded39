//! Transfer session state
//!
//! A [`TransferSession`] tracks one download from start to a terminal state:
//!
//! ```text
//! Idle -> InProgress (first byte) -> Completed | Failed | Cancelled
//! ```
//!
//! The clock stops when the nominal size is reached. Bytes recorded after
//! that still count as received but no longer affect the timing.
//!
//! Terminal states are final; every mutation after one returns
//! [`TransferError::AlreadyFinished`]. Callers pass the current [`Instant`] in,
//! which keeps the rate math independent of the wall clock in tests.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::TransferError;
use crate::stats::{Throughput, percent_complete};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransferState::Idle => "idle",
            TransferState::InProgress => "in progress",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
            TransferState::Cancelled => "cancelled",
        }
    }
}

/// Point-in-time view of a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub bytes_received: u64,
    pub total_bytes: u64,
    /// Received vs. expected, not clamped to 100
    pub percent: f64,
    pub elapsed_ms: u64,
    /// Cumulative bytes over elapsed time
    #[serde(flatten)]
    pub throughput: Throughput,
    /// Set only on the one snapshot emitted when the session ends
    pub is_final: bool,
}

/// Summary of a completed transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    pub server: String,
    pub url: String,
    /// Nominal payload size
    pub expected_bytes: u64,
    pub bytes_received: u64,
    pub duration_ms: u64,
    /// Nominal size over elapsed time
    pub avg_mbytes_per_sec: f64,
    pub avg_mbps: f64,
    /// Bytes actually received over elapsed time
    pub measured_mbps: f64,
    pub timestamp: DateTime<Utc>,
}

pub struct TransferSession {
    endpoint: Endpoint,
    expected_bytes: u64,
    bytes_received: u64,
    started_at: Instant,
    /// When the nominal size was reached, and the byte count at that point
    timed: Option<(Instant, u64)>,
    finished_at: Option<Instant>,
    state: TransferState,
}

impl TransferSession {
    /// A new idle session whose clock starts at `started_at`
    pub fn new(endpoint: Endpoint, expected_bytes: u64, started_at: Instant) -> Self {
        Self {
            endpoint,
            expected_bytes,
            bytes_received: 0,
            started_at,
            timed: None,
            finished_at: None,
            state: TransferState::Idle,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn expected_bytes(&self) -> u64 {
        self.expected_bytes
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Time since start, frozen at the nominal size or a terminal state
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.finished_at
            .or(self.timed.map(|(at, _)| at))
            .unwrap_or(now)
            .saturating_duration_since(self.started_at)
    }

    /// True once the received byte count reaches the nominal size
    pub fn reached_expected(&self) -> bool {
        self.expected_bytes > 0 && self.bytes_received >= self.expected_bytes
    }

    pub fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        let elapsed = self.elapsed(now);
        ProgressSnapshot {
            bytes_received: self.bytes_received,
            total_bytes: self.expected_bytes,
            percent: percent_complete(self.bytes_received, self.expected_bytes),
            elapsed_ms: elapsed.as_millis() as u64,
            throughput: Throughput::from_bytes(self.bytes_received, elapsed),
            is_final: self.state.is_terminal(),
        }
    }

    /// Account for a newly arrived chunk and return the updated snapshot
    pub fn record(&mut self, bytes: u64, now: Instant) -> Result<ProgressSnapshot, TransferError> {
        if self.state.is_terminal() {
            return Err(TransferError::AlreadyFinished);
        }
        if self.state == TransferState::Idle {
            self.state = TransferState::InProgress;
        }
        self.bytes_received = self.bytes_received.saturating_add(bytes);
        if self.timed.is_none() && self.reached_expected() {
            self.timed = Some((now.max(self.started_at), self.bytes_received));
        }
        Ok(self.snapshot(now))
    }

    /// Average rate over the nominal payload size.
    ///
    /// Uses the expected size, not the bytes actually received, so a short or
    /// oversized download still reports a figure scaled to the nominal size.
    pub fn average_throughput(&self, now: Instant) -> Throughput {
        Throughput::from_bytes(self.expected_bytes, self.elapsed(now))
    }

    /// Stop the clock and produce the final snapshot and result
    pub fn complete(
        &mut self,
        now: Instant,
    ) -> Result<(ProgressSnapshot, TransferResult), TransferError> {
        self.finish(TransferState::Completed, now)?;

        let elapsed = self.elapsed(now);
        let average = self.average_throughput(now);
        let timed_bytes = self.timed.map_or(self.bytes_received, |(_, bytes)| bytes);
        let measured = Throughput::from_bytes(timed_bytes, elapsed);

        let result = TransferResult {
            server: self.endpoint.name().to_string(),
            url: self.endpoint.url().to_string(),
            expected_bytes: self.expected_bytes,
            bytes_received: self.bytes_received,
            duration_ms: elapsed.as_millis() as u64,
            avg_mbytes_per_sec: average.mbytes_per_sec,
            avg_mbps: average.mbps,
            measured_mbps: measured.mbps,
            timestamp: Utc::now(),
        };

        Ok((self.snapshot(now), result))
    }

    pub fn fail(&mut self, now: Instant) -> Result<ProgressSnapshot, TransferError> {
        self.finish(TransferState::Failed, now)?;
        Ok(self.snapshot(now))
    }

    pub fn cancel(&mut self, now: Instant) -> Result<ProgressSnapshot, TransferError> {
        self.finish(TransferState::Cancelled, now)?;
        Ok(self.snapshot(now))
    }

    fn finish(&mut self, state: TransferState, now: Instant) -> Result<(), TransferError> {
        if self.state.is_terminal() {
            return Err(TransferError::AlreadyFinished);
        }
        self.state = state;
        let stop = self.timed.map_or(now, |(at, _)| at);
        self.finished_at = Some(stop.max(self.started_at));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1_048_576;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    fn session(expected: u64) -> (TransferSession, Instant) {
        let start = Instant::now();
        let endpoint = Endpoint::new("Test", "http://test.example/150mb.bin").unwrap();
        (TransferSession::new(endpoint, expected, start), start)
    }

    #[test]
    fn test_idle_until_first_byte() {
        let (mut s, t0) = session(100);
        assert_eq!(s.state(), TransferState::Idle);
        s.record(10, t0 + Duration::from_millis(5)).unwrap();
        assert_eq!(s.state(), TransferState::InProgress);
    }

    #[test]
    fn test_instantaneous_rate() {
        let (mut s, t0) = session(150 * MB);
        let snap = s.record(50 * MB, t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(snap.bytes_received, 52_428_800);
        assert!(approx(snap.throughput.mbytes_per_sec, 10.0));
        assert!(approx(snap.throughput.mbps, 80.0));
        assert!(!snap.is_final);
    }

    #[test]
    fn test_tick_at_zero_elapsed() {
        let (mut s, t0) = session(100);
        let snap = s.record(10, t0).unwrap();
        assert_eq!(snap.throughput, Throughput::ZERO);
        assert_eq!(snap.elapsed_ms, 0);
    }

    #[test]
    fn test_average_uses_nominal_size() {
        let (mut s, t0) = session(157_286_400);
        // Only half the payload arrives
        s.record(78_643_200, t0 + Duration::from_secs(7)).unwrap();
        let (snap, result) = s.complete(t0 + Duration::from_secs(15)).unwrap();

        assert!(snap.is_final);
        assert!(approx(snap.percent, 50.0));
        assert_eq!(result.duration_ms, 15_000);
        assert!(approx(result.avg_mbytes_per_sec, 10.0));
        assert!(approx(result.avg_mbps, 80.0));
        assert!(approx(result.measured_mbps, 40.0));
    }

    #[test]
    fn test_bytes_are_monotonic() {
        let (mut s, t0) = session(1000);
        let mut last = 0;
        for (i, chunk) in [100u64, 0, 250, 1, 400].into_iter().enumerate() {
            let snap = s
                .record(chunk, t0 + Duration::from_millis(10 * (i as u64 + 1)))
                .unwrap();
            assert!(snap.bytes_received >= last);
            last = snap.bytes_received;
        }
        assert_eq!(s.bytes_received(), 751);
    }

    #[test]
    fn test_single_terminal_transition() {
        let (mut s, t0) = session(10);
        s.record(10, t0 + Duration::from_millis(1)).unwrap();
        assert!(s.reached_expected());
        s.complete(t0 + Duration::from_millis(2)).unwrap();

        assert!(matches!(
            s.complete(t0 + Duration::from_millis(3)),
            Err(TransferError::AlreadyFinished)
        ));
        assert!(matches!(
            s.fail(t0 + Duration::from_millis(3)),
            Err(TransferError::AlreadyFinished)
        ));
        assert!(matches!(
            s.record(1, t0 + Duration::from_millis(3)),
            Err(TransferError::AlreadyFinished)
        ));
        assert_eq!(s.state(), TransferState::Completed);
        assert_eq!(s.bytes_received(), 10);
    }

    #[test]
    fn test_clock_stops_at_terminal_state() {
        let (mut s, t0) = session(100);
        s.record(40, t0 + Duration::from_secs(1)).unwrap();
        s.cancel(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(s.elapsed(t0 + Duration::from_secs(60)), Duration::from_secs(2));
        assert_eq!(s.state(), TransferState::Cancelled);
    }

    #[test]
    fn test_clock_stops_at_nominal_size() {
        let (mut s, t0) = session(300);
        s.record(200, t0 + Duration::from_secs(1)).unwrap();
        s.record(250, t0 + Duration::from_secs(2)).unwrap();
        assert!(s.reached_expected());
        // Overshoot keeps counting, the clock does not
        s.record(500, t0 + Duration::from_secs(5)).unwrap();
        let (snap, result) = s.complete(t0 + Duration::from_secs(9)).unwrap();

        assert_eq!(result.bytes_received, 950);
        assert_eq!(result.duration_ms, 2000);
        assert_eq!(snap.elapsed_ms, 2000);
        assert!(approx(result.avg_mbytes_per_sec, 150.0 / MB as f64));
        assert!(approx(result.measured_mbps, 225.0 * 8.0 / MB as f64));
    }

    #[test]
    fn test_empty_stream_completes_from_idle() {
        let (mut s, t0) = session(100);
        let (snap, result) = s.complete(t0 + Duration::from_millis(20)).unwrap();
        assert_eq!(snap.bytes_received, 0);
        assert_eq!(result.bytes_received, 0);
        assert_eq!(s.state(), TransferState::Completed);
    }

    #[test]
    fn test_failure_from_idle() {
        let (mut s, t0) = session(100);
        let snap = s.fail(t0).unwrap();
        assert!(snap.is_final);
        assert_eq!(s.state(), TransferState::Failed);
    }
}
