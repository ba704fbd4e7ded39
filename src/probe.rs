//! Latency-based server selection
//!
//! Every candidate is probed on its own task. The survey only returns once
//! every probe has finished (or the caller cancels), so the selection always
//! compares the full candidate set rather than taking the first reply.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, EndpointTable};
use crate::error::ProbeFailure;
use crate::ping::{Pinger, ProbeTarget};

/// Per-probe timeout used when the caller does not set one
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Slack on top of the probe timeout before the probe is abandoned
const PROBE_DEADLINE_SLACK: Duration = Duration::from_secs(1);

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Reachable { latency_ms: u64 },
    Failed(ProbeFailure),
}

impl ProbeStatus {
    pub fn latency_ms(&self) -> Option<u64> {
        match self {
            ProbeStatus::Reachable { latency_ms } => Some(*latency_ms),
            ProbeStatus::Failed(_) => None,
        }
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeStatus::Reachable { .. })
    }
}

/// One endpoint's probe result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub endpoint: Endpoint,
    pub status: ProbeStatus,
    /// False when the probe was abandoned by cancellation
    pub completed: bool,
}

/// Which endpoint won, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    Selected { endpoint: Endpoint, latency_ms: u64 },
    NoReachableEndpoint,
}

impl SelectionOutcome {
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            SelectionOutcome::Selected { endpoint, .. } => Some(endpoint),
            SelectionOutcome::NoReachableEndpoint => None,
        }
    }

    pub fn latency_ms(&self) -> Option<u64> {
        match self {
            SelectionOutcome::Selected { latency_ms, .. } => Some(*latency_ms),
            SelectionOutcome::NoReachableEndpoint => None,
        }
    }
}

/// Serializable view of a probe result, used in reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSummary {
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ProbeResult> for ProbeSummary {
    fn from(result: &ProbeResult) -> Self {
        let error = match &result.status {
            ProbeStatus::Reachable { .. } => None,
            ProbeStatus::Failed(failure) => Some(failure.to_string()),
        };
        Self {
            name: result.endpoint.name().to_string(),
            url: result.endpoint.url().to_string(),
            latency_ms: result.status.latency_ms(),
            error,
        }
    }
}

/// Pick the completed, reachable result with the lowest latency.
///
/// Ties go to the earliest result in slice order.
pub fn select_best(results: &[ProbeResult]) -> SelectionOutcome {
    let mut best: Option<(&Endpoint, u64)> = None;

    for result in results.iter().filter(|r| r.completed) {
        if let ProbeStatus::Reachable { latency_ms } = result.status
            && best.is_none_or(|(_, best_ms)| latency_ms < best_ms)
        {
            best = Some((&result.endpoint, latency_ms));
        }
    }

    match best {
        Some((endpoint, latency_ms)) => SelectionOutcome::Selected {
            endpoint: endpoint.clone(),
            latency_ms,
        },
        None => SelectionOutcome::NoReachableEndpoint,
    }
}

/// Runs latency probes with a shared primitive and timeout
pub struct Prober<P> {
    pinger: Arc<P>,
    timeout: Duration,
}

impl<P: Pinger> Prober<P> {
    pub fn new(pinger: P) -> Self {
        Self {
            pinger: Arc::new(pinger),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Set the per-probe timeout; `None` keeps the default
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe a single URL or host. Never fails; failures come back as data.
    pub async fn probe_one(&self, address: &str) -> ProbeStatus {
        match ProbeTarget::parse(address) {
            Ok(target) => probe_target(self.pinger.as_ref(), &target, self.timeout).await,
            Err(failure) => {
                debug!("Not probing {}: {}", address, failure);
                ProbeStatus::Failed(failure)
            }
        }
    }

    pub async fn probe_endpoint(&self, endpoint: &Endpoint) -> ProbeStatus {
        probe_target(self.pinger.as_ref(), &ProbeTarget::from(endpoint), self.timeout).await
    }

    /// Probe every endpoint concurrently and return the results in table order.
    ///
    /// Returns once all probes have finished. If `cancel` flips to `true`,
    /// outstanding probes are aborted and reported with `completed = false`.
    pub async fn survey(
        &self,
        endpoints: &EndpointTable,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Vec<ProbeResult> {
        if endpoints.is_empty() {
            info!("No candidate endpoints to probe");
            return Vec::new();
        }

        info!("Probing {} servers...", endpoints.len());

        let mut slots: Vec<Option<ProbeStatus>> = vec![None; endpoints.len()];
        let mut tasks = JoinSet::new();

        for (idx, endpoint) in endpoints.iter().enumerate() {
            let pinger = self.pinger.clone();
            let target = ProbeTarget::from(endpoint);
            let timeout = self.timeout;
            tasks.spawn(async move { (idx, probe_target(pinger.as_ref(), &target, timeout).await) });
        }

        let mut cancel = cancel;
        let mut watching = cancel.is_some();
        let mut cancelled = false;

        loop {
            let joined = if watching && let Some(rx) = cancel.as_mut() {
                if *rx.borrow_and_update() {
                    cancelled = true;
                    break;
                }
                tokio::select! {
                    biased;
                    changed = rx.changed() => {
                        if changed.is_err() {
                            // Sender gone; nobody can cancel any more
                            watching = false;
                        }
                        continue;
                    }
                    joined = tasks.join_next() => joined,
                }
            } else {
                tasks.join_next().await
            };

            match joined {
                Some(Ok((idx, status))) => slots[idx] = Some(status),
                Some(Err(e)) => warn!("Probe task failed: {}", e),
                None => break,
            }
        }

        if cancelled {
            info!("Probing cancelled; keeping completed results");
            tasks.abort_all();
        }

        endpoints
            .iter()
            .zip(slots)
            .map(|(endpoint, slot)| {
                let result = match slot {
                    Some(status) => ProbeResult {
                        endpoint: endpoint.clone(),
                        status,
                        completed: true,
                    },
                    None if cancelled => ProbeResult {
                        endpoint: endpoint.clone(),
                        status: ProbeStatus::Failed(ProbeFailure::Cancelled),
                        completed: false,
                    },
                    None => ProbeResult {
                        endpoint: endpoint.clone(),
                        status: ProbeStatus::Failed(ProbeFailure::Command(
                            "probe task aborted".to_string(),
                        )),
                        completed: true,
                    },
                };
                match &result.status {
                    ProbeStatus::Reachable { latency_ms } => {
                        debug!("{}: {} ms", endpoint.name(), latency_ms)
                    }
                    ProbeStatus::Failed(failure) => debug!("{}: {}", endpoint.name(), failure),
                }
                result
            })
            .collect()
    }

    /// Probe every endpoint and pick the best one
    pub async fn probe_all(
        &self,
        endpoints: &EndpointTable,
        cancel: Option<watch::Receiver<bool>>,
    ) -> SelectionOutcome {
        let results = self.survey(endpoints, cancel).await;
        let outcome = select_best(&results);
        match &outcome {
            SelectionOutcome::Selected {
                endpoint,
                latency_ms,
            } => info!("Selected {} ({} ms)", endpoint.name(), latency_ms),
            SelectionOutcome::NoReachableEndpoint => {
                warn!("None of {} servers answered", endpoints.len())
            }
        }
        outcome
    }
}

/// Probe every endpoint with `pinger` and pick the best one.
///
/// `timeout` applies to each probe; `None` means [`DEFAULT_PROBE_TIMEOUT`].
pub async fn probe_all<P: Pinger>(
    pinger: P,
    endpoints: &EndpointTable,
    timeout: Option<Duration>,
) -> SelectionOutcome {
    Prober::new(pinger)
        .with_timeout(timeout)
        .probe_all(endpoints, None)
        .await
}

/// Probe one URL or host with `pinger`.
pub async fn probe_one<P: Pinger>(
    pinger: P,
    address: &str,
    timeout: Option<Duration>,
) -> ProbeStatus {
    Prober::new(pinger)
        .with_timeout(timeout)
        .probe_one(address)
        .await
}

async fn probe_target<P: Pinger>(
    pinger: &P,
    target: &ProbeTarget,
    timeout: Duration,
) -> ProbeStatus {
    match tokio::time::timeout(timeout + PROBE_DEADLINE_SLACK, pinger.ping(target, timeout)).await
    {
        Ok(Ok(rtt)) => ProbeStatus::Reachable {
            latency_ms: rtt.as_millis() as u64,
        },
        Ok(Err(failure)) => ProbeStatus::Failed(failure),
        Err(_) => ProbeStatus::Failed(ProbeFailure::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Scripted pinger: per-host delay before answering, then a fixed answer
    struct ScriptedPinger {
        script: HashMap<String, (Duration, Result<Duration, ProbeFailure>)>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedPinger {
        fn new(entries: &[(&str, u64, Result<u64, ProbeFailure>)]) -> Self {
            let script = entries
                .iter()
                .map(|(host, delay_ms, answer)| {
                    (
                        host.to_string(),
                        (
                            Duration::from_millis(*delay_ms),
                            answer.clone().map(Duration::from_millis),
                        ),
                    )
                })
                .collect();
            Self {
                script,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Pinger for ScriptedPinger {
        async fn ping(
            &self,
            target: &ProbeTarget,
            _timeout: Duration,
        ) -> Result<Duration, ProbeFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, answer) = self
                .script
                .get(&target.host)
                .cloned()
                .unwrap_or((Duration::ZERO, Err(ProbeFailure::Resolve(target.host.clone()))));
            tokio::time::sleep(delay).await;
            answer
        }
    }

    fn table(names: &[&str]) -> EndpointTable {
        let urls: Vec<(String, String)> = names
            .iter()
            .map(|n| (n.to_string(), format!("http://{}.test/file.bin", n)))
            .collect();
        EndpointTable::from_pairs(urls.iter().map(|(n, u)| (n.as_str(), u.as_str()))).unwrap()
    }

    fn selected_name(outcome: &SelectionOutcome) -> Option<&str> {
        outcome.endpoint().map(|e| e.name())
    }

    #[tokio::test]
    async fn test_selects_lowest_latency() {
        let pinger = ScriptedPinger::new(&[
            ("a.test", 0, Ok(40)),
            ("b.test", 0, Ok(12)),
            ("c.test", 0, Ok(25)),
        ]);
        let outcome = probe_all(pinger, &table(&["a", "b", "c"]), None).await;
        assert_eq!(selected_name(&outcome), Some("b"));
        assert_eq!(outcome.latency_ms(), Some(12));
    }

    #[tokio::test]
    async fn test_tie_goes_to_first_in_order() {
        // c answers first, but a comes first in the table
        let pinger = ScriptedPinger::new(&[
            ("a.test", 80, Ok(20)),
            ("b.test", 0, Ok(30)),
            ("c.test", 0, Ok(20)),
        ]);
        let outcome = probe_all(pinger, &table(&["a", "b", "c"]), None).await;
        assert_eq!(selected_name(&outcome), Some("a"));
    }

    #[tokio::test]
    async fn test_failures_are_skipped() {
        let pinger = ScriptedPinger::new(&[
            ("a.test", 0, Err(ProbeFailure::Unreachable("down".into()))),
            ("b.test", 0, Ok(300)),
            ("c.test", 0, Err(ProbeFailure::Timeout(Duration::from_secs(1)))),
        ]);
        let outcome = probe_all(pinger, &table(&["a", "b", "c"]), None).await;
        assert_eq!(selected_name(&outcome), Some("b"));
    }

    #[tokio::test]
    async fn test_all_failed() {
        let pinger = ScriptedPinger::new(&[
            ("a.test", 0, Err(ProbeFailure::Resolve("a.test".into()))),
            ("b.test", 0, Err(ProbeFailure::PermissionDenied("raw socket".into()))),
        ]);
        let outcome = probe_all(pinger, &table(&["a", "b"]), None).await;
        assert_eq!(outcome, SelectionOutcome::NoReachableEndpoint);
    }

    #[tokio::test]
    async fn test_empty_set_issues_no_probes() {
        let pinger = ScriptedPinger::new(&[]);
        let calls = pinger.calls.clone();
        let outcome = probe_all(pinger, &EndpointTable::default(), None).await;
        assert_eq!(outcome, SelectionOutcome::NoReachableEndpoint);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_candidate_wins_regardless_of_latency() {
        let pinger = ScriptedPinger::new(&[("only.test", 0, Ok(4_000))]);
        let outcome = probe_all(pinger, &table(&["only"]), None).await;
        assert_eq!(selected_name(&outcome), Some("only"));
        assert_eq!(outcome.latency_ms(), Some(4_000));
    }

    #[tokio::test]
    async fn test_waits_for_every_probe() {
        // The slow responder has the best latency and must still win
        let pinger = ScriptedPinger::new(&[
            ("fast.test", 0, Ok(50)),
            ("slow.test", 150, Ok(5)),
        ]);
        let outcome = probe_all(pinger, &table(&["fast", "slow"]), None).await;
        assert_eq!(selected_name(&outcome), Some("slow"));
    }

    #[tokio::test]
    async fn test_probes_run_concurrently() {
        let entries: Vec<(String, u64, Result<u64, ProbeFailure>)> = (0..5)
            .map(|i| (format!("s{}.test", i), 200, Ok(10 + i)))
            .collect();
        let borrowed: Vec<(&str, u64, Result<u64, ProbeFailure>)> = entries
            .iter()
            .map(|(h, d, r)| (h.as_str(), *d, r.clone()))
            .collect();
        let pinger = ScriptedPinger::new(&borrowed);

        let start = Instant::now();
        let results = Prober::new(pinger)
            .survey(&table(&["s0", "s1", "s2", "s3", "s4"]), None)
            .await;
        assert_eq!(results.len(), 5);
        assert!(
            start.elapsed() < Duration::from_millis(800),
            "probes should overlap, took {:?}",
            start.elapsed()
        );
        // Results stay in table order, not arrival order
        let names: Vec<&str> = results.iter().map(|r| r.endpoint.name()).collect();
        assert_eq!(names, vec!["s0", "s1", "s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn test_hung_probe_times_out() {
        let pinger = ScriptedPinger::new(&[("hang.test", 10_000, Ok(1))]);
        let prober = Prober::new(pinger).with_timeout(Some(Duration::from_millis(50)));
        let status = prober.probe_one("http://hang.test/file").await;
        assert_eq!(
            status,
            ProbeStatus::Failed(ProbeFailure::Timeout(Duration::from_millis(50)))
        );
    }

    #[tokio::test]
    async fn test_probe_one_invalid_address() {
        let pinger = ScriptedPinger::new(&[]);
        let status = probe_one(pinger, "http://", None).await;
        assert!(matches!(
            status,
            ProbeStatus::Failed(ProbeFailure::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_one_bare_host() {
        let pinger = ScriptedPinger::new(&[("a.test", 0, Ok(7))]);
        let status = probe_one(pinger, "a.test", None).await;
        assert_eq!(status, ProbeStatus::Reachable { latency_ms: 7 });
    }

    #[tokio::test]
    async fn test_cancel_keeps_completed_results() {
        let pinger = ScriptedPinger::new(&[("quick.test", 0, Ok(30)), ("stuck.test", 10_000, Ok(1))]);
        let prober = Prober::new(pinger).with_timeout(Some(Duration::from_secs(30)));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = cancel_tx.send(true);
        });

        let start = Instant::now();
        let results = prober
            .survey(&table(&["quick", "stuck"]), Some(cancel_rx))
            .await;
        assert!(start.elapsed() < Duration::from_secs(5));

        assert!(results[0].completed);
        assert_eq!(results[0].status, ProbeStatus::Reachable { latency_ms: 30 });
        assert!(!results[1].completed);
        assert_eq!(results[1].status, ProbeStatus::Failed(ProbeFailure::Cancelled));

        assert_eq!(selected_name(&select_best(&results)), Some("quick"));
    }

    #[test]
    fn test_select_best_ignores_incomplete() {
        let endpoints = table(&["a", "b"]);
        let mut iter = endpoints.iter();
        let results = vec![
            ProbeResult {
                endpoint: iter.next().unwrap().clone(),
                status: ProbeStatus::Reachable { latency_ms: 1 },
                completed: false,
            },
            ProbeResult {
                endpoint: iter.next().unwrap().clone(),
                status: ProbeStatus::Reachable { latency_ms: 9 },
                completed: true,
            },
        ];
        assert_eq!(selected_name(&select_best(&results)), Some("b"));
    }

    #[test]
    fn test_summary_from_result() {
        let endpoint = Endpoint::new("x", "http://x.test/f").unwrap();
        let summary = ProbeSummary::from(&ProbeResult {
            endpoint,
            status: ProbeStatus::Failed(ProbeFailure::Resolve("x.test".into())),
            completed: true,
        });
        assert_eq!(summary.latency_ms, None);
        assert_eq!(summary.error.as_deref(), Some("could not resolve x.test"));
    }
}
