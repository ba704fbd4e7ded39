//! Plain text output

use crate::client::TestReport;
use crate::endpoint::EndpointTable;
use crate::probe::ProbeSummary;
use crate::session::ProgressSnapshot;
use crate::stats::{bytes_to_human, mbps_to_human};

pub fn output_plain(report: &TestReport) -> String {
    let t = &report.transfer;
    let mut output = String::new();

    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push_str("  speedprobe Results\n");
    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push('\n');

    output.push_str(&format!("  Server:      {}\n", report.server));
    output.push_str(&format!("  URL:         {}\n", report.url));
    match report.latency_ms {
        Some(ms) => output.push_str(&format!("  Ping:        {} ms\n", ms)),
        None => output.push_str("  Ping:        n/a\n"),
    }
    output.push('\n');

    output.push_str(&format!(
        "  Duration:    {:.2}s\n",
        t.duration_ms as f64 / 1000.0
    ));
    output.push_str(&format!(
        "  Transfer:    {} of {}\n",
        bytes_to_human(t.bytes_received),
        bytes_to_human(t.expected_bytes)
    ));
    output.push_str(&format!(
        "  Average:     {:.2} MB/s ({})\n",
        t.avg_mbytes_per_sec,
        mbps_to_human(t.avg_mbps)
    ));
    if t.bytes_received != t.expected_bytes {
        output.push_str(&format!("  Measured:    {}\n", mbps_to_human(t.measured_mbps)));
    }
    output.push('\n');

    if !report.probes.is_empty() {
        output.push_str("  Server Latency:\n");
        output.push_str(&probe_rows(&report.probes, Some(report.server.as_str())));
        output.push('\n');
    }

    output.push_str("─".repeat(60).as_str());
    output.push('\n');

    output
}

pub fn output_interval_plain(snapshot: &ProgressSnapshot) -> String {
    format!(
        "[{:5.1}s]  {:5.1}%  {}  {:.2} MB/s  {}\n",
        snapshot.elapsed_ms as f64 / 1000.0,
        snapshot.percent,
        bytes_to_human(snapshot.bytes_received),
        snapshot.throughput.mbytes_per_sec,
        mbps_to_human(snapshot.throughput.mbps)
    )
}

/// Latency table for the `probe` command
pub fn output_probes_plain(probes: &[ProbeSummary], selected: Option<&str>) -> String {
    let mut output = probe_rows(probes, selected);
    match selected {
        Some(name) => output.push_str(&format!("\nSelected: {}\n", name)),
        None => output.push_str("\nNo reachable server\n"),
    }
    output
}

pub fn output_servers_plain(table: &EndpointTable) -> String {
    let width = table.iter().map(|e| e.name().len()).max().unwrap_or(0);
    table
        .iter()
        .map(|e| format!("  {:width$}  {}\n", e.name(), e.url(), width = width))
        .collect()
}

fn probe_rows(probes: &[ProbeSummary], selected: Option<&str>) -> String {
    let width = probes.iter().map(|p| p.name.len()).max().unwrap_or(0);
    let mut output = String::new();
    for probe in probes {
        let marker = if selected == Some(probe.name.as_str()) {
            '*'
        } else {
            ' '
        };
        let status = match (probe.latency_ms, &probe.error) {
            (Some(ms), _) => format!("{} ms", ms),
            (None, Some(error)) => error.clone(),
            (None, None) => "no reply".to_string(),
        };
        output.push_str(&format!(
            "  {} {:width$}  {}\n",
            marker,
            probe.name,
            status,
            width = width
        ));
    }
    output
}
