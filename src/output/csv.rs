//! CSV output format

use crate::client::TestReport;
use crate::probe::ProbeSummary;
use crate::session::ProgressSnapshot;

/// Output test report as CSV
pub fn output_csv(report: &TestReport) -> String {
    let mut output = String::new();

    // Header
    output.push_str("test_id,server,latency_ms,duration_secs,expected_bytes,bytes_received,avg_mbytes_per_sec,avg_mbps,measured_mbps\n");

    // Summary row
    let t = &report.transfer;
    output.push_str(&format!(
        "{},{},{},{:.2},{},{},{:.2},{:.2},{:.2}\n",
        report.id,
        escape(&report.server),
        report
            .latency_ms
            .map(|ms| ms.to_string())
            .unwrap_or_default(),
        t.duration_ms as f64 / 1000.0,
        t.expected_bytes,
        t.bytes_received,
        t.avg_mbytes_per_sec,
        t.avg_mbps,
        t.measured_mbps,
    ));

    output
}

/// Output progress snapshot as CSV line
pub fn output_interval_csv(snapshot: &ProgressSnapshot) -> String {
    format!(
        "{:.2},{},{:.1},{:.2},{:.2}\n",
        snapshot.elapsed_ms as f64 / 1000.0,
        snapshot.bytes_received,
        snapshot.percent,
        snapshot.throughput.mbytes_per_sec,
        snapshot.throughput.mbps,
    )
}

/// CSV header for interval output
pub fn csv_interval_header() -> &'static str {
    "elapsed_secs,bytes,percent,mbytes_per_sec,mbps\n"
}

pub fn output_probes_csv(probes: &[ProbeSummary]) -> String {
    let mut output = String::from("server,url,latency_ms,error\n");
    for probe in probes {
        output.push_str(&format!(
            "{},{},{},{}\n",
            escape(&probe.name),
            escape(&probe.url),
            probe
                .latency_ms
                .map(|ms| ms.to_string())
                .unwrap_or_default(),
            escape(probe.error.as_deref().unwrap_or("")),
        ));
    }
    output
}

/// Quote a field if it contains a separator, quote or newline
fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(escape("Miami"), "Miami");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_probes_csv() {
        let probes = vec![
            ProbeSummary {
                name: "Chicago".to_string(),
                url: "https://chi.example.net/100mb.bin".to_string(),
                latency_ms: Some(18),
                error: None,
            },
            ProbeSummary {
                name: "Amsterdam".to_string(),
                url: "https://ams.example.net/100mb.bin".to_string(),
                latency_ms: None,
                error: Some("timed out after 5s".to_string()),
            },
        ];
        let csv = output_probes_csv(&probes);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "Chicago,https://chi.example.net/100mb.bin,18,");
        assert_eq!(lines[2], "Amsterdam,https://ams.example.net/100mb.bin,,timed out after 5s");
    }
}
