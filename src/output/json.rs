//! JSON output

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::client::TestReport;
use crate::probe::ProbeSummary;
use crate::session::ProgressSnapshot;

pub fn output_json(report: &TestReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
}

pub fn save_json(report: &TestReport, path: &Path) -> anyhow::Result<()> {
    let json = output_json(report);
    fs::write(path, json)?;
    Ok(())
}

/// One progress line for `--json-stream`
pub fn output_interval_json(snapshot: &ProgressSnapshot) -> String {
    serde_json::to_string(snapshot).unwrap_or_else(|_| "{}".to_string())
}

#[derive(Serialize)]
struct ProbeListing<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    selected: Option<&'a str>,
    probes: &'a [ProbeSummary],
}

pub fn output_probes_json(probes: &[ProbeSummary], selected: Option<&str>) -> String {
    serde_json::to_string_pretty(&ProbeListing { selected, probes })
        .unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_json_is_flat() {
        let snapshot = ProgressSnapshot {
            bytes_received: 1024,
            total_bytes: 2048,
            percent: 50.0,
            elapsed_ms: 100,
            throughput: crate::stats::Throughput {
                mbytes_per_sec: 0.01,
                mbps: 0.08,
            },
            is_final: false,
        };
        let value: serde_json::Value =
            serde_json::from_str(&output_interval_json(&snapshot)).unwrap();
        assert_eq!(value["bytes_received"], 1024);
        assert_eq!(value["mbps"], 0.08);
        assert_eq!(value["is_final"], false);
    }

    #[test]
    fn test_probes_json() {
        let probes = vec![ProbeSummary {
            name: "Miami".to_string(),
            url: "https://speedtest-mia.example.net/100mb.bin".to_string(),
            latency_ms: Some(31),
            error: None,
        }];
        let value: serde_json::Value =
            serde_json::from_str(&output_probes_json(&probes, Some("Miami"))).unwrap();
        assert_eq!(value["selected"], "Miami");
        assert_eq!(value["probes"][0]["latency_ms"], 31);
        assert!(value["probes"][0].get("error").is_none());
    }
}
