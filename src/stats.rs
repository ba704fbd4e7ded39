//! Throughput math and human-readable formatting
//!
//! Megabytes are binary (1 MB = 1,048,576 bytes) and Mbps is MB/s × 8.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bytes per megabyte used for every rate in this crate
pub const BYTES_PER_MB: f64 = 1_048_576.0;

/// A transfer rate expressed as both byte-rate and bit-rate
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Throughput {
    /// Megabytes per second
    pub mbytes_per_sec: f64,
    /// Megabits per second (`mbytes_per_sec * 8`)
    pub mbps: f64,
}

impl Throughput {
    pub const ZERO: Throughput = Throughput {
        mbytes_per_sec: 0.0,
        mbps: 0.0,
    };

    /// Rate for `bytes` moved in `elapsed`.
    ///
    /// Returns [`Throughput::ZERO`] when no time has passed, so the very first
    /// progress tick never divides by zero.
    pub fn from_bytes(bytes: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            let mbytes_per_sec = bytes as f64 / (secs * BYTES_PER_MB);
            Self {
                mbytes_per_sec,
                mbps: mbytes_per_sec * 8.0,
            }
        } else {
            Self::ZERO
        }
    }
}

/// Percent of `expected` covered by `received`.
///
/// Not clamped: a server that sends more than announced yields more than 100.
pub fn percent_complete(received: u64, expected: u64) -> f64 {
    if expected > 0 {
        received as f64 / expected as f64 * 100.0
    } else {
        0.0
    }
}

/// Parse a byte size such as `100M`, `1G`, `512K` or a plain byte count
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim().to_uppercase();
    let s = s.strip_suffix('B').unwrap_or(&s);
    let (num, suffix) = if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024u64)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024u64)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024u64)
    } else {
        (s, 1u64)
    };

    num.trim()
        .parse::<u64>()
        .map_err(|e| e.to_string())?
        .checked_mul(suffix)
        .ok_or_else(|| format!("size too large: {}", s))
}

pub fn bytes_to_human(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn mbps_to_human(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.2} Mbps", mbps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_rate_fifty_mb_in_five_seconds() {
        let rate = Throughput::from_bytes(52_428_800, Duration::from_secs_f64(5.0));
        assert!(approx(rate.mbytes_per_sec, 10.0));
        assert!(approx(rate.mbps, 80.0));
    }

    #[test]
    fn test_rate_zero_elapsed() {
        let rate = Throughput::from_bytes(1_000_000, Duration::ZERO);
        assert_eq!(rate, Throughput::ZERO);
    }

    #[test]
    fn test_percent_complete() {
        assert!(approx(percent_complete(50, 200), 25.0));
        assert!(approx(percent_complete(300, 200), 150.0));
        assert_eq!(percent_complete(10, 0), 0.0);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("100M"), Ok(104_857_600));
        assert_eq!(parse_size("1g"), Ok(1_073_741_824));
        assert_eq!(parse_size("512KB"), Ok(524_288));
        assert_eq!(parse_size("4096"), Ok(4096));
        assert!(parse_size("lots").is_err());
        assert!(parse_size("99999999999999G").is_err());
    }

    #[test]
    fn test_bytes_to_human() {
        assert_eq!(bytes_to_human(500), "500 B");
        assert_eq!(bytes_to_human(1024), "1.00 KB");
        assert_eq!(bytes_to_human(1024 * 1024), "1.00 MB");
        assert_eq!(bytes_to_human(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_mbps_to_human() {
        assert_eq!(mbps_to_human(80.0), "80.00 Mbps");
        assert_eq!(mbps_to_human(1500.0), "1.50 Gbps");
    }
}
