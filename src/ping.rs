//! Latency probe primitives
//!
//! A [`Pinger`] sends one round-trip request to a host and reports how long
//! the reply took. Two implementations are provided:
//!
//! - [`TcpPinger`] times a TCP handshake to the endpoint's port. It needs no
//!   privileges and works wherever the download itself would work.
//! - [`SystemPinger`] runs the platform `ping` command for a single ICMP echo
//!   and parses the reported round-trip time.

use std::future::Future;
use std::process::Stdio;
use std::time::{Duration, Instant};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::ProbeFailure;
use crate::net::{self, AddressFamily};

/// Extra time granted to the `ping` process beyond its own reply timeout
const COMMAND_GRACE: Duration = Duration::from_millis(500);

/// Where a probe is aimed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: Option<u16>,
}

impl ProbeTarget {
    /// Parse either a URL (`https://host/path`) or a bare host name / IP.
    pub fn parse(address: &str) -> Result<Self, ProbeFailure> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ProbeFailure::InvalidAddress("empty address".to_string()));
        }

        if address.contains("://") {
            let url = Url::parse(address)
                .map_err(|e| ProbeFailure::InvalidAddress(format!("{}: {}", address, e)))?;
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| ProbeFailure::InvalidAddress(format!("{}: no host", address)))?;
            return Ok(Self {
                host: host.to_string(),
                port: url.port_or_known_default(),
            });
        }

        if address.contains('/') || address.chars().any(char::is_whitespace) {
            return Err(ProbeFailure::InvalidAddress(address.to_string()));
        }

        Ok(Self {
            host: address.to_string(),
            port: None,
        })
    }
}

impl From<&Endpoint> for ProbeTarget {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            host: endpoint.host().to_string(),
            port: endpoint.port(),
        }
    }
}

/// A single-shot round-trip latency primitive.
///
/// Implementations must report every failure through [`ProbeFailure`]; they
/// never panic on network errors.
pub trait Pinger: Send + Sync + 'static {
    fn ping(
        &self,
        target: &ProbeTarget,
        timeout: Duration,
    ) -> impl Future<Output = Result<Duration, ProbeFailure>> + Send;
}

/// Which probe primitive to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    /// Time a TCP connect to the endpoint's port
    #[default]
    Tcp,
    /// Run the system `ping` command (ICMP echo)
    System,
}

impl std::str::FromStr for ProbeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" | "connect" => Ok(Self::Tcp),
            "system" | "icmp" | "ping" => Ok(Self::System),
            other => Err(format!("unknown probe method: {} (expected tcp or system)", other)),
        }
    }
}

impl std::fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Measures the time to complete a TCP handshake
#[derive(Debug, Clone)]
pub struct TcpPinger {
    pub family: AddressFamily,
    /// Port used when the target does not carry one
    pub default_port: u16,
}

impl Default for TcpPinger {
    fn default() -> Self {
        Self {
            family: AddressFamily::default(),
            default_port: 443,
        }
    }
}

impl Pinger for TcpPinger {
    async fn ping(&self, target: &ProbeTarget, timeout: Duration) -> Result<Duration, ProbeFailure> {
        let port = target.port.unwrap_or(self.default_port);
        let addrs = net::resolve_host(&target.host, port, self.family)
            .await
            .map_err(|e| ProbeFailure::Resolve(format!("{}: {}", target.host, e)))?;
        let addr = addrs[0];

        let start = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let rtt = start.elapsed();
                drop(stream);
                debug!("TCP connect to {} took {:?}", addr, rtt);
                Ok(rtt)
            }
            Ok(Err(e)) => Err(io_failure(&addr.to_string(), e)),
            Err(_) => Err(ProbeFailure::Timeout(timeout)),
        }
    }
}

/// Runs the platform `ping` command for one echo request
#[derive(Debug, Clone)]
pub struct SystemPinger {
    pub program: String,
}

impl Default for SystemPinger {
    fn default() -> Self {
        Self {
            program: "ping".to_string(),
        }
    }
}

impl SystemPinger {
    /// Arguments for a single echo with a reply timeout
    pub fn args(host: &str, timeout: Duration) -> Vec<String> {
        if cfg!(windows) {
            vec![
                "-n".to_string(),
                "1".to_string(),
                "-w".to_string(),
                timeout.as_millis().max(1).to_string(),
                host.to_string(),
            ]
        } else if cfg!(target_os = "macos") {
            vec![
                "-c".to_string(),
                "1".to_string(),
                "-t".to_string(),
                whole_secs(timeout).to_string(),
                host.to_string(),
            ]
        } else {
            vec![
                "-c".to_string(),
                "1".to_string(),
                "-W".to_string(),
                whole_secs(timeout).to_string(),
                host.to_string(),
            ]
        }
    }
}

impl Pinger for SystemPinger {
    async fn ping(&self, target: &ProbeTarget, timeout: Duration) -> Result<Duration, ProbeFailure> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(Self::args(&target.host, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout + COMMAND_GRACE, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(ProbeFailure::PermissionDenied(format!("{}: {}", self.program, e)));
            }
            Ok(Err(e)) => return Err(ProbeFailure::Command(format!("{}: {}", self.program, e))),
            Err(_) => return Err(ProbeFailure::Timeout(timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(ProbeFailure::Unreachable(format!(
                "{} reported no reply from {} ({})",
                self.program, target.host, output.status
            )));
        }

        parse_ping_output(&stdout).ok_or_else(|| {
            ProbeFailure::Command(format!("no round-trip time in {} output", self.program))
        })
    }
}

/// Either probe primitive, chosen at runtime
#[derive(Debug, Clone)]
pub enum PingerKind {
    Tcp(TcpPinger),
    System(SystemPinger),
}

impl PingerKind {
    pub fn new(method: ProbeMethod, family: AddressFamily) -> Self {
        match method {
            ProbeMethod::Tcp => Self::Tcp(TcpPinger {
                family,
                ..TcpPinger::default()
            }),
            ProbeMethod::System => Self::System(SystemPinger::default()),
        }
    }
}

impl Pinger for PingerKind {
    async fn ping(&self, target: &ProbeTarget, timeout: Duration) -> Result<Duration, ProbeFailure> {
        match self {
            Self::Tcp(p) => p.ping(target, timeout).await,
            Self::System(p) => p.ping(target, timeout).await,
        }
    }
}

/// Extract the round-trip time from `ping` output.
///
/// Understands `time=14ms`, `time=14.2 ms` and `time<1ms` (reported as 1 ms).
pub fn parse_ping_output(output: &str) -> Option<Duration> {
    for line in output.lines() {
        if let Some(idx) = line.find("time=") {
            let rest = &line[idx + 5..];
            let number: String = rest
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            if let Ok(ms) = number.parse::<f64>() {
                return Some(Duration::from_micros((ms * 1000.0).round() as u64));
            }
        } else if line.contains("time<1ms") {
            return Some(Duration::from_millis(1));
        }
    }
    None
}

fn whole_secs(timeout: Duration) -> u64 {
    timeout.as_secs_f64().ceil().max(1.0) as u64
}

fn io_failure(addr: &str, e: std::io::Error) -> ProbeFailure {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            ProbeFailure::PermissionDenied(format!("{}: {}", addr, e))
        }
        std::io::ErrorKind::TimedOut => ProbeFailure::Unreachable(format!("{}: timed out", addr)),
        _ => ProbeFailure::Unreachable(format!("{}: {}", addr, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_url() {
        let target = ProbeTarget::parse("https://speedtest-ny.turnkeyinternet.net/100mb.bin")
            .unwrap();
        assert_eq!(target.host, "speedtest-ny.turnkeyinternet.net");
        assert_eq!(target.port, Some(443));
    }

    #[test]
    fn test_target_bare_host() {
        let target = ProbeTarget::parse("example.com").unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, None);
    }

    #[test]
    fn test_target_invalid() {
        assert!(ProbeTarget::parse("").is_err());
        assert!(ProbeTarget::parse("http://").is_err());
        assert!(ProbeTarget::parse("not a host").is_err());
    }

    #[test]
    fn test_parse_linux_output() {
        let out = "PING example.com (93.184.216.34) 56(84) bytes of data.\n\
                   64 bytes from 93.184.216.34: icmp_seq=1 ttl=56 time=11.8 ms\n";
        let rtt = parse_ping_output(out).unwrap();
        assert_eq!(rtt.as_micros(), 11_800);
    }

    #[test]
    fn test_parse_windows_output() {
        let out = "Reply from 1.1.1.1: bytes=32 time=14ms TTL=56";
        assert_eq!(parse_ping_output(out), Some(Duration::from_millis(14)));

        let fast = "Reply from 127.0.0.1: bytes=32 time<1ms TTL=128";
        assert_eq!(parse_ping_output(fast), Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_parse_no_reply() {
        assert_eq!(parse_ping_output("Request timed out."), None);
    }

    #[test]
    fn test_probe_method_parse() {
        assert_eq!("tcp".parse::<ProbeMethod>(), Ok(ProbeMethod::Tcp));
        assert_eq!("ICMP".parse::<ProbeMethod>(), Ok(ProbeMethod::System));
        assert!("udp".parse::<ProbeMethod>().is_err());
    }

    #[test]
    fn test_system_args_carry_host() {
        let args = SystemPinger::args("example.com", Duration::from_millis(1500));
        assert_eq!(args.last().map(String::as_str), Some("example.com"));
    }

    #[tokio::test]
    async fn test_tcp_ping_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((_stream, _)) = listener.accept().await {}
        });

        let target = ProbeTarget {
            host: "127.0.0.1".to_string(),
            port: Some(port),
        };
        let rtt = TcpPinger::default()
            .ping(&target, Duration::from_secs(2))
            .await;
        assert!(rtt.is_ok(), "local connect should succeed: {:?}", rtt);
    }

    #[tokio::test]
    async fn test_tcp_ping_closed_port() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let target = ProbeTarget {
            host: "127.0.0.1".to_string(),
            port: Some(port),
        };
        let result = TcpPinger::default()
            .ping(&target, Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(ProbeFailure::Unreachable(_))));
    }
}
