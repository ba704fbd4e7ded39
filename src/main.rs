//! speedprobe - Pick the closest server and measure download speed

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use speedprobe::client::{Client, ClientConfig, TestEvent};
use speedprobe::config::Config;
use speedprobe::endpoint::EndpointTable;
use speedprobe::meter::{MeterConfig, TransferEvent};
use speedprobe::net::AddressFamily;
use speedprobe::output::{output_csv, output_json, output_plain};
use speedprobe::ping::ProbeMethod;
use speedprobe::probe::{ProbeSummary, select_best};
use speedprobe::stats::parse_size;

/// Output format options
#[derive(Clone, Copy)]
struct OutputOptions {
    json: bool,
    json_stream: bool,
    csv: bool,
    quiet: bool,
}

/// Fallback file name when the URL path has none
const DEFAULT_SINK_NAME: &str = "speedprobe.bin";

/// Initialize logging with optional file output
fn init_logging(log_file: Option<&str>, log_level: Option<&str>) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = log_level.unwrap_or("info");
    let env_filter =
        EnvFilter::from_default_env().add_directive(format!("speedprobe={}", level).parse()?);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time()
        .with_writer(io::stderr);

    if let Some(file_path) = log_file {
        let expanded_path = expand_tilde(file_path);

        if let Some(parent) = expanded_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Daily rotation, non-blocking writer
        let file_appender = tracing_appender::rolling::daily(
            expanded_path.parent().unwrap_or_else(|| Path::new(".")),
            expanded_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("speedprobe.log")),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Keep guard alive for the duration of the program
        std::mem::forget(guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
    }

    Ok(())
}

fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

#[derive(Parser)]
#[command(name = "speedprobe")]
#[command(author, version, about = "Pick the closest server and measure download speed")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Generate shell completions
    #[arg(long, value_name = "SHELL", value_parser = ["bash", "zsh", "fish", "powershell", "elvish"])]
    completions: Option<String>,

    /// Test against this server from the table instead of probing
    #[arg(short, long, env = "SPEEDPROBE_SERVER", conflicts_with = "url")]
    server: Option<String>,

    /// Download from this URL instead of probing
    #[arg(long, env = "SPEEDPROBE_URL")]
    url: Option<String>,

    /// Nominal download size (e.g., 100M, 1G)
    #[arg(long, value_parser = parse_size, env = "SPEEDPROBE_SIZE")]
    size: Option<u64>,

    /// Per-probe timeout
    #[arg(long, value_parser = parse_duration, env = "SPEEDPROBE_TIMEOUT")]
    timeout: Option<Duration>,

    /// Probe method (tcp, system)
    #[arg(long, env = "SPEEDPROBE_METHOD")]
    method: Option<ProbeMethod>,

    /// Probe over IPv4 only
    #[arg(short = '4', long, conflicts_with = "ipv6")]
    ipv4: bool,

    /// Probe over IPv6 only
    #[arg(short = '6', long)]
    ipv6: bool,

    /// Minimum gap between progress lines
    #[arg(short = 'i', long, value_parser = parse_duration)]
    interval: Option<Duration>,

    /// JSON output
    #[arg(long)]
    json: bool,

    /// JSON streaming output (one object per line)
    #[arg(long)]
    json_stream: bool,

    /// CSV output
    #[arg(long)]
    csv: bool,

    /// Quiet mode - suppress progress output, show only summary
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Save the JSON report to this file
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Keep the downloaded file
    #[arg(long)]
    keep: bool,

    /// Directory for the downloaded file
    #[arg(long, env = "SPEEDPROBE_DOWNLOAD_DIR")]
    download_dir: Option<PathBuf>,

    /// Log file path (e.g., "~/.config/speedprobe/speedprobe.log")
    #[arg(long, env = "SPEEDPROBE_LOG_FILE")]
    log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "SPEEDPROBE_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every server and show latencies
    Probe,

    /// List the candidate servers
    Servers,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn generate_completions(shell: &str) {
    use clap::CommandFactory;
    use clap_complete::{Shell, generate};

    let mut cmd = Cli::command();
    let shell = match shell {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "powershell" => Shell::PowerShell,
        "elvish" => Shell::Elvish,
        _ => {
            eprintln!("Unknown shell: {}", shell);
            std::process::exit(1);
        }
    };
    generate(shell, &mut cmd, "speedprobe", &mut std::io::stdout());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle shell completions early (before logging init)
    if let Some(ref shell) = cli.completions {
        generate_completions(shell);
        return Ok(());
    }

    // Load config file (falls back to defaults if not found)
    let file_config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Warning: ignoring {}: {}",
                Config::config_path().display(),
                e
            );
            Config::default()
        }
    };

    let log_file = cli.log_file.as_ref().or(file_config.log_file.as_ref());
    let log_level = cli.log_level.as_ref().or(file_config.log_level.as_ref());
    init_logging(log_file.map(|s| s.as_str()), log_level.map(|s| s.as_str()))?;

    let config = build_client_config(&cli, &file_config)?;
    let opts = OutputOptions {
        json: cli.json,
        json_stream: cli.json_stream,
        csv: cli.csv,
        quiet: cli.quiet,
    };

    match cli.command {
        Some(Commands::Servers) => {
            print!(
                "{}",
                speedprobe::output::plain::output_servers_plain(&config.endpoints)
            );
        }

        Some(Commands::Probe) => {
            run_probe(config, opts).await?;
        }

        None => {
            let keep = cli.keep || file_config.transfer.keep_file.unwrap_or(false);
            let download_dir = cli
                .download_dir
                .clone()
                .or_else(|| {
                    file_config
                        .transfer
                        .output_dir
                        .as_deref()
                        .map(expand_tilde)
                })
                .unwrap_or_else(std::env::temp_dir);
            run_test(config, opts, &download_dir, keep, cli.output).await?;
        }
    }

    Ok(())
}

/// Merge CLI flags over the config file over built-in defaults
fn build_client_config(cli: &Cli, file_config: &Config) -> Result<ClientConfig> {
    let endpoints: EndpointTable = file_config.endpoint_table()?;

    let expected_bytes = match (cli.size, file_config.transfer.expected_size.as_deref()) {
        (Some(size), _) => size,
        (None, Some(size)) => parse_size(size).map_err(|e| anyhow::anyhow!("expected_size: {}", e))?,
        (None, None) => ClientConfig::default().expected_bytes,
    };

    let address_family = if cli.ipv4 {
        AddressFamily::V4Only
    } else if cli.ipv6 {
        AddressFamily::V6Only
    } else {
        file_config
            .probe
            .address_family
            .as_deref()
            .map(|s| s.parse::<AddressFamily>())
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))?
            .unwrap_or_default()
    };

    let defaults = MeterConfig::default();
    let meter = MeterConfig {
        progress_interval: cli
            .interval
            .or(file_config.progress_interval())
            .unwrap_or(defaults.progress_interval),
        stall_timeout: file_config
            .stall_timeout()
            .unwrap_or(defaults.stall_timeout),
        request_timeout: file_config.request_timeout().or(defaults.request_timeout),
        connect_timeout: defaults.connect_timeout,
    };

    Ok(ClientConfig {
        endpoints,
        server: cli.server.clone(),
        url: cli.url.clone(),
        expected_bytes,
        probe_method: cli.method.or(file_config.probe.method).unwrap_or_default(),
        probe_timeout: cli.timeout.or(file_config.probe_timeout()),
        address_family,
        meter,
    })
}

async fn run_probe(config: ClientConfig, opts: OutputOptions) -> Result<()> {
    let client = Client::new(config)?;

    let results = client.survey().await;
    let outcome = select_best(&results);
    let selected = outcome.endpoint().map(|e| e.name());
    let probes: Vec<ProbeSummary> = results.iter().map(ProbeSummary::from).collect();

    let output = if opts.json || opts.json_stream {
        speedprobe::output::json::output_probes_json(&probes, selected)
    } else if opts.csv {
        speedprobe::output::csv::output_probes_csv(&probes)
    } else {
        speedprobe::output::plain::output_probes_plain(&probes, selected)
    };
    println!("{}", output);

    if selected.is_none() {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_test(
    config: ClientConfig,
    opts: OutputOptions,
    download_dir: &Path,
    keep: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let client = Client::new(config)?;

    let (tx, mut rx) = mpsc::channel::<TestEvent>(100);

    // Print CSV header if needed
    if opts.csv && !opts.quiet {
        print!("{}", speedprobe::output::csv::csv_interval_header());
        let _ = io::stdout().flush();
    }

    // Print progress in a separate task
    let print_handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if opts.quiet {
                continue;
            }
            match event {
                TestEvent::Selected { server, url } if !opts.csv && !opts.json_stream => {
                    println!("Testing against {} ({})", server, url);
                }
                TestEvent::Transfer(TransferEvent::Progress(snapshot)) => {
                    let line = if opts.json_stream {
                        format!(
                            "{}\n",
                            speedprobe::output::json::output_interval_json(&snapshot)
                        )
                    } else if opts.csv {
                        speedprobe::output::csv::output_interval_csv(&snapshot)
                    } else {
                        speedprobe::output::plain::output_interval_plain(&snapshot)
                    };
                    print!("{}", line);
                    let _ = io::stdout().flush();
                }
                _ => {}
            }
        }
    });

    let result = {
        // Keep cancel armed between selection and measurement
        let _armed = client.hold();
        let run = async {
            let selection = client.select(Some(&tx)).await?;

            let file_name = selection.endpoint.file_name().unwrap_or(DEFAULT_SINK_NAME);
            let path = download_dir.join(file_name);
            let mut file = tokio::fs::File::create(&path).await?;
            info!("Writing download to {}", path.display());

            let result = client.measure(selection, &mut file, Some(tx.clone())).await;
            drop(file);

            if !keep && let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to delete {}: {}", path.display(), e);
            }
            anyhow::Ok(result?)
        };
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            _ = tokio::signal::ctrl_c() => {
                let _ = client.cancel();
                run.await
            }
        }
    };

    // Wait for print task to finish
    drop(tx);
    let _ = print_handle.await;

    let report = result?;

    let output_str = if opts.json || opts.json_stream {
        output_json(&report)
    } else if opts.csv {
        output_csv(&report)
    } else {
        output_plain(&report)
    };

    println!("{}", output_str);

    if let Some(path) = output {
        speedprobe::output::json::save_json(&report, &path)?;
        info!("Results saved to {}", path.display());
    }

    Ok(())
}
