use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portsweep::engine::{self, Engine, EngineConfig};
use portsweep::report::ConsoleReporter;
use portsweep::server::{self, ServerConfig};
use portsweep::services::{ServiceTable, DEFAULT_SERVICES_PATH};
use portsweep::types::{MAX_PORT, MIN_PORT};
use portsweep::{AddressSpec, PortRange, ScanSummary};

/// portsweep — concurrent TCP connect prober for addresses and CIDR blocks.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "portsweep",
    version,
    about = "Concurrent TCP connect prober for addresses and CIDR blocks.",
    after_help = "Example:\n  portsweep 127.0.0.1/32 192.168.88.0/24 2001:DB8::/120"
)]
struct Cli {
    /// Addresses or CIDR blocks to scan.
    targets: Vec<String>,

    /// First port of the range.
    #[arg(long, default_value_t = MIN_PORT, value_parser = clap::value_parser!(u16).range(1..))]
    start: u16,

    /// Last port of the range.
    #[arg(long, default_value_t = MAX_PORT, value_parser = clap::value_parser!(u16).range(1..))]
    end: u16,

    /// Concurrent connection attempts (default 10, or 1024 per client with --serve-ui).
    #[arg(long)]
    concurrency: Option<usize>,

    /// Connect timeout in milliseconds (default 1000, or 500 with --serve-ui).
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Print closed ports and failure causes too.
    #[arg(long, short)]
    verbose: bool,

    /// Service name registry used to label ports.
    #[arg(long, default_value = DEFAULT_SERVICES_PATH)]
    services: PathBuf,

    /// Serve the WebSocket scan API and static UI instead of scanning.
    #[arg(long = "serve-ui", default_value_t = false)]
    serve_ui: bool,

    /// Listen address for --serve-ui.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Directory of static UI files for --serve-ui.
    #[arg(long = "static-dir", default_value = "static")]
    static_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let services = Arc::new(ServiceTable::load_or_empty(&cli.services));

    if cli.serve_ui {
        let defaults = ServerConfig::default();
        let config = ServerConfig {
            bind: cli.bind,
            concurrency: cli.concurrency.unwrap_or(defaults.concurrency),
            timeout: cli.timeout_ms.map(Duration::from_millis).unwrap_or(defaults.timeout),
            static_dir: cli.static_dir,
        };
        info!(?config, "starting websocket front-end");
        return server::spawn_server(config, services).await;
    }

    let ports = PortRange::new(cli.start, cli.end)
        .with_context(|| format!("invalid port start/end combination, range is {MIN_PORT} to {MAX_PORT}"))?;
    if cli.targets.is_empty() {
        bail!("no targets given; pass one or more addresses or CIDR blocks");
    }
    let specs = cli
        .targets
        .iter()
        .map(|t| AddressSpec::parse(t))
        .collect::<Result<Vec<_>, _>>()?;

    let config = EngineConfig::new(Arc::new(ConsoleReporter::new(services, cli.verbose)))
        .with_concurrency(cli.concurrency.unwrap_or(engine::DEFAULT_CONCURRENCY))
        .with_timeout(
            cli.timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(engine::DEFAULT_TIMEOUT),
        );
    info!(
        targets = ?cli.targets,
        %ports,
        concurrency = config.concurrency,
        timeout_ms = config.timeout.as_millis() as u64,
        "configuration"
    );
    let engine = Engine::new(config)?;

    // Ctrl-C stops the engine; scans unwind with partial results.
    let stop = engine.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping scan");
            stop.stop();
        }
    });

    let mut total = ScanSummary::default();
    for spec in &specs {
        total.merge(engine.scan_spec(spec, ports).await);
    }
    engine.shutdown().await;

    info!(
        probed = total.delivered,
        open = total.open,
        complete = total.is_complete(),
        "done"
    );
    Ok(())
}
