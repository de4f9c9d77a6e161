//! tcpxy - a layer-4 TCP reverse proxy
//!
//! Usage:
//!     tcpxy [--laddr <host:port>] [--timeout <duration>] [--lb <RANDOM|P2C>] <backend>...
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use tcpxy::balancer::Policy;
use tcpxy::health::HealthCheckConfig;
use tcpxy::proxy::{ProxyConfig, TcpProxy};
use tcpxy::util::{init_logging, LogFormat};

/// A layer-4 TCP reverse proxy with health-checked backends.
#[derive(Parser, Debug)]
#[command(name = "tcpxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Local address to listen on
    #[arg(long, value_name = "HOST:PORT", default_value = "0.0.0.0:4000")]
    laddr: String,

    /// Backend dial timeout
    #[arg(long, value_name = "DURATION", default_value = "3s", value_parser = parse_duration)]
    timeout: Duration,

    /// Load balancing policy (RANDOM or P2C, case-sensitive)
    #[arg(long, value_name = "POLICY", default_value = "P2C")]
    lb: String,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,

    /// Backend host:port endpoints (at least one required)
    #[arg(value_name = "BACKEND")]
    backends: Vec<String>,
}

fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level, cli.log_format);

    if cli.backends.is_empty() {
        Cli::command().print_help()?;
        std::process::exit(1);
    }

    // Policy is parsed here rather than by clap so invalid values exit 1.
    let policy: Policy = cli.lb.parse()?;

    let config = ProxyConfig {
        laddr: cli.laddr,
        timeout: cli.timeout,
        backends: cli.backends,
        policy,
        health: HealthCheckConfig::default(),
    };

    info!(
        laddr = %config.laddr,
        policy = %config.policy,
        backends = config.backends.len(),
        "tcpxy starting"
    );

    // Run the proxy
    run(config)
}

/// Run the proxy with the given configuration.
fn run(config: ProxyConfig) -> Result<()> {
    // Create tokio runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(config).await })
}

/// Async entry point for the proxy.
async fn run_async(config: ProxyConfig) -> Result<()> {
    let proxy = Arc::new(TcpProxy::new(config));

    spawn_signal_handlers(&proxy)?;

    proxy.run().await.context("proxy exited with error")?;

    info!("tcpxy shut down complete");
    Ok(())
}

/// Wire process signals to the proxy: interrupt and terminate trigger
/// shutdown; SIGUSR1 dumps the stats snapshot to stdout.
#[cfg(unix)]
fn spawn_signal_handlers(proxy: &Arc<TcpProxy>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to listen for SIGINT")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
    let shutdown_proxy = Arc::clone(proxy);
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        info!("received shutdown signal");
        shutdown_proxy.shutdown();
    });

    let mut stats_signal =
        signal(SignalKind::user_defined1()).context("failed to listen for SIGUSR1")?;
    let stats_proxy = Arc::clone(proxy);
    tokio::spawn(async move {
        while stats_signal.recv().await.is_some() {
            dump_stats(&stats_proxy);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_handlers(proxy: &Arc<TcpProxy>) -> Result<()> {
    let shutdown_proxy = Arc::clone(proxy);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            shutdown_proxy.shutdown();
        }
    });
    Ok(())
}

/// Write the stats snapshot to stdout, one metric per line, sorted by
/// name.
#[cfg(unix)]
fn dump_stats(proxy: &TcpProxy) {
    for (name, value) in proxy.stats() {
        println!("{}: {}", name, value);
    }
}
