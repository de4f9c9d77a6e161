//! Tracing setup for the proxy.

use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Machine-readable, one JSON object per event.
    Json,
    /// Human-readable multi-line output.
    Pretty,
}

/// Install the global tracing subscriber.
///
/// `level` applies to this crate's targets; dependencies stay at `warn`
/// so a debug-level proxy doesn't drown in runtime internals. Setting
/// `RUST_LOG` replaces the whole filter. Connection handlers run inside
/// a `session` span, so every event they emit carries the session id
/// and client address without repeating them per call site.
pub fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,tcpxy={}", level)));

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => {
            registry
                .with(fmt::layer().json().flatten_event(true))
                .init();
        }
        LogFormat::Pretty => {
            registry.with(fmt::layer().pretty()).init();
        }
    }
}
