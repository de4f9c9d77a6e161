//! TCP health probe.
//!
//! A probe is a single stateless check; the monitor decides what a run
//! of results means.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Why a probe failed. Failures are the signal driving hysteresis, not
/// errors to propagate.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("connection failed: {0}")]
    Connect(#[from] io::Error),

    #[error("connection timeout")]
    Timeout,
}

/// A single health probe, safe to invoke concurrently.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> Result<(), CheckError>;
}

/// Probes a backend by establishing a TCP connection within the timeout
/// and closing it immediately on success.
#[derive(Debug, Clone)]
pub struct TcpHealthCheck {
    addr: String,
    timeout: Duration,
}

impl TcpHealthCheck {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl HealthCheck for TcpHealthCheck {
    async fn check(&self) -> Result<(), CheckError> {
        // TODO: probe with a TCP half-open connect to avoid completing
        // the handshake on every interval.
        match timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                debug!(addr = %self.addr, "tcp health check passed");
                Ok(())
            }
            Ok(Err(e)) => {
                debug!(addr = %self.addr, error = %e, "tcp health check failed");
                Err(CheckError::Connect(e))
            }
            Err(_) => {
                debug!(addr = %self.addr, "tcp health check timed out");
                Err(CheckError::Timeout)
            }
        }
    }
}
