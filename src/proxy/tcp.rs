//! The TCP proxy core.
//!
//! Owns the listener, the backend registry and the load balancer, and
//! pumps bytes between clients and backends.

use crate::backend::{Backend, MonitorError, Registry, Update};
use crate::balancer::LoadBalancer;
use crate::metrics::MetricValue;
use crate::proxy::state::{Lifecycle, State};
use crate::proxy::stats::{IoVolume, ProxyStats};
use crate::proxy::ProxyConfig;
use crate::util::SessionId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// Terminal errors surfaced from [`TcpProxy::run`].
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("attempted to start proxy when not in NEW state")]
    AlreadyStarted,

    #[error("attempted to run proxy when not in STARTING state")]
    StartInterrupted,

    #[error("failed to listen on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to register backend {addr}")]
    Register {
        addr: String,
        #[source]
        source: MonitorError,
    },

    #[error("failed to accept connection")]
    Accept(#[source] io::Error),
}

/// A layer-4 reverse proxy for a fixed pool of backends.
///
/// The lifecycle runs NEW -> STARTING -> RUNNING -> STOPPED; shutdown is
/// legal from any state and STOPPED is terminal. Cloning yields another
/// handle to the same proxy.
#[derive(Clone)]
pub struct TcpProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    cfg: ProxyConfig,
    lifecycle: Lifecycle,
    registry: Registry,
    balancer: Arc<dyn LoadBalancer>,
    stats: ProxyStats,
    shutdown_tx: broadcast::Sender<()>,
    local_addr: OnceLock<SocketAddr>,
    exit_tx: Mutex<Option<mpsc::Sender<ProxyError>>>,
    exit_rx: Mutex<Option<mpsc::Receiver<ProxyError>>>,
}

impl TcpProxy {
    /// Build a proxy from its configuration. Must be called within a
    /// tokio runtime; the registry's fan-out task starts immediately.
    pub fn new(cfg: ProxyConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (exit_tx, exit_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(ProxyInner {
                registry: Registry::new(cfg.health),
                balancer: cfg.policy.build(),
                stats: ProxyStats::new(),
                cfg,
                lifecycle: Lifecycle::new(),
                shutdown_tx,
                local_addr: OnceLock::new(),
                exit_tx: Mutex::new(Some(exit_tx)),
                exit_rx: Mutex::new(Some(exit_rx)),
            }),
        }
    }

    /// Bind the listener, register the backends, and spawn the accept
    /// loop. Errors on any state but NEW.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let inner = &self.inner;
        info!("starting proxy");
        if !inner.lifecycle.compare_and_swap(State::New, State::Starting) {
            return Err(ProxyError::AlreadyStarted);
        }

        let listener = match TcpListener::bind(&inner.cfg.laddr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.shutdown();
                return Err(ProxyError::Bind {
                    addr: inner.cfg.laddr.clone(),
                    source: e,
                });
            }
        };
        if let Ok(addr) = listener.local_addr() {
            let _ = inner.local_addr.set(addr);
            info!(addr = %addr, "listening");
        }

        inner.registry.register_listener(|update| match &update {
            Update::Joined(b) | Update::Health(b) => {
                info!(backend = %b.addr(), state = %b.state(), "backend update")
            }
            Update::Removed(b) => info!(backend = %b.addr(), "backend removed"),
        });
        let balancer = Arc::clone(&inner.balancer);
        inner
            .registry
            .register_listener(move |update| balancer.update_backend(&update));

        for addr in &inner.cfg.backends {
            if let Err(e) = inner.registry.add(addr) {
                self.shutdown();
                return Err(ProxyError::Register {
                    addr: addr.clone(),
                    source: e,
                });
            }
        }
        for backend in inner.registry.snapshot() {
            inner.stats.register_backend_gauge(&backend);
        }

        // Subscribe before the transition to RUNNING so a concurrent
        // shutdown's signal is buffered rather than lost.
        let shutdown_rx = inner.shutdown_tx.subscribe();

        if !inner.lifecycle.compare_and_swap(State::Starting, State::Running) {
            // Shutdown raced us between the two transitions; clear any
            // backends registered after its eviction pass.
            self.shutdown();
            inner.registry.evict_all();
            return Err(ProxyError::StartInterrupted);
        }

        let proxy = self.clone();
        tokio::spawn(async move { proxy.accept_loop(listener, shutdown_rx).await });
        Ok(())
    }

    /// `start` then block until the proxy exits, returning the first
    /// terminal error if there was one.
    pub async fn run(&self) -> Result<(), ProxyError> {
        self.start().await?;
        let Some(mut exit_rx) = self.inner.exit_rx.lock().take() else {
            return Err(ProxyError::AlreadyStarted);
        };
        match exit_rx.recv().await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop the proxy. Legal in any state, idempotent, and always safe
    /// to call; in-flight sessions end on their own as their endpoints
    /// close.
    pub fn shutdown(&self) {
        let prev = self.inner.lifecycle.swap(State::Stopped);
        info!(state = %prev, "shutting down");
        match prev {
            State::New | State::Starting => {
                let _ = self.inner.shutdown_tx.send(());
                self.exit(None);
            }
            State::Running => {
                // The accept loop observes the signal and releases the
                // listener and the registry itself.
                let _ = self.inner.shutdown_tx.send(());
            }
            State::Stopped => {}
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.inner.lifecycle.load()
    }

    /// Address the listener is bound to, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// Snapshot of every proxy metric, sorted by name.
    pub fn stats(&self) -> BTreeMap<String, MetricValue> {
        self.inner.stats.snapshot()
    }

    fn exit(&self, err: Option<ProxyError>) {
        self.inner.registry.evict_all();
        if let Some(exit_tx) = self.inner.exit_tx.lock().take() {
            if let Some(err) = err {
                let _ = exit_tx.try_send(err);
            }
        }
    }

    async fn accept_loop(self, listener: TcpListener, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            // Biased select so a pending shutdown wins over a pending
            // accept; tokio's accept is cancellable, so no deadline
            // polling is needed to observe shutdown while idle.
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,

                accepted = listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        self.inner.stats.incr_requests();
                        let session = SessionId::next();
                        info!(session = %session, client = %peer, "accepted connection");
                        let proxy = self.clone();
                        tokio::spawn(async move { proxy.handle_conn(session, client, peer).await });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        if let Some(exit_tx) = self.inner.exit_tx.lock().as_ref() {
                            let _ = exit_tx.try_send(ProxyError::Accept(e));
                        }
                        self.shutdown();
                        break;
                    }
                }
            }
        }
        drop(listener);
        self.exit(None);
    }

    #[instrument(name = "session", skip_all, fields(session = %session, client = %peer))]
    async fn handle_conn(self, session: SessionId, client: TcpStream, peer: SocketAddr) {
        let inner = &self.inner;
        let backend = match inner.balancer.next_backend() {
            Ok(backend) => backend,
            Err(e) => {
                warn!(error = %e, "closing client connection");
                inner.stats.incr_errors();
                return;
            }
        };

        let backend_stream =
            match timeout(inner.cfg.timeout, TcpStream::connect(backend.addr())).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    // TODO: attempt a different backend before giving up.
                    error!(backend = %backend.addr(), error = %e, "error dialing backend");
                    inner.stats.incr_errors();
                    return;
                }
                Err(_) => {
                    error!(backend = %backend.addr(), "timed out dialing backend");
                    inner.stats.incr_errors();
                    return;
                }
            };
        debug!(backend = %backend.addr(), "opened connection to backend");

        if let Err(e) = client.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }
        if let Err(e) = backend_stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on backend connection");
        }

        backend.incr_active_conns();
        let _active = ActiveConnGuard(Arc::clone(&backend));

        let volume = pump_session(client, backend_stream).await;

        if let Some(e) = volume.first_error {
            warn!(backend = %backend.addr(), error = %e, "error proxying data");
            inner.stats.incr_errors();
        }
        debug!(
            backend = %backend.addr(),
            to_backend = volume.to_backend,
            to_client = volume.to_client,
            "proxy session finished"
        );

        inner.stats.record_frontend_io(IoVolume {
            tx: volume.to_client,
            rx: volume.to_backend,
        });
        inner.stats.record_backend_io(
            backend.addr(),
            IoVolume {
                tx: volume.to_backend,
                rx: volume.to_client,
            },
        );
    }
}

/// Pairs an active-connection increment with its decrement on every exit
/// path of the connection handler, panics included.
struct ActiveConnGuard(Arc<Backend>);

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        self.0.decr_active_conns();
    }
}

/// Byte totals and first failure of one proxied session.
struct SessionVolume {
    to_backend: u64,
    to_client: u64,
    first_error: Option<io::Error>,
}

/// Run both byte pumps until the first terminates, then close both
/// endpoints; the peer pump unblocks and its result is discarded.
async fn pump_session(client: TcpStream, backend_stream: TcpStream) -> SessionVolume {
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend_stream.into_split();
    let to_backend = Arc::new(AtomicU64::new(0));
    let to_client = Arc::new(AtomicU64::new(0));

    // Capacity two lets the second pump report and exit unobserved.
    let (done_tx, mut done_rx) = mpsc::channel::<io::Result<()>>(2);
    let c2b = tokio::spawn(pump(
        client_read,
        backend_write,
        Arc::clone(&to_backend),
        done_tx.clone(),
    ));
    let b2c = tokio::spawn(pump(
        backend_read,
        client_write,
        Arc::clone(&to_client),
        done_tx,
    ));

    let first = done_rx.recv().await.unwrap_or(Ok(()));

    // Aborting drops the stream halves, closing both connections.
    c2b.abort();
    b2c.abort();
    let _ = c2b.await;
    let _ = b2c.await;

    SessionVolume {
        to_backend: to_backend.load(Ordering::Acquire),
        to_client: to_client.load(Ordering::Acquire),
        first_error: first.err(),
    }
}

/// Copy bytes from `src` to `dst` until end-of-stream or error,
/// counting as it goes so a torn-down session still reports its volume.
async fn pump(
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    transferred: Arc<AtomicU64>,
    done: mpsc::Sender<io::Result<()>>,
) {
    let mut buf = vec![0u8; 16 * 1024];
    let result = loop {
        match src.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => match dst.write_all(&buf[..n]).await {
                Ok(()) => {
                    transferred.fetch_add(n as u64, Ordering::AcqRel);
                }
                Err(e) => break Err(e),
            },
            Err(e) => break Err(e),
        }
    };
    let _ = done.send(result).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pump_session_counts_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // One end of each proxied pair is driven by the test.
        let client_side = TcpStream::connect(addr).await.unwrap();
        let (mut remote_client, _) = listener.accept().await.unwrap();
        let backend_side = TcpStream::connect(addr).await.unwrap();
        let (mut remote_backend, _) = listener.accept().await.unwrap();

        let session = tokio::spawn(pump_session(client_side, backend_side));

        remote_client.write_all(b"hi!").await.unwrap();
        let mut buf = [0u8; 3];
        remote_backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi!");

        remote_backend.write_all(b"hello!").await.unwrap();
        let mut buf = [0u8; 6];
        remote_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello!");

        drop(remote_client);
        drop(remote_backend);

        let volume = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(volume.to_backend, 3);
        assert_eq!(volume.to_client, 6);
        assert!(volume.first_error.is_none());
    }
}
