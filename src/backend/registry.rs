//! Backend registry.
//!
//! Owns the set of backends and their monitors, and fans health updates
//! out to registered listeners.

use crate::backend::{Backend, BackendState, HealthMonitor, MonitorError};
use crate::health::{HealthCheckConfig, TcpHealthCheck};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A change in the backend set, delivered to registry listeners.
#[derive(Clone)]
pub enum Update {
    /// A backend joined the set (synthetic, emitted on add).
    Joined(Arc<Backend>),
    /// A monitored backend changed health state.
    Health(Arc<Backend>),
    /// A backend left the set. Carries the backend with whatever state
    /// it last had; receivers must treat it as gone regardless.
    Removed(Arc<Backend>),
}

impl Update {
    pub fn backend(&self) -> &Arc<Backend> {
        match self {
            Update::Joined(b) | Update::Health(b) | Update::Removed(b) => b,
        }
    }
}

/// Invoked with every update the registry's aggregator drains.
pub type RegistryListener = Arc<dyn Fn(Update) + Send + Sync>;

struct RegistryState {
    backends: HashMap<String, Arc<Backend>>,
    monitors: HashMap<String, Arc<HealthMonitor>>,
    listeners: Vec<RegistryListener>,
}

/// Registry of upstream backends and their health monitors.
///
/// All monitors feed one aggregation channel; a single fan-out task
/// drains it serially and invokes every listener concurrently, so each
/// event observes a consistent listener set.
#[derive(Clone)]
pub struct Registry {
    cfg: HealthCheckConfig,
    state: Arc<RwLock<RegistryState>>,
    aggr_tx: mpsc::UnboundedSender<Update>,
}

impl Registry {
    pub fn new(cfg: HealthCheckConfig) -> Self {
        let (aggr_tx, mut aggr_rx) = mpsc::unbounded_channel::<Update>();
        let state = Arc::new(RwLock::new(RegistryState {
            backends: HashMap::new(),
            monitors: HashMap::new(),
            listeners: Vec::new(),
        }));

        let fanout_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(update) = aggr_rx.recv().await {
                // Hold the read lock only to copy the listener set.
                let listeners = fanout_state.read().listeners.clone();
                for listener in listeners {
                    let update = update.clone();
                    tokio::spawn(async move { listener(update) });
                }
            }
        });

        Self {
            cfg,
            state,
            aggr_tx,
        }
    }

    /// Add a backend, replacing any existing entry for the address, and
    /// start monitoring it. The backend joins as HEALTHY and listeners
    /// receive a synthetic update for it.
    pub fn add(&self, addr: &str) -> Result<(), MonitorError> {
        let mut state = self.state.write();
        self.remove_locked(&mut state, addr);

        // TODO: perform an initial probe rather than assuming healthy.
        let backend = Arc::new(Backend::new(addr, BackendState::Healthy));
        let monitor = Arc::new(HealthMonitor::new(Arc::clone(&backend), self.cfg));
        monitor.add_check(Arc::new(TcpHealthCheck::new(addr, self.cfg.timeout)));

        let aggr_tx = self.aggr_tx.clone();
        monitor.register_listener(move |backend| {
            let _ = aggr_tx.send(Update::Health(backend));
        });

        state.backends.insert(addr.to_string(), Arc::clone(&backend));
        state.monitors.insert(addr.to_string(), Arc::clone(&monitor));

        match monitor.start() {
            Ok(()) => {
                let _ = self.aggr_tx.send(Update::Joined(backend));
                Ok(())
            }
            Err(e) => {
                self.remove_locked(&mut state, addr);
                Err(e)
            }
        }
    }

    /// Remove a backend, stopping its monitor. Listeners receive a
    /// removal update.
    pub fn remove(&self, addr: &str) {
        let mut state = self.state.write();
        self.remove_locked(&mut state, addr);
    }

    /// Remove every backend.
    pub fn evict_all(&self) {
        let mut state = self.state.write();
        let addrs: Vec<String> = state.backends.keys().cloned().collect();
        for addr in addrs {
            self.remove_locked(&mut state, &addr);
        }
    }

    pub fn register_listener(&self, listener: impl Fn(Update) + Send + Sync + 'static) {
        self.state.write().listeners.push(Arc::new(listener));
    }

    /// A copy of the current backend set.
    pub fn snapshot(&self) -> Vec<Arc<Backend>> {
        self.state.read().backends.values().cloned().collect()
    }

    fn remove_locked(&self, state: &mut RegistryState, addr: &str) {
        if let Some(backend) = state.backends.remove(addr) {
            let _ = self.aggr_tx.send(Update::Removed(backend));
        }
        if let Some(monitor) = state.monitors.remove(addr) {
            monitor.stop();
        }
    }
}
