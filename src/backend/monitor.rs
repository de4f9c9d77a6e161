//! Per-backend health monitor.
//!
//! Drives the registered probes on a fixed cadence and applies
//! hysteresis to the backend's observable state.

use crate::backend::{Backend, BackendState};
use crate::health::{CheckError, HealthCheck, HealthCheckConfig};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

/// Invoked with the backend whenever its state changes.
pub type UpdateListener = Arc<dyn Fn(Arc<Backend>) + Send + Sync>;

const LIFECYCLE_NEW: u32 = 1;
const LIFECYCLE_RUNNING: u32 = 2;
const LIFECYCLE_STOPPED: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("attempted to start health monitor when not in NEW state")]
    AlreadyStarted,
}

/// Monitors the health of a single backend.
///
/// One driver task fires the probes every interval; one consumer task
/// drains results serially and applies the streak thresholds. State
/// transitions for a backend are therefore totally ordered.
pub struct HealthMonitor {
    cfg: HealthCheckConfig,
    backend: Arc<Backend>,
    checks: Arc<RwLock<Vec<Arc<dyn HealthCheck>>>>,
    listeners: Arc<RwLock<Vec<UpdateListener>>>,
    stop_tx: watch::Sender<bool>,
    lifecycle: AtomicU32,
}

impl HealthMonitor {
    pub fn new(backend: Arc<Backend>, cfg: HealthCheckConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            cfg,
            backend,
            checks: Arc::new(RwLock::new(Vec::new())),
            listeners: Arc::new(RwLock::new(Vec::new())),
            stop_tx,
            lifecycle: AtomicU32::new(LIFECYCLE_NEW),
        }
    }

    /// Register a probe. Probes added after `start` are picked up on the
    /// next tick.
    pub fn add_check(&self, check: Arc<dyn HealthCheck>) {
        self.checks.write().push(check);
    }

    /// Register a listener for state changes. Listeners are invoked in
    /// their own task and must tolerate being fired off.
    pub fn register_listener(&self, listener: impl Fn(Arc<Backend>) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Start the driver and consumer tasks. Fails on any second call.
    pub fn start(&self) -> Result<(), MonitorError> {
        let swapped = self
            .lifecycle
            .compare_exchange(
                LIFECYCLE_NEW,
                LIFECYCLE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !swapped {
            return Err(MonitorError::AlreadyStarted);
        }

        let (results_tx, results_rx) = mpsc::unbounded_channel();

        self.spawn_driver(results_tx);
        self.spawn_consumer(results_rx);
        Ok(())
    }

    /// Stop the monitor. Idempotent; after return no further listener
    /// invocations are initiated, though in-flight ones may complete.
    pub fn stop(&self) {
        let prev = self.lifecycle.swap(LIFECYCLE_STOPPED, Ordering::AcqRel);
        if prev != LIFECYCLE_STOPPED {
            self.stop_tx.send_replace(true);
        }
    }

    /// Probes run in an independent task so the cadence stays consistent
    /// regardless of how long result handling takes.
    fn spawn_driver(&self, results_tx: mpsc::UnboundedSender<Result<(), CheckError>>) {
        let checks = Arc::clone(&self.checks);
        let mut stop_rx = self.stop_tx.subscribe();
        let period = self.cfg.interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    _ = stop_rx.changed() => break,

                    _ = ticker.tick() => {
                        let checks = checks.read().clone();
                        for check in checks {
                            let results_tx = results_tx.clone();
                            tokio::spawn(async move {
                                let _ = results_tx.send(check.check().await);
                            });
                        }
                    }
                }
            }
        });
    }

    fn spawn_consumer(&self, mut results_rx: mpsc::UnboundedReceiver<Result<(), CheckError>>) {
        let backend = Arc::clone(&self.backend);
        let listeners = Arc::clone(&self.listeners);
        let mut stop_rx = self.stop_tx.subscribe();
        let mut hysteresis = Hysteresis::new(self.cfg);

        tokio::spawn(async move {
            loop {
                // Biased select so that stop wins over a pending result.
                tokio::select! {
                    biased;

                    _ = stop_rx.changed() => break,

                    result = results_rx.recv() => {
                        let Some(result) = result else { break };
                        let Some(target) = hysteresis.observe(result.is_ok()) else {
                            continue;
                        };
                        if backend.set_state(target) {
                            info!(backend = %backend.addr(), state = %target, "backend state changed");
                            let listeners = listeners.read().clone();
                            for listener in listeners {
                                let backend = Arc::clone(&backend);
                                tokio::spawn(async move { listener(backend) });
                            }
                        }
                    }
                }
            }
        });
    }
}

/// Streak accounting for probe results.
///
/// At most one streak is non-zero at any moment; streaks are capped at
/// their threshold so a sustained run keeps reporting the same target
/// state without overflowing.
struct Hysteresis {
    cfg: HealthCheckConfig,
    healthy_streak: u32,
    unhealthy_streak: u32,
}

impl Hysteresis {
    fn new(cfg: HealthCheckConfig) -> Self {
        Self {
            cfg,
            healthy_streak: 0,
            unhealthy_streak: 0,
        }
    }

    /// Feed one probe result; returns the state the backend should be in
    /// once the corresponding streak has reached its threshold.
    fn observe(&mut self, ok: bool) -> Option<BackendState> {
        if ok {
            self.unhealthy_streak = 0;
            self.healthy_streak = (self.healthy_streak + 1).min(self.cfg.healthy_threshold);
            (self.healthy_streak >= self.cfg.healthy_threshold).then_some(BackendState::Healthy)
        } else {
            self.healthy_streak = 0;
            self.unhealthy_streak = (self.unhealthy_streak + 1).min(self.cfg.unhealthy_threshold);
            (self.unhealthy_streak >= self.cfg.unhealthy_threshold)
                .then_some(BackendState::Unhealthy)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio::time::timeout;

    /// A probe whose results are fed from the test via a channel.
    struct ScriptedCheck {
        results: Mutex<mpsc::Receiver<Result<(), CheckError>>>,
    }

    #[async_trait]
    impl HealthCheck for ScriptedCheck {
        async fn check(&self) -> Result<(), CheckError> {
            self.results
                .lock()
                .await
                .recv()
                .await
                .unwrap_or(Err(CheckError::Timeout))
        }
    }

    fn test_config() -> HealthCheckConfig {
        HealthCheckConfig {
            timeout: Duration::from_millis(10),
            interval: Duration::from_millis(5),
            unhealthy_threshold: 3,
            healthy_threshold: 3,
        }
    }

    fn scripted_monitor() -> (
        Arc<Backend>,
        HealthMonitor,
        mpsc::Sender<Result<(), CheckError>>,
    ) {
        let backend = Arc::new(Backend::new("localhost:57803", BackendState::Healthy));
        let monitor = HealthMonitor::new(Arc::clone(&backend), test_config());
        let (probe_tx, probe_rx) = mpsc::channel(1);
        monitor.add_check(Arc::new(ScriptedCheck {
            results: Mutex::new(probe_rx),
        }));
        (backend, monitor, probe_tx)
    }

    fn probe_failure() -> Result<(), CheckError> {
        Err(CheckError::Connect(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "health check failed",
        )))
    }

    #[tokio::test]
    async fn test_flapping_above_threshold() {
        let (backend, monitor, probe_tx) = scripted_monitor();

        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        monitor.register_listener(move |backend: Arc<Backend>| {
            let _ = update_tx.send(backend.state());
        });

        monitor.start().unwrap();
        assert_eq!(backend.state(), BackendState::Healthy);

        // Fail enough probes to cross the unhealthy threshold.
        for _ in 0..3 {
            probe_tx.send(probe_failure()).await.unwrap();
        }
        let update = timeout(Duration::from_secs(5), update_rx.recv())
            .await
            .expect("no update after unhealthy streak");
        assert_eq!(update, Some(BackendState::Unhealthy));
        assert_eq!(backend.state(), BackendState::Unhealthy);

        // Pass enough probes to cross back over the healthy threshold.
        for _ in 0..3 {
            probe_tx.send(Ok(())).await.unwrap();
        }
        let update = timeout(Duration::from_secs(5), update_rx.recv())
            .await
            .expect("no update after healthy streak");
        assert_eq!(update, Some(BackendState::Healthy));
        assert_eq!(backend.state(), BackendState::Healthy);

        monitor.stop();
    }

    #[tokio::test]
    async fn test_flapping_below_threshold() {
        let (backend, monitor, probe_tx) = scripted_monitor();

        let update_count = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&update_count);
        monitor.register_listener(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        monitor.start().unwrap();

        // Flap below both thresholds.
        for _ in 0..5 {
            for _ in 0..2 {
                probe_tx.send(probe_failure()).await.unwrap();
            }
            for _ in 0..2 {
                probe_tx.send(Ok(())).await.unwrap();
            }
        }

        // Allow the consumer to drain the final results.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(backend.state(), BackendState::Healthy);
        assert_eq!(update_count.load(Ordering::SeqCst), 0);

        monitor.stop();
    }

    #[tokio::test]
    async fn test_cannot_start_twice() {
        let (_, monitor, _probe_tx) = scripted_monitor();

        monitor.start().unwrap();
        assert!(matches!(monitor.start(), Err(MonitorError::AlreadyStarted)));

        monitor.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (_, monitor, _probe_tx) = scripted_monitor();

        monitor.start().unwrap();
        monitor.stop();
        monitor.stop();
    }

    #[test]
    fn test_hysteresis_streak_cap() {
        let mut hysteresis = Hysteresis::new(test_config());

        // A long failure run keeps reporting UNHEALTHY without drifting.
        for i in 0..10 {
            let target = hysteresis.observe(false);
            if i < 2 {
                assert_eq!(target, None);
            } else {
                assert_eq!(target, Some(BackendState::Unhealthy));
            }
        }
        assert_eq!(hysteresis.unhealthy_streak, 3);

        // One success resets the opposing streak.
        assert_eq!(hysteresis.observe(true), None);
        assert_eq!(hysteresis.unhealthy_streak, 0);
        assert_eq!(hysteresis.healthy_streak, 1);
    }
}
