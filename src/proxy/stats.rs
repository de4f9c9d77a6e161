//! Proxy-level metrics.
//!
//! Wraps the metrics registry with the fixed names the proxy exposes:
//! `requests`, `errors`, per-side `*.io.tx`/`*.io.rx` byte counters and
//! per-backend `active_connections` gauges.

use crate::backend::Backend;
use crate::metrics::{Counter, Gauge, Metric, MetricValue, MetricsRegistry};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

/// Bytes moved through one side of a proxy session.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoVolume {
    /// Bytes written to this side.
    pub tx: u64,
    /// Bytes read from this side.
    pub rx: u64,
}

/// All counters and gauges the proxy maintains.
pub struct ProxyStats {
    registry: MetricsRegistry,
    requests: Arc<Counter>,
    errors: Arc<Counter>,
}

impl ProxyStats {
    pub fn new() -> Self {
        let registry = MetricsRegistry::new();
        let requests = Arc::new(Counter::new());
        let errors = Arc::new(Counter::new());
        registry.register("requests", Metric::Counter(Arc::clone(&requests)));
        registry.register("errors", Metric::Counter(Arc::clone(&errors)));
        Self {
            registry,
            requests,
            errors,
        }
    }

    pub fn incr_requests(&self) {
        self.requests.incr();
    }

    pub fn incr_errors(&self) {
        self.errors.incr();
    }

    /// Record bytes exchanged with the client for one session.
    pub fn record_frontend_io(&self, io: IoVolume) {
        self.record_io("frontend", io);
    }

    /// Record bytes exchanged with a backend for one session.
    pub fn record_backend_io(&self, addr: &str, io: IoVolume) {
        self.record_io(&format!("backend.{}", addr), io);
    }

    /// Expose a backend's live connection count as a gauge.
    pub fn register_backend_gauge(&self, backend: &Arc<Backend>) {
        let sampled = Arc::clone(backend);
        let gauge = Gauge::uint(move || sampled.active_conns());
        self.registry.register(
            format!("backend.{}.active_connections", backend.addr()),
            Metric::Gauge(Arc::new(gauge)),
        );
    }

    // TODO: don't pessimistically allocate a fresh counter per call;
    // most of the time the name already exists.
    fn record_io(&self, prefix: &str, io: IoVolume) {
        for (suffix, bytes) in [(".io.tx", io.tx), (".io.rx", io.rx)] {
            let name = format!("{}{}", prefix, suffix);
            match self
                .registry
                .load_or_register_counter(name, Arc::new(Counter::new()))
            {
                Ok(counter) => {
                    counter.add(bytes);
                }
                Err(e) => error!(error = %e, "failed to record io counter"),
            }
        }
    }

    /// Snapshot every metric by name, sorted for stable output.
    pub fn snapshot(&self) -> BTreeMap<String, MetricValue> {
        let mut snapshot = BTreeMap::new();
        for (name, counter) in self.registry.counters() {
            snapshot.insert(name, MetricValue::Uint(counter.count()));
        }
        for (name, gauge) in self.registry.gauges() {
            snapshot.insert(name, gauge.value());
        }
        snapshot
    }
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendState;

    #[test]
    fn test_request_and_error_counters() {
        let stats = ProxyStats::new();

        stats.incr_requests();
        stats.incr_requests();
        stats.incr_errors();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot["requests"], MetricValue::Uint(2));
        assert_eq!(snapshot["errors"], MetricValue::Uint(1));
    }

    #[test]
    fn test_io_counters_accumulate() {
        let stats = ProxyStats::new();

        stats.record_frontend_io(IoVolume { tx: 6, rx: 3 });
        stats.record_frontend_io(IoVolume { tx: 4, rx: 2 });
        stats.record_backend_io("127.0.0.1:9000", IoVolume { tx: 3, rx: 6 });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot["frontend.io.tx"], MetricValue::Uint(10));
        assert_eq!(snapshot["frontend.io.rx"], MetricValue::Uint(5));
        assert_eq!(snapshot["backend.127.0.0.1:9000.io.tx"], MetricValue::Uint(3));
        assert_eq!(snapshot["backend.127.0.0.1:9000.io.rx"], MetricValue::Uint(6));
    }

    #[test]
    fn test_backend_gauge_tracks_live_count() {
        let stats = ProxyStats::new();
        let backend = Arc::new(Backend::new("127.0.0.1:9000", BackendState::Healthy));
        stats.register_backend_gauge(&backend);

        let name = "backend.127.0.0.1:9000.active_connections";
        assert_eq!(stats.snapshot()[name], MetricValue::Uint(0));

        backend.incr_active_conns();
        assert_eq!(stats.snapshot()[name], MetricValue::Uint(1));

        backend.decr_active_conns();
        assert_eq!(stats.snapshot()[name], MetricValue::Uint(0));
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let stats = ProxyStats::new();
        stats.record_backend_io("127.0.0.1:9000", IoVolume::default());

        let names: Vec<_> = stats.snapshot().into_keys().collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
