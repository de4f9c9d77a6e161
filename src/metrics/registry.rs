//! Named metric registry.
//!
//! Thread-safe storage for counters and gauges, with atomic
//! load-or-register semantics and snapshot enumeration.

use crate::metrics::{Counter, Gauge};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// A registered metric: either a counter or a gauge.
#[derive(Debug, Clone)]
pub enum Metric {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
}

/// Error raised when a metric name is already taken by the other kind.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metric '{0}' is already registered as a gauge")]
    NotACounter(String),

    #[error("metric '{0}' is already registered as a counter")]
    NotAGauge(String),
}

/// Thread-safe registry mapping opaque names to metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    metrics: Arc<DashMap<String, Metric>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a metric unconditionally, replacing any existing entry.
    pub fn register(&self, name: impl Into<String>, metric: Metric) {
        self.metrics.insert(name.into(), metric);
    }

    /// Return the counter registered under `name`, inserting `counter`
    /// if the name is free. The same counter is returned to every caller.
    pub fn load_or_register_counter(
        &self,
        name: impl Into<String>,
        counter: Arc<Counter>,
    ) -> Result<Arc<Counter>, MetricsError> {
        let name = name.into();
        let entry = self
            .metrics
            .entry(name.clone())
            .or_insert_with(|| Metric::Counter(counter));
        match entry.value() {
            Metric::Counter(c) => Ok(Arc::clone(c)),
            Metric::Gauge(_) => Err(MetricsError::NotACounter(name)),
        }
    }

    /// Symmetric to [`MetricsRegistry::load_or_register_counter`].
    pub fn load_or_register_gauge(
        &self,
        name: impl Into<String>,
        gauge: Arc<Gauge>,
    ) -> Result<Arc<Gauge>, MetricsError> {
        let name = name.into();
        let entry = self
            .metrics
            .entry(name.clone())
            .or_insert_with(|| Metric::Gauge(gauge));
        match entry.value() {
            Metric::Gauge(g) => Ok(Arc::clone(g)),
            Metric::Counter(_) => Err(MetricsError::NotAGauge(name)),
        }
    }

    /// Snapshot of every registered metric.
    pub fn all(&self) -> HashMap<String, Metric> {
        self.metrics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Snapshot of the registered counters.
    pub fn counters(&self) -> HashMap<String, Arc<Counter>> {
        self.metrics
            .iter()
            .filter_map(|entry| match entry.value() {
                Metric::Counter(c) => Some((entry.key().clone(), Arc::clone(c))),
                Metric::Gauge(_) => None,
            })
            .collect()
    }

    /// Snapshot of the registered gauges.
    pub fn gauges(&self) -> HashMap<String, Arc<Gauge>> {
        self.metrics
            .iter()
            .filter_map(|entry| match entry.value() {
                Metric::Gauge(g) => Some((entry.key().clone(), Arc::clone(g))),
                Metric::Counter(_) => None,
            })
            .collect()
    }
}
