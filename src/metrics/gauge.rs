//! Gauge metric: a value sampled on demand.

use std::fmt;

/// A value read from a metric at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricValue {
    Uint(u64),
    Text(String),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Uint(v) => write!(f, "{}", v),
            MetricValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// A gauge measures a value by invoking a closure at read time.
///
/// The closure must be safe to call from any thread at any moment.
pub struct Gauge {
    measure: Box<dyn Fn() -> MetricValue + Send + Sync>,
}

impl Gauge {
    /// Create a gauge producing unsigned integer samples.
    pub fn uint(measure: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            measure: Box::new(move || MetricValue::Uint(measure())),
        }
    }

    /// Create a gauge producing textual samples.
    pub fn text(measure: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self {
            measure: Box::new(move || MetricValue::Text(measure())),
        }
    }

    /// Sample the gauge.
    pub fn value(&self) -> MetricValue {
        (self.measure)()
    }
}

impl fmt::Debug for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gauge").finish_non_exhaustive()
    }
}
