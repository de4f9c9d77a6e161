//! Named counters and gauges with thread-safe registration.

mod counter;
mod gauge;
mod registry;

pub use counter::Counter;
pub use gauge::{Gauge, MetricValue};
pub use registry::{Metric, MetricsError, MetricsRegistry};
