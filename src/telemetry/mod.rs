//! Telemetry: logging and metrics.
//!
//! Provides:
//! - Logging configuration and subscriber initialization for the binary
//! - The [`Logger`] and [`Metrics`] sinks a manager reports through

mod logger;
mod logging;
mod metrics;

pub use logger::{Logger, NoopLogger, TracingLogger};
pub use logging::{LogConfig, LogFormat, init_logging};
pub use metrics::{Metrics, MetricsError, MetricsRegistry, NoopMetrics, prefix};
