//! # dt-observability
//!
//! Logging and metrics infrastructure for the drop test analysis engine.
//!
//! Structured logging goes through `tracing`; counters and gauges emitted by
//! `dt-core` are described here so any installed `metrics` recorder can
//! export them with help text.

pub mod logging;
pub mod metrics;

pub use logging::{build_subscriber, init_logging, init_logging_with_config, LoggingConfig};
pub use metrics::{register_metrics, METRIC_NAMES};
