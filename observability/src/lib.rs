//! # Observability Module
//!
//! Generation observability:
//! - `GenerationTelemetry`: emissions to the `metrics` facade, Prometheus exporter setup
//! - `MetricsTracker`: in-process aggregates, analytics and recommendations

pub mod metrics_tracker;
pub mod telemetry;

pub use metrics_tracker::{GenerationAnalytics, MetricsKey, MetricsTracker, RequestHandle};
pub use telemetry::{
    GenerationTelemetry, LATENCY_BUCKETS_MS, init_telemetry, init_telemetry_with_endpoint
};
