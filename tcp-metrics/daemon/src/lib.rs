//! TCP Metrics Userspace Library
//!
//! Provides reusable components for loading the TCP capture probes,
//! draining their ring buffers, and aggregating the records.

pub mod channel;
pub mod collector;
pub mod config;
pub mod events;
pub mod exporter;
pub mod loader;
pub mod types;

pub use channel::EventChannel;
pub use collector::{CollectorLimits, MetricsCollector};
pub use config::{ConfigOverrides, ProbeConfig};
pub use events::EventProcessor;
pub use exporter::{ExporterType, JsonExporter, MetricsExporter, PrometheusExporter};
pub use loader::{ProbeLoader, StatsReader};
pub use types::*;
