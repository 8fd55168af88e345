//! Telemetry plumbing.

pub mod metrics;

pub use metrics::{AgentMetrics, IpamMetrics, REGISTRY};
