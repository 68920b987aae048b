//! Metrics module
//!
//! Prometheus counters for the parity engine, one registry per volume.

mod engine;

pub use engine::EngineMetrics;
