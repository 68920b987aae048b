//! Engine metrics
//!
//! Counters are updated by the builder, the aggregator and the state
//! machine. `gather_text()` renders them in the Prometheus exposition
//! format.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

const NAMESPACE: &str = "raidp";

/// Prometheus metrics for one volume.
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    registry: Registry,

    /// Work units resolved, by outcome (ok / failed)
    units_resolved: IntCounterVec,

    /// Sub-operation failures, by chunk
    subop_failures: IntCounterVec,

    /// Chunk transitions, by target state
    chunk_transitions: IntCounterVec,

    /// Read segments served by XOR reconstruction
    reconstructions: IntCounter,

    /// Failed reads reissued
    read_retries: IntCounter,

    /// Writes rejected because the target chunk was offline
    rejected_writes: IntCounter,

    /// Work units deferred behind an overlapping unit
    deferred_units: IntCounter,

    /// Work units currently alive
    inflight_units: IntGauge,
}

impl EngineMetrics {
    pub fn new(volume: &str) -> Result<Self> {
        let registry = Registry::new_custom(
            Some(NAMESPACE.to_string()),
            Some([("volume".to_string(), volume.to_string())].into()),
        )
        .map_err(metrics_error)?;

        let units_resolved = IntCounterVec::new(
            Opts::new("work_units_resolved_total", "Work units resolved"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let subop_failures = IntCounterVec::new(
            Opts::new("subop_failures_total", "Failed physical sub-operations"),
            &["chunk"],
        )
        .map_err(metrics_error)?;
        let chunk_transitions = IntCounterVec::new(
            Opts::new("chunk_transitions_total", "Chunk state transitions"),
            &["state"],
        )
        .map_err(metrics_error)?;
        let reconstructions = IntCounter::new(
            "reconstructed_segments_total",
            "Read segments rebuilt from parity",
        )
        .map_err(metrics_error)?;
        let read_retries =
            IntCounter::new("read_retries_total", "Failed reads reissued")
                .map_err(metrics_error)?;
        let rejected_writes = IntCounter::new(
            "rejected_writes_total",
            "Writes rejected because the data chunk is offline",
        )
        .map_err(metrics_error)?;
        let deferred_units = IntCounter::new(
            "deferred_work_units_total",
            "Work units deferred behind an overlapping work unit",
        )
        .map_err(metrics_error)?;
        let inflight_units = IntGauge::new("inflight_work_units", "Work units alive")
            .map_err(metrics_error)?;

        registry
            .register(Box::new(units_resolved.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(subop_failures.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(chunk_transitions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(reconstructions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(read_retries.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(rejected_writes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(deferred_units.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(inflight_units.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            units_resolved,
            subop_failures,
            chunk_transitions,
            reconstructions,
            read_retries,
            rejected_writes,
            deferred_units,
            inflight_units,
        })
    }

    pub fn record_resolved(&self, ok: bool) {
        let outcome = if ok { "ok" } else { "failed" };
        self.units_resolved.with_label_values(&[outcome]).inc();
    }

    pub fn record_subop_failure(&self, chunk: usize) {
        let chunk = chunk.to_string();
        self.subop_failures
            .with_label_values(&[chunk.as_str()])
            .inc();
    }

    pub fn record_transition(&self, state: &str) {
        self.chunk_transitions.with_label_values(&[state]).inc();
    }

    pub fn record_reconstructions(&self, segments: usize) {
        self.reconstructions.inc_by(segments as u64);
    }

    pub fn record_read_retry(&self) {
        self.read_retries.inc();
    }

    pub fn record_rejected_write(&self) {
        self.rejected_writes.inc();
    }

    pub fn record_deferred(&self) {
        self.deferred_units.inc();
    }

    pub fn set_inflight(&self, units: usize) {
        self.inflight_units.set(units as i64);
    }

    pub fn resolved(&self, ok: bool) -> u64 {
        let outcome = if ok { "ok" } else { "failed" };
        self.units_resolved.with_label_values(&[outcome]).get()
    }

    pub fn subop_failures(&self, chunk: usize) -> u64 {
        let chunk = chunk.to_string();
        self.subop_failures
            .with_label_values(&[chunk.as_str()])
            .get()
    }

    pub fn reconstructions(&self) -> u64 {
        self.reconstructions.get()
    }

    pub fn read_retries(&self) -> u64 {
        self.read_retries.get()
    }

    pub fn rejected_writes(&self) -> u64 {
        self.rejected_writes.get()
    }

    pub fn deferred(&self) -> u64 {
        self.deferred_units.get()
    }

    /// Render every metric in the text exposition format.
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding: {e}")))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {e}"))
}
