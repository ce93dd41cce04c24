//! Prometheus metrics
//!
//! One `MetricsContext` per process. A thin, explicit wrapper around the
//! `prometheus` crate so the lifecycle callbacks only touch gauge/counter
//! handles.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus registry plus the listener-lifecycle handles
#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,

    /// Live listener count
    pub current_clients: IntGauge,

    /// Cumulative connected listeners
    pub total_clients: IntCounter,
}

impl MetricsContext {
    /// Create a new registry and register the standard metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let current_clients = IntGauge::with_opts(Opts::new(
            "streama_current_clients",
            "Number of currently connected listeners",
        ))?;
        let total_clients = IntCounter::with_opts(Opts::new(
            "streama_total_clients",
            "Total listeners that ever connected",
        ))?;

        registry.register(Box::new(current_clients.clone()))?;
        registry.register(Box::new(total_clients.clone()))?;

        Ok(Self {
            registry,
            current_clients,
            total_clients,
        })
    }

    /// Encode the current metric families in the Prometheus text format
    pub fn encode_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}
