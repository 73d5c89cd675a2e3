//! Metrics surface. Registers and updates `prometheus` metrics; the HTTP
//! endpoint that serves them is an external collaborator — this crate only
//! provides `encode()` so a host binary can mount `/metrics` trivially. Each
//! `Metrics` owns its own `Registry` rather than a single global one, so
//! tests can construct independent instances.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};

pub struct Metrics {
    registry: Registry,
    pub messages_processed_total: IntCounter,
    pub messages_error_total: IntCounter,
    pub upserts_total: IntCounter,
    pub database_writes_failed_total: IntCounter,
    pub trust_recompute_total: IntCounter,
    pub ingest_latency_seconds: Histogram,
    pub processing_lag_seconds: IntGauge,
    pub pending_messages: IntGauge,
    pub backpressure_paused_total: IntCounter,
    pub backpressure_resumed_total: IntCounter,
    pub backpressure_pause_duration_seconds: Histogram,
    pub reconnection_attempts_total: IntCounter,
    pub reconnection_success_total: IntCounter,
}

impl Metrics {
    pub fn new(registry: Registry) -> Result<Self, prometheus::Error> {
        let messages_processed_total = IntCounter::with_opts(Opts::new(
            "messages_processed_total",
            "Frames handed to the processor",
        ))?;
        let messages_error_total = IntCounter::with_opts(Opts::new(
            "messages_error_total",
            "Frames failing decode/validate/map",
        ))?;
        let upserts_total = IntCounter::with_opts(Opts::new(
            "upserts_total",
            "Successful repository applies (creates + updates)",
        ))?;
        let database_writes_failed_total = IntCounter::with_opts(Opts::new(
            "database_writes_failed_total",
            "Transactions aborted",
        ))?;
        let trust_recompute_total = IntCounter::with_opts(Opts::new(
            "trust_recompute_total",
            "Reserved; emitted by downstream consumers of the mapped stream",
        ))?;
        let ingest_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "ingest_latency_seconds",
            "End-to-end per-frame latency",
        ))?;
        let processing_lag_seconds = IntGauge::with_opts(Opts::new(
            "processing_lag_seconds",
            "Wall-clock minus current frame's sequence-time",
        ))?;
        let pending_messages =
            IntGauge::with_opts(Opts::new("pending_messages", "C7 queue depth"))?;
        let backpressure_paused_total =
            IntCounter::with_opts(Opts::new("backpressure_paused_total", "Pause events"))?;
        let backpressure_resumed_total =
            IntCounter::with_opts(Opts::new("backpressure_resumed_total", "Resume events"))?;
        let backpressure_pause_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "backpressure_pause_duration_seconds",
            "Pause lengths",
        ))?;
        let reconnection_attempts_total = IntCounter::with_opts(Opts::new(
            "reconnection_attempts_total",
            "Connect failures + retries",
        ))?;
        let reconnection_success_total = IntCounter::with_opts(Opts::new(
            "reconnection_success_total",
            "Successful connects after a previous failure",
        ))?;

        registry.register(Box::new(messages_processed_total.clone()))?;
        registry.register(Box::new(messages_error_total.clone()))?;
        registry.register(Box::new(upserts_total.clone()))?;
        registry.register(Box::new(database_writes_failed_total.clone()))?;
        registry.register(Box::new(trust_recompute_total.clone()))?;
        registry.register(Box::new(ingest_latency_seconds.clone()))?;
        registry.register(Box::new(processing_lag_seconds.clone()))?;
        registry.register(Box::new(pending_messages.clone()))?;
        registry.register(Box::new(backpressure_paused_total.clone()))?;
        registry.register(Box::new(backpressure_resumed_total.clone()))?;
        registry.register(Box::new(backpressure_pause_duration_seconds.clone()))?;
        registry.register(Box::new(reconnection_attempts_total.clone()))?;
        registry.register(Box::new(reconnection_success_total.clone()))?;

        Ok(Self {
            registry,
            messages_processed_total,
            messages_error_total,
            upserts_total,
            database_writes_failed_total,
            trust_recompute_total,
            ingest_latency_seconds,
            processing_lag_seconds,
            pending_messages,
            backpressure_paused_total,
            backpressure_resumed_total,
            backpressure_pause_duration_seconds,
            reconnection_attempts_total,
            reconnection_success_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let families = self.registry.gather();
        prometheus::TextEncoder::new().encode_to_string(&families)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_without_name_collisions() {
        let metrics = Metrics::new(Registry::new()).unwrap();
        metrics.messages_processed_total.inc();
        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("messages_processed_total"));
    }
}
