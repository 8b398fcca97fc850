//! Bridge Metrics
//!
//! Prometheus instruments for session lifecycle, frame throughput,
//! backpressure drops and inference channel health. Cheap to clone; all
//! clones share the same instruments.

use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Registry};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct BridgeMetrics {
    inner: Arc<BridgeMetricsInner>,
}

#[derive(Debug)]
struct BridgeMetricsInner {
    sessions_active: Gauge,
    sessions_total: Counter,
    frames_in_total: Counter,
    frames_out_total: Counter,
    frames_dropped_total: Counter,
    malformed_frames_total: Counter,
    channel_reconnects_total: Counter,
    channel_failures_total: Counter,
    frame_latency_ms: Histogram,
    session_duration_seconds: Histogram,
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BridgeMetricsInner {
                sessions_active: Gauge::new("tryon_bridge_sessions_active", "Active sessions")
                    .unwrap(),
                sessions_total: Counter::new(
                    "tryon_bridge_sessions_total",
                    "Total sessions created",
                )
                .unwrap(),
                frames_in_total: Counter::new(
                    "tryon_bridge_frames_in_total",
                    "Frames forwarded to the inference backend",
                )
                .unwrap(),
                frames_out_total: Counter::new(
                    "tryon_bridge_frames_out_total",
                    "Processed frames delivered to clients",
                )
                .unwrap(),
                frames_dropped_total: Counter::new(
                    "tryon_bridge_frames_dropped_total",
                    "Frames dropped under backpressure",
                )
                .unwrap(),
                malformed_frames_total: Counter::new(
                    "tryon_bridge_malformed_frames_total",
                    "Client frames rejected as malformed",
                )
                .unwrap(),
                channel_reconnects_total: Counter::new(
                    "tryon_bridge_channel_reconnects_total",
                    "Inference stream reconnect attempts",
                )
                .unwrap(),
                channel_failures_total: Counter::new(
                    "tryon_bridge_channel_failures_total",
                    "Inference channels lost after exhausting retries",
                )
                .unwrap(),
                frame_latency_ms: Histogram::with_opts(HistogramOpts::new(
                    "tryon_bridge_frame_latency_ms",
                    "Capture-to-delivery latency in milliseconds",
                ))
                .unwrap(),
                session_duration_seconds: Histogram::with_opts(HistogramOpts::new(
                    "tryon_bridge_session_duration_seconds",
                    "Session duration in seconds",
                ))
                .unwrap(),
            }),
        }
    }

    pub fn register(&self, registry: &Registry) {
        registry
            .register(Box::new(self.inner.sessions_active.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.sessions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.frames_in_total.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.frames_out_total.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.frames_dropped_total.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.malformed_frames_total.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.channel_reconnects_total.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.channel_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.frame_latency_ms.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.session_duration_seconds.clone()))
            .unwrap();
    }

    pub fn session_opened(&self) {
        self.inner.sessions_active.inc();
        self.inner.sessions_total.inc();
    }

    pub fn session_closed(&self, duration_seconds: f64) {
        self.inner.sessions_active.dec();
        self.inner.session_duration_seconds.observe(duration_seconds);
    }

    pub fn record_frame_in(&self) {
        self.inner.frames_in_total.inc();
    }

    pub fn record_frame_out(&self, latency_ms: f64) {
        self.inner.frames_out_total.inc();
        self.inner.frame_latency_ms.observe(latency_ms);
    }

    pub fn record_frame_dropped(&self) {
        self.inner.frames_dropped_total.inc();
    }

    pub fn record_malformed_frame(&self) {
        self.inner.malformed_frames_total.inc();
    }

    pub fn record_channel_reconnect(&self) {
        self.inner.channel_reconnects_total.inc();
    }

    pub fn record_channel_failure(&self) {
        self.inner.channel_failures_total.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_clean_on_a_fresh_registry() {
        let metrics = BridgeMetrics::new();
        let registry = Registry::new();
        metrics.register(&registry);

        metrics.session_opened();
        metrics.record_frame_in();
        metrics.record_frame_out(12.5);
        metrics.session_closed(3.0);

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "tryon_bridge_sessions_total"));
    }
}
