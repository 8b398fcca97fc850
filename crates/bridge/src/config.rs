//! Gateway Configuration
//!
//! All knobs come from `TRYON_*` environment variables with engineering
//! defaults; anything unparseable falls back to the default.

use crate::channel::ChannelConfig;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// WebSocket listen address for client connections.
    pub ws_addr: String,
    /// HTTP listen address for health/stats/metrics.
    pub http_addr: String,
    /// Inference backend gRPC endpoint.
    pub inference_addr: String,
    /// Per-session bound on frames queued toward the backend. When the
    /// queue is at capacity the incoming frame is dropped, never buffered.
    pub frame_queue_capacity: usize,
    /// Budget for opening a session's inference channel before the
    /// connection is failed.
    pub channel_open_timeout: Duration,
    /// Stream (re)establishment attempts beyond the first.
    pub channel_retries: u32,
    /// Initial backoff between attempts; doubles per retry.
    pub channel_backoff: Duration,
    /// Stall detection on stream writes.
    pub stream_send_timeout: Duration,
    /// Sessions idle longer than this are evicted by the sweeper.
    pub max_idle: Duration,
    pub sweep_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ws_addr: env::var("TRYON_WS_ADDR").unwrap_or_else(|_| "0.0.0.0:8765".to_string()),
            http_addr: env::var("TRYON_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8766".to_string()),
            inference_addr: env::var("TRYON_INFERENCE_ADDR")
                .unwrap_or_else(|_| "http://localhost:50052".to_string()),
            frame_queue_capacity: env_parsed("TRYON_FRAME_QUEUE_CAPACITY", 5),
            channel_open_timeout: Duration::from_millis(env_parsed(
                "TRYON_CHANNEL_OPEN_TIMEOUT_MS",
                5_000,
            )),
            channel_retries: env_parsed("TRYON_CHANNEL_RETRIES", 3),
            channel_backoff: Duration::from_millis(env_parsed("TRYON_CHANNEL_BACKOFF_MS", 200)),
            stream_send_timeout: Duration::from_millis(env_parsed(
                "TRYON_STREAM_SEND_TIMEOUT_MS",
                600,
            )),
            max_idle: Duration::from_secs(env_parsed("TRYON_MAX_IDLE_SECS", 300)),
            sweep_interval: Duration::from_secs(env_parsed("TRYON_SWEEP_INTERVAL_SECS", 60)),
        }
    }
}

impl GatewayConfig {
    /// The slice of configuration the inference channel client needs.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            endpoint: self.inference_addr.clone(),
            frame_queue_capacity: self.frame_queue_capacity,
            open_retries: self.channel_retries,
            backoff: self.channel_backoff,
            send_timeout: self.stream_send_timeout,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_budgets() {
        let config = GatewayConfig::default();
        assert_eq!(config.frame_queue_capacity, 5);
        assert_eq!(config.channel_open_timeout, Duration::from_secs(5));
        assert_eq!(config.channel_retries, 3);
        assert_eq!(config.channel_backoff, Duration::from_millis(200));
        assert_eq!(config.max_idle, Duration::from_secs(300));
    }
}
