//! Prometheus series for the adapter engine.
//!
//! One registry per adapter; the public server exposes [`Metrics::export`]
//! at `/metrics`. Failure to register any series is fatal at startup.

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::EngineError;

/// All engine metric series, labelled by endpoint/transport where the
/// series is per-transport.
pub struct Metrics {
    registry: Registry,

    // Request path
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,

    // Cache
    pub cache_data_get_count: IntCounterVec,
    pub cache_data_set_count: IntCounterVec,
    pub cache_data_staleness_seconds: GaugeVec,
    pub total_data_staleness_seconds: GaugeVec,

    // Background executor
    pub bg_execute_total: IntCounterVec,
    pub bg_execute_errors: IntCounterVec,
    pub bg_execute_duration_seconds: HistogramVec,

    // WebSocket transport
    pub ws_connection_active: IntGauge,
    pub ws_connection_errors: IntCounter,
    pub ws_subscription_active: IntGaugeVec,
    pub ws_subscription_total: IntCounterVec,
    pub ws_message_total: IntCounterVec,

    // HTTP polling transport
    pub transport_polling_failure_count: IntCounterVec,
    pub transport_polling_duration_seconds: HistogramVec,

    // Rate limiting
    pub rate_limit_credits_spent_total: IntCounterVec,
}

impl Metrics {
    pub fn new(adapter_name: &str) -> Result<Self, EngineError> {
        let registry = Registry::new_custom(
            None,
            Some(
                [(String::from("adapter"), adapter_name.to_owned())]
                    .into_iter()
                    .collect(),
            ),
        )
        .map_err(internal)?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Inbound adapter requests"),
            &["endpoint", "status"],
        )
        .map_err(internal)?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "Foreground request latency",
            ),
            &["endpoint"],
        )
        .map_err(internal)?;

        let cache_data_get_count = IntCounterVec::new(
            Opts::new("cache_data_get_count", "Response cache reads"),
            &["endpoint", "transport", "outcome"],
        )
        .map_err(internal)?;

        let cache_data_set_count = IntCounterVec::new(
            Opts::new("cache_data_set_count", "Response cache writes"),
            &["endpoint", "transport"],
        )
        .map_err(internal)?;

        let cache_data_staleness_seconds = GaugeVec::new(
            Opts::new(
                "cache_data_staleness_seconds",
                "Seconds since the served entry was written",
            ),
            &["endpoint", "transport"],
        )
        .map_err(internal)?;

        let total_data_staleness_seconds = GaugeVec::new(
            Opts::new(
                "total_data_staleness_seconds",
                "Seconds since the provider produced the served value",
            ),
            &["endpoint", "transport"],
        )
        .map_err(internal)?;

        let bg_execute_total = IntCounterVec::new(
            Opts::new("bg_execute_total", "Background ticks executed"),
            &["endpoint", "transport"],
        )
        .map_err(internal)?;

        let bg_execute_errors = IntCounterVec::new(
            Opts::new("bg_execute_errors", "Background ticks that failed"),
            &["endpoint", "transport"],
        )
        .map_err(internal)?;

        let bg_execute_duration_seconds = HistogramVec::new(
            HistogramOpts::new("bg_execute_duration_seconds", "Background tick duration"),
            &["endpoint", "transport"],
        )
        .map_err(internal)?;

        let ws_connection_active =
            IntGauge::new("ws_connection_active", "Open WebSocket connections")
                .map_err(internal)?;

        let ws_connection_errors =
            IntCounter::new("ws_connection_errors", "WebSocket socket-level errors")
                .map_err(internal)?;

        let ws_subscription_active = IntGaugeVec::new(
            Opts::new("ws_subscription_active", "Desired WebSocket subscriptions"),
            &["endpoint"],
        )
        .map_err(internal)?;

        let ws_subscription_total = IntCounterVec::new(
            Opts::new("ws_subscription_total", "Subscribe frames sent"),
            &["endpoint"],
        )
        .map_err(internal)?;

        let ws_message_total = IntCounterVec::new(
            Opts::new("ws_message_total", "Inbound WebSocket messages"),
            &["endpoint", "outcome"],
        )
        .map_err(internal)?;

        let transport_polling_failure_count = IntCounterVec::new(
            Opts::new(
                "transport_polling_failure_count",
                "Subscriptions whose poll attempt failed",
            ),
            &["endpoint"],
        )
        .map_err(internal)?;

        let transport_polling_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "transport_polling_duration_seconds",
                "Duration of one polling pass",
            ),
            &["endpoint"],
        )
        .map_err(internal)?;

        let rate_limit_credits_spent_total = IntCounterVec::new(
            Opts::new(
                "rate_limit_credits_spent_total",
                "Rate-limit credits consumed by foreground requests",
            ),
            &["endpoint"],
        )
        .map_err(internal)?;

        for collector in [
            Box::new(http_requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(http_request_duration_seconds.clone()),
            Box::new(cache_data_get_count.clone()),
            Box::new(cache_data_set_count.clone()),
            Box::new(cache_data_staleness_seconds.clone()),
            Box::new(total_data_staleness_seconds.clone()),
            Box::new(bg_execute_total.clone()),
            Box::new(bg_execute_errors.clone()),
            Box::new(bg_execute_duration_seconds.clone()),
            Box::new(ws_connection_active.clone()),
            Box::new(ws_connection_errors.clone()),
            Box::new(ws_subscription_active.clone()),
            Box::new(ws_subscription_total.clone()),
            Box::new(ws_message_total.clone()),
            Box::new(transport_polling_failure_count.clone()),
            Box::new(transport_polling_duration_seconds.clone()),
            Box::new(rate_limit_credits_spent_total.clone()),
        ] {
            registry.register(collector).map_err(internal)?;
        }

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            cache_data_get_count,
            cache_data_set_count,
            cache_data_staleness_seconds,
            total_data_staleness_seconds,
            bg_execute_total,
            bg_execute_errors,
            bg_execute_duration_seconds,
            ws_connection_active,
            ws_connection_errors,
            ws_subscription_active,
            ws_subscription_total,
            ws_message_total,
            transport_polling_failure_count,
            transport_polling_duration_seconds,
            rate_limit_credits_spent_total,
        })
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn export(&self) -> Result<String, EngineError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(internal)?;
        String::from_utf8(buffer).map_err(|error| EngineError::internal(error.to_string()))
    }
}

fn internal(error: prometheus::Error) -> EngineError {
    EngineError::internal(format!("metrics registration failed: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_required_series() {
        let metrics = Metrics::new("test-adapter").expect("registry must build");

        metrics
            .http_requests_total
            .with_label_values(&["price", "200"])
            .inc();
        metrics.ws_connection_active.set(1);
        metrics
            .bg_execute_total
            .with_label_values(&["price", "ws"])
            .inc();

        let exported = metrics.export().expect("export must succeed");
        for series in [
            "http_requests_total",
            "ws_connection_active",
            "bg_execute_total",
        ] {
            assert!(exported.contains(series), "missing series {series}");
        }
    }

    #[test]
    fn two_adapters_do_not_share_a_registry() {
        let first = Metrics::new("one").expect("registry must build");
        let second = Metrics::new("two").expect("registry must build");

        first
            .http_requests_total
            .with_label_values(&["price", "200"])
            .inc();

        let exported = second.export().expect("export must succeed");
        assert!(!exported.contains("endpoint=\"price\""));
    }
}
