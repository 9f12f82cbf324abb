use std::time::Duration;

use anyhow::Result;
use prometheus::{CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};

/// Prometheus metrics for API service health and observability.
pub struct ApiMetrics {
    registry: Registry,

    /// Total API requests by route and outcome.
    pub requests_total: CounterVec,
    /// API request duration by route.
    pub request_duration: HistogramVec,
    /// Whether the ClickHouse read pool is connected (1=yes, 0=no).
    pub clickhouse_connected: Gauge,
}

impl ApiMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("requests_total", "Total API requests by route and outcome.")
                .namespace("viewoor"),
            &["route", "status"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "API request duration by route.")
                .namespace("viewoor")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["route"],
        )?;
        let clickhouse_connected = Gauge::with_opts(
            Opts::new(
                "clickhouse_connected",
                "Whether the ClickHouse read pool is connected (1=yes, 0=no).",
            )
            .namespace("viewoor"),
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(clickhouse_connected.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            clickhouse_connected,
        })
    }

    /// Records one finished request.
    pub fn observe(&self, route: &str, status: &str, duration: Duration) {
        self.requests_total.with_label_values(&[route, status]).inc();
        self.request_duration
            .with_label_values(&[route])
            .observe(duration.as_secs_f64());
    }

    /// Returns the underlying registry for the /metrics endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
