//! Prometheus metrics registry.
//!
//! All counters, histograms, and gauges scraped at `/metrics` are registered
//! here against one injected registry. Business counters are incremented by
//! the read/write engines and the HTTP middleware; infrastructure gauges are
//! refreshed by the background sampler.

use prometheus::{
    Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Read path
    pub resolve_requests_total: IntCounter,
    pub resolve_cache_hit_total: IntCounter,
    pub resolve_cache_miss_total: IntCounter,
    pub resolve_negative_cache_hit_total: IntCounter,
    pub resolve_latency_seconds: Histogram,

    // Write path
    pub write_requests_total: IntCounter,
    pub write_success_total: IntCounter,
    pub write_failure_total: IntCounter,
    pub write_latency_seconds: Histogram,

    // Broker
    pub kafka_events_published_total: IntCounterVec,
    pub kafka_events_failed_total: IntCounterVec,

    // Relational store
    pub db_queries_total: IntCounter,
    pub db_connection_errors_total: IntCounter,

    // HTTP surface
    pub api_requests_total: IntCounterVec,
    pub api_request_duration_seconds: HistogramVec,

    // Correlation
    pub correlation_ids_generated_total: IntCounter,
    pub correlation_ids_provided_total: IntCounter,

    // Infrastructure gauges, refreshed by the sampler
    pub db_pool_size: IntGauge,
    pub db_pool_available: IntGauge,
    pub db_pool_in_use: IntGauge,
    pub cache_connected: IntGauge,
    pub kafka_producer_ready: IntGauge,
    pub application_uptime_seconds: Gauge,

    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let resolve_requests_total =
            IntCounter::new("resolve_requests_total", "Total number of resolve requests")?;
        let resolve_cache_hit_total =
            IntCounter::new("resolve_cache_hit_total", "Total cache hits")?;
        let resolve_cache_miss_total =
            IntCounter::new("resolve_cache_miss_total", "Total cache misses")?;
        let resolve_negative_cache_hit_total =
            IntCounter::new("resolve_negative_cache_hit_total", "Total negative cache hits")?;
        let resolve_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "resolve_latency_seconds",
            "Latency of resolve requests",
        ))?;

        let write_requests_total =
            IntCounter::new("write_requests_total", "Total number of write requests")?;
        let write_success_total =
            IntCounter::new("write_success_total", "Total successful writes")?;
        let write_failure_total = IntCounter::new("write_failure_total", "Total failed writes")?;
        let write_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "write_latency_seconds",
            "Latency of write requests",
        ))?;

        let kafka_events_published_total = IntCounterVec::new(
            Opts::new("kafka_events_published_total", "Route events published to Kafka"),
            &["action"],
        )?;
        let kafka_events_failed_total = IntCounterVec::new(
            Opts::new("kafka_events_failed_total", "Route events that failed to publish"),
            &["action"],
        )?;

        let db_queries_total =
            IntCounter::new("db_queries_total", "Total database queries executed")?;
        let db_connection_errors_total = IntCounter::new(
            "db_connection_errors_total",
            "Failures acquiring a database connection",
        )?;

        let api_requests_total = IntCounterVec::new(
            Opts::new("api_requests_total", "Total number of API requests"),
            &["method", "endpoint", "status_code"],
        )?;
        let api_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "api_request_duration_seconds",
                "Duration of API requests in seconds",
            ),
            &["method", "endpoint"],
        )?;

        let correlation_ids_generated_total = IntCounter::new(
            "correlation_ids_generated_total",
            "Correlation ids generated for requests without one",
        )?;
        let correlation_ids_provided_total = IntCounter::new(
            "correlation_ids_provided_total",
            "Correlation ids supplied by clients",
        )?;

        let db_pool_size =
            IntGauge::new("db_pool_size", "Configured size of the database pool")?;
        let db_pool_available =
            IntGauge::new("db_pool_available", "Available connections in the database pool")?;
        let db_pool_in_use =
            IntGauge::new("db_pool_in_use", "Connections currently in use")?;
        let cache_connected =
            IntGauge::new("cache_connected", "Whether the cache is reachable (1) or not (0)")?;
        let kafka_producer_ready = IntGauge::new(
            "kafka_producer_ready",
            "Whether the Kafka producer is ready (1) or not (0)",
        )?;
        let application_uptime_seconds = Gauge::new(
            "application_uptime_seconds",
            "Seconds the application has been running",
        )?;

        registry.register(Box::new(resolve_requests_total.clone()))?;
        registry.register(Box::new(resolve_cache_hit_total.clone()))?;
        registry.register(Box::new(resolve_cache_miss_total.clone()))?;
        registry.register(Box::new(resolve_negative_cache_hit_total.clone()))?;
        registry.register(Box::new(resolve_latency_seconds.clone()))?;
        registry.register(Box::new(write_requests_total.clone()))?;
        registry.register(Box::new(write_success_total.clone()))?;
        registry.register(Box::new(write_failure_total.clone()))?;
        registry.register(Box::new(write_latency_seconds.clone()))?;
        registry.register(Box::new(kafka_events_published_total.clone()))?;
        registry.register(Box::new(kafka_events_failed_total.clone()))?;
        registry.register(Box::new(db_queries_total.clone()))?;
        registry.register(Box::new(db_connection_errors_total.clone()))?;
        registry.register(Box::new(api_requests_total.clone()))?;
        registry.register(Box::new(api_request_duration_seconds.clone()))?;
        registry.register(Box::new(correlation_ids_generated_total.clone()))?;
        registry.register(Box::new(correlation_ids_provided_total.clone()))?;
        registry.register(Box::new(db_pool_size.clone()))?;
        registry.register(Box::new(db_pool_available.clone()))?;
        registry.register(Box::new(db_pool_in_use.clone()))?;
        registry.register(Box::new(cache_connected.clone()))?;
        registry.register(Box::new(kafka_producer_ready.clone()))?;
        registry.register(Box::new(application_uptime_seconds.clone()))?;

        Ok(Self {
            registry,
            resolve_requests_total,
            resolve_cache_hit_total,
            resolve_cache_miss_total,
            resolve_negative_cache_hit_total,
            resolve_latency_seconds,
            write_requests_total,
            write_success_total,
            write_failure_total,
            write_latency_seconds,
            kafka_events_published_total,
            kafka_events_failed_total,
            db_queries_total,
            db_connection_errors_total,
            api_requests_total,
            api_request_duration_seconds,
            correlation_ids_generated_total,
            correlation_ids_provided_total,
            db_pool_size,
            db_pool_available,
            db_pool_in_use,
            cache_connected,
            kafka_producer_ready,
            application_uptime_seconds,
            started_at: Instant::now(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }

    pub fn record_uptime(&self) {
        self.application_uptime_seconds.set(self.started_at.elapsed().as_secs_f64());
    }
}
