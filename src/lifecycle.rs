//! Process wiring shared by the server and consumer binaries: engine
//! construction, the background metrics sampler, and signal handling.

use crate::cache::RouteCache;
use crate::config::Settings;
use crate::kafka::producer::EventPublisher;
use crate::metrics::Metrics;
use crate::read_path::ResolveEngine;
use crate::resilience::ResilienceManager;
use crate::store::RouteStore;
use crate::write_path::WriteEngine;
use std::sync::Arc;
use std::time::Duration;

/// Refresh interval for infrastructure gauges.
pub const SAMPLER_INTERVAL: Duration = Duration::from_secs(30);

/// Build the read and write engines against one set of clients. The circuit
/// breakers and budgets are clones sharing the manager's state.
pub fn build_engines(
    settings: &Settings,
    manager: &ResilienceManager,
    cache: Arc<dyn RouteCache>,
    store: Arc<dyn RouteStore>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Metrics,
) -> (Arc<ResolveEngine>, Arc<WriteEngine>) {
    let resolver = Arc::new(ResolveEngine::new(
        cache,
        store.clone(),
        manager.db_circuit().clone(),
        manager.cache_circuit().clone(),
        manager.cache_retry_budget().clone(),
        metrics.clone(),
        settings.app.positive_cache_ttl(),
        settings.app.negative_cache_ttl(),
    ));
    let writer = Arc::new(WriteEngine::new(
        store,
        publisher,
        manager.db_retry_budget().clone(),
        metrics,
    ));
    (resolver, writer)
}

/// Periodically refresh the infrastructure gauges from the live clients.
pub fn spawn_metrics_sampler(
    metrics: Metrics,
    store: Arc<dyn RouteStore>,
    cache: Arc<dyn RouteCache>,
    publisher: Arc<dyn EventPublisher>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            metrics.record_uptime();

            let pool = store.pool_status();
            metrics.db_pool_size.set(i64::from(pool.max_connections));
            metrics.db_pool_in_use.set(i64::from(pool.in_use));
            metrics.db_pool_available.set(i64::from(pool.available));

            metrics.cache_connected.set(i64::from(cache.ping().await.is_ok()));
            metrics.kafka_producer_ready.set(i64::from(publisher.is_ready()));
            tracing::debug!("system metrics updated");
        }
    })
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for SIGINT");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => tracing::error!(error = %err, "failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
