//! Control-plane server entrypoint.
//!
//! Startup order: configuration, resilience manager, relational pool
//! (eager), cache and audit clients (lazy), event producer, HTTP router,
//! metrics sampler, bind. Shutdown reverses it behind the drain gate.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use traffic_manager::api::{self, AppState};
use traffic_manager::audit::{AuditStore, MongoAuditStore};
use traffic_manager::cache::{RedisCache, RouteCache};
use traffic_manager::config::Settings;
use traffic_manager::kafka::producer::{EventPublisher, KafkaPublisher};
use traffic_manager::lifecycle;
use traffic_manager::metrics::Metrics;
use traffic_manager::resilience::ResilienceManager;
use traffic_manager::store::{PgRouteStore, RouteStore};

#[tokio::main]
async fn main() {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.app.tracing_directive())),
        )
        .init();

    if let Err(err) = run(settings).await {
        tracing::error!(error = %err, "fatal error");
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = Metrics::new()?;
    let resilience = Arc::new(ResilienceManager::new());

    // The relational store is the one eager dependency; everything else
    // connects lazily and degrades gracefully.
    let pg = Arc::new(PgRouteStore::connect(&settings.db).await?);
    let store: Arc<dyn RouteStore> = pg.clone();

    let cache: Arc<dyn RouteCache> = Arc::new(RedisCache::new(&settings.redis)?);
    let audit: Arc<dyn AuditStore> = Arc::new(MongoAuditStore::new(settings.mongodb.clone()));

    let kafka_publisher = Arc::new(KafkaPublisher::new(&settings.kafka)?);
    let publisher: Arc<dyn EventPublisher> = kafka_publisher.clone();

    let (resolver, writer) = lifecycle::build_engines(
        &settings,
        &resilience,
        cache.clone(),
        store.clone(),
        publisher.clone(),
        metrics.clone(),
    );

    let state = AppState {
        resilience: resilience.clone(),
        resolver,
        writer,
        store: store.clone(),
        cache: cache.clone(),
        audit,
        publisher: publisher.clone(),
        metrics: metrics.clone(),
    };

    let sampler = lifecycle::spawn_metrics_sampler(
        metrics,
        store,
        cache,
        publisher,
        lifecycle::SAMPLER_INTERVAL,
    );

    let app = api::router(state);
    let addr = format!("{}:{}", settings.app.api_host, settings.app.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, environment = %settings.app.environment, "traffic-manager listening");

    let drainer = resilience.drainer().clone();
    let drain_timeout = settings.app.drain_timeout();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            lifecycle::shutdown_signal().await;
            tracing::info!("shutdown signal received, draining");
            drainer.start_drain();
            if drainer.await_drain(drain_timeout).await {
                tracing::info!("drain complete");
            } else {
                tracing::warn!(
                    in_flight = drainer.in_flight(),
                    "drain timeout elapsed, abandoning remaining requests"
                );
            }
        })
        .await?;

    // Ordered shutdown: stop sampling, flush the producer, close the pool.
    sampler.abort();
    kafka_publisher.flush(Duration::from_secs(10));
    pg.close().await;
    tracing::info!("shutdown complete");
    Ok(())
}
