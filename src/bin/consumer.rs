//! Consumer worker entrypoint.
//!
//! Runs exactly one worker group over the route-events topic. Each kind
//! initializes only the clients it needs, consumes until SIGINT/SIGTERM,
//! then closes them in reverse order of initialization.

use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use traffic_manager::audit::MongoAuditStore;
use traffic_manager::cache::{RedisCache, RouteCache};
use traffic_manager::config::Settings;
use traffic_manager::kafka::consumer::{
    AuditHandler, ConsumerKind, ConsumerRuntime, EventHandler, InvalidationHandler, WarmingHandler,
};
use traffic_manager::lifecycle;
use traffic_manager::metrics::Metrics;
use traffic_manager::read_path::ResolveEngine;
use traffic_manager::resilience::ResilienceManager;
use traffic_manager::store::PgRouteStore;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    CacheInvalidation,
    CacheWarming,
    AuditLog,
}

impl From<KindArg> for ConsumerKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::CacheInvalidation => ConsumerKind::CacheInvalidation,
            KindArg::CacheWarming => ConsumerKind::CacheWarming,
            KindArg::AuditLog => ConsumerKind::AuditLog,
        }
    }
}

/// Run one route-events consumer group.
#[derive(Parser)]
#[command(name = "consumer")]
struct Args {
    /// Which worker group to run.
    #[arg(value_enum)]
    kind: KindArg,
}

#[tokio::main]
async fn main() {
    // Exit 1 on an unknown consumer kind (clap's default is 2).
    let args = Args::try_parse().unwrap_or_else(|err| {
        eprintln!("{err}");
        std::process::exit(1);
    });

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

    if let Err(err) = run(settings, args.kind.into()).await {
        tracing::error!(error = %err, "fatal consumer error");
        std::process::exit(1);
    }
}

async fn run(settings: Settings, kind: ConsumerKind) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(%kind, "initializing consumer services");

    // Each kind opens only what its handler touches; the warming consumer
    // reuses the full read engine so warmed entries match read-path entries.
    let mut pg: Option<Arc<PgRouteStore>> = None;
    let handler: Box<dyn EventHandler> = match kind {
        ConsumerKind::CacheInvalidation => {
            let cache = Arc::new(RedisCache::new(&settings.redis)?);
            Box::new(InvalidationHandler::new(cache))
        }
        ConsumerKind::CacheWarming => {
            let store = Arc::new(PgRouteStore::connect(&settings.db).await?);
            pg = Some(store.clone());
            let cache: Arc<dyn RouteCache> = Arc::new(RedisCache::new(&settings.redis)?);
            let manager = ResilienceManager::new();
            let resolver = Arc::new(ResolveEngine::new(
                cache,
                store,
                manager.db_circuit().clone(),
                manager.cache_circuit().clone(),
                manager.cache_retry_budget().clone(),
                Metrics::new()?,
                settings.app.positive_cache_ttl(),
                settings.app.negative_cache_ttl(),
            ));
            Box::new(WarmingHandler::new(resolver))
        }
        ConsumerKind::AuditLog => {
            let audit = Arc::new(MongoAuditStore::new(settings.mongodb.clone()));
            Box::new(AuditHandler::new(audit))
        }
    };

    let runtime = ConsumerRuntime::new(&settings.kafka, kind, handler)?;
    runtime.run(lifecycle::shutdown_signal()).await;

    // Clients close in reverse of initialization.
    if let Some(pg) = pg {
        pg.close().await;
    }
    tracing::info!(%kind, "consumer shutdown complete");
    Ok(())
}
