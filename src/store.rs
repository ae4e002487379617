//! Relational store client.
//!
//! `RouteStore` is the seam between the engines and PostgreSQL: the joined
//! active-route lookup, the transactional upsert, and the activation flip.
//! The sqlx transaction guard rolls back automatically on any early return,
//! so a scope either commits explicitly or undoes everything.

use crate::config::DatabaseConfig;
use crate::events::RouteKey;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection unavailable: {0}")]
    Pool(String),
    #[error("database query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Pool(err.to_string())
            }
            sqlx::Error::Io(_) => StoreError::Pool(err.to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

impl StoreError {
    /// Pool acquisition failures are worth one budgeted retry; query
    /// failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Pool(_))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStatus {
    pub max_connections: u32,
    pub in_use: u32,
    pub available: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertResult {
    pub is_active: bool,
    pub inserted: bool,
}

#[async_trait]
pub trait RouteStore: Send + Sync {
    /// The four-way join: active endpoint URL for the key, if any.
    async fn resolve_active_url(&self, key: &RouteKey) -> Result<Option<String>, StoreError>;

    /// Idempotently create the tenant/service/environment chain and upsert
    /// the endpoint (active by default). Returns the stored `is_active` and
    /// whether the endpoint row was newly inserted.
    async fn upsert_route(&self, key: &RouteKey, url: &str) -> Result<UpsertResult, StoreError>;

    /// Flip `is_active` for an existing endpoint. Returns the endpoint URL,
    /// or `None` when no row matched the key.
    async fn set_active(&self, key: &RouteKey, active: bool) -> Result<Option<String>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    fn pool_status(&self) -> PoolStatus;
}

const SQL_RESOLVE_ACTIVE: &str = r#"
SELECT e.url
FROM tenants t
JOIN services s ON s.tenant_id = t.id
JOIN environments env ON env.service_id = s.id
JOIN endpoints e ON e.environment_id = env.id
WHERE t.name = $1
  AND s.name = $2
  AND env.name = $3
  AND e.version = $4
  AND e.is_active = true
LIMIT 1
"#;

const SQL_INSERT_TENANT: &str =
    "INSERT INTO tenants (name) VALUES ($1) ON CONFLICT (name) DO NOTHING RETURNING id";
const SQL_SELECT_TENANT: &str = "SELECT id FROM tenants WHERE name = $1";

const SQL_INSERT_SERVICE: &str = "INSERT INTO services (tenant_id, name) VALUES ($1, $2) \
     ON CONFLICT (tenant_id, name) DO NOTHING RETURNING id";
const SQL_SELECT_SERVICE: &str = "SELECT id FROM services WHERE tenant_id = $1 AND name = $2";

const SQL_INSERT_ENVIRONMENT: &str = "INSERT INTO environments (service_id, name) VALUES ($1, $2) \
     ON CONFLICT (service_id, name) DO NOTHING RETURNING id";
const SQL_SELECT_ENVIRONMENT: &str =
    "SELECT id FROM environments WHERE service_id = $1 AND name = $2";

// xmax = 0 distinguishes a fresh insert from a conflict-update.
const SQL_UPSERT_ENDPOINT: &str = r#"
INSERT INTO endpoints (environment_id, version, url, is_active)
VALUES ($1, $2, $3, $4)
ON CONFLICT (environment_id, version)
DO UPDATE SET url = EXCLUDED.url, is_active = EXCLUDED.is_active, updated_at = now()
RETURNING is_active, (xmax = 0) AS inserted
"#;

const SQL_RESOLVE_ENVIRONMENT_ID: &str = r#"
SELECT env.id
FROM tenants t
JOIN services s ON s.tenant_id = t.id
JOIN environments env ON env.service_id = s.id
WHERE t.name = $1
  AND s.name = $2
  AND env.name = $3
LIMIT 1
"#;

const SQL_SET_ACTIVE: &str = r#"
UPDATE endpoints
SET is_active = $1, updated_at = now()
WHERE environment_id = $2 AND version = $3
RETURNING url
"#;

/// PostgreSQL-backed store over a bounded connection pool.
pub struct PgRouteStore {
    pool: PgPool,
    max_connections: u32,
}

impl PgRouteStore {
    /// Connect eagerly; the pool holds `[min, max]` connections and bounds
    /// acquisition by the configured timeout.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.name)
            .username(&config.user)
            .password(&config.password);
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout())
            .connect_with(options)
            .await?;
        tracing::info!(
            min = config.min_connections,
            max = config.max_connections,
            "database connection pool initialized"
        );
        Ok(Self { pool, max_connections: config.max_connections })
    }

    pub fn from_pool(pool: PgPool, max_connections: u32) -> Self {
        Self { pool, max_connections }
    }

    /// Close every pooled connection. Called once at shutdown.
    pub async fn close(&self) {
        tracing::info!("closing database connection pool");
        self.pool.close().await;
    }

    async fn get_or_create_tenant(
        tx: &mut Transaction<'_, Postgres>,
        name: &str,
    ) -> Result<i64, StoreError> {
        if let Some(id) = sqlx::query_scalar::<_, i64>(SQL_INSERT_TENANT)
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?
        {
            return Ok(id);
        }
        // Insert conflicted, the row already exists.
        Ok(sqlx::query_scalar::<_, i64>(SQL_SELECT_TENANT)
            .bind(name)
            .fetch_one(&mut **tx)
            .await?)
    }

    async fn get_or_create_service(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: i64,
        name: &str,
    ) -> Result<i64, StoreError> {
        if let Some(id) = sqlx::query_scalar::<_, i64>(SQL_INSERT_SERVICE)
            .bind(tenant_id)
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?
        {
            return Ok(id);
        }
        Ok(sqlx::query_scalar::<_, i64>(SQL_SELECT_SERVICE)
            .bind(tenant_id)
            .bind(name)
            .fetch_one(&mut **tx)
            .await?)
    }

    async fn get_or_create_environment(
        tx: &mut Transaction<'_, Postgres>,
        service_id: i64,
        name: &str,
    ) -> Result<i64, StoreError> {
        if let Some(id) = sqlx::query_scalar::<_, i64>(SQL_INSERT_ENVIRONMENT)
            .bind(service_id)
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?
        {
            return Ok(id);
        }
        Ok(sqlx::query_scalar::<_, i64>(SQL_SELECT_ENVIRONMENT)
            .bind(service_id)
            .bind(name)
            .fetch_one(&mut **tx)
            .await?)
    }
}

#[async_trait]
impl RouteStore for PgRouteStore {
    async fn resolve_active_url(&self, key: &RouteKey) -> Result<Option<String>, StoreError> {
        Ok(sqlx::query_scalar::<_, String>(SQL_RESOLVE_ACTIVE)
            .bind(&key.tenant)
            .bind(&key.service)
            .bind(&key.env)
            .bind(&key.version)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn upsert_route(&self, key: &RouteKey, url: &str) -> Result<UpsertResult, StoreError> {
        let mut tx = self.pool.begin().await?;
        let tenant_id = Self::get_or_create_tenant(&mut tx, &key.tenant).await?;
        let service_id = Self::get_or_create_service(&mut tx, tenant_id, &key.service).await?;
        let environment_id = Self::get_or_create_environment(&mut tx, service_id, &key.env).await?;
        let (is_active, inserted) = sqlx::query_as::<_, (bool, bool)>(SQL_UPSERT_ENDPOINT)
            .bind(environment_id)
            .bind(&key.version)
            .bind(url)
            .bind(true)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(UpsertResult { is_active, inserted })
    }

    async fn set_active(&self, key: &RouteKey, active: bool) -> Result<Option<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let environment_id = sqlx::query_scalar::<_, i64>(SQL_RESOLVE_ENVIRONMENT_ID)
            .bind(&key.tenant)
            .bind(&key.service)
            .bind(&key.env)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(environment_id) = environment_id else {
            return Ok(None);
        };
        let url = sqlx::query_scalar::<_, String>(SQL_SET_ACTIVE)
            .bind(active)
            .bind(environment_id)
            .bind(&key.version)
            .fetch_optional(&mut *tx)
            .await?;
        if url.is_some() {
            tx.commit().await?;
        }
        Ok(url)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    fn pool_status(&self) -> PoolStatus {
        let size = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        let in_use = size.saturating_sub(idle);
        PoolStatus {
            max_connections: self.max_connections,
            in_use,
            available: self.max_connections.saturating_sub(in_use),
        }
    }
}

/// In-memory store for tests: same contract, plus failure and latency
/// injection and a query counter so tests can assert the DB was (not)
/// consulted.
#[derive(Default)]
pub struct MemoryRouteStore {
    routes: Mutex<HashMap<RouteKey, (String, bool)>>,
    failing: AtomicBool,
    queries: AtomicU64,
    delay: Mutex<Option<std::time::Duration>>,
}

impl MemoryRouteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a route directly, bypassing the write path.
    pub fn insert(&self, key: RouteKey, url: &str, active: bool) {
        self.routes.lock().unwrap().insert(key, (url.to_string(), active));
    }

    /// Make every subsequent operation fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stall every subsequent operation, simulating a slow database.
    pub fn set_delay(&self, delay: Option<std::time::Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    async fn check(&self) -> Result<(), StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Pool("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RouteStore for MemoryRouteStore {
    async fn resolve_active_url(&self, key: &RouteKey) -> Result<Option<String>, StoreError> {
        self.check().await?;
        Ok(self
            .routes
            .lock()
            .unwrap()
            .get(key)
            .filter(|(_, active)| *active)
            .map(|(url, _)| url.clone()))
    }

    async fn upsert_route(&self, key: &RouteKey, url: &str) -> Result<UpsertResult, StoreError> {
        self.check().await?;
        let previous =
            self.routes.lock().unwrap().insert(key.clone(), (url.to_string(), true));
        Ok(UpsertResult { is_active: true, inserted: previous.is_none() })
    }

    async fn set_active(&self, key: &RouteKey, active: bool) -> Result<Option<String>, StoreError> {
        self.check().await?;
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(key) {
            Some((url, is_active)) => {
                *is_active = active;
                Ok(Some(url.clone()))
            }
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check().await
    }

    fn pool_status(&self) -> PoolStatus {
        PoolStatus::default()
    }
}
