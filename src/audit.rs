//! Audit store client.
//!
//! Persists the [`RouteEvent`] projection described by the audit consumers
//! and answers the audit query endpoints. The MongoDB client is created
//! lazily on first use; the four indexes are ensured right after connecting.
//! The unique `event_id` index makes re-delivered events idempotent.

use crate::config::MongoConfig;
use crate::events::{RouteAction, RouteEvent, RouteKey};
use async_trait::async_trait;
use bson::doc;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::OnceCell;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit store unavailable: {0}")]
    Unavailable(String),
    #[error("audit store operation failed: {0}")]
    Operation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRoute {
    pub tenant: String,
    pub service: String,
    pub env: String,
    pub version: String,
}

/// Stored projection of a route event, enriched with processing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditDocument {
    pub event_id: String,
    pub event_type: String,
    pub action: RouteAction,
    pub route: AuditRoute,
    pub url: Option<String>,
    pub previous_url: Option<String>,
    pub previous_state: Option<String>,
    pub changed_by: Option<String>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub occurred_at: DateTime<Utc>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub processed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: bson::Document,
}

/// Build the stored projection for an event, stamping `processed_at`.
pub fn project_event(event: &RouteEvent) -> AuditDocument {
    AuditDocument {
        event_id: event.event_id.clone(),
        event_type: event.event_type.clone(),
        action: event.action,
        route: AuditRoute {
            tenant: event.tenant.clone(),
            service: event.service.clone(),
            env: event.env.clone(),
            version: event.version.clone(),
        },
        url: Some(event.url.clone()),
        previous_url: None,
        previous_state: None,
        changed_by: None,
        occurred_at: event.occurred_at,
        processed_at: Utc::now(),
        metadata: bson::Document::new(),
    }
}

/// JSON shape returned by the audit query endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEventView {
    pub event_id: String,
    pub action: RouteAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<AuditRoute>,
    pub url: Option<String>,
    pub previous_url: Option<String>,
    pub previous_state: Option<String>,
    pub changed_by: Option<String>,
    pub occurred_at: String,
    pub processed_at: String,
}

impl AuditEventView {
    /// `with_route` is false for per-route history, where the route is
    /// already in the response envelope.
    pub fn from_document(doc: &AuditDocument, with_route: bool) -> Self {
        Self {
            event_id: doc.event_id.clone(),
            action: doc.action,
            route: with_route.then(|| doc.route.clone()),
            url: doc.url.clone(),
            previous_url: doc.previous_url.clone(),
            previous_state: doc.previous_state.clone(),
            changed_by: doc.changed_by.clone(),
            occurred_at: doc.occurred_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            processed_at: doc.processed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Optional route-field filters shared by the audit queries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub tenant: Option<String>,
    pub service: Option<String>,
    pub env: Option<String>,
}

impl AuditFilter {
    fn matches(&self, route: &AuditRoute) -> bool {
        self.tenant.as_deref().map_or(true, |t| t == route.tenant)
            && self.service.as_deref().map_or(true, |s| s == route.service)
            && self.env.as_deref().map_or(true, |e| e == route.env)
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist one event. Returns `false` when the event was already stored
    /// (unique `event_id` deduplication).
    async fn insert(&self, event: &RouteEvent) -> Result<bool, AuditError>;

    async fn route_history(
        &self,
        key: &RouteKey,
        limit: i64,
    ) -> Result<Vec<AuditDocument>, AuditError>;

    async fn recent_events(
        &self,
        days: i64,
        filter: &AuditFilter,
        limit: i64,
    ) -> Result<Vec<AuditDocument>, AuditError>;

    async fn events_by_action(
        &self,
        action: RouteAction,
        hours: Option<i64>,
        filter: &AuditFilter,
        limit: i64,
    ) -> Result<Vec<AuditDocument>, AuditError>;

    async fn events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        action: Option<RouteAction>,
        filter: &AuditFilter,
        limit: i64,
    ) -> Result<Vec<AuditDocument>, AuditError>;

    async fn ping(&self) -> Result<(), AuditError>;
}

/// MongoDB-backed audit store.
pub struct MongoAuditStore {
    config: MongoConfig,
    handles: OnceCell<(mongodb::Database, Collection<AuditDocument>)>,
}

impl MongoAuditStore {
    pub fn new(config: MongoConfig) -> Self {
        Self { config, handles: OnceCell::new() }
    }

    async fn collection(&self) -> Result<&Collection<AuditDocument>, AuditError> {
        self.handles().await.map(|(_, collection)| collection)
    }

    async fn handles(
        &self,
    ) -> Result<&(mongodb::Database, Collection<AuditDocument>), AuditError> {
        self.handles
            .get_or_try_init(|| async {
                tracing::info!(
                    host = %self.config.host,
                    port = self.config.port,
                    db = %self.config.name,
                    "connecting audit store client"
                );
                let mut options = ClientOptions::parse(self.config.uri())
                    .await
                    .map_err(|e| AuditError::Unavailable(e.to_string()))?;
                options.connect_timeout = Some(self.config.connect_timeout());
                options.server_selection_timeout = Some(self.config.server_selection_timeout());
                options.max_pool_size = Some(50);
                options.min_pool_size = Some(2);

                let client = Client::with_options(options)
                    .map_err(|e| AuditError::Unavailable(e.to_string()))?;
                let database = client.database(&self.config.name);
                database
                    .run_command(doc! { "ping": 1 })
                    .await
                    .map_err(|e| AuditError::Unavailable(e.to_string()))?;

                let collection =
                    database.collection::<AuditDocument>(&self.config.audit_collection);
                Self::ensure_indexes(&collection).await;
                Ok((database, collection))
            })
            .await
    }

    async fn ensure_indexes(collection: &Collection<AuditDocument>) {
        let models = vec![
            IndexModel::builder()
                .keys(doc! {
                    "route.tenant": 1,
                    "route.service": 1,
                    "route.env": 1,
                    "route.version": 1,
                    "occurred_at": -1,
                })
                .options(IndexOptions::builder().name("route_occurred_at_idx".to_string()).build())
                .build(),
            IndexModel::builder()
                .keys(doc! { "occurred_at": -1 })
                .options(IndexOptions::builder().name("occurred_at_idx".to_string()).build())
                .build(),
            IndexModel::builder()
                .keys(doc! { "action": 1, "occurred_at": -1 })
                .options(IndexOptions::builder().name("action_occurred_at_idx".to_string()).build())
                .build(),
            IndexModel::builder()
                .keys(doc! { "event_id": 1 })
                .options(
                    IndexOptions::builder()
                        .name("event_id_idx".to_string())
                        .unique(true)
                        .build(),
                )
                .build(),
        ];
        if let Err(err) = collection.create_indexes(models).await {
            tracing::warn!(error = %err, "failed to create audit indexes (may already exist)");
        } else {
            tracing::info!("audit store indexes ensured");
        }
    }

    async fn find(
        &self,
        filter: bson::Document,
        limit: i64,
    ) -> Result<Vec<AuditDocument>, AuditError> {
        let collection = self.collection().await?;
        let cursor = collection
            .find(filter)
            .sort(doc! { "occurred_at": -1 })
            .limit(limit)
            .await
            .map_err(|e| AuditError::Operation(e.to_string()))?;
        cursor.try_collect().await.map_err(|e| AuditError::Operation(e.to_string()))
    }

    fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
        matches!(
            err.kind.as_ref(),
            ErrorKind::Write(WriteFailure::WriteError(write_err)) if write_err.code == 11_000
        )
    }
}

fn apply_route_filter(doc: &mut bson::Document, filter: &AuditFilter) {
    if let Some(tenant) = &filter.tenant {
        doc.insert("route.tenant", tenant);
    }
    if let Some(service) = &filter.service {
        doc.insert("route.service", service);
    }
    if let Some(env) = &filter.env {
        doc.insert("route.env", env);
    }
}

#[async_trait]
impl AuditStore for MongoAuditStore {
    async fn insert(&self, event: &RouteEvent) -> Result<bool, AuditError> {
        let collection = self.collection().await?;
        let document = project_event(event);
        match collection.insert_one(&document).await {
            Ok(_) => {
                tracing::info!(
                    event_id = %document.event_id,
                    action = %document.action,
                    "audit event saved"
                );
                Ok(true)
            }
            Err(err) if Self::is_duplicate_key(&err) => {
                tracing::debug!(event_id = %document.event_id, "audit event already stored");
                Ok(false)
            }
            Err(err) => Err(AuditError::Operation(err.to_string())),
        }
    }

    async fn route_history(
        &self,
        key: &RouteKey,
        limit: i64,
    ) -> Result<Vec<AuditDocument>, AuditError> {
        self.find(
            doc! {
                "route.tenant": &key.tenant,
                "route.service": &key.service,
                "route.env": &key.env,
                "route.version": &key.version,
            },
            limit,
        )
        .await
    }

    async fn recent_events(
        &self,
        days: i64,
        filter: &AuditFilter,
        limit: i64,
    ) -> Result<Vec<AuditDocument>, AuditError> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut query = doc! { "occurred_at": { "$gte": bson::DateTime::from_chrono(cutoff) } };
        apply_route_filter(&mut query, filter);
        self.find(query, limit).await
    }

    async fn events_by_action(
        &self,
        action: RouteAction,
        hours: Option<i64>,
        filter: &AuditFilter,
        limit: i64,
    ) -> Result<Vec<AuditDocument>, AuditError> {
        let mut query = doc! { "action": action.as_str() };
        if let Some(hours) = hours {
            let cutoff = Utc::now() - chrono::Duration::hours(hours);
            query.insert("occurred_at", doc! { "$gte": bson::DateTime::from_chrono(cutoff) });
        }
        apply_route_filter(&mut query, filter);
        self.find(query, limit).await
    }

    async fn events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        action: Option<RouteAction>,
        filter: &AuditFilter,
        limit: i64,
    ) -> Result<Vec<AuditDocument>, AuditError> {
        let mut query = doc! {
            "occurred_at": {
                "$gte": bson::DateTime::from_chrono(start),
                "$lte": bson::DateTime::from_chrono(end),
            }
        };
        if let Some(action) = action {
            query.insert("action", action.as_str());
        }
        apply_route_filter(&mut query, filter);
        self.find(query, limit).await
    }

    async fn ping(&self) -> Result<(), AuditError> {
        let (database, _) = self.handles().await?;
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| AuditError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

/// In-memory audit store for tests: same dedup and filtering contract.
#[derive(Default)]
pub struct MemoryAuditStore {
    documents: Mutex<Vec<AuditDocument>>,
    failing: std::sync::atomic::AtomicBool,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), AuditError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            Err(AuditError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn collect<F>(&self, predicate: F, limit: i64) -> Vec<AuditDocument>
    where
        F: Fn(&AuditDocument) -> bool,
    {
        let mut matched: Vec<AuditDocument> = self
            .documents
            .lock()
            .unwrap()
            .iter()
            .filter(|doc| predicate(doc))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        matched.truncate(limit.max(0) as usize);
        matched
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn insert(&self, event: &RouteEvent) -> Result<bool, AuditError> {
        self.check()?;
        let mut documents = self.documents.lock().unwrap();
        if documents.iter().any(|doc| doc.event_id == event.event_id) {
            return Ok(false);
        }
        documents.push(project_event(event));
        Ok(true)
    }

    async fn route_history(
        &self,
        key: &RouteKey,
        limit: i64,
    ) -> Result<Vec<AuditDocument>, AuditError> {
        self.check()?;
        Ok(self.collect(
            |doc| {
                doc.route.tenant == key.tenant
                    && doc.route.service == key.service
                    && doc.route.env == key.env
                    && doc.route.version == key.version
            },
            limit,
        ))
    }

    async fn recent_events(
        &self,
        days: i64,
        filter: &AuditFilter,
        limit: i64,
    ) -> Result<Vec<AuditDocument>, AuditError> {
        self.check()?;
        let cutoff = Utc::now() - chrono::Duration::days(days);
        Ok(self.collect(|doc| doc.occurred_at >= cutoff && filter.matches(&doc.route), limit))
    }

    async fn events_by_action(
        &self,
        action: RouteAction,
        hours: Option<i64>,
        filter: &AuditFilter,
        limit: i64,
    ) -> Result<Vec<AuditDocument>, AuditError> {
        self.check()?;
        let cutoff = hours.map(|h| Utc::now() - chrono::Duration::hours(h));
        Ok(self.collect(
            |doc| {
                doc.action == action
                    && cutoff.map_or(true, |c| doc.occurred_at >= c)
                    && filter.matches(&doc.route)
            },
            limit,
        ))
    }

    async fn events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        action: Option<RouteAction>,
        filter: &AuditFilter,
        limit: i64,
    ) -> Result<Vec<AuditDocument>, AuditError> {
        self.check()?;
        Ok(self.collect(
            |doc| {
                doc.occurred_at >= start
                    && doc.occurred_at <= end
                    && action.map_or(true, |a| doc.action == a)
                    && filter.matches(&doc.route)
            },
            limit,
        ))
    }

    async fn ping(&self) -> Result<(), AuditError> {
        self.check()
    }
}
