//! Shared handler state: one root object holding every client and engine,
//! passed by reference so tests can substitute in-memory fakes.

use crate::audit::AuditStore;
use crate::cache::RouteCache;
use crate::kafka::producer::EventPublisher;
use crate::metrics::Metrics;
use crate::read_path::ResolveEngine;
use crate::resilience::ResilienceManager;
use crate::store::RouteStore;
use crate::write_path::WriteEngine;
use std::sync::Arc;

pub const SERVICE_NAME: &str = "traffic-manager";

#[derive(Clone)]
pub struct AppState {
    pub resilience: Arc<ResilienceManager>,
    pub resolver: Arc<ResolveEngine>,
    pub writer: Arc<WriteEngine>,
    pub store: Arc<dyn RouteStore>,
    pub cache: Arc<dyn RouteCache>,
    pub audit: Arc<dyn AuditStore>,
    pub publisher: Arc<dyn EventPublisher>,
    pub metrics: Metrics,
}
