#![forbid(unsafe_code)]

//! # traffic-manager
//!
//! Multi-tenant routing control plane. Given a `(tenant, service, env,
//! version)` route key it returns the active endpoint URL, and exposes write
//! operations to create, activate, and deactivate routes. Every state change
//! is committed to PostgreSQL and broadcast as a keyed Kafka event consumed
//! by three worker groups: cache invalidation, cache warming, and audit
//! persistence into MongoDB.
//!
//! Every external call is mediated by the resilience substrate: circuit
//! breakers per dependency, rolling retry budgets, per-operation-class
//! bulkheads, and a graceful drain gate for zero-downtime shutdown.
//!
//! The binaries:
//!
//! - `traffic-manager`: the HTTP control-plane server.
//! - `consumer <kind>`: one consumer worker group (`cache-invalidation`,
//!   `cache-warming`, or `audit-log`).

pub mod api;
pub mod audit;
pub mod cache;
pub mod config;
pub mod correlation;
pub mod events;
pub mod kafka;
pub mod lifecycle;
pub mod metrics;
pub mod read_path;
pub mod resilience;
pub mod store;
pub mod write_path;
