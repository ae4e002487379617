//! Route identity and the `route_changed` wire event.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The four-part business identity of a route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub tenant: String,
    pub service: String,
    pub env: String,
    pub version: String,
}

impl RouteKey {
    pub fn new(
        tenant: impl Into<String>,
        service: impl Into<String>,
        env: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            service: service.into(),
            env: env.into(),
            version: version.into(),
        }
    }

    /// All four fields non-empty after trimming.
    pub fn is_complete(&self) -> bool {
        !(self.tenant.trim().is_empty()
            || self.service.trim().is_empty()
            || self.env.trim().is_empty()
            || self.version.trim().is_empty())
    }

    /// Broker partition key: `tenant:service:env:version`.
    pub fn partition_key(&self) -> String {
        format!("{}:{}:{}:{}", self.tenant, self.service, self.env, self.version)
    }

    /// Cache key: `route:tenant:service:env:version`.
    pub fn cache_key(&self) -> String {
        format!("route:{}", self.partition_key())
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.tenant, self.service, self.env, self.version)
    }
}

/// State change recorded by a [`RouteEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteAction {
    Created,
    Activated,
    Deactivated,
}

impl RouteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Activated => "activated",
            Self::Deactivated => "deactivated",
        }
    }
}

impl fmt::Display for RouteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "activated" => Ok(Self::Activated),
            "deactivated" => Ok(Self::Deactivated),
            _ => Err(()),
        }
    }
}

/// Immutable record emitted on every successful write, published to the
/// `route-events` topic keyed by [`RouteKey::partition_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEvent {
    pub event_id: String,
    pub event_type: String,
    pub action: RouteAction,
    pub tenant: String,
    pub service: String,
    pub env: String,
    pub version: String,
    pub url: String,
    #[serde(with = "rfc3339_seconds")]
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

pub const ROUTE_CHANGED_EVENT_TYPE: &str = "route_changed";

impl RouteEvent {
    pub fn new(
        action: RouteAction,
        key: &RouteKey,
        url: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: ROUTE_CHANGED_EVENT_TYPE.to_string(),
            action,
            tenant: key.tenant.clone(),
            service: key.service.clone(),
            env: key.env.clone(),
            version: key.version.clone(),
            url: url.into(),
            occurred_at: Utc::now(),
            correlation_id,
        }
    }

    pub fn key(&self) -> RouteKey {
        RouteKey::new(&self.tenant, &self.service, &self.env, &self.version)
    }

    pub fn partition_key(&self) -> String {
        self.key().partition_key()
    }
}

/// Seconds-precision RFC3339 with a `Z` suffix on the wire; parsing accepts
/// any RFC3339 offset and normalizes to UTC.
mod rfc3339_seconds {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
