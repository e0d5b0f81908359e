//! Service registrations and the events the registry emits about them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A plugin's offer of a service at a specific version.
///
/// One provider may hold several registrations, but never two with the
/// same `(service_type, version)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegistration {
    /// Host-assigned registration identifier.
    pub registration_id: String,
    /// Runtime identity that owns this registration.
    pub provider_runtime_id: String,
    /// Service type, e.g. `"logger"`.
    pub service_type: String,
    /// Offered version.
    pub version: semver::Version,
    /// Path of the service handler relative to the provider's base URL.
    pub endpoint_path: String,
    /// Free-form provider metadata, opaque to the host.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// When the registration was accepted.
    pub registered_at: DateTime<Utc>,
}

/// Provider selection strategy for discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverStrategy {
    /// Lowest-sorted `registration_id`.
    First,
    /// Per-type cursor advanced atomically.
    RoundRobin,
    /// Uniform draw over the matching set.
    Random,
    /// The full matching set.
    All,
}

/// Event delivered to `WatchService` subscribers.
///
/// Within one stream, events arrive in the order the registry mutated.
/// Subscribers that fall behind drop events and reconcile with a fresh
/// discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "registration", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryEvent {
    /// A registration became visible.
    Added(ServiceRegistration),
    /// A registration was withdrawn or its provider revoked.
    Removed(ServiceRegistration),
    /// A registration changed in place, e.g. a provider health transition.
    Updated(ServiceRegistration),
}

impl RegistryEvent {
    /// The registration this event concerns.
    pub fn registration(&self) -> &ServiceRegistration {
        match self {
            RegistryEvent::Added(r) | RegistryEvent::Removed(r) | RegistryEvent::Updated(r) => r,
        }
    }
}
