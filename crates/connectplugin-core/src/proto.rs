//! Wire types for the core RPC surface.
//!
//! The framework speaks Connect-style unary JSON over HTTP; streaming
//! endpoints emit newline-delimited JSON. These types are the contract
//! between host and plugin at the request/response object level; the
//! framing underneath is an implementation detail.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DiscoverStrategy, ProvidedService, RequiredService};

/// JSON error body sent for every failed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

// ── Handshake ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol_version: u32,
    /// Plugin's stable name, e.g. `"kv"`.
    pub self_id: String,
    /// Base URL of the plugin's own HTTP server, used as the proxy
    /// target for its registered services.
    pub endpoint: String,
    #[serde(default)]
    pub magic_cookie_key: Option<String>,
    #[serde(default)]
    pub magic_cookie_value: Option<String>,
    #[serde(default)]
    pub provides: Vec<ProvidedService>,
    #[serde(default)]
    pub requires: Vec<RequiredService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub runtime_id: String,
    pub runtime_token: String,
    pub server_capabilities: Vec<String>,
    pub negotiated_protocol_version: u32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeRequest {
    pub runtime_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeResponse {
    pub revoked: bool,
}

// ── Service registry ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterServiceRequest {
    pub service_type: String,
    pub version: semver::Version,
    /// Handler path relative to the provider's base URL.
    pub endpoint_path: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterServiceResponse {
    pub registration_id: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterServiceRequest {
    pub registration_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterServiceResponse {
    pub service_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverServiceRequest {
    pub service_type: String,
    #[serde(default)]
    pub min_version: Option<semver::Version>,
    #[serde(default = "DiscoverStrategy::first")]
    pub strategy: DiscoverStrategy,
}

impl DiscoverStrategy {
    fn first() -> Self {
        DiscoverStrategy::First
    }
}

/// One discovered provider, addressed through the host router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredProvider {
    pub registration_id: String,
    pub provider_runtime_id: String,
    pub service_type: String,
    pub version: semver::Version,
    /// Host-router URL for calls to this provider.
    pub endpoint: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverServiceResponse {
    pub providers: Vec<DiscoveredProvider>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchServiceRequest {
    pub service_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupOrderResponse {
    pub order: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactRequest {
    pub runtime_id: String,
}

// ── Capability broker ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCapabilityRequest {
    pub capability_type: String,
}

/// Successful `RequestCapability` answer.
#[derive(Debug, Serialize, Deserialize)]
pub struct GrantedCapability {
    pub grant_id: String,
    /// Base URL of the grant's HTTP surface.
    pub endpoint_url: String,
    pub bearer_token: String,
    pub expires_at: DateTime<Utc>,
}

// ── Health ─────────────────────────────────────────────────────────────

/// Serving state of one named service. An empty name addresses the host
/// overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    Unknown,
    Serving,
    NotServing,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckRequest {
    #[serde(default)]
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
}
