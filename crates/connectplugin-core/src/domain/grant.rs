//! Capability grants: host-side records binding a caller to a
//! host-provided capability handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// A capability invocation, already stripped of transport framing.
///
/// The broker never interprets the payload; it hands the remaining path
/// and body to the handler as-is.
#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    /// HTTP method of the inbound call.
    pub method: String,
    /// Path remainder below `/capabilities/{grant_id}/`.
    pub path: String,
    /// Inbound headers, minus credentials.
    pub headers: HashMap<String, String>,
    /// Raw request body.
    pub body: Vec<u8>,
}

/// A capability handler's answer.
#[derive(Debug, Clone)]
pub struct CapabilityResponse {
    /// HTTP status to relay.
    pub status: u16,
    /// Response content type.
    pub content_type: String,
    /// Raw response body.
    pub body: Vec<u8>,
}

impl CapabilityResponse {
    /// A 200 response with a JSON body.
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "application/json".into(),
            body,
        }
    }
}

/// Host-side implementation of a capability, e.g. secrets access.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Handle one invocation below the grant's endpoint.
    async fn handle(&self, request: CapabilityRequest) -> Result<CapabilityResponse>;
}

/// Record binding a caller, a capability type, and its handler.
///
/// The handler is resolved at creation time and the grant is never
/// re-homed. Destroyed on token expiry, owner revocation, or owner
/// runtime expiry.
#[derive(Clone)]
pub struct CapabilityGrant {
    /// Host-assigned grant identifier; also the token record's owner key.
    pub grant_id: String,
    /// Capability type, e.g. `"secrets"`.
    pub capability_type: String,
    /// Runtime identity the grant was issued to.
    pub owner_runtime_id: String,
    /// When the grant was created.
    pub created_at: DateTime<Utc>,
    /// Host-side implementation dispatched to on each call.
    pub handler: Arc<dyn CapabilityHandler>,
}

impl std::fmt::Debug for CapabilityGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityGrant")
            .field("grant_id", &self.grant_id)
            .field("capability_type", &self.capability_type)
            .field("owner_runtime_id", &self.owner_runtime_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
