//! Capability broker: host-mediated plugin access to host capabilities.
//!
//! Plugins request a capability over the authenticated RPC surface and
//! receive a grant-scoped bearer token plus an endpoint below
//! `/capabilities/{grant_id}/`. Calls on that endpoint are validated
//! against the token store in constant time and dispatched to the
//! host-registered handler. Every validation failure answers with the
//! same `Unauthenticated` code; an expired grant is removed before the
//! rejection goes out.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use connectplugin_core::proto::{GrantedCapability, RequestCapabilityRequest};
use connectplugin_core::{
    ids, CapabilityGrant, CapabilityRequest, CapabilityResponse, Error, Result, ServiceRegistry,
    TokenKind, TokenStore, Validation,
};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::CapabilityOffer;

/// Host-side capability broker.
pub struct CapabilityBroker {
    offers: HashMap<String, CapabilityOffer>,
    grants: RwLock<HashMap<String, CapabilityGrant>>,
    token_store: Arc<TokenStore>,
    registry: Arc<ServiceRegistry>,
    grant_ttl: chrono::Duration,
    base_url: String,
}

impl CapabilityBroker {
    pub fn new(
        offers: HashMap<String, CapabilityOffer>,
        token_store: Arc<TokenStore>,
        registry: Arc<ServiceRegistry>,
        grant_ttl: chrono::Duration,
        base_url: String,
    ) -> Self {
        Self {
            offers,
            grants: RwLock::new(HashMap::new()),
            token_store,
            registry,
            grant_ttl,
            base_url,
        }
    }

    /// Capability types this host offers.
    pub fn capability_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.offers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Whether any capabilities are offered at all.
    pub fn is_enabled(&self) -> bool {
        !self.offers.is_empty()
    }

    /// Create a grant for an authenticated caller.
    ///
    /// The handler is resolved here, at creation time; grants are never
    /// re-homed.
    pub fn request_capability(
        &self,
        caller_runtime_id: &str,
        capability_type: &str,
    ) -> Result<GrantedCapability> {
        let Some(offer) = self.offers.get(capability_type) else {
            return Err(Error::PermissionDenied(format!(
                "capability {capability_type} is not offered"
            )));
        };
        if let Some(allowed) = &offer.grant_to {
            let self_id = self
                .registry
                .runtime(caller_runtime_id)
                .map(|r| r.self_id)
                .unwrap_or_default();
            if !allowed.contains(&self_id) {
                return Err(Error::PermissionDenied(format!(
                    "capability {capability_type} is not granted to {self_id}"
                )));
            }
        }

        let grant_id = ids::grant_id()?;
        let token = self.token_store.issue_bound(
            &grant_id,
            TokenKind::CapabilityGrant,
            caller_runtime_id,
            self.grant_ttl,
        )?;

        let grant = CapabilityGrant {
            grant_id: grant_id.clone(),
            capability_type: capability_type.to_string(),
            owner_runtime_id: caller_runtime_id.to_string(),
            created_at: Utc::now(),
            handler: offer.handler.clone(),
        };
        self.grants.write().insert(grant_id.clone(), grant);

        info!(
            grant_id,
            capability_type,
            owner = caller_runtime_id,
            "[Broker] Capability granted"
        );
        Ok(GrantedCapability {
            endpoint_url: format!("{}/capabilities/{}/", self.base_url, grant_id),
            grant_id,
            bearer_token: token.secret.to_string(),
            expires_at: token.expires_at,
        })
    }

    /// Validate a bearer against a grant and dispatch to its handler.
    ///
    /// Unknown grant, wrong token, wrong kind, and expired token are all
    /// `Unauthenticated`; nothing else leaks.
    pub async fn dispatch(
        &self,
        grant_id: &str,
        bearer: &str,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse> {
        match self
            .token_store
            .validate_kind(grant_id, bearer, Some(TokenKind::CapabilityGrant))
        {
            Validation::Valid => {}
            Validation::Expired => {
                // Lazy cleanup before the uniform rejection.
                self.remove_grant(grant_id);
                return Err(Error::Unauthenticated);
            }
            Validation::Unknown => return Err(Error::Unauthenticated),
        }

        let handler = {
            let grants = self.grants.read();
            let Some(grant) = grants.get(grant_id) else {
                return Err(Error::Unauthenticated);
            };
            grant.handler.clone()
        };
        handler.handle(request).await
    }

    /// Drop one grant and its token. Returns whether it existed.
    pub fn remove_grant(&self, grant_id: &str) -> bool {
        let removed = self.grants.write().remove(grant_id).is_some();
        if removed {
            self.token_store.revoke(grant_id);
            debug!(grant_id, "[Broker] Grant removed");
        }
        removed
    }

    /// Drop every grant owned by a runtime. Invoked on runtime
    /// revocation or expiry.
    pub fn revoke_owner(&self, runtime_id: &str) -> usize {
        let mut grants = self.grants.write();
        let ids: Vec<String> = grants
            .iter()
            .filter(|(_, g)| g.owner_runtime_id == runtime_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            grants.remove(id);
            self.token_store.revoke(id);
        }
        drop(grants);
        if !ids.is_empty() {
            debug!(runtime_id, count = ids.len(), "[Broker] Owner grants revoked");
        }
        ids.len()
    }

    /// Live grant count.
    pub fn grant_count(&self) -> usize {
        self.grants.read().len()
    }

    /// Whether a grant record exists (regardless of token state).
    pub fn grant_exists(&self, grant_id: &str) -> bool {
        self.grants.read().contains_key(grant_id)
    }
}

// ============================================================================
// HTTP surface
// ============================================================================

/// POST `/plugin.v1.CapabilityBroker/RequestCapability` (runtime-token auth)
pub async fn request_capability(
    axum::extract::State(state): axum::extract::State<Arc<crate::state::HostState>>,
    crate::auth::RuntimeAuth(auth): crate::auth::RuntimeAuth,
    axum::Json(request): axum::Json<RequestCapabilityRequest>,
) -> crate::error::ApiResult<axum::Json<GrantedCapability>> {
    state.check_rate(crate::config::ENDPOINT_CAPABILITIES, &auth.identity)?;
    let granted = state
        .broker
        .request_capability(&auth.identity, &request.capability_type)?;
    Ok(axum::Json(granted))
}

/// ANY `/capabilities/{grant_id}/{*path}` (grant bearer auth)
///
/// Credential validation happens here against the grant's own token; the
/// general interceptor chain does not apply.
pub async fn capability_call(
    axum::extract::State(state): axum::extract::State<Arc<crate::state::HostState>>,
    axum::extract::Path((grant_id, path)): axum::extract::Path<(String, String)>,
    request: axum::extract::Request,
) -> crate::error::ApiResult<axum::response::Response> {
    state.check_rate(crate::config::ENDPOINT_CAPABILITIES, &grant_id)?;

    let bearer = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("")
        .to_string();
    if bearer.is_empty() {
        return Err(crate::error::ApiError(Error::Unauthenticated));
    }

    let method = request.method().to_string();
    let headers = request
        .headers()
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            name != "authorization" && name != crate::auth::RUNTIME_ID_HEADER
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| crate::error::ApiError(Error::InvalidArgument(format!("bad body: {e}"))))?;

    let response = state
        .broker
        .dispatch(
            &grant_id,
            &bearer,
            CapabilityRequest {
                method,
                path,
                headers,
                body: body.to_vec(),
            },
        )
        .await?;

    let http_response = axum::response::Response::builder()
        .status(response.status)
        .header("content-type", response.content_type)
        .body(axum::body::Body::from(response.body))
        .map_err(|e| {
            crate::error::ApiError(Error::Internal(format!("failed to build response: {e}")))
        })?;
    Ok(http_response)
}
