//! Handshake service: once-per-connection protocol negotiation and
//! runtime identity issuance.
//!
//! Handshake is the only unauthenticated RPC. The magic cookie is a UX
//! validator for wiring mistakes, never a security control. Two
//! identical requests may mint two distinct identities; clients call at
//! most once per reconnection.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::Json;
use connectplugin_core::proto::{
    HandshakeRequest, HandshakeResponse, RevokeRequest, RevokeResponse,
};
use connectplugin_core::{ids, Error, RuntimeIdentity, TokenKind};
use chrono::Utc;
use tracing::{info, warn};

use crate::config::ENDPOINT_HANDSHAKE;
use crate::error::{ApiError, ApiResult};
use crate::state::HostState;

/// POST `/plugin.v1.HandshakeService/Handshake`
///
/// Never partially succeeds: any failure after ID generation revokes the
/// token and removes the node.
pub async fn handshake(
    State(state): State<Arc<HostState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<HandshakeRequest>,
) -> ApiResult<Json<HandshakeResponse>> {
    state.check_rate(ENDPOINT_HANDSHAKE, &peer.ip().to_string())?;

    validate_request(&state, &request).map_err(|e| {
        warn!(self_id = %request.self_id, error = %e, "[Handshake] Rejected");
        ApiError(e)
    })?;

    // ID generation and token issuance both require the CSPRNG; failures
    // propagate as Internal and never fall back to a predictable value.
    let runtime_id = ids::runtime_id(&request.self_id)?;
    let token = state
        .token_store
        .issue(&runtime_id, TokenKind::Runtime, state.config.runtime_token_ttl)?;

    let identity = RuntimeIdentity {
        runtime_id: runtime_id.clone(),
        self_id: request.self_id.clone(),
        endpoint: request.endpoint.trim_end_matches('/').to_string(),
        issued_at: Utc::now(),
        provides: request.provides.clone(),
        requires: request.requires.clone(),
        protocol_version: request.protocol_version,
    };

    if let Err(e) = state.registry.add_runtime(identity) {
        // Roll back the token so the failure is total.
        state.token_store.revoke(&runtime_id);
        return Err(ApiError(e));
    }

    info!(
        runtime_id = %runtime_id,
        self_id = %request.self_id,
        protocol_version = request.protocol_version,
        provides = request.provides.len(),
        requires = request.requires.len(),
        "[Handshake] Runtime admitted"
    );

    // Advertise brokered capability types plus anything the embedder
    // declared explicitly.
    let mut server_capabilities = state.broker.capability_types();
    for extra in &state.config.server_capabilities {
        if !server_capabilities.contains(extra) {
            server_capabilities.push(extra.clone());
        }
    }
    server_capabilities.sort();

    Ok(Json(HandshakeResponse {
        runtime_id,
        runtime_token: token.secret.to_string(),
        server_capabilities,
        negotiated_protocol_version: request.protocol_version,
        expires_at: token.expires_at,
    }))
}

fn validate_request(state: &HostState, request: &HandshakeRequest) -> Result<(), Error> {
    if request.self_id.trim().is_empty() {
        return Err(Error::InvalidArgument("self_id is empty".into()));
    }
    if request.endpoint.trim().is_empty() {
        return Err(Error::InvalidArgument("endpoint is empty".into()));
    }
    if !state
        .config
        .protocol_versions
        .contains(&request.protocol_version)
    {
        return Err(Error::InvalidArgument(format!(
            "unsupported protocol version {}; supported: {:?}",
            request.protocol_version, state.config.protocol_versions
        )));
    }
    if let Some((expected_key, expected_value)) = &state.config.magic_cookie {
        let key_ok = request.magic_cookie_key.as_deref() == Some(expected_key.as_str());
        let value_ok = request.magic_cookie_value.as_deref() == Some(expected_value.as_str());
        if !key_ok || !value_ok {
            return Err(Error::InvalidArgument(
                "magic cookie mismatch; this usually means the plugin was launched by hand \
                 or against the wrong host"
                    .into(),
            ));
        }
    }
    Ok(())
}

/// POST `/plugin.v1.HandshakeService/Revoke` (authenticated; a runtime
/// may only revoke itself). Cascades to registrations and grants.
pub async fn revoke(
    State(state): State<Arc<HostState>>,
    auth: crate::auth::RuntimeAuth,
    Json(request): Json<RevokeRequest>,
) -> ApiResult<Json<RevokeResponse>> {
    if auth.0.identity != request.runtime_id {
        return Err(ApiError(Error::PermissionDenied(
            "a runtime may only revoke its own identity".into(),
        )));
    }
    state.registry.remove_runtime(&request.runtime_id);
    state.broker.revoke_owner(&request.runtime_id);
    let revoked = !state
        .token_store
        .revoke_by_runtime(&request.runtime_id)
        .is_empty();
    info!(runtime_id = %request.runtime_id, "[Handshake] Runtime revoked");
    Ok(Json(RevokeResponse { revoked }))
}
