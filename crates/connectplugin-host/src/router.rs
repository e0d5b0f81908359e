//! Inter-plugin router: reverse proxy for plugin-to-plugin calls.
//!
//! URL shape: `/services/{service_type}/{registration_id}/{method...}`.
//! The host validates the caller, resolves the provider (failing over
//! when the addressed provider is gone or unhealthy), scrubs inbound
//! credentials, annotates the caller, and streams the exchange without
//! buffering. Providers authenticate the host, not the original caller.
//! Dropping the inbound connection cancels the downstream request.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use chrono::Utc;
use connectplugin_core::{CallLogEntry, Error, RouteTarget};
use tracing::{debug, info, warn};

use crate::auth::{RuntimeAuth, CALLER_HEADER, RUNTIME_ID_HEADER};
use crate::config::ENDPOINT_SERVICE_ROUTER;
use crate::error::{ApiError, ApiResult};
use crate::state::HostState;

/// Headers that never cross the proxy, besides credentials.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_forwardable(name: &HeaderName) -> bool {
    let lower = name.as_str();
    !HOP_BY_HOP.contains(&lower) && lower != "authorization" && lower != RUNTIME_ID_HEADER
}

/// ANY `/services/{service_type}/{registration_id}/{*method}`
pub async fn route_service(
    State(state): State<Arc<HostState>>,
    RuntimeAuth(auth): RuntimeAuth,
    Path((service_type, registration_id, method)): Path<(String, String, String)>,
    request: axum::extract::Request,
) -> ApiResult<Response> {
    state.check_rate(ENDPOINT_SERVICE_ROUTER, &auth.identity)?;

    let target = state.registry.resolve_route(&registration_id)?;
    if target.registration().service_type != service_type {
        return Err(ApiError(Error::NotFound(format!(
            "registration {registration_id} does not provide {service_type}"
        ))));
    }
    if let RouteTarget::Failover { registration, .. } = &target {
        debug!(
            requested = %registration_id,
            selected = %registration.registration_id,
            service_type = %service_type,
            "[Router] Failing over to alternate provider"
        );
    }

    let registration = target.registration().clone();
    let url = compose_target_url(
        target.provider_endpoint(),
        &registration.endpoint_path,
        &method,
        request.uri().query(),
    );

    let downstream_method = request.method().clone();
    let headers = scrub_headers(request.headers(), &auth.identity);
    let body = reqwest::Body::wrap_stream(request.into_body().into_data_stream());

    let started = Instant::now();
    let downstream = state
        .http
        .request(downstream_method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let response = match downstream {
        Ok(resp) => resp,
        Err(e) => {
            warn!(
                caller = %auth.identity,
                provider = %registration.provider_runtime_id,
                url = %url,
                error = %e,
                "[Router] Downstream call failed"
            );
            record_call(&state, &auth.identity, &registration, &method, 503, started);
            return Err(ApiError(Error::Unavailable(format!(
                "provider {} unreachable",
                registration.provider_runtime_id
            ))));
        }
    };

    let status = response.status().as_u16();
    record_call(&state, &auth.identity, &registration, &method, status, started);

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in response.headers() {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            builder = builder.header(name.clone(), value.clone());
        }
    }
    let proxied = builder
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|e| ApiError(Error::Internal(format!("failed to build response: {e}"))))?;
    Ok(proxied)
}

fn compose_target_url(
    provider_endpoint: &str,
    endpoint_path: &str,
    method: &str,
    query: Option<&str>,
) -> String {
    let base = provider_endpoint.trim_end_matches('/');
    let path = endpoint_path.trim_matches('/');
    let method = method.trim_start_matches('/');
    let mut url = if path.is_empty() {
        format!("{base}/{method}")
    } else {
        format!("{base}/{path}/{method}")
    };
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn scrub_headers(inbound: &HeaderMap, caller: &str) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound {
        if is_forwardable(name) {
            out.insert(name.clone(), value.clone());
        }
    }
    if let Ok(value) = HeaderValue::from_str(caller) {
        out.insert(HeaderName::from_static(CALLER_HEADER), value);
    }
    out
}

fn record_call(
    state: &HostState,
    caller: &str,
    registration: &connectplugin_core::ServiceRegistration,
    method: &str,
    status: u16,
    started: Instant,
) {
    let duration_ms = started.elapsed().as_millis() as u64;
    info!(
        caller,
        provider = %registration.provider_runtime_id,
        registration_id = %registration.registration_id,
        service_type = %registration.service_type,
        method,
        status,
        duration_ms,
        "[Router] Proxied call"
    );
    state.call_log.record(CallLogEntry {
        caller: caller.to_string(),
        provider: registration.provider_runtime_id.clone(),
        registration_id: registration.registration_id.clone(),
        service_type: registration.service_type.clone(),
        method: method.to_string(),
        status,
        duration_ms,
        at: Utc::now(),
    });
}
