//! RPC surface over the service registry.
//!
//! Discovery answers point at the host router, never at providers
//! directly. `WatchService` streams newline-delimited JSON events and
//! terminates when the caller's runtime identity is revoked or the
//! connection drops; subscribers that lag drop events and reconcile with
//! a fresh discovery.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use axum::Json;
use connectplugin_core::proto::{
    DiscoverServiceRequest, DiscoverServiceResponse, DiscoveredProvider, ImpactRequest,
    RegisterServiceRequest, RegisterServiceResponse, StartupOrderResponse,
    UnregisterServiceRequest, UnregisterServiceResponse, WatchServiceRequest,
};
use connectplugin_core::{Error, ServiceRegistration};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::auth::RuntimeAuth;
use crate::error::{ApiError, ApiResult};
use crate::state::HostState;

/// How often a watch stream re-checks that its caller is still live,
/// independent of event traffic.
const WATCH_LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

/// POST `/plugin.v1.ServiceRegistry/RegisterService`
pub async fn register_service(
    State(state): State<Arc<HostState>>,
    RuntimeAuth(auth): RuntimeAuth,
    Json(request): Json<RegisterServiceRequest>,
) -> ApiResult<Json<RegisterServiceResponse>> {
    let registration = state.registry.register(
        &auth.identity,
        &request.service_type,
        request.version,
        &request.endpoint_path,
        request.metadata,
    )?;
    Ok(Json(RegisterServiceResponse {
        registration_id: registration.registration_id,
        registered_at: registration.registered_at,
    }))
}

/// POST `/plugin.v1.ServiceRegistry/UnregisterService`
pub async fn unregister_service(
    State(state): State<Arc<HostState>>,
    RuntimeAuth(auth): RuntimeAuth,
    Json(request): Json<UnregisterServiceRequest>,
) -> ApiResult<Json<UnregisterServiceResponse>> {
    let removed = state
        .registry
        .unregister(&request.registration_id, &auth.identity)?;
    Ok(Json(UnregisterServiceResponse {
        service_type: removed.service_type,
    }))
}

/// POST `/plugin.v1.ServiceRegistry/DiscoverService`
pub async fn discover_service(
    State(state): State<Arc<HostState>>,
    RuntimeAuth(_auth): RuntimeAuth,
    Json(request): Json<DiscoverServiceRequest>,
) -> ApiResult<Json<DiscoverServiceResponse>> {
    let matches = state.registry.discover(
        &request.service_type,
        request.min_version.as_ref(),
        request.strategy,
    )?;
    let providers = matches
        .into_iter()
        .map(|reg| router_endpoint(&state.base_url, reg))
        .collect();
    Ok(Json(DiscoverServiceResponse { providers }))
}

fn router_endpoint(base_url: &str, reg: ServiceRegistration) -> DiscoveredProvider {
    DiscoveredProvider {
        endpoint: format!(
            "{}/services/{}/{}/",
            base_url, reg.service_type, reg.registration_id
        ),
        registration_id: reg.registration_id,
        provider_runtime_id: reg.provider_runtime_id,
        service_type: reg.service_type,
        version: reg.version,
        metadata: reg.metadata,
    }
}

/// POST `/plugin.v1.ServiceRegistry/WatchService`
///
/// Server-streaming: one JSON event per line.
pub async fn watch_service(
    State(state): State<Arc<HostState>>,
    RuntimeAuth(auth): RuntimeAuth,
    Json(request): Json<WatchServiceRequest>,
) -> ApiResult<Response> {
    if request.service_type.is_empty() {
        return Err(ApiError(Error::InvalidArgument(
            "service_type is empty".into(),
        )));
    }

    let mut events = state.registry.subscribe();
    let registry = state.registry.clone();
    let caller = auth.identity.clone();
    let service_type = request.service_type.clone();
    debug!(caller = %caller, service_type = %service_type, "[Registry] Watch started");

    let stream = async_stream::stream! {
        let mut liveness = tokio::time::interval(WATCH_LIVENESS_INTERVAL);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = liveness.tick() => {
                    if !registry.runtime_alive(&caller) {
                        debug!(caller = %caller, "[Registry] Watch caller revoked; closing stream");
                        break;
                    }
                }
                received = events.recv() => {
                    match received {
                        Ok(event) => {
                            if event.registration().service_type != service_type {
                                continue;
                            }
                            if !registry.runtime_alive(&caller) {
                                break;
                            }
                            match serde_json::to_string(&event) {
                                Ok(mut line) => {
                                    line.push('\n');
                                    yield Ok::<_, std::convert::Infallible>(line.into_bytes());
                                }
                                Err(e) => {
                                    warn!(error = %e, "[Registry] Failed to encode watch event");
                                }
                            }
                        }
                        // Lagged subscribers drop events; a fresh
                        // discovery reconciles them.
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(caller = %caller, skipped, "[Registry] Watch subscriber lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
    };

    let response = Response::builder()
        .status(200)
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError(Error::Internal(format!("failed to build stream: {e}"))))?;
    Ok(response)
}

/// POST `/plugin.v1.ServiceRegistry/StartupOrder`
pub async fn startup_order(
    State(state): State<Arc<HostState>>,
    RuntimeAuth(_auth): RuntimeAuth,
) -> ApiResult<Json<StartupOrderResponse>> {
    let order = state.registry.startup_order().map_err(Error::from)?;
    Ok(Json(StartupOrderResponse { order }))
}

/// POST `/plugin.v1.ServiceRegistry/GetImpact`
pub async fn get_impact(
    State(state): State<Arc<HostState>>,
    RuntimeAuth(_auth): RuntimeAuth,
    Json(request): Json<ImpactRequest>,
) -> ApiResult<Json<connectplugin_core::Impact>> {
    let impact = state.registry.impact(&request.runtime_id)?;
    Ok(Json(impact))
}
