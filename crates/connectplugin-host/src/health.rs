//! Health service following the standard health contract.
//!
//! Unauthenticated, explicitly enabled via config. `Check` is unary;
//! `Watch` streams the current status followed by every transition.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use axum::Json;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::state::HostState;
use connectplugin_core::proto::{HealthCheckRequest, HealthCheckResponse, ServingStatus};
use connectplugin_core::Error;

const WATCH_CAPACITY: usize = 64;

/// In-process health registry.
pub struct HealthService {
    statuses: RwLock<HashMap<String, ServingStatus>>,
    updates: broadcast::Sender<(String, ServingStatus)>,
}

impl HealthService {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(WATCH_CAPACITY);
        let mut statuses = HashMap::new();
        // The host itself serves once constructed.
        statuses.insert(String::new(), ServingStatus::Serving);
        Self {
            statuses: RwLock::new(statuses),
            updates,
        }
    }

    /// Set a service's status, broadcasting the transition to watchers.
    pub fn set(&self, service: impl Into<String>, status: ServingStatus) {
        let service = service.into();
        let changed = {
            let mut statuses = self.statuses.write();
            statuses.insert(service.clone(), status) != Some(status)
        };
        if changed {
            debug!(service = %service, ?status, "[Health] Status changed");
            let _ = self.updates.send((service, status));
        }
    }

    /// Current status; `Unknown` for unregistered services.
    pub fn check(&self, service: &str) -> ServingStatus {
        self.statuses
            .read()
            .get(service)
            .copied()
            .unwrap_or(ServingStatus::Unknown)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, ServingStatus)> {
        self.updates.subscribe()
    }
}

impl Default for HealthService {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// HTTP surface
// ============================================================================

/// GET `/health` — liveness probe.
pub async fn health() -> &'static str {
    "OK"
}

/// POST `/plugin.v1.Health/Check`
pub async fn check(
    State(state): State<Arc<HostState>>,
    Json(request): Json<HealthCheckRequest>,
) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: state.health.check(&request.service),
    })
}

/// POST `/plugin.v1.Health/Watch`
///
/// Streams the current status, then one line per transition.
pub async fn watch(
    State(state): State<Arc<HostState>>,
    Json(request): Json<HealthCheckRequest>,
) -> ApiResult<Response> {
    let service = request.service;
    let mut updates = state.health.subscribe();
    let current = state.health.check(&service);

    let stream = async_stream::stream! {
        let line = |status: ServingStatus| {
            serde_json::to_string(&HealthCheckResponse { status })
                .map(|mut s| {
                    s.push('\n');
                    s.into_bytes()
                })
        };
        if let Ok(first) = line(current) {
            yield Ok::<_, std::convert::Infallible>(first);
        }
        loop {
            match updates.recv().await {
                Ok((changed, status)) if changed == service => {
                    if let Ok(next) = line(status) {
                        yield Ok(next);
                    }
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Response::builder()
        .status(200)
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError(Error::Internal(format!("failed to build stream: {e}"))))
}
