//! Plugin-side client for the host's core RPC surface.
//!
//! Handles the handshake (lazily by default), attaches runtime
//! credentials to every authenticated call, retries transient failures
//! per the configured policy, and trips a circuit breaker when the host
//! stays unreachable.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use connectplugin_core::proto::{
    DiscoverServiceRequest, DiscoverServiceResponse, DiscoveredProvider, GrantedCapability,
    HandshakeRequest, HandshakeResponse, HealthCheckRequest, HealthCheckResponse, ImpactRequest,
    RegisterServiceRequest, RegisterServiceResponse, RequestCapabilityRequest, RevokeRequest,
    RevokeResponse, StartupOrderResponse, UnregisterServiceRequest, UnregisterServiceResponse,
    WatchServiceRequest,
};
use connectplugin_core::{
    tls_warning_disabled, DiscoverStrategy, Error, Impact, RegistryEvent, Result,
};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::circuit::CircuitBreaker;
use crate::config::ClientConfig;

/// Header naming the caller's runtime identity.
const RUNTIME_ID_HEADER: &str = "x-plugin-runtime-id";

/// Credentials and negotiation results from a completed handshake.
#[derive(Clone)]
struct Session {
    runtime_id: String,
    runtime_token: Zeroizing<String>,
    expires_at: DateTime<Utc>,
    negotiated_protocol_version: u32,
    server_capabilities: Vec<String>,
}

/// Client half of the plugin protocol.
pub struct PluginClient {
    config: ClientConfig,
    /// Unary calls, bounded by `request_timeout`.
    http: reqwest::Client,
    /// Streaming calls (watch); no overall deadline.
    http_stream: reqwest::Client,
    session: tokio::sync::RwLock<Option<Session>>,
    circuit: Option<CircuitBreaker>,
}

impl PluginClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.endpoint.starts_with("http://") && !tls_warning_disabled() {
            warn!(
                endpoint = %config.endpoint,
                "[Client] Host endpoint is plaintext HTTP; traffic including bearer \
                 tokens is visible on the network. Configure TLS, or set \
                 CONNECTPLUGIN_DISABLE_TLS_WARNING=1 to silence this warning"
            );
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build http client: {e}")))?;
        let http_stream = reqwest::Client::builder()
            .connect_timeout(config.handshake_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build http client: {e}")))?;

        let circuit = config.circuit_breaker.clone().map(CircuitBreaker::new);
        Ok(Self {
            config,
            http,
            http_stream,
            session: tokio::sync::RwLock::new(None),
            circuit,
        })
    }

    /// Perform the handshake now instead of on first use.
    pub async fn connect(&self) -> Result<()> {
        if self.config.skip_handshake {
            return Ok(());
        }
        self.handshake_locked().await.map(|_| ())
    }

    /// Runtime id once a handshake has completed.
    pub async fn runtime_id(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.runtime_id.clone())
    }

    /// Capability types the host advertised at handshake.
    pub async fn server_capabilities(&self) -> Option<Vec<String>> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.server_capabilities.clone())
    }

    /// Negotiated protocol version once a handshake has completed.
    pub async fn negotiated_protocol_version(&self) -> Option<u32> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.negotiated_protocol_version)
    }

    async fn ensure_session(&self) -> Result<Session> {
        if self.config.skip_handshake {
            return Err(Error::FailedPrecondition(
                "handshake was skipped; no runtime credentials".into(),
            ));
        }
        {
            let session = self.session.read().await;
            match session.as_ref() {
                Some(session) if session.expires_at > Utc::now() => {
                    return Ok(session.clone());
                }
                Some(_) => {} // expired; re-handshake below
                None if !self.config.lazy_connect => {
                    return Err(Error::FailedPrecondition(
                        "lazy connect is disabled; call connect() first".into(),
                    ));
                }
                None => {}
            }
        }
        self.handshake_locked().await
    }

    async fn handshake_locked(&self) -> Result<Session> {
        let mut slot = self.session.write().await;
        if let Some(session) = slot.as_ref() {
            if session.expires_at > Utc::now() {
                return Ok(session.clone());
            }
        }
        let session = self.do_handshake().await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Try supported versions highest first; the host rejects versions
    /// outside its set with `InvalidArgument`.
    async fn do_handshake(&self) -> Result<Session> {
        let mut versions = self.config.app_protocol_versions.clone();
        versions.sort_unstable();
        versions.reverse();
        if versions.is_empty() {
            return Err(Error::FailedPrecondition(
                "no app protocol versions configured".into(),
            ));
        }

        let mut last_error = None;
        for version in versions {
            let request = HandshakeRequest {
                protocol_version: version,
                self_id: self.config.self_id.clone(),
                endpoint: self.config.plugin_endpoint.clone(),
                magic_cookie_key: self.config.magic_cookie.as_ref().map(|(k, _)| k.clone()),
                magic_cookie_value: self.config.magic_cookie.as_ref().map(|(_, v)| v.clone()),
                provides: self.config.provides.clone(),
                requires: self.config.requires.clone(),
            };
            let url = format!(
                "{}/plugin.v1.HandshakeService/Handshake",
                self.config.endpoint.trim_end_matches('/')
            );
            let result = tokio::time::timeout(
                self.config.handshake_timeout,
                self.http.post(&url).json(&request).send(),
            )
            .await;

            let response = match result {
                Err(_) => {
                    return Err(Error::Unavailable("handshake timed out".into()));
                }
                Ok(Err(e)) => {
                    return Err(Error::Unavailable(format!("handshake target unreachable: {e}")));
                }
                Ok(Ok(resp)) => resp,
            };

            match decode::<HandshakeResponse>(response).await {
                Ok(handshake) => {
                    info!(
                        runtime_id = %handshake.runtime_id,
                        protocol_version = handshake.negotiated_protocol_version,
                        "[Client] Handshake complete"
                    );
                    return Ok(Session {
                        runtime_id: handshake.runtime_id,
                        runtime_token: Zeroizing::new(handshake.runtime_token),
                        expires_at: handshake.expires_at,
                        negotiated_protocol_version: handshake.negotiated_protocol_version,
                        server_capabilities: handshake.server_capabilities,
                    });
                }
                Err(e @ Error::InvalidArgument(_)) => {
                    debug!(version, error = %e, "[Client] Version rejected; trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.map_or_else(
            || Error::FailedPrecondition("version negotiation failed".into()),
            |e| Error::FailedPrecondition(format!("version negotiation failed: {e}")),
        ))
    }

    /// One authenticated unary RPC with retries and circuit breaking.
    async fn call<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut attempts = 0u32;
        loop {
            if let Some(circuit) = &self.circuit {
                circuit.check()?;
            }
            attempts += 1;

            let result = self.call_once(path, request).await;
            match result {
                Ok(resp) => {
                    if let Some(circuit) = &self.circuit {
                        circuit.on_success();
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    let transient = e.is_retryable();
                    if transient {
                        if let Some(circuit) = &self.circuit {
                            circuit.on_failure();
                        }
                    }
                    if !self.config.retry_policy.should_retry(&e, attempts) {
                        return Err(e);
                    }
                    let backoff = self.config.retry_policy.backoff(attempts - 1);
                    debug!(path, attempts, backoff_ms = backoff.as_millis() as u64, error = %e,
                        "[Client] Retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn call_once<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let session = self.ensure_session().await?;
        let url = format!("{}{path}", self.config.endpoint.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .header(RUNTIME_ID_HEADER, &session.runtime_id)
            .bearer_auth(session.runtime_token.as_str())
            .json(request)
            .send()
            .await
            .map_err(into_transport_error)?;
        decode(response).await
    }

    // ── Service registry ───────────────────────────────────────────────

    pub async fn register_service(
        &self,
        request: RegisterServiceRequest,
    ) -> Result<RegisterServiceResponse> {
        self.call("/plugin.v1.ServiceRegistry/RegisterService", &request)
            .await
    }

    pub async fn unregister_service(
        &self,
        registration_id: impl Into<String>,
    ) -> Result<UnregisterServiceResponse> {
        self.call(
            "/plugin.v1.ServiceRegistry/UnregisterService",
            &UnregisterServiceRequest {
                registration_id: registration_id.into(),
            },
        )
        .await
    }

    pub async fn discover_service(
        &self,
        service_type: impl Into<String>,
        min_version: Option<semver::Version>,
        strategy: DiscoverStrategy,
    ) -> Result<Vec<DiscoveredProvider>> {
        let response: DiscoverServiceResponse = self
            .call(
                "/plugin.v1.ServiceRegistry/DiscoverService",
                &DiscoverServiceRequest {
                    service_type: service_type.into(),
                    min_version,
                    strategy,
                },
            )
            .await?;
        Ok(response.providers)
    }

    pub async fn startup_order(&self) -> Result<Vec<String>> {
        let response: StartupOrderResponse = self
            .call(
                "/plugin.v1.ServiceRegistry/StartupOrder",
                &serde_json::json!({}),
            )
            .await?;
        Ok(response.order)
    }

    pub async fn get_impact(&self, runtime_id: impl Into<String>) -> Result<Impact> {
        self.call(
            "/plugin.v1.ServiceRegistry/GetImpact",
            &ImpactRequest {
                runtime_id: runtime_id.into(),
            },
        )
        .await
    }

    /// Watch a service type: a lazy, restartable stream of registry
    /// events. Ends when this runtime is revoked or the host closes the
    /// stream; a lagging consumer should re-discover and watch again.
    pub async fn watch_service(
        &self,
        service_type: impl Into<String>,
    ) -> Result<impl Stream<Item = Result<RegistryEvent>> + Unpin> {
        let session = self.ensure_session().await?;
        let url = format!(
            "{}/plugin.v1.ServiceRegistry/WatchService",
            self.config.endpoint.trim_end_matches('/')
        );
        let response = self
            .http_stream
            .post(&url)
            .header(RUNTIME_ID_HEADER, &session.runtime_id)
            .bearer_auth(session.runtime_token.as_str())
            .json(&WatchServiceRequest {
                service_type: service_type.into(),
            })
            .send()
            .await
            .map_err(into_transport_error)?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buf.drain(..=pos).collect();
                            let line = &line[..line.len() - 1];
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_slice::<RegistryEvent>(line) {
                                Ok(event) => yield Ok(event),
                                Err(e) => {
                                    yield Err(Error::Internal(format!("bad watch event: {e}")))
                                }
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(Error::Unavailable(format!("watch stream broke: {e}")));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    // ── Capabilities ───────────────────────────────────────────────────

    pub async fn request_capability(
        &self,
        capability_type: impl Into<String>,
    ) -> Result<GrantedCapability> {
        self.call(
            "/plugin.v1.CapabilityBroker/RequestCapability",
            &RequestCapabilityRequest {
                capability_type: capability_type.into(),
            },
        )
        .await
    }

    /// Invoke a granted capability below its endpoint.
    pub async fn call_capability(
        &self,
        grant: &GrantedCapability,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = format!(
            "{}{}",
            grant.endpoint_url.trim_end_matches('/'),
            with_leading_slash(path)
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&grant.bearer_token)
            .json(&body)
            .send()
            .await
            .map_err(into_transport_error)?;
        decode(response).await
    }

    // ── Inter-plugin calls ─────────────────────────────────────────────

    /// Call another plugin's service through the host router.
    pub async fn call_service(
        &self,
        provider: &DiscoveredProvider,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let session = self.ensure_session().await?;
        let url = format!(
            "{}{}",
            provider.endpoint.trim_end_matches('/'),
            with_leading_slash(method)
        );
        let response = self
            .http
            .post(&url)
            .header(RUNTIME_ID_HEADER, &session.runtime_id)
            .bearer_auth(session.runtime_token.as_str())
            .json(&body)
            .send()
            .await
            .map_err(into_transport_error)?;
        decode(response).await
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Revoke this runtime's identity and forget the session.
    pub async fn revoke(&self) -> Result<RevokeResponse> {
        let session = self.ensure_session().await?;
        let response: RevokeResponse = self
            .call(
                "/plugin.v1.HandshakeService/Revoke",
                &RevokeRequest {
                    runtime_id: session.runtime_id.clone(),
                },
            )
            .await?;
        *self.session.write().await = None;
        Ok(response)
    }

    /// One unauthenticated health probe against the host.
    pub async fn check_health(&self, service: impl Into<String>) -> Result<HealthCheckResponse> {
        let url = format!(
            "{}/plugin.v1.Health/Check",
            self.config.endpoint.trim_end_matches('/')
        );
        let response = tokio::time::timeout(
            self.config.health_check_timeout,
            self.http
                .post(&url)
                .json(&HealthCheckRequest {
                    service: service.into(),
                })
                .send(),
        )
        .await
        .map_err(|_| Error::Unavailable("health check timed out".into()))?
        .map_err(into_transport_error)?;
        decode(response).await
    }

    /// Poll host health on the configured cadence until cancelled.
    /// Returns `None` when no interval is configured.
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.config.health_check_interval?;
        let client = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match client.check_health("").await {
                            Ok(health) => {
                                debug!(status = ?health.status, "[Client] Host health");
                            }
                            Err(e) => {
                                warn!(error = %e, "[Client] Host health check failed");
                            }
                        }
                    }
                }
            }
        }))
    }
}

fn with_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn into_transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Unavailable("request timed out".into())
    } else {
        Error::Unavailable(format!("host unreachable: {e}"))
    }
}

/// Decode a JSON response, mapping non-2xx statuses through the wire
/// error body.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(decode_error(response).await);
    }
    response
        .json::<T>()
        .await
        .map_err(|e| Error::Internal(format!("bad response body: {e}")))
}

async fn decode_error(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    match response
        .json::<connectplugin_core::proto::ErrorBody>()
        .await
    {
        Ok(body) => Error::from_code(&body.code, &body.message),
        Err(_) => match status {
            401 => Error::Unauthenticated,
            429 => Error::ResourceExhausted,
            404 => Error::NotFound("unknown".into()),
            503 => Error::Unavailable("host returned 503".into()),
            _ => Error::Internal(format!("host returned status {status}")),
        },
    }
}
