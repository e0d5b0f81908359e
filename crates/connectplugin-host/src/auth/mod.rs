//! Auth interceptor chain for the host.
//!
//! Every non-handshake handler runs behind [`auth_middleware`], which
//! either attaches an [`AuthContext`] to the request or short-circuits
//! with a uniform `Unauthenticated` response. Failure sub-cases (missing
//! header, malformed header, unknown identity, expired or non-matching
//! secret) are indistinguishable on the wire.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::FromRequestParts,
    http::{header, request::Parts, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use connectplugin_core::{
    AuthContext, Error, Result, ServiceRegistry, TokenKind, TokenStore, Validation,
};
use tracing::{debug, warn};

use crate::broker::CapabilityBroker;
use crate::error::ApiError;

/// Header naming the caller's runtime identity.
pub const RUNTIME_ID_HEADER: &str = "x-plugin-runtime-id";
/// Header the router stamps on proxied requests so providers can
/// attribute calls to the originating runtime.
pub const CALLER_HEADER: &str = "x-plugin-caller";

/// One link of the interceptor chain.
///
/// `Ok(None)` means the provider abstains (its credentials are absent);
/// the chain moves on. `Err` short-circuits the chain.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Tag recorded on the contexts this provider produces.
    fn name(&self) -> &'static str;

    /// Inspect request parts and either produce an identity, abstain, or
    /// reject.
    async fn authenticate(&self, parts: &Parts) -> Result<Option<AuthContext>>;
}

/// Strip a `Bearer ` prefix from an Authorization header value.
fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
}

// ── Runtime token provider ─────────────────────────────────────────────

/// Authenticates the `X-Plugin-Runtime-ID` + bearer pair against the
/// token store. Expired runtime tokens cascade: the runtime's node,
/// registrations, and grants are removed before the rejection goes out.
pub struct RuntimeTokenProvider {
    token_store: Arc<TokenStore>,
    registry: Arc<ServiceRegistry>,
    broker: Option<Arc<CapabilityBroker>>,
}

impl RuntimeTokenProvider {
    pub fn new(
        token_store: Arc<TokenStore>,
        registry: Arc<ServiceRegistry>,
        broker: Option<Arc<CapabilityBroker>>,
    ) -> Self {
        Self {
            token_store,
            registry,
            broker,
        }
    }

    fn expire_runtime(&self, runtime_id: &str) {
        self.registry.remove_runtime(runtime_id);
        if let Some(broker) = &self.broker {
            broker.revoke_owner(runtime_id);
        }
        self.token_store.revoke_by_runtime(runtime_id);
    }
}

#[async_trait]
impl AuthProvider for RuntimeTokenProvider {
    fn name(&self) -> &'static str {
        "runtime-token"
    }

    async fn authenticate(&self, parts: &Parts) -> Result<Option<AuthContext>> {
        let Some(runtime_id) = parts
            .headers
            .get(RUNTIME_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return Ok(None);
        };
        let Some(token) = bearer_token(parts) else {
            return Err(Error::Unauthenticated);
        };

        match self
            .token_store
            .validate_kind(runtime_id, token, Some(TokenKind::Runtime))
        {
            Validation::Valid => {
                if !self.registry.runtime_alive(runtime_id) {
                    // Token outlived the identity; treat as revoked.
                    return Err(Error::Unauthenticated);
                }
                Ok(Some(AuthContext::new(runtime_id, self.name())))
            }
            Validation::Expired => {
                self.expire_runtime(runtime_id);
                Err(Error::Unauthenticated)
            }
            Validation::Unknown => Err(Error::Unauthenticated),
        }
    }
}

// ── Generic token provider ─────────────────────────────────────────────

/// Opaque-token-to-identity step supplied by the embedder.
pub type ValidateToken = dyn Fn(&str) -> Result<Option<AuthContext>> + Send + Sync;

/// Reads a configured header and delegates validation to a callback.
pub struct TokenAuthProvider {
    header: String,
    prefix: Option<String>,
    validate: Arc<ValidateToken>,
}

impl TokenAuthProvider {
    /// Provider over `Authorization: Bearer ...`.
    pub fn bearer(validate: Arc<ValidateToken>) -> Self {
        Self {
            header: header::AUTHORIZATION.to_string(),
            prefix: Some("Bearer ".to_string()),
            validate,
        }
    }

    /// Provider over an arbitrary header carrying the raw token.
    pub fn with_header(header: impl Into<String>, validate: Arc<ValidateToken>) -> Self {
        Self {
            header: header.into(),
            prefix: None,
            validate,
        }
    }
}

#[async_trait]
impl AuthProvider for TokenAuthProvider {
    fn name(&self) -> &'static str {
        "token"
    }

    async fn authenticate(&self, parts: &Parts) -> Result<Option<AuthContext>> {
        let Some(raw) = parts
            .headers
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok())
        else {
            return Ok(None);
        };
        let token = match &self.prefix {
            Some(prefix) => match raw.strip_prefix(prefix.as_str()) {
                Some(t) => t,
                None => return Err(Error::Unauthenticated),
            },
            None => raw,
        };
        if token.is_empty() {
            return Err(Error::Unauthenticated);
        }
        match (self.validate)(token)? {
            Some(ctx) => Ok(Some(ctx)),
            None => Err(Error::Unauthenticated),
        }
    }
}

// ── Mutual TLS provider ────────────────────────────────────────────────

/// Peer certificate facts injected into request extensions by an outer
/// middleware that owns the TLS connection state.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificate {
    /// Subject common name of the leaf certificate.
    pub common_name: Option<String>,
    /// Subject organization values; may be empty.
    pub organization: Vec<String>,
    /// Subject alternative names, in certificate order.
    pub sans: Vec<String>,
}

/// Derive `(identity, claims)` from a peer certificate.
pub type ExtractIdentity = dyn Fn(&PeerCertificate) -> Result<AuthContext> + Send + Sync;

/// Default extractor: common name, falling back to the first SAN. Never
/// assumes the organization is present.
pub fn default_extract_identity(cert: &PeerCertificate) -> Result<AuthContext> {
    let identity = cert
        .common_name
        .clone()
        .or_else(|| cert.sans.first().cloned())
        .ok_or(Error::Unauthenticated)?;
    let mut ctx = AuthContext::new(identity, "mtls");
    if let Some(org) = cert.organization.first() {
        ctx = ctx.with_claim("organization", org.clone());
    }
    if let Some(san) = cert.sans.first() {
        ctx = ctx.with_claim("san", san.clone());
    }
    Ok(ctx)
}

/// Authenticates from TLS connection state.
///
/// The connection state must be injected by outer middleware; its absence
/// is a deployment misconfiguration and maps to `Internal`, not
/// `Unauthenticated`.
pub struct MtlsAuthProvider {
    extract: Arc<ExtractIdentity>,
}

impl MtlsAuthProvider {
    pub fn new() -> Self {
        Self {
            extract: Arc::new(default_extract_identity),
        }
    }

    pub fn with_extractor(extract: Arc<ExtractIdentity>) -> Self {
        Self { extract }
    }
}

impl Default for MtlsAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthProvider for MtlsAuthProvider {
    fn name(&self) -> &'static str {
        "mtls"
    }

    async fn authenticate(&self, parts: &Parts) -> Result<Option<AuthContext>> {
        let Some(cert) = parts.extensions.get::<PeerCertificate>() else {
            return Err(Error::Internal(
                "mTLS interceptor configured but no TLS state was injected".into(),
            ));
        };
        (self.extract)(cert).map(Some)
    }
}

// ── Composite provider ─────────────────────────────────────────────────

/// Tries providers in order; the first identity wins. All abstaining is
/// an authentication failure.
pub struct CompositeAuthProvider {
    providers: Vec<Arc<dyn AuthProvider>>,
}

impl CompositeAuthProvider {
    pub fn new(providers: Vec<Arc<dyn AuthProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl AuthProvider for CompositeAuthProvider {
    fn name(&self) -> &'static str {
        "composite"
    }

    async fn authenticate(&self, parts: &Parts) -> Result<Option<AuthContext>> {
        for provider in &self.providers {
            if let Some(ctx) = provider.authenticate(parts).await? {
                return Ok(Some(ctx));
            }
        }
        Ok(None)
    }
}

// ── Middleware and extractor ───────────────────────────────────────────

/// Run the configured interceptor chain and attach the resulting
/// [`AuthContext`], or answer with the uniform 401.
pub async fn auth_middleware(
    axum::extract::State(state): axum::extract::State<Arc<crate::state::HostState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let mut context = None;
    for provider in &state.interceptors {
        match provider.authenticate(&parts).await {
            Ok(Some(ctx)) => {
                debug!(identity = %ctx.identity, provider = ctx.provider, "[Auth] Authenticated");
                context = Some(ctx);
                break;
            }
            Ok(None) => continue,
            Err(e) => {
                if !matches!(e, Error::Unauthenticated) {
                    warn!(provider = provider.name(), error = %e, "[Auth] Provider error");
                }
                return ApiError(e).into_response();
            }
        }
    }

    let Some(context) = context else {
        return ApiError(Error::Unauthenticated).into_response();
    };
    parts.extensions.insert(context);
    request = Request::from_parts(parts, body);
    next.run(request).await
}

/// Extractor for handlers behind [`auth_middleware`].
pub struct RuntimeAuth(pub AuthContext);

impl<S> FromRequestParts<S> for RuntimeAuth
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .map(RuntimeAuth)
            .ok_or((StatusCode::UNAUTHORIZED, "missing authentication context"))
    }
}
