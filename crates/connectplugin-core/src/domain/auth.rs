//! Per-request authentication context.

use std::collections::HashMap;

/// Identity attached to a request after the auth interceptor chain runs.
///
/// Immutable for the lifetime of the request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Authenticated principal, e.g. a `runtime_id` or a certificate
    /// common name.
    pub identity: String,
    /// Tag of the provider that produced this context, e.g. `"runtime-token"`.
    pub provider: &'static str,
    /// Provider-specific claims.
    pub claims: HashMap<String, String>,
}

impl AuthContext {
    /// Context with an identity and no claims.
    pub fn new(identity: impl Into<String>, provider: &'static str) -> Self {
        Self {
            identity: identity.into(),
            provider,
            claims: HashMap::new(),
        }
    }

    /// Add a claim.
    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }
}
