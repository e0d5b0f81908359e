//! Shared host state handed to every handler.

use std::sync::Arc;

use connectplugin_core::{
    CallLog, Error, RateLimiter, Result, ServiceRegistry, TokenStore, ANONYMOUS_CLIENT_KEY,
};

use crate::auth::AuthProvider;
use crate::broker::CapabilityBroker;
use crate::config::HostConfig;
use crate::health::HealthService;

/// Process-wide state with an explicit lifecycle: constructed by the
/// host server, passed to components by reference, torn down on
/// shutdown. No ambient singletons.
pub struct HostState {
    pub config: HostConfig,
    pub base_url: String,
    pub token_store: Arc<TokenStore>,
    pub registry: Arc<ServiceRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub broker: Arc<CapabilityBroker>,
    pub call_log: Arc<CallLog>,
    pub health: Arc<HealthService>,
    pub interceptors: Vec<Arc<dyn AuthProvider>>,
    /// Shared client for proxied downstream calls.
    pub http: reqwest::Client,
}

impl HostState {
    /// Gate one request through the rate limiter. Callers with no usable
    /// key share the anonymous bucket.
    pub fn check_rate(&self, endpoint: &str, client_key: &str) -> Result<()> {
        let key = if client_key.is_empty() {
            ANONYMOUS_CLIENT_KEY
        } else {
            client_key
        };
        if self.rate_limiter.allow(endpoint, key) {
            Ok(())
        } else {
            Err(Error::ResourceExhausted)
        }
    }
}
