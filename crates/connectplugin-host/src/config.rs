//! Host server configuration.
//!
//! The option set is closed: everything the host honors is a field here.
//! TLS is consumed as a posture, not managed; the host warns on plaintext
//! listeners unless `CONNECTPLUGIN_DISABLE_TLS_WARNING` is set.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use connectplugin_core::{CapabilityHandler, RateLimitSettings};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthProvider;
use crate::plugin::ServerPlugin;

pub use connectplugin_core::{tls_warning_disabled, DISABLE_TLS_WARNING_ENV};

/// Rate-limited endpoint name for handshake (keyed by peer address).
pub const ENDPOINT_HANDSHAKE: &str = "handshake";
/// Rate-limited endpoint name for the inter-plugin router.
pub const ENDPOINT_SERVICE_ROUTER: &str = "service_router";
/// Rate-limited endpoint name for capability calls.
pub const ENDPOINT_CAPABILITIES: &str = "capabilities";

/// User cleanup callback run at the start of graceful shutdown, bounded
/// by the graceful timeout. Errors are logged, never fatal.
pub type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A host capability offer: the handler plus who may be granted it.
#[derive(Clone)]
pub struct CapabilityOffer {
    pub handler: Arc<dyn CapabilityHandler>,
    /// Plugin `self_id`s allowed to request this capability. `None`
    /// grants to any authenticated runtime.
    pub grant_to: Option<HashSet<String>>,
}

impl CapabilityOffer {
    /// Offer a capability to every authenticated runtime.
    pub fn for_everyone(handler: Arc<dyn CapabilityHandler>) -> Self {
        Self {
            handler,
            grant_to: None,
        }
    }

    /// Offer a capability to specific plugin `self_id`s only.
    pub fn for_plugins(
        handler: Arc<dyn CapabilityHandler>,
        self_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            handler,
            grant_to: Some(self_ids.into_iter().collect()),
        }
    }
}

/// Static serve-side settings.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Address to bind.
    pub addr: SocketAddr,
    /// Externally reachable base URL. Defaults to `http://{addr}` when
    /// unset; its scheme drives the TLS posture warning.
    pub advertise_url: Option<String>,
    /// Expected magic cookie; a UX validator for wiring mistakes, never a
    /// security control.
    pub magic_cookie: Option<(String, String)>,
    /// Protocol versions the host accepts.
    pub protocol_versions: Vec<u32>,
    /// Capability types advertised in the handshake response.
    pub server_capabilities: Vec<String>,
    /// Runtime token lifetime.
    pub runtime_token_ttl: chrono::Duration,
    /// Capability grant token lifetime.
    pub capability_grant_ttl: chrono::Duration,
    /// Periodic token sweep interval. `None` relies on lazy expiry only.
    pub token_cleanup_interval: Option<Duration>,
    /// Drain deadline for graceful shutdown, also the cleanup callback
    /// deadline.
    pub graceful_shutdown_timeout: Duration,
    /// Per-endpoint token-bucket settings. Endpoints absent from the map
    /// are uncapped.
    pub rate_limits: HashMap<String, RateLimitSettings>,
    /// Serve the health service.
    pub health_service: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:0".parse().expect("valid address"),
            advertise_url: None,
            magic_cookie: None,
            protocol_versions: vec![1],
            server_capabilities: Vec::new(),
            runtime_token_ttl: chrono::Duration::hours(24),
            capability_grant_ttl: chrono::Duration::hours(1),
            token_cleanup_interval: None,
            graceful_shutdown_timeout: Duration::from_secs(30),
            rate_limits: HashMap::new(),
            health_service: true,
        }
    }
}

impl HostConfig {
    /// Base URL clients are told to use.
    pub fn base_url(&self) -> String {
        self.advertise_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.addr))
    }

    /// Whether the advertised endpoint is plaintext HTTP (not unix, not
    /// https).
    pub fn is_plaintext(&self) -> bool {
        let url = self.base_url();
        url.starts_with("http://")
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_magic_cookie(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.magic_cookie = Some((key.into(), value.into()));
        self
    }

    pub fn with_protocol_versions(mut self, versions: Vec<u32>) -> Self {
        self.protocol_versions = versions;
        self
    }

    pub fn with_rate_limit(mut self, endpoint: impl Into<String>, settings: RateLimitSettings) -> Self {
        self.rate_limits.insert(endpoint.into(), settings);
        self
    }

    pub fn with_runtime_token_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.runtime_token_ttl = ttl;
        self
    }

    pub fn with_capability_grant_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.capability_grant_ttl = ttl;
        self
    }
}

/// Everything a host embeds beyond plain settings: capability handlers,
/// plugin implementations, the auth chain, and lifecycle hooks.
pub struct HostOptions {
    /// Host capabilities by type, e.g. `"secrets"`.
    pub capabilities: HashMap<String, CapabilityOffer>,
    /// Declared plugin services this host serves directly.
    pub plugins: Vec<Arc<dyn ServerPlugin>>,
    /// Auth interceptor chain for authenticated endpoints. When empty,
    /// the runtime-token provider is installed.
    pub interceptors: Vec<Arc<dyn AuthProvider>>,
    /// Cleanup callback run at shutdown start.
    pub cleanup: Option<CleanupFn>,
    /// External stop channel; cancelling it initiates graceful shutdown.
    pub stop: CancellationToken,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            capabilities: HashMap::new(),
            plugins: Vec::new(),
            interceptors: Vec::new(),
            cleanup: None,
            stop: CancellationToken::new(),
        }
    }
}

impl HostOptions {
    pub fn with_capability(
        mut self,
        capability_type: impl Into<String>,
        offer: CapabilityOffer,
    ) -> Self {
        self.capabilities.insert(capability_type.into(), offer);
        self
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn ServerPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn with_cleanup(mut self, cleanup: CleanupFn) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }
}
