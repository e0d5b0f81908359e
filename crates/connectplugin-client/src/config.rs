//! Plugin-side client configuration.

use std::time::Duration;

use connectplugin_core::domain::{ProvidedService, RequiredService};

use crate::circuit::CircuitBreakerConfig;
use crate::retry::RetryPolicy;

/// The closed set of client options.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host base URL, e.g. `http://127.0.0.1:3210`.
    pub endpoint: String,
    /// This plugin's stable name, declared at handshake.
    pub self_id: String,
    /// Base URL of this plugin's own HTTP server, advertised at
    /// handshake so the host router can reach it.
    pub plugin_endpoint: String,
    /// Protocol versions this plugin speaks, tried highest first.
    pub app_protocol_versions: Vec<u32>,
    /// Magic cookie forwarded in the handshake when set.
    pub magic_cookie: Option<(String, String)>,
    /// Services declared as provided at handshake.
    pub provides: Vec<ProvidedService>,
    /// Services declared as required at handshake.
    pub requires: Vec<RequiredService>,
    /// Defer the handshake until the first authenticated call.
    pub lazy_connect: bool,
    /// Skip the handshake entirely (for callers that manage their own
    /// credentials).
    pub skip_handshake: bool,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Circuit breaker over host calls. `None` disables breaking.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Background host health poll cadence. `None` disables the monitor.
    pub health_check_interval: Option<Duration>,
    pub health_check_timeout: Duration,
}

impl ClientConfig {
    /// Sensible defaults for a plugin talking to `endpoint`.
    pub fn new(
        endpoint: impl Into<String>,
        self_id: impl Into<String>,
        plugin_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            self_id: self_id.into(),
            plugin_endpoint: plugin_endpoint.into(),
            app_protocol_versions: vec![1],
            magic_cookie: None,
            provides: Vec::new(),
            requires: Vec::new(),
            lazy_connect: true,
            skip_handshake: false,
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
            health_check_interval: None,
            health_check_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_magic_cookie(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.magic_cookie = Some((key.into(), value.into()));
        self
    }

    pub fn with_provides(mut self, provides: Vec<ProvidedService>) -> Self {
        self.provides = provides;
        self
    }

    pub fn with_requires(mut self, requires: Vec<RequiredService>) -> Self {
        self.requires = requires;
        self
    }

    pub fn with_protocol_versions(mut self, versions: Vec<u32>) -> Self {
        self.app_protocol_versions = versions;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_health_checks(mut self, interval: Duration) -> Self {
        self.health_check_interval = Some(interval);
        self
    }

    pub fn eager(mut self) -> Self {
        self.lazy_connect = false;
        self
    }
}
