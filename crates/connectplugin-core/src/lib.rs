//! # ConnectPlugin Core Library
//!
//! Domain logic and process-local state for the plugin framework host.
//!
//! ## Modules
//!
//! - `domain` - Core entities (RuntimeIdentity, ServiceRegistration, CapabilityGrant, AuthContext)
//! - `error` - Framework-wide error taxonomy
//! - `proto` - Wire types for the core RPC surface
//! - `ids` - Identifier and secret generation (CSPRNG-backed, failure-propagating)
//! - `token_store` - Bearer secret custody with TTL and constant-time validation
//! - `registry` - Service registry plus dependency graph under one critical section
//! - `graph` - Topological startup ordering and removal impact analysis
//! - `ratelimit` - Per-key token-bucket rate limiting
//! - `calllog` - Bounded ring of proxied inter-plugin calls

pub mod calllog;
pub mod domain;
pub mod error;
pub mod graph;
pub mod ids;
pub mod proto;
pub mod ratelimit;
pub mod registry;
pub mod token_store;

// Re-export commonly used types
pub use calllog::{CallLog, CallLogEntry};
pub use domain::{
    AuthContext, CapabilityGrant, CapabilityHandler, CapabilityRequest, CapabilityResponse,
    DiscoverStrategy, ProvidedService, RegistryEvent, RequiredService, RuntimeIdentity,
    ServiceRegistration,
};
pub use error::{Error, Result};

/// Environment variable suppressing the plaintext-endpoint warning, on
/// both the host and plugin sides.
pub const DISABLE_TLS_WARNING_ENV: &str = "CONNECTPLUGIN_DISABLE_TLS_WARNING";

/// Whether the TLS posture warning is suppressed by the environment.
pub fn tls_warning_disabled() -> bool {
    std::env::var(DISABLE_TLS_WARNING_ENV)
        .map(|v| {
            let v = v.to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes"
        })
        .unwrap_or(false)
}
pub use graph::{DependencyGraph, Impact, StartupOrderError};
pub use ratelimit::{RateLimitSettings, RateLimiter, ANONYMOUS_CLIENT_KEY};
pub use registry::{RouteTarget, ServiceRegistry};
pub use token_store::{IssuedToken, TokenKind, TokenStore, Validation};
