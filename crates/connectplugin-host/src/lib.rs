//! ConnectPlugin Host
//!
//! HTTP server side of the plugin framework:
//! - Handshake and runtime identity issuance
//! - Capability broker under `/capabilities/`
//! - Service registry RPCs and watch streams
//! - Inter-plugin reverse proxy under `/services/`
//! - Auth interceptor chain (runtime token, mTLS, composite)
//! - Graceful lifecycle and TLS posture warnings

pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod handshake;
pub mod health;
pub mod plugin;
pub mod registry_api;
pub mod router;
pub mod server;
pub mod state;

pub use auth::{
    default_extract_identity, AuthProvider, CompositeAuthProvider, MtlsAuthProvider,
    PeerCertificate, RuntimeAuth, RuntimeTokenProvider, TokenAuthProvider, CALLER_HEADER,
    RUNTIME_ID_HEADER,
};
pub use broker::CapabilityBroker;
pub use config::{
    tls_warning_disabled, CapabilityOffer, CleanupFn, HostConfig, HostOptions,
    DISABLE_TLS_WARNING_ENV, ENDPOINT_CAPABILITIES, ENDPOINT_HANDSHAKE, ENDPOINT_SERVICE_ROUTER,
};
pub use error::{ApiError, ApiResult};
pub use health::HealthService;
pub use plugin::{RouterPlugin, ServerPlugin};
pub use server::HostServer;
pub use state::HostState;

// Wire types live in the core contract crate.
pub use connectplugin_core::proto;
