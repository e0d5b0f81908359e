//! Runtime identities minted by the handshake.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A service a plugin offers to other plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidedService {
    /// Service type, e.g. `"logger"`.
    pub service_type: String,
    /// Semantic version of the offered service.
    pub version: semver::Version,
}

/// A service a plugin consumes from other plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredService {
    /// Service type, e.g. `"logger"`.
    pub service_type: String,
    /// Minimum acceptable version.
    pub min_version: semver::Version,
    /// When true, the host refuses to compute a startup order unless some
    /// live provider satisfies this dependency.
    #[serde(default)]
    pub required_for_startup: bool,
}

/// Identity of one live plugin connection.
///
/// `runtime_id` is unique within the host process. The same `self_id` may
/// appear in several runtime identities when a plugin runs replicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeIdentity {
    /// Opaque, host-unique identifier derived from `self_id` plus a random
    /// suffix.
    pub runtime_id: String,
    /// Stable identity supplied by the plugin.
    pub self_id: String,
    /// Base URL at which the plugin's own HTTP server is reachable. The
    /// inter-plugin router proxies to endpoints relative to this.
    pub endpoint: String,
    /// When the handshake completed.
    pub issued_at: DateTime<Utc>,
    /// Services this plugin declared it provides.
    pub provides: Vec<ProvidedService>,
    /// Services this plugin declared it requires.
    pub requires: Vec<RequiredService>,
    /// Protocol version negotiated for this connection.
    pub protocol_version: u32,
}
