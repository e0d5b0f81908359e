//! Core entities: runtime identities, service registrations, capability
//! grants, and the per-request authentication context.

mod auth;
mod grant;
mod identity;
mod registration;

pub use auth::AuthContext;
pub use grant::{CapabilityGrant, CapabilityHandler, CapabilityRequest, CapabilityResponse};
pub use identity::{ProvidedService, RequiredService, RuntimeIdentity};
pub use registration::{DiscoverStrategy, RegistryEvent, ServiceRegistration};
