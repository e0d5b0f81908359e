//! Server-side plugin handle.
//!
//! A declared plugin service is an opaque handle with one operation the
//! host cares about: produce an HTTP handler for its implementation. The
//! host mounts it and never interprets its payloads.

use axum::Router;

/// A named RPC service this host serves directly on behalf of the
/// embedder.
pub trait ServerPlugin: Send + Sync {
    /// Path segment the service mounts under, e.g. `"kv.v1.KVService"`.
    fn service_name(&self) -> &str;

    /// Build the service's handler. Called once at serve time.
    fn handler(&self) -> Router;
}

/// Adapter for building a plugin service from a name and a router.
pub struct RouterPlugin {
    name: String,
    build: Box<dyn Fn() -> Router + Send + Sync>,
}

impl RouterPlugin {
    pub fn new(name: impl Into<String>, build: impl Fn() -> Router + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            build: Box::new(build),
        }
    }
}

impl ServerPlugin for RouterPlugin {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn handler(&self) -> Router {
        (self.build)()
    }
}
