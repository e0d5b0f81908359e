//! Client-side plugin handles.
//!
//! A plugin client adapter is an opaque handle that knows how to build a
//! service client given an endpoint and an HTTP client. Typed access is
//! a thin helper performing a checked downcast.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use connectplugin_core::{DiscoverStrategy, Error, Result};
use url::Url;

use crate::client::PluginClient;

/// Client adapter for one service type.
pub trait ClientPlugin: Send + Sync {
    /// Service type this adapter builds clients for, e.g. `"logger"`.
    fn service_type(&self) -> &str;

    /// Build a type-erased client for a provider endpoint.
    fn build(&self, endpoint: Url, http: reqwest::Client) -> Box<dyn Any + Send + Sync>;
}

/// Downcast a type-erased client handle.
pub fn typed_client<T: 'static>(handle: Box<dyn Any + Send + Sync>) -> Result<Box<T>> {
    handle.downcast::<T>().map_err(|_| {
        Error::Internal(format!(
            "plugin client is not a {}",
            std::any::type_name::<T>()
        ))
    })
}

/// Registered client adapters, looked up by service type at call time.
#[derive(Default)]
pub struct PluginClientSet {
    adapters: HashMap<String, Arc<dyn ClientPlugin>>,
    http: reqwest::Client,
}

impl PluginClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: Arc<dyn ClientPlugin>) -> Self {
        self.adapters
            .insert(adapter.service_type().to_string(), adapter);
        self
    }

    /// Discover a provider through the host and build a typed client for
    /// it. The endpoint points at the host router, so calls are
    /// host-mediated.
    pub async fn client_for<T: 'static>(
        &self,
        client: &PluginClient,
        service_type: &str,
        min_version: Option<semver::Version>,
    ) -> Result<Box<T>> {
        let adapter = self.adapters.get(service_type).ok_or_else(|| {
            Error::NotFound(format!("no client adapter for {service_type}"))
        })?;
        let providers = client
            .discover_service(service_type, min_version, DiscoverStrategy::First)
            .await?;
        let provider = providers
            .first()
            .ok_or_else(|| Error::NotFound(format!("no provider for {service_type}")))?;
        let endpoint = Url::parse(&provider.endpoint)
            .map_err(|e| Error::Internal(format!("bad provider endpoint: {e}")))?;
        typed_client::<T>(adapter.build(endpoint, self.http.clone()))
    }
}
