//! Host server: route registration, TLS posture, and lifecycle.
//!
//! The server owns every piece of process-wide state (token store,
//! registry, rate limiter, broker, call log) and tears them down on
//! shutdown. Serving blocks until the stop channel is cancelled or a
//! termination signal arrives, then drains gracefully: stop accepting,
//! run the embedder's cleanup callback under the graceful deadline,
//! drain in-flight requests, force-close.

use std::collections::HashSet;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{any, get, post};
use axum::Router;
use connectplugin_core::{
    ratelimit, token_store, CallLog, Error, RateLimiter, ServiceRegistry, TokenStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{auth_middleware, AuthProvider, RuntimeTokenProvider};
use crate::broker::{self, CapabilityBroker};
use crate::config::{tls_warning_disabled, HostConfig, HostOptions};
use crate::handshake;
use crate::health::{self, HealthService};
use crate::registry_api;
use crate::router;
use crate::state::HostState;

/// Path prefixes reserved by the core. Declared plugins may not collide
/// with these.
const RESERVED_PREFIXES: &[&str] = &["plugin.v1", "capabilities", "services", "health"];

/// Sweep cadence for idle rate-limit buckets.
const RATE_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
/// Idle threshold beyond which a bucket is reclaimed.
const RATE_IDLE_THRESHOLD: std::time::Duration = std::time::Duration::from_secs(300);

/// The embedding host process.
pub struct HostServer {
    config: HostConfig,
    options: HostOptions,
    state: Arc<HostState>,
}

impl HostServer {
    /// Wire up process-wide state. Fails when declared plugins collide
    /// with each other or with reserved path prefixes.
    pub fn new(config: HostConfig, mut options: HostOptions) -> Result<Self, Error> {
        Self::validate_plugins(&options)?;

        let base_url = config.base_url();
        let token_store = Arc::new(TokenStore::new());
        let registry = Arc::new(ServiceRegistry::new());
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
        let broker = Arc::new(CapabilityBroker::new(
            options.capabilities.clone(),
            token_store.clone(),
            registry.clone(),
            config.capability_grant_ttl,
            base_url.clone(),
        ));

        let mut interceptors = std::mem::take(&mut options.interceptors);
        if interceptors.is_empty() {
            interceptors.push(Arc::new(RuntimeTokenProvider::new(
                token_store.clone(),
                registry.clone(),
                Some(broker.clone()),
            )) as Arc<dyn AuthProvider>);
        }

        let state = Arc::new(HostState {
            base_url,
            token_store,
            registry,
            rate_limiter,
            broker,
            call_log: Arc::new(CallLog::new()),
            health: Arc::new(HealthService::new()),
            interceptors,
            http: reqwest::Client::new(),
            config: config.clone(),
        });

        Ok(Self {
            config,
            options,
            state,
        })
    }

    fn validate_plugins(options: &HostOptions) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for plugin in &options.plugins {
            let name = plugin.service_name();
            if name.is_empty() {
                return Err(Error::Internal("declared plugin has an empty name".into()));
            }
            if !seen.insert(name.to_string()) {
                return Err(Error::Internal(format!(
                    "declared plugins collide on path {name}"
                )));
            }
            let first_segment = name.split('/').next().unwrap_or(name);
            if RESERVED_PREFIXES.contains(&first_segment) {
                return Err(Error::Internal(format!(
                    "plugin path {name} collides with a reserved prefix"
                )));
            }
        }
        Ok(())
    }

    /// Shared state handle, e.g. for tests and embedder tooling.
    pub fn state(&self) -> Arc<HostState> {
        self.state.clone()
    }

    /// Stop channel; cancelling it initiates graceful shutdown.
    pub fn stop_token(&self) -> CancellationToken {
        self.options.stop.clone()
    }

    /// Build the full route table.
    ///
    /// Registration order: handshake, health (optional), capability
    /// broker (when capabilities are offered), inter-plugin router, then
    /// each declared plugin handler.
    fn build_router(&self) -> Router {
        let state = self.state.clone();

        // Handshake is the only unauthenticated RPC.
        let mut router = Router::new().route(
            "/plugin.v1.HandshakeService/Handshake",
            post(handshake::handshake),
        );

        if self.config.health_service {
            router = router
                .route("/health", get(health::health))
                .route("/plugin.v1.Health/Check", post(health::check))
                .route("/plugin.v1.Health/Watch", post(health::watch));
        }

        // Grant-token surface authenticates per grant, outside the chain.
        if self.state.broker.is_enabled() {
            router = router.route(
                "/capabilities/{grant_id}/{*path}",
                any(broker::capability_call),
            );
        }

        // Everything below runs behind the interceptor chain.
        let mut authed = Router::new()
            .route("/plugin.v1.HandshakeService/Revoke", post(handshake::revoke))
            .route(
                "/plugin.v1.ServiceRegistry/RegisterService",
                post(registry_api::register_service),
            )
            .route(
                "/plugin.v1.ServiceRegistry/UnregisterService",
                post(registry_api::unregister_service),
            )
            .route(
                "/plugin.v1.ServiceRegistry/DiscoverService",
                post(registry_api::discover_service),
            )
            .route(
                "/plugin.v1.ServiceRegistry/WatchService",
                post(registry_api::watch_service),
            )
            .route(
                "/plugin.v1.ServiceRegistry/StartupOrder",
                post(registry_api::startup_order),
            )
            .route(
                "/plugin.v1.ServiceRegistry/GetImpact",
                post(registry_api::get_impact),
            )
            .route(
                "/services/{service_type}/{registration_id}/{*method}",
                any(router::route_service),
            );
        if self.state.broker.is_enabled() {
            authed = authed.route(
                "/plugin.v1.CapabilityBroker/RequestCapability",
                post(broker::request_capability),
            );
        }
        for plugin in &self.options.plugins {
            info!(service = plugin.service_name(), "[Host] Mounting plugin service");
            authed = authed.nest_service(&format!("/{}", plugin.service_name()), plugin.handler());
        }
        let authed = authed.layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

        router
            .merge(authed)
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind, serve, and block until shutdown completes.
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.config.addr;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already-bound listener (lets tests and embedders bind
    /// port 0 and learn the address first).
    pub async fn serve_on(mut self, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        self.warn_on_plaintext();

        let stop = self.options.stop.clone();
        let sweepers = self.spawn_sweepers(stop.clone());
        let cleanup = self.options.cleanup.take();
        let graceful_timeout = self.config.graceful_shutdown_timeout;
        let state = self.state.clone();

        let router = self.build_router();
        info!(%addr, "[Host] Serving");

        // Signals route through the stop token so the cleanup callback
        // runs regardless of how shutdown was requested.
        let signal_stop = stop.clone();
        let signal_task = tokio::spawn(async move {
            termination_signal().await;
            signal_stop.cancel();
        });

        let shutdown = stop.clone();
        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
        let mut server = std::pin::pin!(server.into_future());

        // Wait for either a shutdown request or the server exiting on
        // its own (accept error). Biased so the cleanup callback runs
        // even when the drain would finish within the same poll.
        let early_exit = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            result = server.as_mut() => Some(result),
        };

        let result = match early_exit {
            Some(result) => result.map_err(Into::into),
            None => {
                info!("[Host] Shutdown requested; draining");
                if let Some(cleanup) = cleanup {
                    match tokio::time::timeout(graceful_timeout, cleanup()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "[Host] Cleanup callback failed"),
                        Err(_) => warn!(
                            timeout_secs = graceful_timeout.as_secs(),
                            "[Host] Cleanup callback exceeded graceful deadline"
                        ),
                    }
                }
                match tokio::time::timeout(graceful_timeout, server.as_mut()).await {
                    Ok(result) => result.map_err(Into::into),
                    Err(_) => {
                        warn!(
                            timeout_secs = graceful_timeout.as_secs(),
                            "[Host] Drain deadline exceeded; force-closing"
                        );
                        Ok(())
                    }
                }
            }
        };

        // Tear down background tasks and leave the state empty.
        stop.cancel();
        signal_task.abort();
        for handle in sweepers {
            handle.abort();
        }
        state.health.set("", connectplugin_core::proto::ServingStatus::NotServing);
        info!("[Host] Stopped");
        result
    }

    /// Serve in the background; the returned handle resolves when the
    /// server has fully stopped.
    pub fn spawn(self) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.serve().await })
    }

    fn warn_on_plaintext(&self) {
        if self.config.is_plaintext() && !tls_warning_disabled() {
            warn!(
                endpoint = %self.config.base_url(),
                "[Host] Serving plugins over plaintext HTTP; traffic including bearer \
                 tokens is visible on the network. Configure TLS, or set \
                 CONNECTPLUGIN_DISABLE_TLS_WARNING=1 to silence this warning"
            );
        }
    }

    fn spawn_sweepers(&self, stop: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(interval) = self.config.token_cleanup_interval {
            let registry = self.state.registry.clone();
            let broker = self.state.broker.clone();
            handles.push(token_store::spawn_sweeper(
                self.state.token_store.clone(),
                interval,
                stop.clone(),
                move |expired| {
                    // Expired runtime tokens cascade to the node and its
                    // grants; expired grant tokens just drop the grant.
                    for owner_key in expired {
                        if broker.remove_grant(&owner_key) {
                            continue;
                        }
                        registry.remove_runtime(&owner_key);
                        broker.revoke_owner(&owner_key);
                    }
                },
            ));
        }

        handles.push(ratelimit::spawn_sweeper(
            self.state.rate_limiter.clone(),
            RATE_SWEEP_INTERVAL,
            RATE_IDLE_THRESHOLD,
            stop,
        ));
        handles
    }
}

async fn termination_signal() {
    use tokio::signal;
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
