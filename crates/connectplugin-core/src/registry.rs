//! Runtime catalog of plugin-provided services.
//!
//! The registry owns the dependency graph: both mutate under a single
//! mutex, so watchers never observe an endpoint that is not reflected in
//! the graph, nor vice versa. Watch fan-out uses a bounded broadcast
//! channel; lagging subscribers drop events and reconcile with a fresh
//! discovery.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::domain::{
    DiscoverStrategy, ProvidedService, RegistryEvent, RuntimeIdentity, ServiceRegistration,
};
use crate::error::{Error, Result};
use crate::graph::{DependencyGraph, Impact, StartupOrderError};

/// Watch channel capacity. Subscribers further behind than this lose
/// events (and are expected to re-discover).
const EVENT_CAPACITY: usize = 256;

/// How long a removed registration's type is remembered for router
/// failover.
const TOMBSTONE_TTL_SECS: i64 = 600;

/// Routing decision for one inbound `/services/...` call.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    /// The addressed registration's provider is live and healthy.
    Direct {
        registration: ServiceRegistration,
        provider_endpoint: String,
    },
    /// The addressed provider is gone or unhealthy; an alternate provider
    /// of the same service type was selected.
    Failover {
        registration: ServiceRegistration,
        provider_endpoint: String,
    },
}

impl RouteTarget {
    pub fn registration(&self) -> &ServiceRegistration {
        match self {
            RouteTarget::Direct { registration, .. } | RouteTarget::Failover { registration, .. } => {
                registration
            }
        }
    }

    pub fn provider_endpoint(&self) -> &str {
        match self {
            RouteTarget::Direct {
                provider_endpoint, ..
            }
            | RouteTarget::Failover {
                provider_endpoint, ..
            } => provider_endpoint,
        }
    }
}

struct Tombstone {
    service_type: String,
    removed_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    runtimes: HashMap<String, RuntimeIdentity>,
    /// BTreeMap so the `first` strategy and `all` ordering are
    /// deterministic given state.
    registrations: BTreeMap<String, ServiceRegistration>,
    by_provider: HashMap<String, BTreeSet<String>>,
    by_type: BTreeMap<String, BTreeSet<String>>,
    unhealthy: HashSet<String>,
    round_robin: HashMap<String, usize>,
    tombstones: HashMap<String, Tombstone>,
    graph: DependencyGraph,
}

/// Process-local service registry plus dependency graph.
pub struct ServiceRegistry {
    inner: Mutex<Inner>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Subscribe to registration events. Each subscriber receives every
    /// event emitted after subscription, in mutation order.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    // ── Runtime lifecycle ──────────────────────────────────────────────

    /// Record a runtime identity minted by handshake, adding its node to
    /// the dependency graph.
    pub fn add_runtime(&self, identity: RuntimeIdentity) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.runtimes.contains_key(&identity.runtime_id) {
            return Err(Error::Internal(format!(
                "runtime id collision: {}",
                identity.runtime_id
            )));
        }
        inner.graph.add(&identity);
        info!(
            runtime_id = %identity.runtime_id,
            self_id = %identity.self_id,
            "[Registry] Runtime joined"
        );
        inner.runtimes.insert(identity.runtime_id.clone(), identity);
        Ok(())
    }

    /// Remove a runtime and cascade to its registrations. Returns the
    /// removed registrations. Idempotent.
    pub fn remove_runtime(&self, runtime_id: &str) -> Vec<ServiceRegistration> {
        let mut inner = self.inner.lock();
        if inner.runtimes.remove(runtime_id).is_none() {
            return Vec::new();
        }

        let reg_ids: Vec<String> = inner
            .by_provider
            .remove(runtime_id)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        let mut removed = Vec::with_capacity(reg_ids.len());
        let now = Utc::now();
        for reg_id in reg_ids {
            if let Some(reg) = inner.registrations.remove(&reg_id) {
                if let Some(set) = inner.by_type.get_mut(&reg.service_type) {
                    set.remove(&reg_id);
                    if set.is_empty() {
                        inner.by_type.remove(&reg.service_type);
                    }
                }
                inner.tombstones.insert(
                    reg_id,
                    Tombstone {
                        service_type: reg.service_type.clone(),
                        removed_at: now,
                    },
                );
                removed.push(reg);
            }
        }
        inner.unhealthy.remove(runtime_id);
        inner.graph.remove(runtime_id);
        Self::prune_tombstones(&mut inner, now);

        info!(
            runtime_id,
            registrations = removed.len(),
            "[Registry] Runtime removed"
        );
        for reg in &removed {
            let _ = self.events.send(RegistryEvent::Removed(reg.clone()));
        }
        removed
    }

    /// Whether a runtime identity is live.
    pub fn runtime_alive(&self, runtime_id: &str) -> bool {
        self.inner.lock().runtimes.contains_key(runtime_id)
    }

    /// Fetch a live runtime identity.
    pub fn runtime(&self, runtime_id: &str) -> Option<RuntimeIdentity> {
        self.inner.lock().runtimes.get(runtime_id).cloned()
    }

    // ── Registrations ──────────────────────────────────────────────────

    /// Accept a provider's offer of a service.
    ///
    /// Rejects a second registration with the same `(service_type,
    /// version)` from the same provider.
    pub fn register(
        &self,
        provider_runtime_id: &str,
        service_type: &str,
        version: semver::Version,
        endpoint_path: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ServiceRegistration> {
        if service_type.is_empty() {
            return Err(Error::InvalidArgument("service_type is empty".into()));
        }
        let mut inner = self.inner.lock();
        if !inner.runtimes.contains_key(provider_runtime_id) {
            return Err(Error::FailedPrecondition(format!(
                "provider runtime {provider_runtime_id} is not live"
            )));
        }
        let duplicate = inner
            .by_provider
            .get(provider_runtime_id)
            .map(|regs| {
                regs.iter().any(|id| {
                    let reg = &inner.registrations[id];
                    reg.service_type == service_type && reg.version == version
                })
            })
            .unwrap_or(false);
        if duplicate {
            return Err(Error::InvalidArgument(format!(
                "provider {provider_runtime_id} already registered {service_type}@{version}"
            )));
        }

        let registration = ServiceRegistration {
            registration_id: uuid::Uuid::new_v4().to_string(),
            provider_runtime_id: provider_runtime_id.to_string(),
            service_type: service_type.to_string(),
            version: version.clone(),
            endpoint_path: endpoint_path.to_string(),
            metadata,
            registered_at: Utc::now(),
        };

        inner
            .registrations
            .insert(registration.registration_id.clone(), registration.clone());
        inner
            .by_provider
            .entry(provider_runtime_id.to_string())
            .or_default()
            .insert(registration.registration_id.clone());
        inner
            .by_type
            .entry(service_type.to_string())
            .or_default()
            .insert(registration.registration_id.clone());
        inner.graph.add_provided(
            provider_runtime_id,
            ProvidedService {
                service_type: service_type.to_string(),
                version,
            },
        );

        debug!(
            registration_id = %registration.registration_id,
            provider = provider_runtime_id,
            service_type,
            "[Registry] Service registered"
        );
        let _ = self.events.send(RegistryEvent::Added(registration.clone()));
        Ok(registration)
    }

    /// Withdraw a registration. Only its owning runtime may do so.
    pub fn unregister(
        &self,
        registration_id: &str,
        caller_runtime_id: &str,
    ) -> Result<ServiceRegistration> {
        let mut inner = self.inner.lock();
        let Some(reg) = inner.registrations.get(registration_id) else {
            return Err(Error::NotFound(format!("registration {registration_id}")));
        };
        if reg.provider_runtime_id != caller_runtime_id {
            return Err(Error::PermissionDenied(
                "registration is owned by another runtime".into(),
            ));
        }

        let reg = inner.registrations.remove(registration_id).unwrap();
        if let Some(set) = inner.by_provider.get_mut(&reg.provider_runtime_id) {
            set.remove(registration_id);
        }
        if let Some(set) = inner.by_type.get_mut(&reg.service_type) {
            set.remove(registration_id);
            if set.is_empty() {
                inner.by_type.remove(&reg.service_type);
            }
        }
        let now = Utc::now();
        inner.tombstones.insert(
            registration_id.to_string(),
            Tombstone {
                service_type: reg.service_type.clone(),
                removed_at: now,
            },
        );
        inner
            .graph
            .remove_provided(&reg.provider_runtime_id, &reg.service_type, &reg.version);
        Self::prune_tombstones(&mut inner, now);

        debug!(registration_id, "[Registry] Service unregistered");
        let _ = self.events.send(RegistryEvent::Removed(reg.clone()));
        Ok(reg)
    }

    /// Find providers of a service type.
    ///
    /// Only registrations whose provider is live and healthy are visible.
    /// Fails `NotFound` when the matching set is empty. Selection is
    /// deterministic given state for every strategy except `random`.
    pub fn discover(
        &self,
        service_type: &str,
        min_version: Option<&semver::Version>,
        strategy: DiscoverStrategy,
    ) -> Result<Vec<ServiceRegistration>> {
        let mut inner = self.inner.lock();
        let matches = Self::visible_registrations(&inner, service_type, min_version);
        if matches.is_empty() {
            return Err(Error::NotFound(format!("no provider for {service_type}")));
        }

        Ok(match strategy {
            DiscoverStrategy::All => matches,
            DiscoverStrategy::First => vec![matches[0].clone()],
            DiscoverStrategy::RoundRobin => {
                let cursor = inner.round_robin.entry(service_type.to_string()).or_insert(0);
                let pick = matches[*cursor % matches.len()].clone();
                *cursor = cursor.wrapping_add(1);
                vec![pick]
            }
            DiscoverStrategy::Random => {
                let pick = rand::thread_rng().gen_range(0..matches.len());
                vec![matches[pick].clone()]
            }
        })
    }

    fn visible_registrations(
        inner: &Inner,
        service_type: &str,
        min_version: Option<&semver::Version>,
    ) -> Vec<ServiceRegistration> {
        inner
            .by_type
            .get(service_type)
            .map(|ids| {
                ids.iter()
                    .map(|id| &inner.registrations[id])
                    .filter(|reg| !inner.unhealthy.contains(&reg.provider_runtime_id))
                    .filter(|reg| min_version.map(|min| &reg.version >= min).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Health ─────────────────────────────────────────────────────────

    /// Hide a provider's registrations from discovery and routing.
    /// Emits `Updated` for each of its registrations.
    pub fn mark_unhealthy(&self, runtime_id: &str) {
        self.set_health(runtime_id, false);
    }

    /// Restore a provider's visibility.
    pub fn mark_healthy(&self, runtime_id: &str) {
        self.set_health(runtime_id, true);
    }

    /// Whether a live runtime is currently healthy.
    pub fn is_healthy(&self, runtime_id: &str) -> bool {
        let inner = self.inner.lock();
        inner.runtimes.contains_key(runtime_id) && !inner.unhealthy.contains(runtime_id)
    }

    fn set_health(&self, runtime_id: &str, healthy: bool) {
        let mut inner = self.inner.lock();
        let changed = if healthy {
            inner.unhealthy.remove(runtime_id)
        } else {
            inner.runtimes.contains_key(runtime_id)
                && inner.unhealthy.insert(runtime_id.to_string())
        };
        if !changed {
            return;
        }
        info!(runtime_id, healthy, "[Registry] Provider health changed");
        let regs: Vec<ServiceRegistration> = inner
            .by_provider
            .get(runtime_id)
            .map(|ids| ids.iter().map(|id| inner.registrations[id].clone()).collect())
            .unwrap_or_default();
        drop(inner);
        for reg in regs {
            let _ = self.events.send(RegistryEvent::Updated(reg));
        }
    }

    // ── Routing ────────────────────────────────────────────────────────

    /// Resolve the proxy target for a registration id, failing over to
    /// the highest-version healthy alternate of the same service type
    /// when the addressed provider is revoked or unhealthy.
    pub fn resolve_route(&self, registration_id: &str) -> Result<RouteTarget> {
        let inner = self.inner.lock();

        let service_type = if let Some(reg) = inner.registrations.get(registration_id) {
            let healthy = !inner.unhealthy.contains(&reg.provider_runtime_id);
            if healthy {
                let endpoint = inner
                    .runtimes
                    .get(&reg.provider_runtime_id)
                    .map(|r| r.endpoint.clone())
                    .ok_or_else(|| {
                        Error::Internal(format!(
                            "registration {registration_id} has no live runtime"
                        ))
                    })?;
                return Ok(RouteTarget::Direct {
                    registration: reg.clone(),
                    provider_endpoint: endpoint,
                });
            }
            reg.service_type.clone()
        } else if let Some(tomb) = inner.tombstones.get(registration_id) {
            tomb.service_type.clone()
        } else {
            return Err(Error::NotFound(format!("registration {registration_id}")));
        };

        // Failover: highest healthy version of the same type.
        let alternate = Self::visible_registrations(&inner, &service_type, None)
            .into_iter()
            .filter(|reg| reg.registration_id != registration_id)
            .max_by(|a, b| {
                a.version
                    .cmp(&b.version)
                    .then_with(|| b.registration_id.cmp(&a.registration_id))
            });
        match alternate {
            Some(reg) => {
                let endpoint = inner
                    .runtimes
                    .get(&reg.provider_runtime_id)
                    .map(|r| r.endpoint.clone())
                    .ok_or_else(|| {
                        Error::Internal(format!(
                            "registration {} has no live runtime",
                            reg.registration_id
                        ))
                    })?;
                Ok(RouteTarget::Failover {
                    registration: reg,
                    provider_endpoint: endpoint,
                })
            }
            None => Err(Error::Unavailable(format!(
                "no healthy provider for {service_type}"
            ))),
        }
    }

    // ── Graph views ────────────────────────────────────────────────────

    /// Topological startup order over required-for-startup edges.
    pub fn startup_order(&self) -> std::result::Result<Vec<String>, StartupOrderError> {
        self.inner.lock().graph.startup_order()
    }

    /// Removal impact analysis for a live runtime.
    pub fn impact(&self, runtime_id: &str) -> Result<Impact> {
        self.inner.lock().graph.impact(runtime_id)
    }

    /// Run a closure against a consistent registry+graph snapshot. Used
    /// by tests asserting the atomicity invariant.
    pub fn with_consistent_view<T>(
        &self,
        f: impl FnOnce(&[ServiceRegistration], &DependencyGraph) -> T,
    ) -> T {
        let inner = self.inner.lock();
        let regs: Vec<ServiceRegistration> = inner.registrations.values().cloned().collect();
        f(&regs, &inner.graph)
    }

    fn prune_tombstones(inner: &mut Inner, now: DateTime<Utc>) {
        let ttl = Duration::seconds(TOMBSTONE_TTL_SECS);
        inner.tombstones.retain(|_, t| now - t.removed_at < ttl);
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
