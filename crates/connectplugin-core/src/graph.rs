//! Dependency graph over live runtime identities.
//!
//! Nodes are runtime identities; a directed edge exists from provider to
//! dependent for every requirement satisfied by that provider. The
//! provider index is recomputed whenever nodes or registrations change.
//! Required-for-startup edges must form a DAG.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::domain::{ProvidedService, RequiredService, RuntimeIdentity};
use crate::error::Error;

/// Why no startup order exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartupOrderError {
    /// Required-for-startup edges form at least one cycle.
    #[error("dependency cycle across required services: {}", members.join(", "))]
    CycleDetected {
        /// Nodes left with unresolved in-degree, sorted.
        members: Vec<String>,
    },
    /// A required-for-startup dependency has no satisfying provider.
    #[error("unsatisfied dependency: {runtime_id} requires {service_type}")]
    UnsatisfiedDependency {
        runtime_id: String,
        service_type: String,
    },
}

impl From<StartupOrderError> for Error {
    fn from(e: StartupOrderError) -> Self {
        Error::FailedPrecondition(e.to_string())
    }
}

/// Result of removal impact analysis. The three sets are disjoint and
/// never contain the analyzed node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impact {
    /// Service types that lose their last provider.
    pub affected_services: BTreeSet<String>,
    /// Transitive closure of nodes whose required-for-startup dependency
    /// becomes unsatisfiable.
    pub affected_plugins: BTreeSet<String>,
    /// Nodes that depend on the removed provider but stay satisfiable,
    /// through an alternate provider or because the dependency is optional.
    pub optional_impact: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct Node {
    provides: Vec<ProvidedService>,
    requires: Vec<RequiredService>,
}

/// Logical dependency view. Owned by the service registry and mutated
/// under its critical section so registry and graph stay consistent.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, Node>,
    /// service type -> providers, rebuilt on every mutation.
    by_type: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the node for an identity.
    pub fn add(&mut self, identity: &RuntimeIdentity) {
        self.nodes.insert(
            identity.runtime_id.clone(),
            Node {
                provides: identity.provides.clone(),
                requires: identity.requires.clone(),
            },
        );
        self.reindex();
    }

    /// Remove a node. Returns whether it existed.
    pub fn remove(&mut self, runtime_id: &str) -> bool {
        let existed = self.nodes.remove(runtime_id).is_some();
        if existed {
            self.reindex();
        }
        existed
    }

    /// Extend a node's provided services with a runtime registration.
    pub fn add_provided(&mut self, runtime_id: &str, provided: ProvidedService) {
        if let Some(node) = self.nodes.get_mut(runtime_id) {
            if !node.provides.contains(&provided) {
                node.provides.push(provided);
            }
            self.reindex();
        }
    }

    /// Drop one provided service from a node, e.g. on unregistration.
    pub fn remove_provided(&mut self, runtime_id: &str, service_type: &str, version: &semver::Version) {
        if let Some(node) = self.nodes.get_mut(runtime_id) {
            node.provides
                .retain(|p| !(p.service_type == service_type && &p.version == version));
            self.reindex();
        }
    }

    pub fn contains(&self, runtime_id: &str) -> bool {
        self.nodes.contains_key(runtime_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Providers of a service type, sorted.
    pub fn providers_of(&self, service_type: &str) -> Vec<String> {
        self.by_type
            .get(service_type)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn reindex(&mut self) {
        self.by_type.clear();
        for (id, node) in &self.nodes {
            for p in &node.provides {
                self.by_type
                    .entry(p.service_type.clone())
                    .or_default()
                    .insert(id.clone());
            }
        }
    }

    /// Providers satisfying one requirement, minus an excluded set.
    fn satisfying_providers(
        &self,
        require: &RequiredService,
        excluded: &BTreeSet<String>,
    ) -> Vec<String> {
        let Some(candidates) = self.by_type.get(&require.service_type) else {
            return Vec::new();
        };
        candidates
            .iter()
            .filter(|id| !excluded.contains(*id))
            .filter(|id| {
                self.nodes[*id].provides.iter().any(|p| {
                    p.service_type == require.service_type && p.version >= require.min_version
                })
            })
            .cloned()
            .collect()
    }

    /// Topological startup order over required-for-startup edges only.
    ///
    /// Kahn's algorithm; ties break by lexicographic runtime id, so the
    /// order is deterministic given state. A provider always appears
    /// before every node that requires it.
    pub fn startup_order(&self) -> Result<Vec<String>, StartupOrderError> {
        let empty = BTreeSet::new();
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.keys().map(|k| (k.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (id, node) in &self.nodes {
            for require in node.requires.iter().filter(|r| r.required_for_startup) {
                let providers = self.satisfying_providers(require, &empty);
                if providers.is_empty() {
                    return Err(StartupOrderError::UnsatisfiedDependency {
                        runtime_id: id.clone(),
                        service_type: require.service_type.clone(),
                    });
                }
                for provider in providers {
                    // Self-provision satisfies the requirement without an edge.
                    if provider == *id {
                        continue;
                    }
                    let (provider_key, _) = self
                        .nodes
                        .get_key_value(provider.as_str())
                        .expect("provider index references live node");
                    dependents
                        .entry(provider_key.as_str())
                        .or_default()
                        .push(id.as_str());
                    *in_degree.get_mut(id.as_str()).unwrap() += 1;
                }
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(&next) = ready.iter().next() {
            ready.remove(next);
            order.push(next.to_string());
            if let Some(deps) = dependents.get(next) {
                for dep in deps {
                    let d = in_degree.get_mut(dep).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*dep);
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            let mut members: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(k, _)| k.to_string())
                .collect();
            members.sort();
            return Err(StartupOrderError::CycleDetected { members });
        }
        Ok(order)
    }

    /// Removal impact analysis for one node.
    pub fn impact(&self, runtime_id: &str) -> Result<Impact, Error> {
        let target = self
            .nodes
            .get(runtime_id)
            .ok_or_else(|| Error::NotFound(format!("runtime {runtime_id}")))?;

        let mut impact = Impact::default();

        // Service types whose only provider is the target.
        for p in &target.provides {
            let providers = self.by_type.get(&p.service_type);
            let sole = providers
                .map(|s| s.len() == 1 && s.contains(runtime_id))
                .unwrap_or(false);
            if sole {
                impact.affected_services.insert(p.service_type.clone());
            }
        }

        // Transitive closure over required-for-startup edges that become
        // unsatisfiable once the target (and anything already affected)
        // is gone.
        let mut removed: BTreeSet<String> = BTreeSet::from([runtime_id.to_string()]);
        let mut changed = true;
        while changed {
            changed = false;
            for (id, node) in &self.nodes {
                if removed.contains(id) {
                    continue;
                }
                let unsatisfied = node
                    .requires
                    .iter()
                    .filter(|r| r.required_for_startup)
                    .any(|r| self.satisfying_providers(r, &removed).is_empty());
                if unsatisfied {
                    removed.insert(id.clone());
                    changed = true;
                }
            }
        }
        impact.affected_plugins = removed;
        impact.affected_plugins.remove(runtime_id);

        // Everything else that consumed the target's services but stays
        // satisfiable.
        let none = BTreeSet::new();
        for (id, node) in &self.nodes {
            if id == runtime_id || impact.affected_plugins.contains(id) {
                continue;
            }
            let consumed_target = node.requires.iter().any(|r| {
                self.satisfying_providers(r, &none)
                    .iter()
                    .any(|p| p == runtime_id)
            });
            if consumed_target {
                impact.optional_impact.insert(id.clone());
            }
        }

        Ok(impact)
    }
}
