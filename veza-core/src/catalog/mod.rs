//! Service catalog.
//!
//! Static declarative registry of [`ServiceSpec`]s. A catalog is validated
//! once at load time and is immutable afterwards; every component reads
//! services in the provisioning order computed here.

mod builtin;

pub use builtin::builtin_services;

use crate::error::{Result, VezaError};
use crate::types::{ServiceSpec, Tier};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::debug;

/// On-disk catalog format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogFile {
    pub services: Vec<ServiceSpec>,
}

/// Validated, ordered set of services.
#[derive(Debug, Clone)]
pub struct Catalog {
    /// Services in provisioning order: by tier, then dependencies first.
    services: Vec<ServiceSpec>,
}

impl Catalog {
    /// Validate `services` and compute the provisioning order.
    pub fn new(services: Vec<ServiceSpec>) -> Result<Self> {
        let order = provisioning_order(&services)?;
        let mut by_name: HashMap<String, ServiceSpec> =
            services.into_iter().map(|s| (s.name.clone(), s)).collect();
        let services = order.iter().filter_map(|name| by_name.remove(name)).collect();
        Ok(Self { services })
    }

    /// The built-in eight-service topology.
    pub fn builtin() -> Result<Self> {
        Self::new(builtin_services().to_vec())
    }

    /// Parse a YAML catalog.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(content)
            .map_err(|e| VezaError::InvalidCatalog { reason: e.to_string() })?;
        Self::new(file.services)
    }

    /// Load a YAML catalog from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VezaError::IoError { path: path.to_path_buf(), source: e })?;
        let catalog = Self::from_yaml(&content)?;
        debug!(path = %path.display(), services = catalog.services.len(), "Catalog loaded");
        Ok(catalog)
    }

    /// Every service, in provisioning order.
    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Look up a service named on the command line.
    pub fn require(&self, name: &str) -> Result<&ServiceSpec> {
        self.get(name).ok_or_else(|| VezaError::precondition(name, "no such service in catalog"))
    }

    /// Resolve command-line service names; an empty list means every service.
    ///
    /// Results keep provisioning order regardless of argument order.
    pub fn select(&self, names: &[String]) -> Result<Vec<&ServiceSpec>> {
        if names.is_empty() {
            return Ok(self.services.iter().collect());
        }
        for name in names {
            self.require(name)?;
        }
        Ok(self.services.iter().filter(|s| names.contains(&s.name)).collect())
    }

    /// Services grouped by tier, tiers in provisioning order.
    pub fn tiers(&self) -> Vec<(Tier, Vec<&ServiceSpec>)> {
        let mut tiers: BTreeMap<Tier, Vec<&ServiceSpec>> = BTreeMap::new();
        for spec in &self.services {
            tiers.entry(spec.tier()).or_default().push(spec);
        }
        tiers.into_iter().collect()
    }

    pub fn in_tier(&self, tier: Tier) -> impl Iterator<Item = &ServiceSpec> {
        self.services.iter().filter(move |s| s.tier() == tier)
    }

    /// The reverse-proxy service, if the catalog has one.
    pub fn edge(&self) -> Option<&ServiceSpec> {
        self.in_tier(Tier::Edge).next()
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, the names a shell `export` accepts.
fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate the graph and return names in provisioning order.
///
/// Kahn's algorithm over a ready set ordered by (tier, name), so the result
/// is deterministic and tier-grouped.
fn provisioning_order(services: &[ServiceSpec]) -> Result<Vec<String>> {
    if services.is_empty() {
        return Err(VezaError::InvalidCatalog { reason: "catalog has no services".to_string() });
    }

    let mut tiers: HashMap<&str, Tier> = HashMap::new();
    let mut ports: HashMap<u16, &str> = HashMap::new();
    for spec in services {
        if spec.name.is_empty() {
            return Err(VezaError::InvalidCatalog { reason: "service with empty name".to_string() });
        }
        if tiers.insert(&spec.name, spec.tier()).is_some() {
            return Err(VezaError::InvalidCatalog {
                reason: format!("duplicate service name {}", spec.name),
            });
        }
        if let Some(other) = ports.insert(spec.port, &spec.name) {
            return Err(VezaError::InvalidCatalog {
                reason: format!("port {} used by both {} and {}", spec.port, other, spec.name),
            });
        }
        if let Some(key) = spec.env.keys().find(|k| !is_env_name(k)) {
            return Err(VezaError::InvalidCatalog {
                reason: format!("{}: invalid environment variable name {:?}", spec.name, key),
            });
        }
    }

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for spec in services {
        in_degree.entry(&spec.name).or_insert(0);
        for dep in &spec.depends_on {
            let Some(dep_tier) = tiers.get(dep.as_str()) else {
                return Err(VezaError::InvalidCatalog {
                    reason: format!("service {} depends on unknown service {}", spec.name, dep),
                });
            };
            if *dep_tier > spec.tier() {
                return Err(VezaError::InvalidCatalog {
                    reason: format!(
                        "service {} ({} tier) depends on {} in later {} tier",
                        spec.name,
                        spec.tier(),
                        dep,
                        dep_tier
                    ),
                });
            }
            *in_degree.entry(&spec.name).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(&spec.name);
        }
    }

    let mut ready: BTreeSet<(Tier, &str)> = in_degree
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(name, _)| (tiers[name], *name))
        .collect();

    let mut order = Vec::with_capacity(services.len());
    while let Some(next) = ready.pop_first() {
        let (_, name) = next;
        order.push(name.to_string());
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(count) = in_degree.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert((tiers[dependent], *dependent));
                }
            }
        }
    }

    if order.len() != services.len() {
        let stuck: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(name, _)| *name)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        return Err(VezaError::InvalidCatalog {
            reason: format!("circular dependency among {}", stuck.join(", ")),
        });
    }

    Ok(order)
}
