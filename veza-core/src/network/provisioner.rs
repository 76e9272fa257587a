//! Network provisioner and address-resolution cache.

use crate::adapters::ContainerRuntime;
use crate::error::{Result, VezaError};
use crate::network::NetworkDriver;
use crate::retry::RetryPolicy;
use crate::types::NetworkTopology;
use ipnetwork::Ipv4Network;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, instrument, warn};

/// Result of [`NetworkProvisioner::ensure_network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Unchanged,
}

/// Ensures the bridge exists and tracks container addresses.
///
/// The address cache is the single source of "where is container X":
/// filled by [`resolve_address`](Self::resolve_address), cleared by
/// [`invalidate`](Self::invalidate) whenever a container restarts.
pub struct NetworkProvisioner {
    driver: Arc<dyn NetworkDriver>,
    runtime: Arc<dyn ContainerRuntime>,
    topology: NetworkTopology,
    retry: RetryPolicy,
    addresses: RwLock<HashMap<String, Ipv4Addr>>,
}

impl NetworkProvisioner {
    pub fn new(
        driver: Arc<dyn NetworkDriver>,
        runtime: Arc<dyn ContainerRuntime>,
        topology: NetworkTopology,
        retry: RetryPolicy,
    ) -> Self {
        Self { driver, runtime, topology, retry, addresses: RwLock::new(HashMap::new()) }
    }

    pub fn topology(&self) -> &NetworkTopology {
        &self.topology
    }

    /// Create the bridge if missing.
    ///
    /// An existing bridge with the same subnet is left alone; a different
    /// subnet is a `SubnetConflict` and the bridge is never reconfigured.
    #[instrument(skip(self), fields(bridge = %self.topology.bridge_name))]
    pub async fn ensure_network(&self) -> Result<EnsureOutcome> {
        let requested = self.topology.subnet()?;

        let Some(existing) = self.driver.inspect(&self.topology.bridge_name).await? else {
            self.driver.create(&self.topology).await?;
            info!(subnet = %requested, "Bridge created");
            return Ok(EnsureOutcome::Created);
        };

        let existing_net = existing.ipv4_cidr.as_deref().and_then(normalize);
        if existing_net != Some(requested) {
            return Err(VezaError::SubnetConflict {
                bridge: self.topology.bridge_name.clone(),
                existing: existing.ipv4_cidr.unwrap_or_else(|| "none".to_string()),
                requested: requested.to_string(),
            });
        }

        if existing.nat != self.topology.nat_enabled {
            warn!(
                existing = existing.nat,
                requested = self.topology.nat_enabled,
                "Bridge NAT setting differs; leaving it unchanged"
            );
        }

        debug!("Bridge already matches");
        Ok(EnsureOutcome::Unchanged)
    }

    /// Delete the bridge. Refused while any container is attached.
    #[instrument(skip(self), fields(bridge = %self.topology.bridge_name))]
    pub async fn remove_network(&self) -> Result<bool> {
        let Some(existing) = self.driver.inspect(&self.topology.bridge_name).await? else {
            return Ok(false);
        };
        if !existing.attached.is_empty() {
            return Err(VezaError::precondition(
                &self.topology.bridge_name,
                format!("still attached: {}", existing.attached.join(", ")),
            ));
        }
        self.driver.delete(&self.topology.bridge_name).await?;
        self.addresses.write().unwrap_or_else(|p| p.into_inner()).clear();
        Ok(true)
    }

    /// Address of `container`, polling the runtime until a lease appears.
    ///
    /// Only addresses inside the topology subnet count; anything else is a
    /// lease from some other interface and is ignored.
    #[instrument(skip(self))]
    pub async fn resolve_address(&self, container: &str) -> Result<Ipv4Addr> {
        if let Some(addr) = self.cached(container) {
            return Ok(addr);
        }

        let resolved = self
            .retry
            .poll(|| async {
                let addr = self.runtime.address(container).await?;
                Ok(addr.filter(|a| self.topology.contains(*a)))
            })
            .await?;

        match resolved {
            Some(addr) => {
                debug!(%addr, "Address resolved");
                self.addresses
                    .write()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(container.to_string(), addr);
                Ok(addr)
            }
            None => Err(VezaError::Timeout {
                target: container.to_string(),
                operation: "address resolution".to_string(),
                after: self.retry.budget(),
                port: None,
            }),
        }
    }

    /// Cached address, else a single runtime query. Never waits.
    pub async fn lookup(&self, container: &str) -> Result<Option<Ipv4Addr>> {
        if let Some(addr) = self.cached(container) {
            return Ok(Some(addr));
        }
        let addr = self.runtime.address(container).await?.filter(|a| self.topology.contains(*a));
        if let Some(addr) = addr {
            self.addresses
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .insert(container.to_string(), addr);
        }
        Ok(addr)
    }

    /// Cached address, without touching the runtime.
    pub fn cached(&self, container: &str) -> Option<Ipv4Addr> {
        self.addresses.read().unwrap_or_else(|p| p.into_inner()).get(container).copied()
    }

    /// Forget a container's address (after restart, stop, delete or import).
    pub fn invalidate(&self, container: &str) {
        self.addresses.write().unwrap_or_else(|p| p.into_inner()).remove(container);
    }
}

fn normalize(cidr: &str) -> Option<Ipv4Network> {
    let net: Ipv4Network = cidr.parse().ok()?;
    Ipv4Network::new(net.network(), net.prefix()).ok()
}
