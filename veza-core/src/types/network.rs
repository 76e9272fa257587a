//! Network domain types.

use crate::error::{Result, VezaError};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Bridged network all topology containers attach to.
///
/// Immutable once any container is attached; changing the subnet requires
/// detaching every container first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTopology {
    /// Bridge name (e.g., "veza-br0")
    pub bridge_name: String,

    /// Subnet CIDR (e.g., "10.5.0.0/24")
    pub subnet_cidr: String,

    /// Whether outbound NAT is enabled on the bridge
    pub nat_enabled: bool,

    /// DNS servers handed to containers
    pub dns_servers: Vec<Ipv4Addr>,
}

impl NetworkTopology {
    /// Parsed subnet.
    pub fn subnet(&self) -> Result<Ipv4Network> {
        let net: Ipv4Network = self.subnet_cidr.parse().map_err(|e| VezaError::InvalidConfig {
            reason: format!("Invalid subnet {}: {}", self.subnet_cidr, e),
        })?;
        // Normalize host bits away so "10.5.0.1/24" and "10.5.0.0/24" compare equal.
        Ipv4Network::new(net.network(), net.prefix()).map_err(|e| VezaError::InvalidConfig {
            reason: format!("Invalid subnet {}: {}", self.subnet_cidr, e),
        })
    }

    /// Gateway address (first host of the subnet).
    pub fn gateway(&self) -> Result<Ipv4Addr> {
        let net = self.subnet()?;
        let first = u32::from(net.network()) + 1;
        Ok(Ipv4Addr::from(first))
    }

    /// Gateway in CIDR notation, as bridges expect it (e.g., "10.5.0.1/24").
    pub fn gateway_cidr(&self) -> Result<String> {
        let net = self.subnet()?;
        Ok(format!("{}/{}", self.gateway()?, net.prefix()))
    }

    /// Whether `addr` lies inside this topology's subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.subnet().map(|net| net.contains(addr)).unwrap_or(false)
    }
}
