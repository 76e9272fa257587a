//! Bridge drivers.

use crate::error::{Result, VezaError};
use crate::types::NetworkTopology;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, instrument};

/// What the host reports about an existing bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInfo {
    pub name: String,
    /// Gateway address in CIDR notation, if IPv4 is configured.
    pub ipv4_cidr: Option<String>,
    pub nat: bool,
    /// Containers currently attached.
    pub attached: Vec<String>,
}

/// Bridge manager trait.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Describe a bridge; `None` if it does not exist.
    async fn inspect(&self, bridge: &str) -> Result<Option<BridgeInfo>>;

    /// Create a bridge for `topology`.
    async fn create(&self, topology: &NetworkTopology) -> Result<()>;

    /// Delete a bridge with no attached containers.
    async fn delete(&self, bridge: &str) -> Result<()>;
}

/// Incus managed-network driver.
pub struct IncusNetworkDriver {
    binary_path: PathBuf,
}

impl IncusNetworkDriver {
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    async fn run_checked(&self, bridge: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| VezaError::transport(bridge, format!("failed to run incus: {}", e)))?;

        if !output.status.success() {
            return Err(VezaError::transport(
                bridge,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl NetworkDriver for IncusNetworkDriver {
    #[instrument(skip(self))]
    async fn inspect(&self, bridge: &str) -> Result<Option<BridgeInfo>> {
        let json = self.run_checked(bridge, &["network", "list", "--format", "json"]).await?;
        parse_network_list(&json, bridge)
    }

    #[instrument(skip(self, topology), fields(bridge = %topology.bridge_name))]
    async fn create(&self, topology: &NetworkTopology) -> Result<()> {
        info!(subnet = %topology.subnet_cidr, nat = topology.nat_enabled, "Creating bridge");

        let mut args = vec![
            "network".to_string(),
            "create".to_string(),
            topology.bridge_name.clone(),
            format!("ipv4.address={}", topology.gateway_cidr()?),
            format!("ipv4.nat={}", topology.nat_enabled),
            "ipv6.address=none".to_string(),
        ];
        if !topology.dns_servers.is_empty() {
            let servers: Vec<String> = topology.dns_servers.iter().map(|s| s.to_string()).collect();
            args.push(format!("raw.dnsmasq=dhcp-option=option:dns-server,{}", servers.join(",")));
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&topology.bridge_name, &args).await?;

        metrics::counter!("veza_bridge_created_total").increment(1);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, bridge: &str) -> Result<()> {
        info!("Deleting bridge");
        self.run_checked(bridge, &["network", "delete", bridge]).await?;
        metrics::counter!("veza_bridge_deleted_total").increment(1);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ListedNetwork {
    name: String,
    #[serde(default)]
    config: HashMap<String, String>,
    #[serde(default)]
    used_by: Vec<String>,
}

fn parse_network_list(json: &str, bridge: &str) -> Result<Option<BridgeInfo>> {
    let listed: Vec<ListedNetwork> = serde_json::from_str(json).map_err(|e| {
        VezaError::transport(bridge, format!("unparseable incus network list output: {}", e))
    })?;

    Ok(listed.into_iter().find(|n| n.name == bridge).map(|n| {
        let ipv4_cidr =
            n.config.get("ipv4.address").filter(|a| !a.is_empty() && *a != "none").cloned();
        let nat = n.config.get("ipv4.nat").map(|v| v == "true").unwrap_or(false);
        // used_by entries look like "/1.0/instances/<name>?project=default"
        let attached = n
            .used_by
            .iter()
            .filter_map(|u| u.strip_prefix("/1.0/instances/"))
            .map(|u| u.split('?').next().unwrap_or(u).to_string())
            .collect();
        BridgeInfo { name: n.name, ipv4_cidr, nat, attached }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network_list() {
        let json = r#"[
            {"name": "lxdbr0", "config": {}, "used_by": []},
            {
                "name": "veza-br0",
                "config": {"ipv4.address": "10.5.0.1/24", "ipv4.nat": "true"},
                "used_by": ["/1.0/instances/postgres", "/1.0/instances/redis?project=default", "/1.0/profiles/default"]
            }
        ]"#;

        let info = parse_network_list(json, "veza-br0").unwrap().unwrap();
        assert_eq!(info.ipv4_cidr.as_deref(), Some("10.5.0.1/24"));
        assert!(info.nat);
        assert_eq!(info.attached, vec!["postgres", "redis"]);

        assert!(parse_network_list(json, "missing").unwrap().is_none());
    }

    #[test]
    fn test_ipv4_none_is_unset() {
        let json = r#"[{"name": "veza-br0", "config": {"ipv4.address": "none"}}]"#;
        let info = parse_network_list(json, "veza-br0").unwrap().unwrap();
        assert!(info.ipv4_cidr.is_none());
        assert!(!info.nat);
    }
}
