//! Configuration management.

use crate::error::{Result, VezaError};
use crate::paths;
use crate::retry::RetryPolicy;
use crate::types::{NetworkTopology, ServiceSpec};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persistent configuration for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bridge_name: String,
    pub subnet_cidr: String,
    pub nat_enabled: bool,
    pub dns_servers: Vec<Ipv4Addr>,
    pub base_image: String,
    pub readiness_timeout_secs: u64,
    pub readiness_poll_interval_ms: u64,
    pub health_probe_timeout_ms: u64,
    pub address_retries: u32,
    pub address_retry_interval_ms: u64,
    pub stop_timeout_secs: u64,
    pub max_concurrent_builds: usize,
    pub build_log_tail_lines: usize,
    pub sync_ignore: Vec<String>,
    pub remote_root: String,
    pub source_root: String,
    pub artifacts_dir: String,
    pub logs_dir: String,
    pub edge_dir: String,
    pub cache_dir: String,
    pub edge_template_path: Option<String>,
    pub incus_binary: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge_name: "veza-br0".to_string(),
            subnet_cidr: "10.5.0.0/24".to_string(),
            nat_enabled: true,
            dns_servers: vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)],
            base_image: "images:debian/12".to_string(),
            readiness_timeout_secs: 120,
            readiness_poll_interval_ms: 2000,
            health_probe_timeout_ms: 2000,
            address_retries: 30,
            address_retry_interval_ms: 1000,
            stop_timeout_secs: 30,
            max_concurrent_builds: 4,
            build_log_tail_lines: 40,
            sync_ignore: [".git", "node_modules", "target", "dist", "build", "vendor", ".cache"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            remote_root: "/opt/veza".to_string(),
            source_root: ".".to_string(),
            artifacts_dir: paths::artifacts_dir().to_string_lossy().to_string(),
            logs_dir: paths::logs_dir().to_string_lossy().to_string(),
            edge_dir: paths::edge_dir().to_string_lossy().to_string(),
            cache_dir: paths::cache_dir().to_string_lossy().to_string(),
            edge_template_path: None,
            incus_binary: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Get the default path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.json")
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults when absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| VezaError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| VezaError::InvalidConfig {
            reason: format!("Failed to parse config {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VezaError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| VezaError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)
            .map_err(|e| VezaError::IoError { path: path.to_path_buf(), source: e })
    }

    /// Reject values that would make bounded waits unbounded or meaningless.
    pub fn validate(&self) -> Result<()> {
        self.network().subnet()?;
        if self.readiness_poll_interval_ms == 0 || self.address_retry_interval_ms == 0 {
            return Err(VezaError::InvalidConfig {
                reason: "poll intervals must be greater than zero".to_string(),
            });
        }
        if self.max_concurrent_builds == 0 {
            return Err(VezaError::InvalidConfig {
                reason: "max_concurrent_builds must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Network topology described by this configuration.
    pub fn network(&self) -> NetworkTopology {
        NetworkTopology {
            bridge_name: self.bridge_name.clone(),
            subnet_cidr: self.subnet_cidr.clone(),
            nat_enabled: self.nat_enabled,
            dns_servers: self.dns_servers.clone(),
        }
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Retry policy for post-boot address resolution.
    pub fn address_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.address_retries, Duration::from_millis(self.address_retry_interval_ms))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        PathBuf::from(&self.artifacts_dir)
    }

    pub fn logs_dir(&self) -> PathBuf {
        PathBuf::from(&self.logs_dir)
    }

    pub fn edge_dir(&self) -> PathBuf {
        PathBuf::from(&self.edge_dir)
    }

    pub fn cache_dir(&self) -> PathBuf {
        PathBuf::from(&self.cache_dir)
    }

    /// Image a service's container is created from.
    pub fn image_for<'a>(&'a self, spec: &'a ServiceSpec) -> &'a str {
        if spec.runtime_image.is_empty() {
            &self.base_image
        } else {
            &spec.runtime_image
        }
    }

    /// Resolve a catalog source path against the configured source root.
    pub fn source_dir(&self, source_path: &Path) -> PathBuf {
        if source_path.is_absolute() {
            source_path.to_path_buf()
        } else {
            Path::new(&self.source_root).join(source_path)
        }
    }
}
