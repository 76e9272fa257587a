//! Service catalog domain types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Dependency layer of the topology.
///
/// Tiers are provisioned strictly in order; a service never depends on a
/// service in a later tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Database, cache and shared storage.
    Data,
    /// Application services and the web front end.
    Application,
    /// Reverse proxy fronting the application tier.
    Edge,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::Application => write!(f, "application"),
            Self::Edge => write!(f, "edge"),
        }
    }
}

/// Closed set of service kinds.
///
/// Each kind maps to one bootstrap routine in the provisioner's capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Database,
    Cache,
    SharedStorage,
    CompiledBackend,
    CompiledRealtime,
    WebFrontend,
    Proxy,
}

impl ServiceKind {
    /// Tier this kind belongs to.
    #[must_use]
    pub fn tier(&self) -> Tier {
        match self {
            Self::Database | Self::Cache | Self::SharedStorage => Tier::Data,
            Self::CompiledBackend | Self::CompiledRealtime | Self::WebFrontend => {
                Tier::Application
            }
            Self::Proxy => Tier::Edge,
        }
    }

    /// Distribution-provided systemd unit, for kinds that do not ship their own.
    #[must_use]
    pub fn system_unit(&self) -> Option<&'static str> {
        match self {
            Self::Database => Some("postgresql"),
            Self::Cache => Some("redis-server"),
            Self::SharedStorage => Some("nfs-kernel-server"),
            Self::Proxy => Some("haproxy"),
            Self::CompiledBackend | Self::CompiledRealtime | Self::WebFrontend => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Cache => "cache",
            Self::SharedStorage => "shared_storage",
            Self::CompiledBackend => "compiled_backend",
            Self::CompiledRealtime => "compiled_realtime",
            Self::WebFrontend => "web_frontend",
            Self::Proxy => "proxy",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness probe declared by a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheck {
    /// TCP connect to the service port.
    #[default]
    Port,
    /// HTTP GET against the service port; any 2xx/3xx is healthy.
    Http { path: String },
}

impl std::fmt::Display for HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Port => write!(f, "tcp"),
            Self::Http { path } => write!(f, "http {}", path),
        }
    }
}

/// Declarative specification of one service in the catalog.
///
/// Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique service name, also used as the container name.
    pub name: String,

    /// Service kind (selects the bootstrap routine and tier).
    pub kind: ServiceKind,

    /// Runtime image the container is created from (e.g. "images:debian/12").
    /// Empty means the configured base image.
    #[serde(default)]
    pub runtime_image: String,

    /// Distribution packages installed during bootstrap.
    #[serde(default)]
    pub packages: Vec<String>,

    /// Language toolchain (e.g. "go1.22.5", "stable", "20").
    #[serde(default)]
    pub toolchain: Option<String>,

    /// Port the service listens on, unique in the topology.
    pub port: u16,

    /// systemd unit template rendered during bootstrap (Tera syntax).
    #[serde(default)]
    pub unit_template: Option<String>,

    /// Host source tree, relative to the configured source root.
    #[serde(default)]
    pub source_path: Option<PathBuf>,

    /// Build command executed inside the container working directory.
    #[serde(default)]
    pub build_cmd: Option<String>,

    /// Command the unit runs, relative to the working directory.
    #[serde(default)]
    pub start_cmd: Option<String>,

    /// Liveness probe.
    #[serde(default)]
    pub health_check: HealthCheck,

    /// Services that must be Healthy before this one is provisioned.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Path prefix routed to this service by the edge proxy.
    #[serde(default)]
    pub route: Option<String>,

    /// Environment rendered into the unit template.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ServiceSpec {
    /// Tier of this service.
    #[must_use]
    pub fn tier(&self) -> Tier {
        self.kind.tier()
    }

    /// systemd unit managing this service's process.
    #[must_use]
    pub fn unit_name(&self) -> String {
        self.kind
            .system_unit()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.service", self.name))
    }

    /// Working directory inside the container.
    #[must_use]
    pub fn workdir(&self, remote_root: &str) -> String {
        format!("{}/{}", remote_root.trim_end_matches('/'), self.name)
    }

    /// Whether this service has source to sync and build.
    #[must_use]
    pub fn is_buildable(&self) -> bool {
        self.source_path.is_some() && self.build_cmd.is_some()
    }

    /// Whether the unit is installed from this spec rather than shipped by
    /// a distribution package.
    #[must_use]
    pub fn owns_unit(&self) -> bool {
        self.kind.system_unit().is_none()
    }
}
