//! Edge (reverse proxy) configuration.
//!
//! The routing table is regenerated from the catalog and the live addresses
//! of routed services, never hand-edited. A new configuration is staged next
//! to the active one, validated by the proxy itself, and only then moved
//! into place and reloaded. A rejected configuration leaves the active one
//! byte-for-byte untouched, and a failed reload puts the previous one back
//! so the next attempt sees a difference and retries.

use crate::adapters::{sh, shell_quote, ContainerRuntime, ExecOutput};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::{Result, VezaError};
use crate::locks::KeyedLocks;
use crate::network::NetworkProvisioner;
use crate::state::InstanceRegistry;
use crate::templates::{TemplateRenderer, EDGE};
use crate::types::{EdgeRoute, HealthCheck, LifecycleState, ServiceSpec};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tera::Context;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Active proxy configuration inside the edge container.
pub const EDGE_CONFIG_PATH: &str = "/etc/haproxy/haproxy.cfg";

/// Candidate configuration awaiting validation.
pub const EDGE_STAGING_PATH: &str = "/etc/haproxy/haproxy.cfg.staging";

/// Outcome of a reconfiguration.
#[derive(Debug, Clone)]
pub struct EdgeReport {
    /// Routes in the applied configuration, longest prefix first.
    pub routes: Vec<EdgeRoute>,
    /// Routed services left out because they had no live address.
    pub omitted: Vec<String>,
    /// Whether the active configuration was replaced and reloaded.
    pub changed: bool,
}

#[derive(Serialize)]
struct RouteContext<'a> {
    backend: String,
    match_rule: &'a str,
    is_default: bool,
    health_path: Option<&'a str>,
    service: &'a str,
    address: String,
    port: u16,
}

pub struct EdgeConfigurator {
    runtime: Arc<dyn ContainerRuntime>,
    network: Arc<NetworkProvisioner>,
    registry: InstanceRegistry,
    templates: Arc<TemplateRenderer>,
    service_locks: Arc<KeyedLocks>,
    config: Config,
    serial: Mutex<()>,
}

impl EdgeConfigurator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        network: Arc<NetworkProvisioner>,
        registry: InstanceRegistry,
        templates: Arc<TemplateRenderer>,
        service_locks: Arc<KeyedLocks>,
        config: Config,
    ) -> Self {
        Self { runtime, network, registry, templates, service_locks, config, serial: Mutex::new(()) }
    }

    /// Regenerate, validate and apply the proxy configuration.
    ///
    /// Reconfigurations are serialized, and each holds the service locks of
    /// every routed service so no backend is restarted mid-render.
    #[instrument(skip_all)]
    pub async fn reconfigure_edge(&self, catalog: &Catalog) -> Result<EdgeReport> {
        let _serial = self.serial.lock().await;

        let edge = catalog
            .edge()
            .ok_or_else(|| VezaError::precondition("edge", "catalog has no proxy service"))?;
        let edge_state = self.registry.state(&edge.name);
        if edge_state != LifecycleState::Running {
            return Err(VezaError::precondition(
                &edge.name,
                format!("proxy container is {}, not running", edge_state),
            ));
        }

        let routed: Vec<&ServiceSpec> = catalog
            .services()
            .iter()
            .filter(|s| s.route.is_some() && s.name != edge.name)
            .collect();
        let _guards = self.service_locks.lock_many(routed.iter().map(|s| s.name.as_str())).await;

        let (routes, omitted) = self.collect_routes(&routed).await?;
        if routes.is_empty() {
            return Err(VezaError::precondition(
                &edge.name,
                "no routed service has a live address",
            ));
        }
        for name in &omitted {
            warn!(service = %name, "Omitting route, service has no live address");
        }

        let rendered = self.render(edge, &routed, &routes)?;

        let current = self.runtime.read_file(&edge.name, EDGE_CONFIG_PATH).await?;
        if current.as_deref() == Some(rendered.as_bytes()) {
            debug!("Edge configuration unchanged");
            return Ok(EdgeReport { routes, omitted, changed: false });
        }

        self.runtime.write_file(&edge.name, EDGE_STAGING_PATH, rendered.as_bytes()).await?;

        let check = self
            .exec(&edge.name, vec![
                "haproxy".to_string(),
                "-c".to_string(),
                "-f".to_string(),
                EDGE_STAGING_PATH.to_string(),
            ])
            .await?;
        if !check.success() {
            let discard = format!("rm -f {}", shell_quote(EDGE_STAGING_PATH));
            if let Err(e) = self.exec(&edge.name, sh(discard)).await {
                warn!(error = %e, "Failed to remove rejected staging configuration");
            }
            metrics::counter!("veza_edge_reloads_total", "outcome" => "rejected").increment(1);
            let output = format!("{}{}", check.stdout, check.stderr);
            return Err(VezaError::ValidationFailed { output: output.trim().to_string() });
        }

        let promote =
            format!("mv -f {} {}", shell_quote(EDGE_STAGING_PATH), shell_quote(EDGE_CONFIG_PATH));
        self.checked(&edge.name, sh(promote)).await?;

        let reload = vec!["systemctl".to_string(), "reload".to_string(), "haproxy".to_string()];
        if let Err(e) = self.checked(&edge.name, reload).await {
            self.restore(&edge.name, current.as_deref()).await;
            metrics::counter!("veza_edge_reloads_total", "outcome" => "reload_failed").increment(1);
            return Err(e);
        }

        self.persist(&rendered);
        metrics::counter!("veza_edge_reloads_total", "outcome" => "applied").increment(1);
        info!(routes = routes.len(), omitted = omitted.len(), "Edge configuration applied");
        Ok(EdgeReport { routes, omitted, changed: true })
    }

    async fn collect_routes(&self, routed: &[&ServiceSpec]) -> Result<(Vec<EdgeRoute>, Vec<String>)> {
        let mut routes = Vec::new();
        let mut omitted = Vec::new();

        for spec in routed {
            let Some(rule) = spec.route.as_deref() else { continue };
            let address = if self.registry.state(&spec.name) == LifecycleState::Running {
                self.network.lookup(&spec.name).await?
            } else {
                None
            };
            match address {
                Some(upstream_address) => routes.push(EdgeRoute {
                    match_rule: rule.to_string(),
                    upstream_service: spec.name.clone(),
                    upstream_port: spec.port,
                    upstream_address,
                }),
                None => omitted.push(spec.name.clone()),
            }
        }

        sort_routes(&mut routes);
        Ok((routes, omitted))
    }

    fn render(&self, edge: &ServiceSpec, routed: &[&ServiceSpec], routes: &[EdgeRoute]) -> Result<String> {
        let contexts: Vec<RouteContext<'_>> = routes
            .iter()
            .map(|route| {
                let health_path = routed
                    .iter()
                    .find(|s| s.name == route.upstream_service)
                    .and_then(|s| match &s.health_check {
                        HealthCheck::Http { path } => Some(path.as_str()),
                        HealthCheck::Port => None,
                    });
                RouteContext {
                    backend: route.backend_name(),
                    match_rule: &route.match_rule,
                    is_default: route.is_default(),
                    health_path,
                    service: &route.upstream_service,
                    address: route.upstream_address.to_string(),
                    port: route.upstream_port,
                }
            })
            .collect();
        let default_backend = routes.iter().find(|r| r.is_default()).map(EdgeRoute::backend_name);

        let mut context = Context::new();
        context.insert("bind_port", &edge.port);
        context.insert("routes", &contexts);
        context.insert("default_backend", &default_backend);
        self.templates.render(EDGE, &context)
    }

    async fn exec(&self, name: &str, command: Vec<String>) -> Result<ExecOutput> {
        self.runtime.exec(name, &command).await
    }

    /// Run a command; non-zero exit is a `CommandFailed`.
    async fn checked(&self, name: &str, command: Vec<String>) -> Result<ExecOutput> {
        let output = self.exec(name, command.clone()).await?;
        if !output.success() {
            return Err(VezaError::CommandFailed {
                target: name.to_string(),
                command: command.join(" "),
                exit_code: output.exit_code,
                output: output.diagnostic(self.config.build_log_tail_lines),
            });
        }
        Ok(output)
    }

    /// Put back the configuration that was active before a failed reload.
    async fn restore(&self, name: &str, previous: Option<&[u8]>) {
        let result = match previous {
            Some(content) => self.runtime.write_file(name, EDGE_CONFIG_PATH, content).await,
            None => {
                let remove = format!("rm -f {}", shell_quote(EDGE_CONFIG_PATH));
                self.exec(name, sh(remove)).await.map(|_| ())
            }
        };
        match result {
            Ok(()) => warn!("Proxy reload failed, previous configuration restored"),
            Err(e) => warn!(error = %e, "Proxy reload failed and the previous configuration could not be restored"),
        }
    }

    /// Keep a host-side copy of the last applied configuration.
    fn persist(&self, rendered: &str) {
        let dir = self.config.edge_dir();
        let path: PathBuf = dir.join("haproxy.cfg");
        let result = std::fs::create_dir_all(&dir).and_then(|()| std::fs::write(&path, rendered));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to persist edge configuration");
        }
    }
}

/// Longest prefix first so more specific routes win; ties by service name.
pub fn sort_routes(routes: &mut [EdgeRoute]) {
    routes.sort_by(|a, b| {
        b.match_rule
            .len()
            .cmp(&a.match_rule.len())
            .then_with(|| a.upstream_service.cmp(&b.upstream_service))
    });
}
