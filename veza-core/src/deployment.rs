//! Deployment façade.
//!
//! Wires the components around one runtime, one network and one instance
//! registry, and composes them into the commands the CLI exposes.

use crate::adapters::{sh, shell_quote, AdapterFactory, ContainerRuntime};
use crate::build::{BuildLog, BuildOrchestrator};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::edge::{EdgeConfigurator, EdgeReport};
use crate::error::{Result, Step, StepFailure, VezaError};
use crate::export::ExportManager;
use crate::health::{HealthMonitor, NetworkProber, Prober};
use crate::locks::KeyedLocks;
use crate::network::{EnsureOutcome, NetworkDriver, NetworkProvisioner};
use crate::provisioner::{ProvisionReport, Provisioner};
use crate::report::StepReport;
use crate::state::InstanceRegistry;
use crate::sync::{SyncEngine, SyncStats};
use crate::templates::{TemplateRenderer, EDGE};
use crate::types::{
    ContainerInstance, ExportArtifact, HealthStatus, LifecycleState, ServiceSpec, Tier,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// One row of `status`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStatus {
    pub service: String,
    pub tier: Tier,
    pub state: LifecycleState,
    pub health: HealthStatus,
    pub address: Option<Ipv4Addr>,
    pub port: u16,
}

/// Result of `create`.
#[derive(Debug)]
pub struct CreateReport {
    pub provision: ProvisionReport,
    /// Edge reconfiguration, attempted when the proxy ended up running.
    pub edge: Option<Result<EdgeReport>>,
}

impl CreateReport {
    pub fn exit_code(&self) -> i32 {
        let edge = match &self.edge {
            Some(Err(e)) => e.exit_code(),
            _ => 0,
        };
        self.provision.exit_code().max(edge)
    }
}

/// Result of `export` or `import`.
#[derive(Debug)]
pub struct ArchiveReport<T> {
    pub services: StepReport<T>,
    /// Edge reconfiguration, attempted when a container came back up with a
    /// new address while the proxy was running.
    pub edge: Option<Result<EdgeReport>>,
}

impl<T> ArchiveReport<T> {
    pub fn is_success(&self) -> bool {
        self.services.is_success() && !matches!(self.edge, Some(Err(_)))
    }

    pub fn exit_code(&self) -> i32 {
        let edge = match &self.edge {
            Some(Err(e)) => e.exit_code(),
            _ => 0,
        };
        self.services.exit_code().max(edge)
    }
}

/// Result of `deploy`: each step only sees the services that passed the
/// previous one.
#[derive(Debug)]
pub struct DeployReport {
    pub sync: StepReport<SyncStats>,
    pub build: StepReport<BuildLog>,
    pub restart: StepReport<()>,
    pub edge: Option<Result<EdgeReport>>,
    pub status: Vec<ServiceStatus>,
}

impl DeployReport {
    pub fn failures(&self) -> impl Iterator<Item = &StepFailure> {
        self.sync.failed.iter().chain(&self.build.failed).chain(&self.restart.failed)
    }

    pub fn exit_code(&self) -> i32 {
        let edge = match &self.edge {
            Some(Err(e)) => e.exit_code(),
            _ => 0,
        };
        self.sync
            .exit_code()
            .max(self.build.exit_code())
            .max(self.restart.exit_code())
            .max(edge)
    }
}

/// Result of `clean`.
#[derive(Debug)]
pub struct CleanReport {
    pub containers: StepReport<()>,
    pub network_removed: bool,
}

pub struct Deployment {
    config: Config,
    catalog: Catalog,
    runtime: Arc<dyn ContainerRuntime>,
    network: Arc<NetworkProvisioner>,
    registry: InstanceRegistry,
    health: Arc<HealthMonitor>,
    provisioner: Provisioner,
    sync: Arc<SyncEngine>,
    builder: Arc<BuildOrchestrator>,
    edge: EdgeConfigurator,
    exports: ExportManager,
}

impl Deployment {
    /// Connect to the host runtime and observe the current topology.
    pub async fn open(config: Config, catalog: Catalog) -> Result<Self> {
        let runtime = AdapterFactory::create(&config)?;
        let driver = AdapterFactory::network_driver(&config)?;
        let prober: Arc<dyn Prober> = Arc::new(NetworkProber::new()?);
        Self::with_parts(config, catalog, runtime, driver, prober).await
    }

    /// Assemble from explicit collaborators.
    pub async fn with_parts(
        config: Config,
        catalog: Catalog,
        runtime: Arc<dyn ContainerRuntime>,
        driver: Arc<dyn NetworkDriver>,
        prober: Arc<dyn Prober>,
    ) -> Result<Self> {
        config.validate()?;

        let mut templates = TemplateRenderer::new()?;
        if let Some(path) = &config.edge_template_path {
            let content = std::fs::read_to_string(path).map_err(|e| VezaError::InvalidConfig {
                reason: format!("Failed to read edge template {}: {}", path, e),
            })?;
            templates.set_template(EDGE, &content)?;
        }
        let templates = Arc::new(templates);

        let registry = InstanceRegistry::new();
        let service_locks = Arc::new(KeyedLocks::new());
        let network = Arc::new(NetworkProvisioner::new(
            driver,
            runtime.clone(),
            config.network(),
            config.address_retry(),
        ));
        let health =
            Arc::new(HealthMonitor::new(prober, network.clone(), registry.clone(), &config));

        let sync = Arc::new(SyncEngine::new(
            runtime.clone(),
            registry.clone(),
            service_locks.clone(),
            config.clone(),
        ));
        let builder = Arc::new(BuildOrchestrator::new(
            runtime.clone(),
            registry.clone(),
            service_locks.clone(),
            config.clone(),
        ));
        let provisioner = Provisioner::new(
            runtime.clone(),
            network.clone(),
            health.clone(),
            registry.clone(),
            templates.clone(),
            service_locks.clone(),
            sync.clone(),
            builder.clone(),
            config.clone(),
        );
        let edge = EdgeConfigurator::new(
            runtime.clone(),
            network.clone(),
            registry.clone(),
            templates,
            service_locks.clone(),
            config.clone(),
        );
        let exports = ExportManager::new(
            runtime.clone(),
            network.clone(),
            registry.clone(),
            service_locks,
            config.clone(),
        );

        registry.reconcile(runtime.as_ref(), &catalog).await?;

        Ok(Self {
            config,
            catalog,
            runtime,
            network,
            registry,
            health,
            provisioner,
            sync,
            builder,
            edge,
            exports,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    /// Prepare the host: bridge plus the host-side directories.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> Result<EnsureOutcome> {
        for dir in [
            self.config.artifacts_dir(),
            self.config.logs_dir(),
            self.config.edge_dir(),
            self.config.cache_dir(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| VezaError::IoError { path: dir.clone(), source: e })?;
        }
        self.network.ensure_network().await
    }

    /// Provision the whole topology, then route the edge if it is up.
    pub async fn create(&self, force: bool) -> Result<CreateReport> {
        let provision = self.provisioner.create_topology(&self.catalog, force).await?;
        let edge = self.reconfigure_if_edge_running().await;
        Ok(CreateReport { provision, edge })
    }

    async fn reconfigure_if_edge_running(&self) -> Option<Result<EdgeReport>> {
        let edge = self.catalog.edge()?;
        if self.registry.state(&edge.name) != LifecycleState::Running {
            return None;
        }
        Some(self.edge.reconfigure_edge(&self.catalog).await)
    }

    pub async fn reconfigure_edge(&self) -> Result<EdgeReport> {
        self.edge.reconfigure_edge(&self.catalog).await
    }

    /// Export the selected services.
    ///
    /// Running services are stopped for a consistent snapshot and started
    /// again afterwards; a failed restart is reported as a Start failure.
    /// Restarted containers get new addresses, so the edge is re-rendered.
    #[instrument(skip(self))]
    pub async fn export(&self, names: &[String]) -> Result<ArchiveReport<ExportArtifact>> {
        let specs = self.catalog.select(names)?;
        let mut report = StepReport::new();
        let mut restarted = 0usize;

        for spec in specs.iter().copied() {
            let was_running = match self.provisioner.stop_if_running(&spec.name).await {
                Ok(stopped) => stopped,
                Err(e) => {
                    report.record(spec.name.clone(), Step::Stop, Err(e));
                    continue;
                }
            };

            let exported = if self.registry.state(&spec.name) == LifecycleState::Absent {
                Err(VezaError::precondition(&spec.name, "container does not exist"))
            } else {
                self.exports.export(spec).await
            };
            report.record(spec.name.clone(), Step::Export, exported);

            if was_running {
                match self.provisioner.start_and_wait(spec).await {
                    Ok(()) => restarted += 1,
                    Err(e) => {
                        warn!(service = %spec.name, error = %e, "Restart after export failed");
                        report.failed.push(StepFailure::new(spec.name.clone(), Step::Start, e));
                    }
                }
            }
        }

        let edge = self.refresh_edge_after(restarted, &specs).await;
        Ok(ArchiveReport { services: report, edge })
    }

    /// Re-render the edge once containers other than the proxy came back up.
    async fn refresh_edge_after(
        &self,
        revived: usize,
        specs: &[&ServiceSpec],
    ) -> Option<Result<EdgeReport>> {
        if revived == 0 || specs.iter().all(|s| s.tier() == Tier::Edge) {
            return None;
        }
        self.reconfigure_if_edge_running().await
    }

    /// Import every artifact present for the selected services, in
    /// provisioning order, and wait for each to become Healthy. The edge is
    /// re-rendered afterwards if any import came up.
    #[instrument(skip(self))]
    pub async fn import(
        &self,
        names: &[String],
        force: bool,
    ) -> Result<ArchiveReport<ContainerInstance>> {
        let specs = self.catalog.select(names)?;
        self.network.ensure_network().await?;

        let explicit = !names.is_empty();
        let mut report = StepReport::new();
        let mut found = 0usize;

        for spec in specs.iter().copied() {
            let artifact = match self.exports.load(&spec.name) {
                Ok(artifact) => artifact,
                Err(e @ VezaError::ArtifactMissing { .. }) if explicit => {
                    report.record(spec.name.clone(), Step::Import, Err(e));
                    continue;
                }
                Err(VezaError::ArtifactMissing { .. }) => continue,
                Err(e) => {
                    report.record(spec.name.clone(), Step::Import, Err(e));
                    continue;
                }
            };
            found += 1;

            if let Err(e) = self.exports.import(&artifact, force).await {
                report.record(spec.name.clone(), Step::Import, Err(e));
                continue;
            }

            let ready = async {
                let address = self.network.resolve_address(&spec.name).await?;
                self.registry.set_address(&spec.name, Some(address));
                self.health.await_ready(spec, self.config.readiness_timeout()).await?;
                Ok::<_, VezaError>(self.registry.get(&spec.name))
            }
            .await;
            if ready.is_err() && self.registry.state(&spec.name) == LifecycleState::Provisioning {
                if let Err(e) = self.registry.transition(&spec.name, LifecycleState::Failed) {
                    warn!(service = %spec.name, error = %e, "Could not mark instance failed");
                }
            }
            report.record(spec.name.clone(), Step::Readiness, ready);
        }

        if found == 0 && report.failed.is_empty() {
            return Err(VezaError::ArtifactMissing { path: self.config.artifacts_dir() });
        }

        let edge = self.refresh_edge_after(report.succeeded.len(), &specs).await;
        Ok(ArchiveReport { services: report, edge })
    }

    /// Services with a source tree, or exactly the named ones.
    fn sources(&self, names: &[String]) -> Result<Vec<&ServiceSpec>> {
        let specs = self.catalog.select(names)?;
        if names.is_empty() {
            Ok(specs.into_iter().filter(|s| s.source_path.is_some()).collect())
        } else {
            Ok(specs)
        }
    }

    fn buildable(&self, names: &[String]) -> Result<Vec<&ServiceSpec>> {
        let specs = self.catalog.select(names)?;
        if names.is_empty() {
            Ok(specs.into_iter().filter(|s| s.is_buildable()).collect())
        } else {
            Ok(specs)
        }
    }

    pub async fn sync(&self, names: &[String]) -> Result<StepReport<SyncStats>> {
        let specs = self.sources(names)?;
        Ok(self.sync.sync_all(&specs).await)
    }

    pub async fn build(&self, names: &[String]) -> Result<StepReport<BuildLog>> {
        let specs = self.buildable(names)?;
        Ok(self.builder.build_all(&specs).await)
    }

    /// Restart the named services' units; by default the application tier.
    pub async fn restart(&self, names: &[String]) -> Result<StepReport<()>> {
        let specs: Vec<&ServiceSpec> = if names.is_empty() {
            self.catalog.in_tier(Tier::Application).collect()
        } else {
            self.catalog.select(names)?
        };
        Ok(self.provisioner.restart_services(&specs).await)
    }

    /// sync, build, restart, reconfigure edge, status.
    ///
    /// Services without a build command go straight from sync to restart.
    #[instrument(skip(self))]
    pub async fn deploy(&self, names: &[String]) -> Result<DeployReport> {
        let targets = self.sources(names)?;

        let sync = self.sync.sync_all(&targets).await;
        let synced: Vec<&ServiceSpec> =
            targets.iter().copied().filter(|s| sync.get(&s.name).is_some()).collect();

        let to_build: Vec<&ServiceSpec> =
            synced.iter().copied().filter(|s| s.build_cmd.is_some()).collect();
        let build = self.builder.build_all(&to_build).await;
        let built: Vec<&ServiceSpec> = synced
            .iter()
            .copied()
            .filter(|s| s.build_cmd.is_none() || build.get(&s.name).is_some())
            .collect();

        let restart = self.provisioner.restart_services(&built).await;
        let edge = self.reconfigure_if_edge_running().await;
        let status = self.status().await;

        info!(
            deployed = restart.succeeded.len(),
            failed = sync.failed.len() + build.failed.len() + restart.failed.len(),
            "Deploy finished"
        );
        Ok(DeployReport { sync, build, restart, edge, status })
    }

    /// State, address and a fresh health probe of every service.
    pub async fn status(&self) -> Vec<ServiceStatus> {
        for spec in self.catalog.services() {
            if self.registry.state(&spec.name) == LifecycleState::Running {
                if let Ok(address) = self.network.lookup(&spec.name).await {
                    self.registry.set_address(&spec.name, address);
                }
            }
        }
        let health = self.health.check_all(&self.catalog).await;

        self.catalog
            .services()
            .iter()
            .map(|spec| {
                let instance = self.registry.get(&spec.name);
                ServiceStatus {
                    service: spec.name.clone(),
                    tier: spec.tier(),
                    state: instance.lifecycle_state,
                    health: health.get(&spec.name).copied().unwrap_or_default(),
                    address: instance.address,
                    port: spec.port,
                }
            })
            .collect()
    }

    fn running_spec(&self, service: &str) -> Result<&ServiceSpec> {
        let spec = self.catalog.require(service)?;
        let state = self.registry.state(service);
        if state != LifecycleState::Running {
            return Err(VezaError::precondition(service, format!("container is {}, not running", state)));
        }
        Ok(spec)
    }

    fn journal_command(spec: &ServiceSpec, lines: usize, follow: bool) -> Vec<String> {
        let mut cmd = vec![
            "journalctl".to_string(),
            "--no-pager".to_string(),
            "-u".to_string(),
            spec.unit_name(),
            "-n".to_string(),
            lines.to_string(),
        ];
        if follow {
            cmd.push("-f".to_string());
        }
        cmd
    }

    /// Last `lines` lines of a service's unit journal.
    pub async fn logs(&self, service: &str, lines: usize) -> Result<String> {
        let spec = self.running_spec(service)?;
        let cmd = Self::journal_command(spec, lines, false);
        let output = self.runtime.exec(service, &cmd).await?;
        if !output.success() {
            return Err(VezaError::CommandFailed {
                target: service.to_string(),
                command: cmd.join(" "),
                exit_code: output.exit_code,
                output: output.diagnostic(self.config.build_log_tail_lines),
            });
        }
        Ok(output.stdout)
    }

    /// Follow a service's unit journal on the terminal until interrupted.
    pub async fn follow_logs(&self, service: &str, lines: usize) -> Result<i32> {
        let spec = self.running_spec(service)?;
        self.runtime.interactive(service, &Self::journal_command(spec, lines, true)).await
    }

    /// Interactive login shell inside a service's container.
    pub async fn shell(&self, service: &str) -> Result<i32> {
        let spec = self.running_spec(service)?;
        let workdir = spec.workdir(&self.config.remote_root);
        let script = format!("cd {} 2>/dev/null; exec bash -l", shell_quote(&workdir));
        self.runtime.interactive(service, &sh(script)).await
    }

    pub async fn stop(&self) -> StepReport<()> {
        self.provisioner.stop_topology(&self.catalog).await
    }

    /// Delete every container and, when asked and nothing failed, the bridge.
    pub async fn clean(&self, remove_network: bool) -> Result<CleanReport> {
        let containers = self.provisioner.destroy_topology(&self.catalog).await;
        let network_removed = if remove_network && containers.is_success() {
            self.network.remove_network().await?
        } else {
            false
        };
        Ok(CleanReport { containers, network_removed })
    }

    /// Live addresses of running services, in catalog order.
    pub async fn ips(&self) -> Result<Vec<(String, Ipv4Addr)>> {
        let mut out = Vec::new();
        for spec in self.catalog.services() {
            if self.registry.state(&spec.name) != LifecycleState::Running {
                continue;
            }
            if let Some(address) = self.network.lookup(&spec.name).await? {
                out.push((spec.name.clone(), address));
            }
        }
        Ok(out)
    }
}
