//! Provisioner.
//!
//! Creates the topology tier by tier. Inside a tier, services run in waves:
//! every service whose dependencies are settled is provisioned concurrently,
//! and a service only enters Provisioning once each dependency is Healthy.
//! A failure aborts the failed service's transitive dependents and nothing
//! else; there is no rollback.

pub mod bootstrap;

use crate::adapters::{ContainerRuntime, RuntimeState};
use crate::build::BuildOrchestrator;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::{Result, Step, StepFailure, VezaError};
use crate::health::HealthMonitor;
use crate::locks::KeyedLocks;
use crate::network::{EnsureOutcome, NetworkProvisioner};
use crate::report::StepReport;
use crate::state::InstanceRegistry;
use crate::sync::SyncEngine;
use crate::templates::TemplateRenderer;
use crate::types::{HealthStatus, LifecycleState, ServiceSpec, Tier};
use bootstrap::{capability, BootstrapContext};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What happened to one service during `create_topology`.
#[derive(Debug)]
pub enum Outcome {
    /// Container did not exist and was created.
    Created,
    /// Running container kept as is; health re-verified.
    Reused,
    /// Stopped container started again.
    Started,
    /// Existing container deleted and recreated (force).
    Replaced,
    /// A step failed; the instance is Failed.
    Failed(StepFailure),
    /// Not attempted because a dependency did not become Healthy.
    Skipped { dependency: String },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Reused => "reused",
            Self::Started => "started",
            Self::Replaced => "replaced",
            Self::Failed(_) => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }

    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Failed(_) | Self::Skipped { .. })
    }
}

#[derive(Debug)]
pub struct ServiceOutcome {
    pub service: String,
    pub tier: Tier,
    pub outcome: Outcome,
}

impl std::fmt::Display for ServiceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.outcome {
            Outcome::Failed(failure) => write!(f, "{}", failure),
            Outcome::Skipped { dependency } => {
                write!(f, "{}: skipped — dependency {} failed", self.service, dependency)
            }
            other => write!(f, "{}: {}", self.service, other.label()),
        }
    }
}

/// Result of `create_topology`.
#[derive(Debug)]
pub struct ProvisionReport {
    pub network: EnsureOutcome,
    /// One entry per catalog service, in provisioning order.
    pub outcomes: Vec<ServiceOutcome>,
}

impl ProvisionReport {
    pub fn get(&self, service: &str) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| o.service == service).map(|o| &o.outcome)
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.outcome.is_ok())
    }

    /// Services whose container was destroyed or recreated.
    pub fn destructive(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Replaced))
            .map(|o| o.service.as_str())
            .collect()
    }

    pub fn exit_code(&self) -> i32 {
        self.outcomes
            .iter()
            .map(|o| match &o.outcome {
                Outcome::Failed(f) => f.error.exit_code(),
                Outcome::Skipped { .. } => 2,
                _ => 0,
            })
            .max()
            .unwrap_or(0)
    }
}

impl std::fmt::Display for ProvisionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for outcome in &self.outcomes {
            writeln!(f, "{}", outcome)?;
        }
        Ok(())
    }
}

/// Creates, starts and tears down containers.
pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntime>,
    network: Arc<NetworkProvisioner>,
    health: Arc<HealthMonitor>,
    registry: InstanceRegistry,
    templates: Arc<TemplateRenderer>,
    service_locks: Arc<KeyedLocks>,
    sync: Arc<SyncEngine>,
    builder: Arc<BuildOrchestrator>,
    config: Config,
}

impl Provisioner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        network: Arc<NetworkProvisioner>,
        health: Arc<HealthMonitor>,
        registry: InstanceRegistry,
        templates: Arc<TemplateRenderer>,
        service_locks: Arc<KeyedLocks>,
        sync: Arc<SyncEngine>,
        builder: Arc<BuildOrchestrator>,
        config: Config,
    ) -> Self {
        Self { runtime, network, health, registry, templates, service_locks, sync, builder, config }
    }

    /// Provision every catalog service.
    ///
    /// Fails outright only if the network cannot be ensured; per-service
    /// failures are reported in the [`ProvisionReport`].
    #[instrument(skip_all, fields(force))]
    pub async fn create_topology(&self, catalog: &Catalog, force: bool) -> Result<ProvisionReport> {
        let network = self.network.ensure_network().await?;
        self.registry.reconcile(self.runtime.as_ref(), catalog).await?;

        let mut outcomes = Vec::with_capacity(catalog.len());
        let mut blocked: HashSet<String> = HashSet::new();

        for (tier, specs) in catalog.tiers() {
            info!(%tier, services = specs.len(), "Provisioning tier");
            let mut pending: Vec<&ServiceSpec> = specs;

            while !pending.is_empty() {
                let in_tier: HashSet<&str> = pending.iter().map(|s| s.name.as_str()).collect();
                let (wave, rest): (Vec<&ServiceSpec>, Vec<&ServiceSpec>) = pending
                    .into_iter()
                    .partition(|s| s.depends_on.iter().all(|d| !in_tier.contains(d.as_str())));
                pending = rest;
                if wave.is_empty() {
                    // Catalog validation rejects cycles, so this is unreachable.
                    return Err(VezaError::InvalidCatalog {
                        reason: format!("unresolvable dependencies in {} tier", tier),
                    });
                }

                let mut runnable = Vec::new();
                for spec in wave {
                    match self.unmet_dependency(spec, &blocked) {
                        Some(dependency) => {
                            warn!(service = %spec.name, %dependency, "Skipping, dependency not healthy");
                            metrics::counter!("veza_provision_skipped_total").increment(1);
                            blocked.insert(spec.name.clone());
                            outcomes.push(ServiceOutcome {
                                service: spec.name.clone(),
                                tier,
                                outcome: Outcome::Skipped { dependency },
                            });
                        }
                        None => runnable.push(spec),
                    }
                }

                let results =
                    join_all(runnable.iter().map(|spec| self.provision_one(spec, force))).await;
                for (spec, outcome) in runnable.into_iter().zip(results) {
                    if !outcome.is_ok() {
                        blocked.insert(spec.name.clone());
                    }
                    outcomes.push(ServiceOutcome { service: spec.name.clone(), tier, outcome });
                }
            }
        }

        Ok(ProvisionReport { network, outcomes })
    }

    /// First dependency of `spec` that is blocked or not Healthy.
    fn unmet_dependency(&self, spec: &ServiceSpec, blocked: &HashSet<String>) -> Option<String> {
        spec.depends_on
            .iter()
            .find(|dep| blocked.contains(*dep) || !self.registry.get(dep).is_healthy())
            .cloned()
    }

    #[instrument(skip(self, spec), fields(service = %spec.name))]
    async fn provision_one(&self, spec: &ServiceSpec, force: bool) -> Outcome {
        let name = spec.name.as_str();

        let observed = match self.runtime.state(name).await {
            Ok(state) => state,
            Err(e) => return self.fail(name, Step::Create, e),
        };

        let result = match (observed, force) {
            (RuntimeState::Running, false) => self.reuse(spec).await.map(|()| Outcome::Reused),
            (RuntimeState::Stopped, false) => self.start_existing(spec).await.map(|()| Outcome::Started),
            (RuntimeState::Missing, _) => self.create_fresh(spec).await.map(|()| Outcome::Created),
            (RuntimeState::Running | RuntimeState::Stopped, true) => {
                self.replace(spec, observed).await.map(|()| Outcome::Replaced)
            }
        };

        match result {
            Ok(outcome) => {
                metrics::counter!("veza_provision_total", "outcome" => outcome.label()).increment(1);
                info!(outcome = outcome.label(), "Provisioned");
                outcome
            }
            Err((step, error)) => self.fail(name, step, error),
        }
    }

    fn fail(&self, name: &str, step: Step, error: VezaError) -> Outcome {
        warn!(service = name, %step, error = %error, "Provisioning failed");
        metrics::counter!("veza_provision_total", "outcome" => "failed").increment(1);
        if self.registry.state(name) != LifecycleState::Failed {
            if let Err(e) = self.registry.transition(name, LifecycleState::Failed) {
                warn!(service = name, error = %e, "Could not mark instance failed");
            }
        }
        Outcome::Failed(StepFailure::new(name, step, error))
    }

    /// Keep a running container; only re-verify its health.
    async fn reuse(&self, spec: &ServiceSpec) -> std::result::Result<(), (Step, VezaError)> {
        let address =
            self.network.resolve_address(&spec.name).await.map_err(|e| (Step::Network, e))?;
        self.registry.set_address(&spec.name, Some(address));
        self.health
            .wait_healthy(spec, self.config.readiness_timeout())
            .await
            .map_err(|e| (Step::Readiness, e))?;
        self.registry.set_health(&spec.name, HealthStatus::Healthy);
        Ok(())
    }

    async fn start_existing(&self, spec: &ServiceSpec) -> std::result::Result<(), (Step, VezaError)> {
        self.enter_provisioning(&spec.name).map_err(|e| (Step::Start, e))?;
        self.runtime.start(&spec.name).await.map_err(|e| (Step::Start, e))?;
        self.bring_up(spec, false).await
    }

    async fn create_fresh(&self, spec: &ServiceSpec) -> std::result::Result<(), (Step, VezaError)> {
        self.enter_provisioning(&spec.name).map_err(|e| (Step::Create, e))?;
        self.runtime
            .create(&spec.name, self.config.image_for(spec), &self.network.topology().bridge_name)
            .await
            .map_err(|e| (Step::Create, e))?;
        self.runtime.start(&spec.name).await.map_err(|e| (Step::Start, e))?;
        self.bring_up(spec, true).await
    }

    /// Stop (if running) and delete through guarded transitions, then create.
    async fn replace(
        &self,
        spec: &ServiceSpec,
        observed: RuntimeState,
    ) -> std::result::Result<(), (Step, VezaError)> {
        info!(service = %spec.name, "Replacing existing container");
        if observed == RuntimeState::Running {
            self.stop_one(&spec.name).await.map_err(|e| (Step::Stop, e))?;
        }
        self.delete_one(&spec.name).await.map_err(|e| (Step::Delete, e))?;
        self.create_fresh(spec).await
    }

    fn enter_provisioning(&self, name: &str) -> Result<()> {
        self.network.invalidate(name);
        self.registry.transition(name, LifecycleState::Provisioning)
    }

    /// Address, bootstrap, then bounded readiness. Leaves the instance
    /// Running and Healthy, or Failed.
    ///
    /// A fresh container of a service with its own unit has nothing running
    /// yet: its source is synced (if any), built (if a build command is
    /// set) and the unit started before the readiness wait.
    async fn bring_up(
        &self,
        spec: &ServiceSpec,
        fresh: bool,
    ) -> std::result::Result<(), (Step, VezaError)> {
        let address =
            self.network.resolve_address(&spec.name).await.map_err(|e| (Step::Network, e))?;
        self.registry.set_address(&spec.name, Some(address));

        let topology = self.network.topology();
        let ctx = BootstrapContext {
            runtime: self.runtime.as_ref(),
            spec,
            config: &self.config,
            topology,
            templates: &self.templates,
            fresh,
        };
        capability(spec.kind).bootstrap(&ctx).await.map_err(|e| (Step::Bootstrap, e))?;

        if fresh && spec.owns_unit() {
            if spec.source_path.is_some() {
                self.sync.sync(spec).await.map_err(|e| (Step::Sync, e))?;
            }
            if spec.build_cmd.is_some() {
                self.builder.build(spec).await.map_err(|e| (Step::Build, e))?;
            }
            self.restart_unit(spec).await.map_err(|e| (Step::Start, e))?;
        }

        self.health
            .await_ready(spec, self.config.readiness_timeout())
            .await
            .map_err(|e| (Step::Readiness, e))
    }

    async fn stop_one(&self, name: &str) -> Result<()> {
        self.runtime.stop(name, self.config.stop_timeout()).await?;
        self.network.invalidate(name);
        self.registry.transition(name, LifecycleState::Stopped)
    }

    async fn delete_one(&self, name: &str) -> Result<()> {
        self.runtime.delete(name).await?;
        self.registry.transition(name, LifecycleState::Absent)
    }

    /// Restart each service's unit and wait for it to become Healthy again.
    ///
    /// Holds the service lock, so a restart never overlaps a sync, build or
    /// edge reconfiguration of the same service.
    #[instrument(skip_all)]
    pub async fn restart_services(&self, specs: &[&ServiceSpec]) -> StepReport<()> {
        let results = join_all(specs.iter().map(|spec| async move {
            let _guard = self.service_locks.lock(&spec.name).await;
            (spec.name.clone(), self.restart_one(spec).await)
        }))
        .await;

        let mut report = StepReport::new();
        for (name, result) in results {
            match result {
                Ok(()) => report.record(name, Step::Restart, Ok(())),
                Err((step, e)) => report.record(name, step, Err(e)),
            }
        }
        report
    }

    async fn restart_one(&self, spec: &ServiceSpec) -> std::result::Result<(), (Step, VezaError)> {
        if self.registry.state(&spec.name) != LifecycleState::Running {
            return Err((
                Step::Restart,
                VezaError::precondition(
                    &spec.name,
                    format!("container is {}, not running", self.registry.state(&spec.name)),
                ),
            ));
        }

        self.restart_unit(spec).await.map_err(|e| (Step::Restart, e))?;

        self.network.invalidate(&spec.name);
        self.registry.set_health(&spec.name, HealthStatus::Unknown);
        let address =
            self.network.resolve_address(&spec.name).await.map_err(|e| (Step::Network, e))?;
        self.registry.set_address(&spec.name, Some(address));

        match self.health.wait_healthy(spec, self.config.readiness_timeout()).await {
            Ok(()) => {
                self.registry.set_health(&spec.name, HealthStatus::Healthy);
                Ok(())
            }
            Err(e) => {
                self.registry.set_health(&spec.name, HealthStatus::Unhealthy);
                Err((Step::Health, e))
            }
        }
    }

    async fn restart_unit(&self, spec: &ServiceSpec) -> Result<()> {
        info!(service = %spec.name, unit = %spec.unit_name(), "Restarting unit");
        let cmd = vec!["systemctl".to_string(), "restart".to_string(), spec.unit_name()];
        let output = self.runtime.exec(&spec.name, &cmd).await?;
        if !output.success() {
            return Err(VezaError::CommandFailed {
                target: spec.name.clone(),
                command: cmd.join(" "),
                exit_code: output.exit_code,
                output: output.diagnostic(self.config.build_log_tail_lines),
            });
        }
        metrics::counter!("veza_unit_restarts_total").increment(1);
        Ok(())
    }

    /// Stop every live container, edge tier first.
    #[instrument(skip_all)]
    pub async fn stop_topology(&self, catalog: &Catalog) -> StepReport<()> {
        let mut report = StepReport::new();
        for spec in catalog.services().iter().rev() {
            let result = self.stop_if_running(&spec.name).await.map(|_| ());
            report.record(spec.name.clone(), Step::Stop, result);
        }
        report
    }

    /// Stop the container if the runtime reports it running.
    ///
    /// Returns whether a stop was issued.
    pub async fn stop_if_running(&self, name: &str) -> Result<bool> {
        if self.runtime.state(name).await? != RuntimeState::Running {
            return Ok(false);
        }
        let _guard = self.service_locks.lock(name).await;
        self.stop_one(name).await?;
        Ok(true)
    }

    /// Start a stopped container and wait for it to become Healthy.
    pub async fn start_and_wait(&self, spec: &ServiceSpec) -> Result<()> {
        self.start_existing(spec).await.map_err(|(_, e)| e)
    }

    /// Stop and delete every container, edge tier first.
    #[instrument(skip_all)]
    pub async fn destroy_topology(&self, catalog: &Catalog) -> StepReport<()> {
        let mut report = StepReport::new();
        for spec in catalog.services().iter().rev() {
            let name = spec.name.as_str();
            let result = async {
                let observed = self.runtime.state(name).await.map_err(|e| (Step::Delete, e))?;
                if observed == RuntimeState::Missing {
                    return Ok(());
                }
                let _guard = self.service_locks.lock(name).await;
                if observed == RuntimeState::Running {
                    self.stop_one(name).await.map_err(|e| (Step::Stop, e))?;
                } else if self.registry.state(name) == LifecycleState::Failed {
                    self.registry.transition(name, LifecycleState::Stopped).map_err(|e| (Step::Stop, e))?;
                }
                self.delete_one(name).await.map_err(|e| (Step::Delete, e))?;
                self.network.invalidate(name);
                Ok::<(), (Step, VezaError)>(())
            }
            .await;

            match result {
                Ok(()) => report.record(name, Step::Delete, Ok(())),
                Err((step, e)) => report.record(name, step, Err(e)),
            }
        }
        report
    }
}
