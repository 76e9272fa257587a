//! Export/import of provisioned containers.
//!
//! An export is a runtime archive of a stopped container plus a JSON sidecar
//! describing it. Archives are written under a `.partial` name and renamed
//! once complete, so a present `<service>.tar.gz` is always whole.

use crate::adapters::{ContainerRuntime, RuntimeState};
use crate::config::Config;
use crate::error::{Result, VezaError};
use crate::locks::KeyedLocks;
use crate::network::NetworkProvisioner;
use crate::state::InstanceRegistry;
use crate::types::{ContainerInstance, ExportArtifact, LifecycleState, ServiceSpec};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct ExportManager {
    runtime: Arc<dyn ContainerRuntime>,
    network: Arc<NetworkProvisioner>,
    registry: InstanceRegistry,
    service_locks: Arc<KeyedLocks>,
    config: Config,
}

impl ExportManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        network: Arc<NetworkProvisioner>,
        registry: InstanceRegistry,
        service_locks: Arc<KeyedLocks>,
        config: Config,
    ) -> Self {
        Self { runtime, network, registry, service_locks, config }
    }

    pub fn archive_path(&self, service: &str) -> PathBuf {
        self.config.artifacts_dir().join(format!("{}.tar.gz", service))
    }

    fn sidecar_path(&self, service: &str) -> PathBuf {
        self.config.artifacts_dir().join(format!("{}.json", service))
    }

    /// Export a stopped container.
    #[instrument(skip(self, spec), fields(service = %spec.name))]
    pub async fn export(&self, spec: &ServiceSpec) -> Result<ExportArtifact> {
        let name = spec.name.as_str();
        let _guard = self.service_locks.lock(name).await;

        match self.registry.state(name) {
            LifecycleState::Stopped => {}
            LifecycleState::Provisioning => {
                return Err(VezaError::precondition(name, "container is still provisioning"));
            }
            other => {
                return Err(VezaError::precondition(
                    name,
                    format!("container is {}; stop it before exporting", other),
                ));
            }
        }

        let dir = self.config.artifacts_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| VezaError::IoError { path: dir.clone(), source: e })?;

        let archive = self.archive_path(name);
        let partial = archive.with_extension("gz.partial");
        let _ = tokio::fs::remove_file(&partial).await;

        if let Err(e) = self.runtime.export(name, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, &archive)
            .await
            .map_err(|e| VezaError::IoError { path: archive.clone(), source: e })?;

        let artifact = ExportArtifact {
            service_name: name.to_string(),
            archive_path: archive,
            created_at: Utc::now(),
        };
        self.write_sidecar(&artifact).await?;
        self.registry.set_artifact(name, artifact.clone());

        metrics::counter!("veza_exports_total").increment(1);
        info!(archive = %artifact.archive_path.display(), "Exported");
        Ok(artifact)
    }

    /// Import an artifact as a new container and start it.
    ///
    /// The instance is left in Provisioning; a health pass promotes it.
    /// An existing container is only replaced when `force` is set.
    #[instrument(skip(self, artifact), fields(service = %artifact.service_name))]
    pub async fn import(&self, artifact: &ExportArtifact, force: bool) -> Result<ContainerInstance> {
        let name = artifact.service_name.as_str();
        if !artifact.archive_path.is_file() {
            return Err(VezaError::ArtifactMissing { path: artifact.archive_path.clone() });
        }

        let _guard = self.service_locks.lock(name).await;

        let observed = self.runtime.state(name).await?;
        if observed != RuntimeState::Missing {
            if !force {
                return Err(VezaError::AlreadyExists { service: name.to_string() });
            }
            warn!("Replacing existing container");
            self.remove_existing(name, observed).await?;
        }

        self.network.invalidate(name);
        self.registry.transition(name, LifecycleState::Provisioning)?;

        let imported = async {
            self.runtime.import(name, &artifact.archive_path).await?;
            self.runtime.start(name).await
        }
        .await;
        if let Err(e) = imported {
            if let Err(mark) = self.registry.transition(name, LifecycleState::Failed) {
                warn!(error = %mark, "Could not mark instance failed");
            }
            return Err(e);
        }

        self.registry.set_artifact(name, artifact.clone());
        metrics::counter!("veza_imports_total").increment(1);
        info!("Imported, awaiting health");
        Ok(self.registry.get(name))
    }

    async fn remove_existing(&self, name: &str, observed: RuntimeState) -> Result<()> {
        if observed == RuntimeState::Running {
            self.runtime.stop(name, self.config.stop_timeout()).await?;
            self.registry.transition(name, LifecycleState::Stopped)?;
        }
        self.runtime.delete(name).await?;
        self.network.invalidate(name);
        self.registry.transition(name, LifecycleState::Absent)
    }

    async fn write_sidecar(&self, artifact: &ExportArtifact) -> Result<()> {
        let path = self.sidecar_path(&artifact.service_name);
        let json = serde_json::to_string_pretty(artifact)
            .map_err(|e| VezaError::Internal(format!("failed to serialize artifact: {}", e)))?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| VezaError::IoError { path: path.clone(), source: e })
    }

    /// Artifact for `service`, from its sidecar or, failing that, the archive
    /// itself.
    pub fn load(&self, service: &str) -> Result<ExportArtifact> {
        let archive = self.archive_path(service);
        if !archive.is_file() {
            return Err(VezaError::ArtifactMissing { path: archive });
        }

        let sidecar = self.sidecar_path(service);
        if let Some(artifact) = std::fs::read(&sidecar)
            .ok()
            .and_then(|c| serde_json::from_slice::<ExportArtifact>(&c).ok())
        {
            return Ok(artifact);
        }

        let created_at = modified_at(&archive).unwrap_or_else(Utc::now);
        Ok(ExportArtifact { service_name: service.to_string(), archive_path: archive, created_at })
    }

    /// Every complete artifact in the artifacts directory, by service name.
    pub fn list(&self) -> Result<Vec<ExportArtifact>> {
        let dir = self.config.artifacts_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VezaError::IoError { path: dir, source: e }),
        };

        let mut artifacts = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(service) = file_name.strip_suffix(".tar.gz") {
                artifacts.push(self.load(service)?);
            }
        }
        artifacts.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        Ok(artifacts)
    }
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}
