//! In-memory instance registry.
//!
//! The runtime is the source of truth for whether a container exists and
//! runs; the registry layers the guarded lifecycle, addresses and health on
//! top of it for the duration of one command.

use crate::adapters::ContainerRuntime;
use crate::catalog::Catalog;
use crate::error::Result;
use crate::types::{ContainerInstance, ExportArtifact, HealthStatus, LifecycleState};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, instrument};


/// Shared registry of [`ContainerInstance`]s keyed by service name.
#[derive(Debug, Clone, Default)]
pub struct InstanceRegistry {
    instances: Arc<RwLock<BTreeMap<String, ContainerInstance>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, ContainerInstance>> {
        self.instances.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, ContainerInstance>> {
        self.instances.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Seed every catalog service from what the runtime reports.
    ///
    /// Replaces any previous in-memory view; addresses and health start
    /// unknown and are filled in by later steps.
    #[instrument(skip_all)]
    pub async fn reconcile(&self, runtime: &dyn ContainerRuntime, catalog: &Catalog) -> Result<()> {
        let observed = join_all(catalog.services().iter().map(|spec| async move {
            runtime.state(&spec.name).await.map(|state| (spec.name.clone(), state))
        }))
        .await;

        let mut instances = self.write();
        instances.clear();
        for entry in observed {
            let (name, state) = entry?;
            debug!(service = %name, ?state, "Observed");
            instances.insert(name.clone(), ContainerInstance::observed(name, state.lifecycle()));
        }
        Ok(())
    }

    /// Current view of one service (Absent if never seen).
    pub fn get(&self, service: &str) -> ContainerInstance {
        self.read().get(service).cloned().unwrap_or_else(|| ContainerInstance::new(service))
    }

    pub fn state(&self, service: &str) -> LifecycleState {
        self.read().get(service).map(|i| i.lifecycle_state).unwrap_or(LifecycleState::Absent)
    }

    /// Guarded lifecycle transition.
    pub fn transition(&self, service: &str, to: LifecycleState) -> Result<()> {
        self.update(service, |instance| instance.transition(to))
    }

    pub fn set_address(&self, service: &str, address: Option<Ipv4Addr>) {
        let _ = self.update(service, |instance| {
            instance.address = address;
            Ok(())
        });
    }

    pub fn set_health(&self, service: &str, health: HealthStatus) {
        let _ = self.update(service, |instance| {
            instance.last_health = health;
            Ok(())
        });
    }

    pub fn set_artifact(&self, service: &str, artifact: ExportArtifact) {
        let _ = self.update(service, |instance| {
            instance.export_artifact = Some(artifact);
            Ok(())
        });
    }

    /// Mutate one instance under the write lock.
    pub fn update<T>(
        &self,
        service: &str,
        f: impl FnOnce(&mut ContainerInstance) -> Result<T>,
    ) -> Result<T> {
        let mut instances = self.write();
        let instance =
            instances.entry(service.to_string()).or_insert_with(|| ContainerInstance::new(service));
        f(instance)
    }
}
