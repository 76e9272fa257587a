//! Container instance lifecycle.

use crate::error::{Result, VezaError};
use crate::types::ExportArtifact;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Lifecycle state of a service's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// No container exists.
    Absent,
    /// Container is being created, bootstrapped or imported.
    Provisioning,
    /// Container is running and passed its readiness probe.
    Running,
    /// Container exists but is stopped.
    Stopped,
    /// A guarded operation failed; the container may or may not exist.
    Failed,
}

impl LifecycleState {
    /// Whether `self -> to` is an allowed transition.
    ///
    /// Destructive replacement is never a single edge: a running container
    /// must be stopped, then deleted, before it can be provisioned again.
    #[must_use]
    pub fn can_transition(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Absent, Provisioning)
                | (Provisioning, Running)
                | (Provisioning, Failed)
                | (Provisioning, Stopped)
                | (Running, Stopped)
                | (Running, Failed)
                | (Stopped, Provisioning)
                | (Stopped, Absent)
                | (Failed, Provisioning)
                | (Failed, Stopped)
                | (Failed, Absent)
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Last observed liveness of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Observed state of one service's container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInstance {
    pub service_name: String,
    pub lifecycle_state: LifecycleState,
    /// Address assigned after boot, set by the network provisioner.
    pub address: Option<Ipv4Addr>,
    pub last_health: HealthStatus,
    pub export_artifact: Option<ExportArtifact>,
}

impl ContainerInstance {
    /// A fresh instance in the `Absent` state.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            lifecycle_state: LifecycleState::Absent,
            address: None,
            last_health: HealthStatus::Unknown,
            export_artifact: None,
        }
    }

    /// Instance seeded from an observed runtime state.
    pub fn observed(service_name: impl Into<String>, state: LifecycleState) -> Self {
        Self { lifecycle_state: state, ..Self::new(service_name) }
    }

    /// Apply a guarded lifecycle transition.
    ///
    /// Leaving the running state clears the address and health, since both
    /// are only meaningful for a live container.
    pub fn transition(&mut self, to: LifecycleState) -> Result<()> {
        let from = self.lifecycle_state;
        if !from.can_transition(to) {
            return Err(VezaError::InvalidTransition {
                service: self.service_name.clone(),
                from,
                to,
            });
        }

        self.lifecycle_state = to;
        match to {
            LifecycleState::Absent | LifecycleState::Stopped => {
                self.address = None;
                self.last_health = HealthStatus::Unknown;
            }
            LifecycleState::Provisioning => {
                self.last_health = HealthStatus::Unknown;
            }
            LifecycleState::Failed => {
                self.last_health = HealthStatus::Unhealthy;
            }
            LifecycleState::Running => {}
        }
        Ok(())
    }

    /// Running and last seen healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.lifecycle_state == LifecycleState::Running && self.last_health == HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut instance = ContainerInstance::new("db");
        instance.transition(LifecycleState::Provisioning).unwrap();
        instance.transition(LifecycleState::Running).unwrap();
        instance.transition(LifecycleState::Stopped).unwrap();
        instance.transition(LifecycleState::Absent).unwrap();
        assert_eq!(instance.lifecycle_state, LifecycleState::Absent);
    }

    #[test]
    fn test_running_cannot_be_deleted_directly() {
        let mut instance = ContainerInstance::observed("db", LifecycleState::Running);
        let err = instance.transition(LifecycleState::Absent).unwrap_err();
        assert!(matches!(err, VezaError::InvalidTransition { .. }));
        assert_eq!(instance.lifecycle_state, LifecycleState::Running);
    }

    #[test]
    fn test_absent_cannot_start_running() {
        let mut instance = ContainerInstance::new("db");
        assert!(instance.transition(LifecycleState::Running).is_err());
    }

    #[test]
    fn test_stop_clears_address_and_health() {
        let mut instance = ContainerInstance::observed("db", LifecycleState::Running);
        instance.address = Some(Ipv4Addr::new(10, 5, 0, 10));
        instance.last_health = HealthStatus::Healthy;
        assert!(instance.is_healthy());

        instance.transition(LifecycleState::Stopped).unwrap();
        assert_eq!(instance.address, None);
        assert_eq!(instance.last_health, HealthStatus::Unknown);
    }

    #[test]
    fn test_failure_marks_unhealthy() {
        let mut instance = ContainerInstance::new("db");
        instance.transition(LifecycleState::Provisioning).unwrap();
        instance.transition(LifecycleState::Failed).unwrap();
        assert_eq!(instance.last_health, HealthStatus::Unhealthy);
        instance.transition(LifecycleState::Provisioning).unwrap();
    }
}
