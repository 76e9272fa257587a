//! Veza core library.
//!
//! Lifecycle orchestration for the Veza container topology: catalog,
//! runtime adapter, network, provisioning, source sync, builds, edge
//! proxy, health and export/import.

pub mod adapters;
pub mod build;
pub mod catalog;
pub mod config;
pub mod deployment;
pub mod edge;
pub mod error;
pub mod export;
pub mod health;
pub mod locks;
pub mod network;
pub mod observability;
pub mod paths;
pub mod provisioner;
pub mod report;
pub mod retry;
pub mod state;
pub mod sync;
pub mod templates;
pub mod types;

// Re-export commonly used items
pub use catalog::Catalog;
pub use config::Config;
pub use deployment::{
    ArchiveReport, CleanReport, CreateReport, DeployReport, Deployment, ServiceStatus,
};
pub use error::{Result, Step, StepFailure, VezaError};
pub use observability::init as init_observability;
pub use report::StepReport;
pub use types::{
    ContainerInstance, EdgeRoute, ExportArtifact, HealthCheck, HealthStatus, LifecycleState,
    NetworkTopology, ServiceKind, ServiceSpec, Tier,
};
