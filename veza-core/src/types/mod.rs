//! Core domain types for Veza orchestration.

pub mod artifact;
pub mod edge;
pub mod instance;
pub mod network;
pub mod service;

// Re-exports
pub use artifact::ExportArtifact;
pub use edge::EdgeRoute;
pub use instance::{ContainerInstance, HealthStatus, LifecycleState};
pub use network::NetworkTopology;
pub use service::{HealthCheck, ServiceKind, ServiceSpec, Tier};
