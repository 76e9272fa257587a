//! Error types for Veza orchestration.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use crate::types::LifecycleState;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, VezaError>;

/// Main error type for Veza orchestration.
#[derive(Error, Debug)]
pub enum VezaError {
    // Precondition errors (exit code 2)
    #[error("Precondition failed for {target}: {reason}")]
    PreconditionFailed { target: String, reason: String },

    #[error(
        "Subnet conflict on bridge {bridge}: existing {existing}, requested {requested}"
    )]
    SubnetConflict { bridge: String, existing: String, requested: String },

    #[error("Container runtime not found: {binary}")]
    RuntimeMissing { binary: String },

    #[error("Export artifact not found: {path:?}")]
    ArtifactMissing { path: PathBuf },

    #[error("Container already exists: {service}")]
    AlreadyExists { service: String },

    // Runtime errors
    #[error("Transport to {target} failed: {reason}")]
    TransportFailed { target: String, reason: String },

    #[error("Command failed in {target} (exit code {exit_code}): {command}\n{output}")]
    CommandFailed { target: String, command: String, exit_code: i32, output: String },

    #[error("Build failed for {service} (exit code {exit_code})\n{log_tail}")]
    BuildFailed { service: String, exit_code: i32, log_tail: String },

    #[error("{operation} timed out after {after:?}{}", port_suffix(.port))]
    Timeout { target: String, operation: String, after: Duration, port: Option<u16> },

    #[error("Proxy configuration rejected: {output}")]
    ValidationFailed { output: String },

    #[error("Invalid lifecycle transition for {service}: {from} -> {to}")]
    InvalidTransition { service: String, from: LifecycleState, to: LifecycleState },

    // Catalog and configuration errors
    #[error("Invalid catalog: {reason}")]
    InvalidCatalog { reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn port_suffix(port: &Option<u16>) -> String {
    port.map(|p| format!(" on port {}", p)).unwrap_or_default()
}

impl VezaError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Shorthand for a precondition failure.
    pub fn precondition(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PreconditionFailed { target: target.into(), reason: reason.into() }
    }

    /// Shorthand for a transport failure.
    pub fn transport(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransportFailed { target: target.into(), reason: reason.into() }
    }

    /// Process exit code for this error.
    ///
    /// 2 for unmet preconditions (missing artifact, missing runtime, subnet
    /// conflict, unmet dependency), 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PreconditionFailed { .. }
            | Self::SubnetConflict { .. }
            | Self::RuntimeMissing { .. }
            | Self::ArtifactMissing { .. }
            | Self::AlreadyExists { .. } => 2,
            _ => 1,
        }
    }

    /// Actionable next step for an operator, phrased against `service`.
    pub fn hint(&self, service: &str) -> String {
        match self {
            Self::PreconditionFailed { .. } => {
                format!("check dependencies with `status`, then retry for {}", service)
            }
            Self::SubnetConflict { .. } => {
                "detach all containers with `clean --network` before changing the subnet"
                    .to_string()
            }
            Self::RuntimeMissing { binary } => format!("install {} and run `setup`", binary),
            Self::ArtifactMissing { .. } => {
                format!("run `export` to produce an artifact for {}", service)
            }
            Self::AlreadyExists { .. } => {
                format!("pass --force to replace the existing {} container", service)
            }
            Self::TransportFailed { .. } => {
                format!("verify the container is running via `status`, then `shell {}`", service)
            }
            Self::CommandFailed { .. } => {
                format!("inspect the container via `shell {}`, then retry", service)
            }
            Self::BuildFailed { .. } => format!("inspect the full log via `build {}`", service),
            Self::Timeout { .. } => format!("inspect via `logs {}`", service),
            Self::ValidationFailed { .. } => {
                "the active proxy configuration was left untouched; fix the template and retry"
                    .to_string()
            }
            Self::InvalidTransition { .. } => {
                format!("inspect the current state via `status` before acting on {}", service)
            }
            Self::InvalidCatalog { .. } | Self::InvalidConfig { .. } => {
                "fix the catalog or config file and retry".to_string()
            }
            Self::IoError { path, .. } => format!("check permissions on {}", path.display()),
            Self::Internal(_) | Self::Other(_) => format!("retry, then inspect `logs {}`", service),
        }
    }
}

/// A named step of an orchestration command, used in failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Network,
    Create,
    Start,
    Bootstrap,
    Readiness,
    Sync,
    Build,
    Restart,
    Edge,
    Health,
    Stop,
    Delete,
    Export,
    Import,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Create => "create",
            Self::Start => "start",
            Self::Bootstrap => "bootstrap",
            Self::Readiness => "readiness",
            Self::Sync => "sync",
            Self::Build => "build",
            Self::Restart => "restart",
            Self::Edge => "edge",
            Self::Health => "health",
            Self::Stop => "stop",
            Self::Delete => "delete",
            Self::Export => "export",
            Self::Import => "import",
        };
        f.write_str(s)
    }
}

/// Failure of one step for one service.
///
/// Multi-service commands collect these instead of aborting, so that one
/// service's failure never hides the outcome of unrelated services.
#[derive(Debug)]
pub struct StepFailure {
    pub service: String,
    pub step: Step,
    pub error: VezaError,
}

impl StepFailure {
    pub fn new(service: impl Into<String>, step: Step, error: VezaError) -> Self {
        Self { service: service.into(), step, error }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "service {}: {} failed: {}; {}",
            self.service,
            self.step,
            self.error,
            self.error.hint(&self.service)
        )
    }
}
