//! Container runtime adapter abstraction.
//!
//! The orchestrator never talks to the hypervisor directly; every lifecycle
//! verb goes through the `ContainerRuntime` trait:
//! - Linux: Incus (system containers)
//! - Tests: in-memory mock runtimes

use crate::error::Result;
use crate::types::LifecycleState;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Container runtime trait.
///
/// Implementations are stateless with respect to the topology: they report
/// what the hypervisor sees and perform exactly the verb asked for.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container from `image`, attached to `bridge`.
    async fn create(&self, name: &str, image: &str, bridge: &str) -> Result<()>;

    /// Start an existing container.
    async fn start(&self, name: &str) -> Result<()>;

    /// Stop a running container, waiting up to `timeout` for a clean shutdown.
    async fn stop(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Delete a stopped container.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Observed state of a container.
    async fn state(&self, name: &str) -> Result<RuntimeState>;

    /// IPv4 address currently leased to the container, if any.
    async fn address(&self, name: &str) -> Result<Option<Ipv4Addr>>;

    /// Run a command to completion and capture its output.
    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput>;

    /// Run a command, forwarding each output line to `lines` as it arrives.
    ///
    /// Returns the exit code.
    async fn exec_streaming(
        &self,
        name: &str,
        command: &[String],
        lines: UnboundedSender<String>,
    ) -> Result<i32>;

    /// Copy a host file into the container, creating parent directories.
    async fn push_file(&self, name: &str, local: &Path, remote: &str) -> Result<()>;

    /// Write `contents` to a file inside the container.
    async fn write_file(&self, name: &str, remote: &str, contents: &[u8]) -> Result<()>;

    /// Read a file from the container; `None` if it does not exist.
    async fn read_file(&self, name: &str, remote: &str) -> Result<Option<Vec<u8>>>;

    /// Export a stopped container to an archive on the host.
    async fn export(&self, name: &str, archive: &Path) -> Result<()>;

    /// Import a container named `name` from an archive on the host.
    async fn import(&self, name: &str, archive: &Path) -> Result<()>;

    /// Run a command attached to the caller's terminal. Returns the exit code.
    async fn interactive(&self, name: &str, command: &[String]) -> Result<i32>;

    /// Get adapter name (for logging).
    fn name(&self) -> &str;
}

/// What the runtime reports about a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Missing,
    Stopped,
    Running,
}

impl RuntimeState {
    /// Lifecycle state to seed an instance with, absent any in-process history.
    #[must_use]
    pub fn lifecycle(self) -> LifecycleState {
        match self {
            Self::Missing => LifecycleState::Absent,
            Self::Stopped => LifecycleState::Stopped,
            Self::Running => LifecycleState::Running,
        }
    }
}

/// Captured result of a command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr if non-empty, else stdout, trimmed to the last `lines` lines.
    pub fn diagnostic(&self, lines: usize) -> String {
        let text = if self.stderr.trim().is_empty() { &self.stdout } else { &self.stderr };
        tail_lines(text, lines)
    }
}

/// The last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(n);
    all[start..].join("\n")
}

/// Wrap a shell script as an argv for `exec`.
pub fn sh(script: impl Into<String>) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.into()]
}

/// Quote a value for inclusion in a POSIX shell script.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub mod incus;
pub mod serialized;

mod factory;
pub use factory::AdapterFactory;
pub use incus::IncusAdapter;
pub use serialized::SerializedRuntime;
