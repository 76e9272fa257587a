//! Build orchestration.
//!
//! Runs each service's build command inside its container, streaming output
//! to tracing and to a per-service log file on the host. Builds of different
//! services run concurrently up to `max_concurrent_builds`; two builds of the
//! same service never overlap.

use crate::adapters::{sh, shell_quote, ContainerRuntime};
use crate::config::Config;
use crate::error::{Result, Step, VezaError};
use crate::locks::KeyedLocks;
use crate::paths;
use crate::report::StepReport;
use crate::state::InstanceRegistry;
use crate::types::{LifecycleState, ServiceSpec};
use futures::future::join_all;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, instrument, warn};

/// Toolchain locations installed by the bootstrap step.
const TOOLCHAIN_ENV: &str = "export RUSTUP_HOME=/usr/local/rustup CARGO_HOME=/usr/local/cargo \
     PATH=/usr/local/go/bin:/usr/local/cargo/bin:$PATH";

/// Result of one successful build.
#[derive(Debug, Clone)]
pub struct BuildLog {
    pub service: String,
    pub exit_code: i32,
    pub lines: usize,
    /// Last `build_log_tail_lines` lines of output.
    pub tail: String,
    pub log_path: PathBuf,
    pub duration: Duration,
}

pub struct BuildOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    registry: InstanceRegistry,
    service_locks: Arc<KeyedLocks>,
    slots: Arc<Semaphore>,
    config: Config,
}

impl BuildOrchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: InstanceRegistry,
        service_locks: Arc<KeyedLocks>,
        config: Config,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_builds.max(1)));
        Self { runtime, registry, service_locks, slots, config }
    }

    /// Build one service.
    ///
    /// A second build of the same service waits for the first to finish.
    #[instrument(skip(self, spec), fields(service = %spec.name))]
    pub async fn build(&self, spec: &ServiceSpec) -> Result<BuildLog> {
        let build_cmd = spec.build_cmd.as_deref().ok_or_else(|| {
            VezaError::precondition(&spec.name, "service has no build command")
        })?;

        let _guard = self.service_locks.lock(&spec.name).await;
        let _permit = self.slots.acquire().await.map_err(VezaError::internal)?;

        let state = self.registry.state(&spec.name);
        if !matches!(state, LifecycleState::Running | LifecycleState::Provisioning) {
            return Err(VezaError::precondition(
                &spec.name,
                format!("container is {}, not running", state),
            ));
        }

        let log_path = paths::build_log_path(&self.config.logs_dir(), &spec.name);
        let mut log_file = open_log(&log_path).await?;

        let command = sh(build_script(spec, &self.config.remote_root, build_cmd));
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let tail_len = self.config.build_log_tail_lines;
        let started = Instant::now();
        info!(command = build_cmd, "Building");

        let consume = async {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(tail_len);
            let mut count = 0usize;
            while let Some(line) = rx.recv().await {
                debug!(service = %spec.name, "{}", line);
                if let Err(e) = log_file.write_all(format!("{}\n", line).as_bytes()).await {
                    warn!(path = %log_path.display(), error = %e, "Failed to write build log");
                }
                if tail_len > 0 {
                    if tail.len() == tail_len {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                count += 1;
            }
            (tail, count)
        };

        let (exit, (tail, lines)) =
            tokio::join!(self.runtime.exec_streaming(&spec.name, &command, tx), consume);
        let _ = log_file.flush().await;

        let exit_code = exit?;
        let tail = Vec::from(tail).join("\n");
        let duration = started.elapsed();

        if exit_code != 0 {
            metrics::counter!("veza_builds_total", "outcome" => "failed").increment(1);
            warn!(exit_code, ?duration, "Build failed");
            return Err(VezaError::BuildFailed { service: spec.name.clone(), exit_code, log_tail: tail });
        }

        metrics::counter!("veza_builds_total", "outcome" => "succeeded").increment(1);
        info!(?duration, lines, "Build succeeded");
        Ok(BuildLog { service: spec.name.clone(), exit_code, lines, tail, log_path, duration })
    }

    /// Build several services concurrently, bounded by the build slots.
    pub async fn build_all(&self, specs: &[&ServiceSpec]) -> StepReport<BuildLog> {
        let results = join_all(specs.iter().map(|spec| async move {
            (spec.name.clone(), self.build(spec).await)
        }))
        .await;

        let mut report = StepReport::new();
        for (name, result) in results {
            report.record(name, Step::Build, result);
        }
        report
    }
}

/// Shell script running `build_cmd` in the service's working directory with
/// its environment, merging stderr into stdout.
pub fn build_script(spec: &ServiceSpec, remote_root: &str, build_cmd: &str) -> String {
    let exports: String = spec
        .env
        .iter()
        .map(|(k, v)| format!("export {}={}; ", k, shell_quote(v)))
        .collect();
    format!(
        "{}; {}cd {} && ( {} ) 2>&1",
        TOOLCHAIN_ENV,
        exports,
        shell_quote(&spec.workdir(remote_root)),
        build_cmd
    )
}

async fn open_log(path: &std::path::Path) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VezaError::IoError { path: parent.to_path_buf(), source: e })?;
    }
    tokio::fs::File::create(path)
        .await
        .map_err(|e| VezaError::IoError { path: path.to_path_buf(), source: e })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    #[test]
    fn test_build_script_shape() {
        let catalog = Catalog::builtin().unwrap();
        let backend = catalog.require("backend").unwrap();
        let script = build_script(backend, "/opt/veza", backend.build_cmd.as_deref().unwrap());

        assert!(script.starts_with("export RUSTUP_HOME="));
        assert!(script.contains("export PORT='8080'; "));
        assert!(script.contains("cd '/opt/veza/backend' && ( go build -o bin/server ./cmd/production-server ) 2>&1"));
    }
}
