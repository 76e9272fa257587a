//! Source synchronization.
//!
//! Mirrors a service's host source tree into its container's working
//! directory. Only files whose size or hash differ from the manifest left in
//! the container by the previous sync are transferred; files gone from the
//! host are removed remotely.

pub mod manifest;

use crate::adapters::{sh, shell_quote, ContainerRuntime};
use crate::config::Config;
use crate::error::{Result, Step, VezaError};
use crate::locks::KeyedLocks;
use crate::report::StepReport;
use crate::state::InstanceRegistry;
use crate::types::{LifecycleState, ServiceSpec};
use futures::future::join_all;
pub use manifest::{ManifestDiff, TreeManifest, MANIFEST_FILE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Paths removed per remote `rm` invocation.
const REMOVE_BATCH: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub scanned: usize,
    pub pushed: usize,
    pub removed: usize,
    pub bytes: u64,
}

impl SyncStats {
    pub fn is_noop(&self) -> bool {
        self.pushed == 0 && self.removed == 0
    }

    pub fn unchanged(&self) -> usize {
        self.scanned - self.pushed
    }
}

pub struct SyncEngine {
    runtime: Arc<dyn ContainerRuntime>,
    registry: InstanceRegistry,
    service_locks: Arc<KeyedLocks>,
    config: Config,
}

impl SyncEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: InstanceRegistry,
        service_locks: Arc<KeyedLocks>,
        config: Config,
    ) -> Self {
        Self { runtime, registry, service_locks, config }
    }

    /// Sync one service's source tree into its running container.
    #[instrument(skip(self, spec), fields(service = %spec.name))]
    pub async fn sync(&self, spec: &ServiceSpec) -> Result<SyncStats> {
        let source_path = spec.source_path.as_deref().ok_or_else(|| {
            VezaError::precondition(&spec.name, "service has no source tree to sync")
        })?;
        let local_root = self.config.source_dir(source_path);
        if !local_root.is_dir() {
            return Err(VezaError::precondition(
                &spec.name,
                format!("source directory {} does not exist", local_root.display()),
            ));
        }

        let state = self.registry.state(&spec.name);
        if !matches!(state, LifecycleState::Running | LifecycleState::Provisioning) {
            return Err(VezaError::precondition(
                &spec.name,
                format!("container is {}, not running", state),
            ));
        }

        let _guard = self.service_locks.lock(&spec.name).await;

        let cache_path = self.cache_path(&spec.name);
        let previous = load_cached(&cache_path);
        let ignore = self.config.sync_ignore.clone();
        let root = local_root.clone();
        let local = tokio::task::spawn_blocking(move || {
            TreeManifest::scan(&root, &ignore, previous.as_ref())
        })
        .await
        .map_err(VezaError::internal)??;

        let workdir = spec.workdir(&self.config.remote_root);
        let manifest_path = format!("{}/{}", workdir, MANIFEST_FILE);
        let remote = match self.runtime.read_file(&spec.name, &manifest_path).await? {
            Some(content) => TreeManifest::from_json(&content).unwrap_or_else(|e| {
                warn!(error = %e, "Remote manifest unreadable, resyncing everything");
                TreeManifest::default()
            }),
            None => TreeManifest::default(),
        };

        let diff = local.diff(&remote);
        let mut stats = SyncStats { scanned: local.files.len(), ..SyncStats::default() };
        if diff.is_empty() {
            debug!(files = stats.scanned, "Source tree unchanged");
            save_cached(&cache_path, &local);
            return Ok(stats);
        }

        for rel in &diff.changed {
            let remote_path = format!("{}/{}", workdir, rel);
            self.runtime.push_file(&spec.name, &local_root.join(rel), &remote_path).await?;
            stats.pushed += 1;
        }
        stats.bytes = local.total_bytes(&diff.changed);

        for batch in diff.removed.chunks(REMOVE_BATCH) {
            self.remove_remote(&spec.name, &workdir, batch).await?;
            stats.removed += batch.len();
        }

        self.runtime
            .write_file(&spec.name, &manifest_path, local.to_json()?.as_bytes())
            .await?;
        save_cached(&cache_path, &local);

        metrics::counter!("veza_sync_files_pushed_total").increment(stats.pushed as u64);
        info!(
            pushed = stats.pushed,
            removed = stats.removed,
            bytes = stats.bytes,
            unchanged = stats.unchanged(),
            "Synced source tree"
        );
        Ok(stats)
    }

    /// Sync several services concurrently; one failure does not stop the rest.
    pub async fn sync_all(&self, specs: &[&ServiceSpec]) -> StepReport<SyncStats> {
        let results = join_all(specs.iter().map(|spec| async move {
            (spec.name.clone(), self.sync(spec).await)
        }))
        .await;

        let mut report = StepReport::new();
        for (name, result) in results {
            report.record(name, Step::Sync, result);
        }
        report
    }

    async fn remove_remote(&self, name: &str, workdir: &str, paths: &[String]) -> Result<()> {
        let targets: Vec<String> =
            paths.iter().map(|rel| shell_quote(&format!("{}/{}", workdir, rel))).collect();
        let script = format!("rm -f -- {}", targets.join(" "));
        let output = self.runtime.exec(name, &sh(script.clone())).await?;
        if !output.success() {
            return Err(VezaError::CommandFailed {
                target: name.to_string(),
                command: script,
                exit_code: output.exit_code,
                output: output.diagnostic(self.config.build_log_tail_lines),
            });
        }
        Ok(())
    }

    fn cache_path(&self, service: &str) -> PathBuf {
        self.config.cache_dir().join(format!("{}.sync.json", service))
    }
}

/// Host-side copy of the last scan; only used to skip rehashing.
fn load_cached(path: &Path) -> Option<TreeManifest> {
    let content = std::fs::read(path).ok()?;
    TreeManifest::from_json(&content).ok()
}

fn save_cached(path: &Path, manifest: &TreeManifest) {
    let result = manifest.to_json().and_then(|json| {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VezaError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        std::fs::write(path, json).map_err(|e| VezaError::IoError { path: path.to_path_buf(), source: e })
    });
    if let Err(e) = result {
        debug!(error = %e, "Could not cache sync manifest");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_noop() {
        let stats = SyncStats { scanned: 12, ..SyncStats::default() };
        assert!(stats.is_noop());
        assert_eq!(stats.unchanged(), 12);

        let stats = SyncStats { scanned: 12, pushed: 2, removed: 0, bytes: 90 };
        assert!(!stats.is_noop());
        assert_eq!(stats.unchanged(), 10);
    }

    #[test]
    fn test_cache_round_trip() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("cache").join("chat.sync.json");
        assert!(load_cached(&path).is_none());

        let mut manifest = TreeManifest::default();
        manifest.files.insert(
            "src/main.rs".to_string(),
            manifest::FileEntry { size: 3, sha256: "abc".to_string(), modified: Some(7) },
        );
        save_cached(&path, &manifest);
        assert_eq!(load_cached(&path), Some(manifest));
    }
}
