//! Source tree manifests.
//!
//! A manifest maps every synced file (relative path, `/`-separated) to its
//! size and SHA-256. The copy stored next to the synced tree inside the
//! container is what the next sync diffs against.

use crate::error::{Result, VezaError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Manifest file name, stored at the root of the synced tree.
pub const MANIFEST_FILE: &str = ".veza-sync.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub size: u64,
    pub sha256: String,
    /// Host modification time (ns since epoch); lets a rescan skip hashing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<u128>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeManifest {
    pub files: BTreeMap<String, FileEntry>,
}

/// Files to push and files to delete to make a remote tree match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Whether a path component is excluded by the ignore set.
///
/// Entries match whole names (`.git`, `node_modules`) or, with a leading
/// `*.`, a file suffix (`*.log`).
pub fn is_ignored(name: &str, ignore: &[String]) -> bool {
    ignore.iter().any(|pattern| match pattern.strip_prefix('*') {
        Some(suffix) => name.ends_with(suffix),
        None => name == pattern,
    })
}

impl TreeManifest {
    /// Walk `root`, hashing every regular file not excluded by `ignore`.
    ///
    /// Entries in `previous` whose size and modification time are unchanged
    /// keep their recorded hash instead of being rehashed. Symlinks are
    /// skipped.
    pub fn scan(root: &Path, ignore: &[String], previous: Option<&TreeManifest>) -> Result<Self> {
        let mut manifest = TreeManifest::default();
        let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let entries =
                fs::read_dir(&dir).map_err(|e| VezaError::IoError { path: dir.clone(), source: e })?;

            for entry in entries {
                let entry = entry.map_err(|e| VezaError::IoError { path: dir.clone(), source: e })?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == MANIFEST_FILE || is_ignored(&name, ignore) {
                    continue;
                }

                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .map_err(|e| VezaError::IoError { path: path.clone(), source: e })?;

                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    let rel = relative(root, &path)?;
                    let meta = entry
                        .metadata()
                        .map_err(|e| VezaError::IoError { path: path.clone(), source: e })?;
                    let modified = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_nanos());

                    let reused = previous.and_then(|p| p.files.get(&rel)).filter(|old| {
                        old.size == meta.len() && old.modified.is_some() && old.modified == modified
                    });

                    let sha256 = match reused {
                        Some(old) => old.sha256.clone(),
                        None => hash_file(&path)?,
                    };

                    manifest.files.insert(rel, FileEntry { size: meta.len(), sha256, modified });
                }
            }
        }

        Ok(manifest)
    }

    /// What must change on a remote holding `remote` to match `self`.
    pub fn diff(&self, remote: &TreeManifest) -> ManifestDiff {
        let changed = self
            .files
            .iter()
            .filter(|(path, local)| {
                remote
                    .files
                    .get(*path)
                    .map(|r| r.size != local.size || r.sha256 != local.sha256)
                    .unwrap_or(true)
            })
            .map(|(path, _)| path.clone())
            .collect();

        let removed = remote
            .files
            .keys()
            .filter(|path| !self.files.contains_key(*path))
            .cloned()
            .collect();

        ManifestDiff { changed, removed }
    }

    pub fn total_bytes(&self, paths: &[String]) -> u64 {
        paths.iter().filter_map(|p| self.files.get(p)).map(|e| e.size).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| VezaError::Internal(format!("failed to serialize manifest: {}", e)))
    }

    pub fn from_json(content: &[u8]) -> Result<Self> {
        serde_json::from_slice(content)
            .map_err(|e| VezaError::Internal(format!("failed to parse manifest: {}", e)))
    }
}

fn relative(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|e| VezaError::Internal(format!("{} outside {}: {}", path.display(), root.display(), e)))?;
    Ok(rel.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/"))
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).map_err(|e| VezaError::IoError { path: path.to_path_buf(), source: e })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| VezaError::IoError { path: path.to_path_buf(), source: e })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
