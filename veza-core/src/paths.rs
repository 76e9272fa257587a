//! Centralized path configuration.
//!
//! All host-side paths go through this module so the CLI and tests agree on
//! where artifacts, logs and generated configuration live.

use std::path::PathBuf;

/// Get the data directory.
///
/// Resolution order:
/// 1. `VEZA_DATA_DIR` environment variable
/// 2. `~/.veza`
/// 3. `/var/lib/veza` when no home directory is known
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VEZA_DATA_DIR") {
        return PathBuf::from(dir);
    }

    dirs::home_dir().map(|h| h.join(".veza")).unwrap_or_else(|| PathBuf::from("/var/lib/veza"))
}

/// Get the configuration directory (`VEZA_CONFIG_DIR`, else the data directory).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VEZA_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    data_dir()
}

/// Get the export artifacts directory.
pub fn artifacts_dir() -> PathBuf {
    data_dir().join("artifacts")
}

/// Get the logs directory.
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Get the directory holding the last applied edge configuration.
pub fn edge_dir() -> PathBuf {
    data_dir().join("edge")
}

/// Get the directory holding host-side sync manifests.
pub fn cache_dir() -> PathBuf {
    data_dir().join("cache")
}

/// Get the build log path for a service.
pub fn build_log_path(logs_dir: &std::path::Path, service: &str) -> PathBuf {
    logs_dir.join(format!("{}-build.log", service))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_from_env() {
        std::env::set_var("VEZA_DATA_DIR", "/tmp/veza-test");
        assert_eq!(data_dir(), PathBuf::from("/tmp/veza-test"));
        assert!(artifacts_dir().starts_with("/tmp/veza-test"));
        assert!(logs_dir().starts_with("/tmp/veza-test"));
        assert!(edge_dir().starts_with("/tmp/veza-test"));
        assert!(cache_dir().starts_with("/tmp/veza-test"));
        std::env::remove_var("VEZA_DATA_DIR");
    }

    #[test]
    fn test_build_log_path() {
        let path = build_log_path(std::path::Path::new("/var/log/veza"), "veza-chat");
        assert_eq!(path, PathBuf::from("/var/log/veza/veza-chat-build.log"));
    }
}
