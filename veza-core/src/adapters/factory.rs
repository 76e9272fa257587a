//! Adapter factory.
//!
//! Locates the hypervisor binary once and hands out the runtime adapter and
//! the bridge driver built on it.

use crate::adapters::incus::find_binary;
use crate::adapters::{ContainerRuntime, IncusAdapter, SerializedRuntime};
use crate::config::Config;
use crate::error::{Result, VezaError};
use crate::network::{IncusNetworkDriver, NetworkDriver};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument};

/// Factory for the runtime adapter and network driver.
pub struct AdapterFactory;

impl AdapterFactory {
    /// Resolve the `incus` binary: explicit config override, else discovery.
    ///
    /// # Errors
    ///
    /// `RuntimeMissing` when no binary can be found; every command that
    /// touches containers fails with exit code 2 in that case.
    pub fn binary(config: &Config) -> Result<PathBuf> {
        match &config.incus_binary {
            Some(path) => {
                let path = PathBuf::from(path);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(VezaError::RuntimeMissing { binary: path.to_string_lossy().into_owned() })
                }
            }
            None => find_binary("incus"),
        }
    }

    /// Create the container runtime, serialized per container.
    #[instrument(skip(config))]
    pub fn create(config: &Config) -> Result<Arc<dyn ContainerRuntime>> {
        let binary = Self::binary(config)?;
        info!(binary = %binary.display(), "Using Incus runtime");
        let adapter: Arc<dyn ContainerRuntime> = Arc::new(IncusAdapter::with_binary(binary));
        Ok(Arc::new(SerializedRuntime::new(adapter)))
    }

    /// Create the bridge driver.
    pub fn network_driver(config: &Config) -> Result<Arc<dyn NetworkDriver>> {
        Ok(Arc::new(IncusNetworkDriver::new(Self::binary(config)?)))
    }
}
