//! Network management for Veza.
//!
//! Owns the bridged network every container attaches to and the
//! post-boot address of each container.
//!
//! ## Layout
//!
//! - [`NetworkDriver`]: inspects and creates the bridge (Incus managed network)
//! - [`NetworkProvisioner`]: idempotent `ensure_network` plus the address cache

pub mod driver;
pub mod provisioner;

pub use driver::{BridgeInfo, IncusNetworkDriver, NetworkDriver};
pub use provisioner::{EnsureOutcome, NetworkProvisioner};
