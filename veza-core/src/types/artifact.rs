//! Export artifact types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem snapshot of a fully provisioned container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub service_name: String,
    pub archive_path: PathBuf,
    pub created_at: DateTime<Utc>,
}
