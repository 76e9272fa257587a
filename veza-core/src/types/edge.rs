//! Edge routing types.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// One reverse-proxy route, derived from the catalog and live addresses.
///
/// Never hand-edited: the full route list is regenerated whenever a backing
/// container's address changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRoute {
    /// Path prefix matched by the proxy (e.g., "/api")
    pub match_rule: String,

    /// Catalog name of the upstream service
    pub upstream_service: String,

    /// Upstream listening port
    pub upstream_port: u16,

    /// Resolved upstream address
    pub upstream_address: Ipv4Addr,
}

impl EdgeRoute {
    /// Whether this route is the catch-all default backend.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.match_rule == "/"
    }

    /// Backend identifier usable in proxy configuration.
    #[must_use]
    pub fn backend_name(&self) -> String {
        format!("be_{}", self.upstream_service.replace(['-', '.'], "_"))
    }
}
