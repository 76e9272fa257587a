//! Metric descriptions.
//!
//! Counters follow Prometheus naming conventions (`_total` suffix). No
//! exporter is installed; a recorder can be attached by an embedding process.

use metrics::describe_counter;

/// Describe every counter the orchestrator emits.
pub fn register_core_metrics() {
    // Containers
    describe_counter!("veza_containers_created_total", "Containers created");
    describe_counter!("veza_containers_started_total", "Containers started");
    describe_counter!("veza_containers_stopped_total", "Containers stopped");
    describe_counter!("veza_containers_deleted_total", "Containers deleted");

    // Network
    describe_counter!("veza_bridge_created_total", "Bridges created");
    describe_counter!("veza_bridge_deleted_total", "Bridges deleted");

    // Provisioning
    describe_counter!("veza_provision_total", "Provisioning attempts (by outcome)");
    describe_counter!(
        "veza_provision_skipped_total",
        "Services skipped because a dependency was not healthy"
    );
    describe_counter!("veza_unit_restarts_total", "Service unit restarts");

    // Sync and build
    describe_counter!("veza_sync_files_pushed_total", "Files pushed into containers by sync");
    describe_counter!("veza_builds_total", "Builds run (by outcome)");

    // Edge
    describe_counter!("veza_edge_reloads_total", "Edge reconfigurations (by outcome)");

    // Health
    describe_counter!("veza_health_probes_total", "Health probes issued");
    describe_counter!("veza_health_probe_failures_total", "Health probes reporting unhealthy");

    // Export/import
    describe_counter!("veza_exports_total", "Container exports written");
    describe_counter!("veza_imports_total", "Container imports");
}
