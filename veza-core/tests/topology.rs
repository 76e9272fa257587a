//! Integration tests for provisioning the topology.
//!
//! Every test runs against the in-memory runtime from `common`, so they
//! exercise ordering, dependency gating and idempotence without Incus.

mod common;

use common::{app, spec, Harness, MockNetworkDriver};
use veza_core::adapters::ContainerRuntime;
use veza_core::types::ServiceSpec;
use veza_core::network::EnsureOutcome;
use veza_core::provisioner::Outcome;
use veza_core::types::{HealthStatus, LifecycleState, ServiceKind};
use veza_core::{Catalog, Step, VezaError};

fn data_and_api() -> Catalog {
    Catalog::new(vec![
        spec("db", ServiceKind::Database, 5432, &[]),
        spec("cache", ServiceKind::Cache, 6379, &[]),
        spec("api", ServiceKind::CompiledBackend, 8080, &["db", "cache"]),
    ])
    .unwrap()
}

fn full_stack(harness: &Harness) -> Catalog {
    harness.write_source("api", "main.go", "package main\n");
    Catalog::new(vec![
        spec("db", ServiceKind::Database, 5432, &[]),
        spec("cache", ServiceKind::Cache, 6379, &[]),
        app("api", 8080, "/api", &["db", "cache"]),
        spec("proxy", ServiceKind::Proxy, 80, &[]),
    ])
    .unwrap()
}

#[tokio::test]
async fn test_create_provisions_every_service() {
    let harness = Harness::new();
    let deployment = harness.deployment(full_stack(&harness)).await;

    let report = deployment.create(false).await.unwrap();

    assert!(report.provision.is_success(), "{}", report.provision);
    assert_eq!(report.exit_code(), 0);
    assert!(matches!(report.provision.network, EnsureOutcome::Created));
    for name in ["db", "cache", "api", "proxy"] {
        assert!(matches!(report.provision.get(name), Some(Outcome::Created)), "{}", name);
        let instance = deployment.registry().get(name);
        assert_eq!(instance.lifecycle_state, LifecycleState::Running);
        assert_eq!(instance.last_health, HealthStatus::Healthy);
        assert!(instance.address.is_some());
    }

    // Data tier is created before anything depending on it.
    let creates = harness.runtime.ops_matching("create");
    let position = |name: &str| {
        creates.iter().position(|op| op.starts_with(&format!("create {} ", name))).unwrap()
    };
    assert!(position("db") < position("api"));
    assert!(position("cache") < position("api"));
    assert!(position("api") < position("proxy"));

    // Fresh application containers are synced and built before readiness.
    let build = harness.runtime.ops().into_iter().any(|op| op.contains("make api"));
    assert!(build);
    assert!(harness.runtime.file("api", "/opt/veza/api/main.go").is_some());

    let edge = report.edge.expect("proxy running").unwrap();
    assert!(edge.changed);
    assert_eq!(edge.routes.len(), 1);
}

#[tokio::test]
async fn test_create_twice_is_idempotent() {
    let harness = Harness::new();
    let catalog = full_stack(&harness);
    let first = harness.deployment(catalog.clone()).await;
    assert!(first.create(false).await.unwrap().provision.is_success());

    harness.runtime.clear_ops();
    let second = harness.deployment(catalog).await;
    let report = second.create(false).await.unwrap();

    assert!(matches!(report.provision.network, EnsureOutcome::Unchanged));
    for name in ["db", "cache", "api", "proxy"] {
        assert!(matches!(report.provision.get(name), Some(Outcome::Reused)), "{}", name);
    }
    assert!(report.provision.destructive().is_empty());
    for verb in ["create", "start", "stop", "delete", "import"] {
        assert!(harness.runtime.ops_matching(verb).is_empty(), "unexpected {} op", verb);
    }

    let edge = report.edge.expect("proxy running").unwrap();
    assert!(!edge.changed);
}

#[tokio::test]
async fn test_unhealthy_dependency_skips_dependents() {
    let harness = Harness::new();
    harness.prober.mark_unhealthy("db");
    let deployment = harness.deployment(data_and_api()).await;

    let report = deployment.create(false).await.unwrap();

    match report.provision.get("db") {
        Some(Outcome::Failed(failure)) => {
            assert_eq!(failure.step, Step::Readiness);
            assert!(matches!(failure.error, VezaError::Timeout { .. }));
        }
        other => panic!("db should have failed, got {:?}", other),
    }
    assert!(matches!(report.provision.get("cache"), Some(Outcome::Created)));
    assert!(matches!(
        report.provision.get("api"),
        Some(Outcome::Skipped { dependency }) if dependency == "db"
    ));

    assert_eq!(deployment.registry().state("db"), LifecycleState::Failed);
    assert_eq!(deployment.registry().state("cache"), LifecycleState::Running);
    assert_eq!(deployment.registry().state("api"), LifecycleState::Absent);
    assert!(!harness.runtime.exists("api"));

    assert!(report.provision.to_string().contains("api: skipped — dependency db failed"));
    assert_eq!(report.exit_code(), 2);
}

#[tokio::test]
async fn test_create_failure_fails_only_that_branch() {
    let harness = Harness::new();
    harness.runtime.fail_create("cache");
    let deployment = harness.deployment(data_and_api()).await;

    let report = deployment.create(false).await.unwrap();

    match report.provision.get("cache") {
        Some(Outcome::Failed(failure)) => assert_eq!(failure.step, Step::Create),
        other => panic!("cache should have failed, got {:?}", other),
    }
    assert!(matches!(report.provision.get("db"), Some(Outcome::Created)));
    assert!(matches!(report.provision.get("api"), Some(Outcome::Skipped { .. })));
    assert_eq!(deployment.registry().state("cache"), LifecycleState::Failed);
    assert_eq!(deployment.registry().state("db"), LifecycleState::Running);
}

#[tokio::test]
async fn test_create_starts_stopped_containers() {
    let harness = Harness::new();
    harness.runtime.seed("db", false);
    let deployment = harness
        .deployment(Catalog::new(vec![spec("db", ServiceKind::Database, 5432, &[])]).unwrap())
        .await;
    assert_eq!(deployment.registry().state("db"), LifecycleState::Stopped);

    let report = deployment.create(false).await.unwrap();

    assert!(matches!(report.provision.get("db"), Some(Outcome::Started)));
    assert!(harness.runtime.ops_matching("create").is_empty());
    assert_eq!(deployment.registry().state("db"), LifecycleState::Running);
}

#[tokio::test]
async fn test_force_replaces_existing_containers() {
    let harness = Harness::new();
    harness.runtime.seed("db", true);
    let deployment = harness
        .deployment(Catalog::new(vec![spec("db", ServiceKind::Database, 5432, &[])]).unwrap())
        .await;

    let report = deployment.create(true).await.unwrap();

    assert!(matches!(report.provision.get("db"), Some(Outcome::Replaced)));
    assert_eq!(report.provision.destructive(), vec!["db"]);
    let ops = harness.runtime.ops();
    let stop = ops.iter().position(|op| op == "stop db").unwrap();
    let delete = ops.iter().position(|op| op == "delete db").unwrap();
    let create = ops.iter().position(|op| op.starts_with("create db ")).unwrap();
    assert!(stop < delete && delete < create);
    assert_eq!(deployment.registry().state("db"), LifecycleState::Running);
}

#[tokio::test]
async fn test_subnet_conflict_is_reported() {
    let harness = Harness::with_driver(MockNetworkDriver::with_bridge("veza-br0", "10.9.0.1/24"));
    let deployment = harness.deployment(data_and_api()).await;

    let err = deployment.setup().await.unwrap_err();
    assert!(matches!(err, VezaError::SubnetConflict { .. }));
    assert_eq!(err.exit_code(), 2);

    let err = deployment.create(false).await.unwrap_err();
    assert!(matches!(err, VezaError::SubnetConflict { .. }));
    assert!(harness.runtime.ops_matching("create").is_empty());

    // The existing bridge is never reconfigured.
    let bridge = harness.driver.bridge("veza-br0").unwrap();
    assert_eq!(bridge.ipv4_cidr.as_deref(), Some("10.9.0.1/24"));
}

#[tokio::test]
async fn test_setup_accepts_matching_bridge() {
    let harness = Harness::with_driver(MockNetworkDriver::with_bridge("veza-br0", "10.5.0.1/24"));
    let deployment = harness.deployment(data_and_api()).await;

    let outcome = deployment.setup().await.unwrap();
    assert!(matches!(outcome, EnsureOutcome::Unchanged));
    assert!(deployment.config().artifacts_dir().is_dir());
    assert!(deployment.config().logs_dir().is_dir());
}

#[tokio::test]
async fn test_status_stop_and_clean() {
    let harness = Harness::new();
    let deployment = harness.deployment(data_and_api()).await;
    deployment.create(false).await.unwrap();

    harness.prober.mark_unhealthy("cache");
    let statuses = deployment.status().await;
    let cache = statuses.iter().find(|s| s.service == "cache").unwrap();
    assert_eq!(cache.state, LifecycleState::Running);
    assert_eq!(cache.health, HealthStatus::Unhealthy);
    let db = statuses.iter().find(|s| s.service == "db").unwrap();
    assert_eq!(db.health, HealthStatus::Healthy);
    assert_eq!(db.port, 5432);

    let ips = deployment.ips().await.unwrap();
    assert_eq!(ips.len(), 3);

    let stopped = deployment.stop().await;
    assert!(stopped.is_success());
    for status in deployment.status().await {
        assert_eq!(status.state, LifecycleState::Stopped);
        assert_eq!(status.health, HealthStatus::Unknown);
    }
    assert!(deployment.ips().await.unwrap().is_empty());

    let cleaned = deployment.clean(true).await.unwrap();
    assert!(cleaned.containers.is_success());
    assert!(cleaned.network_removed);
    for name in ["db", "cache", "api"] {
        assert!(!harness.runtime.exists(name));
        assert_eq!(deployment.registry().state(name), LifecycleState::Absent);
    }
    assert!(harness.driver.bridge("veza-br0").is_none());
}

#[tokio::test]
async fn test_logs_and_shell_require_running_container() {
    let harness = Harness::new();
    let deployment = harness
        .deployment(Catalog::new(vec![spec("db", ServiceKind::Database, 5432, &[])]).unwrap())
        .await;

    let err = deployment.logs("db", 50).await.unwrap_err();
    assert!(matches!(err, VezaError::PreconditionFailed { .. }));
    assert!(deployment.shell("nope").await.is_err());

    deployment.create(false).await.unwrap();
    deployment.logs("db", 50).await.unwrap();
    assert!(harness
        .runtime
        .ops()
        .iter()
        .any(|op| op.starts_with("exec db journalctl --no-pager -u ") && op.ends_with("-n 50")));

    assert_eq!(deployment.shell("db").await.unwrap(), 0);
    assert!(harness
        .runtime
        .ops_matching("interactive db")
        .iter()
        .any(|op| op.contains("exec bash -l")));
}

/// A frontend served straight from its synced source, with no build step.
fn static_site() -> ServiceSpec {
    ServiceSpec {
        build_cmd: None,
        start_cmd: Some("node server.js".to_string()),
        ..app("web", 3000, "/", &[])
    }
}

#[tokio::test]
async fn test_fresh_service_without_build_is_synced_and_started() {
    let harness = Harness::new();
    harness.write_source("web", "server.js", "require('http').createServer().listen(3000)\n");
    let deployment = harness.deployment(Catalog::new(vec![static_site()]).unwrap()).await;

    let report = deployment.create(false).await.unwrap();

    assert!(matches!(report.provision.get("web"), Some(Outcome::Created)), "{}", report.provision);
    assert!(harness.runtime.file("web", "/opt/veza/web/server.js").is_some());
    assert!(harness.runtime.ops().iter().all(|op| !op.contains("make web")));
    assert_eq!(harness.runtime.ops_matching("exec web systemctl restart web.service").len(), 1);
    assert!(harness.runtime.unit_active("web", Some("web.service")));

    let instance = deployment.registry().get("web");
    assert_eq!(instance.lifecycle_state, LifecycleState::Running);
    assert_eq!(instance.last_health, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_restarting_container_applies_rewritten_unit() {
    let harness = Harness::new();
    harness.write_source("web", "server.js", "listen(3000)\n");
    let first = harness.deployment(Catalog::new(vec![static_site()]).unwrap()).await;
    first.create(false).await.unwrap();

    // Same unit, container stopped: the unit is only started.
    harness.runtime.stop("web", std::time::Duration::ZERO).await.unwrap();
    harness.runtime.clear_ops();
    let same = harness.deployment(Catalog::new(vec![static_site()]).unwrap()).await;
    let report = same.create(false).await.unwrap();
    assert!(matches!(report.provision.get("web"), Some(Outcome::Started)), "{}", report.provision);
    let enable = harness.runtime.ops_matching("exec web sh -c systemctl daemon-reload");
    assert_eq!(enable.len(), 1);
    assert!(enable[0].ends_with("systemctl start web.service"), "{}", enable[0]);

    // New start command: the rewritten unit is restarted.
    harness.runtime.stop("web", std::time::Duration::ZERO).await.unwrap();
    harness.runtime.clear_ops();
    let changed = ServiceSpec { start_cmd: Some("node server.js --port 3000".to_string()), ..static_site() };
    let deployment = harness.deployment(Catalog::new(vec![changed]).unwrap()).await;
    let report = deployment.create(false).await.unwrap();

    assert!(matches!(report.provision.get("web"), Some(Outcome::Started)), "{}", report.provision);
    assert_eq!(harness.runtime.ops_matching("write web /etc/systemd/system/web.service").len(), 1);
    let enable = harness.runtime.ops_matching("exec web sh -c systemctl daemon-reload");
    assert!(enable[0].ends_with("systemctl restart web.service"), "{}", enable[0]);
    let unit = harness.runtime.file("web", "/etc/systemd/system/web.service").unwrap();
    assert!(String::from_utf8(unit).unwrap().contains("--port 3000"));
}

#[tokio::test]
async fn test_stopped_unit_reports_unhealthy() {
    let harness = Harness::new();
    let deployment = harness.deployment(data_and_api()).await;
    deployment.create(false).await.unwrap();

    let stop = vec!["systemctl".to_string(), "stop".to_string(), "postgresql".to_string()];
    harness.runtime.exec("db", &stop).await.unwrap();

    let statuses = deployment.status().await;
    let db = statuses.iter().find(|s| s.service == "db").unwrap();
    assert_eq!(db.state, LifecycleState::Running);
    assert_eq!(db.health, HealthStatus::Unhealthy);
    let cache = statuses.iter().find(|s| s.service == "cache").unwrap();
    assert_eq!(cache.health, HealthStatus::Healthy);
}
