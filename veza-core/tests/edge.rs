//! Integration tests for edge proxy reconfiguration.

mod common;

use common::{app, spec, Harness};
use std::time::Duration;
use veza_core::adapters::ContainerRuntime;
use veza_core::edge::{EDGE_CONFIG_PATH, EDGE_STAGING_PATH};
use veza_core::types::ServiceKind;
use veza_core::{Catalog, Deployment, VezaError};

fn routed(harness: &Harness) -> Catalog {
    harness.write_source("api", "main.go", "package main\n");
    harness.write_source("web", "index.html", "<html></html>\n");
    Catalog::new(vec![
        app("api", 8080, "/api", &[]),
        app("web", 3000, "/", &[]),
        spec("proxy", ServiceKind::Proxy, 80, &[]),
    ])
    .unwrap()
}

async fn created(harness: &Harness) -> Deployment {
    let deployment = harness.deployment(routed(harness)).await;
    let report = deployment.create(false).await.unwrap();
    assert!(report.provision.is_success(), "{}", report.provision);
    deployment
}

fn active_config(harness: &Harness) -> String {
    String::from_utf8(harness.runtime.file("proxy", EDGE_CONFIG_PATH).unwrap()).unwrap()
}

#[tokio::test]
async fn test_routes_rendered_longest_prefix_first() {
    let harness = Harness::new();
    let _deployment = created(&harness).await;

    let config = active_config(&harness);
    let api = config.find("be_api").unwrap();
    let web = config.find("be_web").unwrap();
    assert!(api < web);
    assert!(config.contains("default_backend be_web"));
    assert!(harness.runtime.file("proxy", EDGE_STAGING_PATH).is_none());

    // The applied configuration is mirrored on the host.
    let persisted = std::fs::read_to_string(
        std::path::Path::new(&harness.config.edge_dir).join("haproxy.cfg"),
    )
    .unwrap();
    assert_eq!(persisted, config);
}

#[tokio::test]
async fn test_unchanged_render_is_noop() {
    let harness = Harness::new();
    let deployment = created(&harness).await;

    harness.runtime.clear_ops();
    let report = deployment.reconfigure_edge().await.unwrap();

    assert!(!report.changed);
    assert_eq!(report.routes.len(), 2);
    assert!(harness.runtime.ops_matching("write").is_empty());
    assert!(harness.runtime.ops().iter().all(|op| !op.contains("systemctl reload")));
}

#[tokio::test]
async fn test_rejected_config_leaves_active_untouched() {
    let harness = Harness::new();
    let deployment = created(&harness).await;

    // Drift the active config so the next render differs from it.
    let previous = "global\n    daemon\n# hand edited\n";
    harness.runtime.put_file("proxy", EDGE_CONFIG_PATH, previous.as_bytes());
    harness.runtime.fail_exec("proxy", "haproxy -c", 1, "[ALERT] parsing [haproxy.cfg:12]: unknown keyword");
    harness.runtime.clear_ops();

    let err = deployment.reconfigure_edge().await.unwrap_err();

    match &err {
        VezaError::ValidationFailed { output } => assert!(output.contains("unknown keyword")),
        other => panic!("expected ValidationFailed, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 1);
    assert_eq!(harness.runtime.file("proxy", EDGE_CONFIG_PATH).unwrap(), previous.as_bytes());
    assert!(harness.runtime.file("proxy", EDGE_STAGING_PATH).is_none());
    assert!(harness.runtime.ops().iter().all(|op| !op.contains("systemctl reload")));
}

#[tokio::test]
async fn test_unaddressed_services_are_omitted() {
    let harness = Harness::new();
    let _ = created(&harness).await;

    // api stopped out of band; a fresh deployment observes it as Stopped.
    harness.runtime.stop("api", Duration::ZERO).await.unwrap();
    let deployment = harness.deployment(routed(&harness)).await;

    let report = deployment.reconfigure_edge().await.unwrap();

    assert!(report.changed);
    assert_eq!(report.omitted, vec!["api".to_string()]);
    assert_eq!(report.routes.len(), 1);
    assert_eq!(report.routes[0].upstream_service, "web");
    let config = active_config(&harness);
    assert!(!config.contains("be_api"));
    assert!(config.contains("default_backend be_web"));

    // With no routable backend left there is nothing to apply.
    harness.runtime.stop("web", Duration::ZERO).await.unwrap();
    let deployment = harness.deployment(routed(&harness)).await;
    let err = deployment.reconfigure_edge().await.unwrap_err();
    assert!(matches!(err, VezaError::PreconditionFailed { .. }));
    assert!(!active_config(&harness).contains("be_api"));
}

#[tokio::test]
async fn test_edge_requires_running_proxy() {
    let harness = Harness::new();
    let deployment = harness.deployment(routed(&harness)).await;

    let err = deployment.reconfigure_edge().await.unwrap_err();
    assert!(matches!(err, VezaError::PreconditionFailed { .. }));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn test_failed_reload_restores_previous_config_and_retries() {
    let harness = Harness::new();
    let deployment = created(&harness).await;
    let applied = active_config(&harness);

    let previous = "global\n    daemon\n# hand edited\n";
    harness.runtime.put_file("proxy", EDGE_CONFIG_PATH, previous.as_bytes());
    harness.runtime.fail_exec("proxy", "systemctl reload haproxy", 1, "Job for haproxy.service failed");

    let err = deployment.reconfigure_edge().await.unwrap_err();
    match &err {
        VezaError::CommandFailed { command, output, .. } => {
            assert_eq!(command, "systemctl reload haproxy");
            assert!(output.contains("Job for haproxy.service failed"));
        }
        other => panic!("expected CommandFailed, got {:?}", other),
    }
    assert_eq!(harness.runtime.file("proxy", EDGE_CONFIG_PATH).unwrap(), previous.as_bytes());
    assert!(harness.runtime.file("proxy", EDGE_STAGING_PATH).is_none());

    // Once the proxy reloads again, the same render is applied rather than
    // mistaken for the active one.
    harness.runtime.clear_failures();
    harness.runtime.clear_ops();
    let report = deployment.reconfigure_edge().await.unwrap();

    assert!(report.changed);
    assert_eq!(active_config(&harness), applied);
    assert_eq!(harness.runtime.ops_matching("exec proxy systemctl reload haproxy").len(), 1);
}
