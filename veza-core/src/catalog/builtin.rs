//! Built-in topology: database, cache, shared storage, three application
//! services, the web front end and the reverse proxy.

use crate::types::{HealthCheck, ServiceKind, ServiceSpec};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::path::PathBuf;

const IMAGE: &str = "images:debian/12";

static BUILTIN: Lazy<Vec<ServiceSpec>> = Lazy::new(|| {
    vec![
        ServiceSpec {
            packages: strings(&["postgresql", "postgresql-contrib"]),
            env: env(&[("POSTGRES_DB", "veza"), ("POSTGRES_USER", "veza")]),
            ..base("postgres", ServiceKind::Database, 5432)
        },
        ServiceSpec {
            packages: strings(&["redis-server"]),
            ..base("redis", ServiceKind::Cache, 6379)
        },
        ServiceSpec {
            packages: strings(&["nfs-kernel-server"]),
            env: env(&[("EXPORT_PATH", "/srv/veza")]),
            ..base("storage", ServiceKind::SharedStorage, 2049)
        },
        ServiceSpec {
            packages: strings(&["build-essential", "git", "curl", "ca-certificates"]),
            toolchain: Some("1.22.5".to_string()),
            source_path: Some(PathBuf::from("veza-backend-api")),
            build_cmd: Some("go build -o bin/server ./cmd/production-server".to_string()),
            start_cmd: Some("bin/server".to_string()),
            health_check: HealthCheck::Http { path: "/health".to_string() },
            depends_on: strings(&["postgres", "redis"]),
            route: Some("/api".to_string()),
            env: env(&[
                ("DATABASE_URL", "postgres://veza@postgres.incus:5432/veza"),
                ("REDIS_URL", "redis://redis.incus:6379"),
                ("PORT", "8080"),
            ]),
            ..base("backend", ServiceKind::CompiledBackend, 8080)
        },
        ServiceSpec {
            packages: strings(&["build-essential", "pkg-config", "libssl-dev", "curl", "ca-certificates"]),
            toolchain: Some("stable".to_string()),
            source_path: Some(PathBuf::from("veza-chat-server")),
            build_cmd: Some("cargo build --release".to_string()),
            start_cmd: Some("target/release/chat-server".to_string()),
            health_check: HealthCheck::Http { path: "/health".to_string() },
            depends_on: strings(&["postgres", "redis"]),
            route: Some("/ws".to_string()),
            env: env(&[
                ("DATABASE_URL", "postgres://veza@postgres.incus:5432/veza"),
                ("REDIS_URL", "redis://redis.incus:6379"),
                ("CHAT_SERVER_BIND_ADDR", "0.0.0.0:3001"),
            ]),
            ..base("chat", ServiceKind::CompiledRealtime, 3001)
        },
        ServiceSpec {
            packages: strings(&[
                "build-essential",
                "pkg-config",
                "libssl-dev",
                "nfs-common",
                "curl",
                "ca-certificates",
            ]),
            toolchain: Some("stable".to_string()),
            source_path: Some(PathBuf::from("veza-stream-server")),
            build_cmd: Some("cargo build --release".to_string()),
            start_cmd: Some("target/release/stream_server".to_string()),
            health_check: HealthCheck::Http { path: "/health".to_string() },
            depends_on: strings(&["redis", "storage"]),
            route: Some("/stream".to_string()),
            env: env(&[("PORT", "3002"), ("AUDIO_DIR", "/srv/veza/audio")]),
            ..base("stream", ServiceKind::CompiledRealtime, 3002)
        },
        ServiceSpec {
            packages: strings(&["git", "curl", "ca-certificates"]),
            toolchain: Some("20".to_string()),
            source_path: Some(PathBuf::from("veza-frontend")),
            build_cmd: Some("npm ci && npm run build".to_string()),
            start_cmd: Some("npm run preview -- --host 0.0.0.0 --port 5173".to_string()),
            depends_on: strings(&["backend"]),
            route: Some("/".to_string()),
            env: env(&[("HOST", "0.0.0.0"), ("PORT", "5173")]),
            ..base("frontend", ServiceKind::WebFrontend, 5173)
        },
        ServiceSpec {
            packages: strings(&["haproxy"]),
            ..base("haproxy", ServiceKind::Proxy, 80)
        },
    ]
});

/// Service specifications of the built-in topology, unordered.
pub fn builtin_services() -> &'static [ServiceSpec] {
    &BUILTIN
}

fn base(name: &str, kind: ServiceKind, port: u16) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        kind,
        runtime_image: IMAGE.to_string(),
        packages: Vec::new(),
        toolchain: None,
        port,
        unit_template: None,
        source_path: None,
        build_cmd: None,
        start_cmd: None,
        health_check: HealthCheck::Port,
        depends_on: Vec::new(),
        route: None,
        env: BTreeMap::new(),
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}
