//! Per-kind bootstrap.
//!
//! Every [`ServiceKind`] maps to one [`Bootstrap`] implementation through
//! [`capability`]. Each step checks before it changes anything, so running a
//! bootstrap against an already-provisioned container is a no-op.

use crate::adapters::{sh, shell_quote, ContainerRuntime};
use crate::config::Config;
use crate::error::{Result, VezaError};
use crate::edge::EDGE_CONFIG_PATH;
use crate::templates::{TemplateRenderer, EDGE, UNIT};
use crate::types::{NetworkTopology, ServiceKind, ServiceSpec};
use async_trait::async_trait;
use tera::Context;
use tracing::{debug, info};

/// Everything a bootstrap routine may touch.
pub struct BootstrapContext<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub spec: &'a ServiceSpec,
    pub config: &'a Config,
    pub topology: &'a NetworkTopology,
    pub templates: &'a TemplateRenderer,
    /// Container was just created; nothing has been synced or built yet.
    pub fresh: bool,
}

impl BootstrapContext<'_> {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn workdir(&self) -> String {
        self.spec.workdir(&self.config.remote_root)
    }

    /// Run a shell step; non-zero exit is a `CommandFailed`.
    async fn run(&self, step: &str, script: String) -> Result<String> {
        debug!(service = %self.name(), step, "Bootstrap step");
        let output = self.runtime.exec(self.name(), &sh(script)).await?;
        if !output.success() {
            return Err(VezaError::CommandFailed {
                target: self.name().to_string(),
                command: step.to_string(),
                exit_code: output.exit_code,
                output: output.diagnostic(self.config.build_log_tail_lines),
            });
        }
        Ok(output.stdout)
    }

    /// Wait for the container's init to finish booting and networking.
    async fn wait_for_init(&self) -> Result<()> {
        self.run(
            "wait for boot",
            "for i in $(seq 1 60); do \
               s=$(systemctl is-system-running 2>/dev/null); \
               case \"$s\" in running|degraded) exit 0;; esac; sleep 1; \
             done; exit 1"
                .to_string(),
        )
        .await
        .map(|_| ())
    }

    /// Install missing distribution packages.
    async fn install_packages(&self, extra: &[&str]) -> Result<()> {
        let mut packages: Vec<&str> = self.spec.packages.iter().map(String::as_str).collect();
        packages.extend_from_slice(extra);
        packages.sort_unstable();
        packages.dedup();
        if packages.is_empty() {
            return Ok(());
        }

        let list = packages.iter().map(|p| shell_quote(p)).collect::<Vec<_>>().join(" ");
        let script = format!(
            "missing=''; for p in {list}; do dpkg -s \"$p\" >/dev/null 2>&1 || missing=\"$missing $p\"; done; \
             if [ -n \"$missing\" ]; then \
               export DEBIAN_FRONTEND=noninteractive; \
               apt-get update -q && apt-get install -y -q $missing; \
             fi"
        );
        self.run("install packages", script).await.map(|_| ())
    }

    /// Write a file only if its content differs. Returns whether it changed.
    async fn write_if_changed(&self, path: &str, content: &str) -> Result<bool> {
        let current = self.runtime.read_file(self.name(), path).await?;
        if current.as_deref() == Some(content.as_bytes()) {
            return Ok(false);
        }
        self.runtime.write_file(self.name(), path, content.as_bytes()).await?;
        Ok(true)
    }

    async fn enable_unit(&self, unit: &str, restart: bool) -> Result<()> {
        let verb = if restart { "restart" } else { "start" };
        self.run(
            "enable unit",
            format!("systemctl daemon-reload && systemctl enable {unit} && systemctl {verb} {unit}"),
        )
        .await
        .map(|_| ())
    }

    /// Render and install the service's systemd unit.
    ///
    /// On an existing container the unit is started, and restarted when its
    /// file was rewritten.
    async fn install_unit(&self, default_start: &str) -> Result<()> {
        let workdir = self.workdir();
        let start = self.spec.start_cmd.as_deref().unwrap_or(default_start);
        let exec_start = if start.starts_with('/') {
            start.to_string()
        } else {
            format!("/bin/sh -c {}", shell_quote(&format!("exec {}/{}", workdir, start)))
        };

        let mut ctx = Context::new();
        ctx.insert("name", &self.spec.name);
        ctx.insert("workdir", &workdir);
        ctx.insert("exec_start", &exec_start);
        ctx.insert("port", &self.spec.port);
        ctx.insert("env", &self.spec.env);

        let unit = match &self.spec.unit_template {
            Some(template) => TemplateRenderer::render_inline(&self.spec.name, template, &ctx)?,
            None => self.templates.render(UNIT, &ctx)?,
        };

        self.run("create workdir", format!("mkdir -p {}", shell_quote(&workdir))).await?;
        let path = format!("/etc/systemd/system/{}", self.spec.unit_name());
        let changed = self.write_if_changed(&path, &unit).await?;
        if self.fresh {
            // Started once the source is synced and built.
            self.run(
                "enable unit",
                format!("systemctl daemon-reload && systemctl enable {}", self.spec.unit_name()),
            )
            .await?;
        } else {
            self.enable_unit(&self.spec.unit_name(), changed).await?;
        }
        Ok(())
    }
}

/// Bootstrap routine for one service kind.
#[async_trait]
pub trait Bootstrap: Send + Sync {
    async fn bootstrap(&self, ctx: &BootstrapContext<'_>) -> Result<()>;
}

/// Capability table: the bootstrap routine for `kind`.
pub fn capability(kind: ServiceKind) -> &'static dyn Bootstrap {
    match kind {
        ServiceKind::Database => &Database,
        ServiceKind::Cache => &Cache,
        ServiceKind::SharedStorage => &SharedStorage,
        ServiceKind::CompiledBackend => &GoBackend,
        ServiceKind::CompiledRealtime => &RustService,
        ServiceKind::WebFrontend => &NodeFrontend,
        ServiceKind::Proxy => &Proxy,
    }
}

struct Database;

#[async_trait]
impl Bootstrap for Database {
    async fn bootstrap(&self, ctx: &BootstrapContext<'_>) -> Result<()> {
        ctx.wait_for_init().await?;
        ctx.install_packages(&["postgresql"]).await?;

        let subnet = ctx.topology.subnet()?;
        let user = ctx.spec.env.get("POSTGRES_USER").map(String::as_str).unwrap_or("veza");
        let db = ctx.spec.env.get("POSTGRES_DB").map(String::as_str).unwrap_or("veza");

        let edited = ctx
            .run(
                "configure listener",
                format!(
                    "conf=$(ls -d /etc/postgresql/*/main | head -n1); \
                     grep -q \"^listen_addresses = '\\*'\" $conf/postgresql.conf || {{ \
                       echo \"listen_addresses = '*'\" >> $conf/postgresql.conf; echo changed; }}; \
                     grep -q '^host all all {subnet} trust' $conf/pg_hba.conf || {{ \
                       echo 'host all all {subnet} trust' >> $conf/pg_hba.conf; echo changed; }}; \
                     grep -q '^port = {port}' $conf/postgresql.conf || {{ \
                       sed -i 's/^#*port = .*/port = {port}/' $conf/postgresql.conf; echo changed; }}",
                    subnet = subnet,
                    port = ctx.spec.port,
                ),
            )
            .await?;
        ctx.enable_unit("postgresql", edited.contains("changed")).await?;

        ctx.run(
            "create role and database",
            format!(
                "cd /tmp; \
                 su postgres -c \"psql -tAc \\\"SELECT 1 FROM pg_roles WHERE rolname='{user}'\\\"\" | grep -q 1 || \
                   su postgres -c 'createuser {user}'; \
                 su postgres -c \"psql -tAc \\\"SELECT 1 FROM pg_database WHERE datname='{db}'\\\"\" | grep -q 1 || \
                   su postgres -c 'createdb -O {user} {db}'"
            ),
        )
        .await?;
        Ok(())
    }
}

struct Cache;

#[async_trait]
impl Bootstrap for Cache {
    async fn bootstrap(&self, ctx: &BootstrapContext<'_>) -> Result<()> {
        ctx.wait_for_init().await?;
        ctx.install_packages(&["redis-server"]).await?;
        let edited = ctx
            .run(
                "configure listener",
                format!(
                    "conf=/etc/redis/redis.conf; \
                     if grep -q '^bind 0.0.0.0$' $conf && grep -q '^protected-mode no$' $conf \
                        && grep -q '^port {port}$' $conf; then exit 0; fi; \
                     sed -i -e 's/^bind .*/bind 0.0.0.0/' -e 's/^protected-mode .*/protected-mode no/' \
                       -e 's/^port .*/port {port}/' $conf && echo changed",
                    port = ctx.spec.port
                ),
            )
            .await?;
        ctx.enable_unit("redis-server", edited.contains("changed")).await
    }
}

struct SharedStorage;

#[async_trait]
impl Bootstrap for SharedStorage {
    async fn bootstrap(&self, ctx: &BootstrapContext<'_>) -> Result<()> {
        ctx.wait_for_init().await?;
        ctx.install_packages(&["nfs-kernel-server"]).await?;

        let export = ctx.spec.env.get("EXPORT_PATH").map(String::as_str).unwrap_or("/srv/veza");
        ctx.run("create export", format!("mkdir -p {} && chmod 0777 {}", export, export))
            .await?;

        let exports = format!(
            "{} {}(rw,sync,no_subtree_check,no_root_squash)\n",
            export,
            ctx.topology.subnet()?
        );
        let changed = ctx.write_if_changed("/etc/exports", &exports).await?;
        ctx.enable_unit("nfs-kernel-server", changed).await?;
        ctx.run("export filesystems", "exportfs -ra".to_string()).await.map(|_| ())
    }
}

struct GoBackend;

#[async_trait]
impl Bootstrap for GoBackend {
    async fn bootstrap(&self, ctx: &BootstrapContext<'_>) -> Result<()> {
        ctx.wait_for_init().await?;
        ctx.install_packages(&["curl", "ca-certificates", "build-essential"]).await?;

        let version = ctx.spec.toolchain.as_deref().unwrap_or("1.22.5");
        ctx.run(
            "install go toolchain",
            format!(
                "/usr/local/go/bin/go version 2>/dev/null | grep -q 'go{v} ' || {{ \
                   arch=$(dpkg --print-architecture); \
                   curl -fsSL https://go.dev/dl/go{v}.linux-$arch.tar.gz -o /tmp/go.tgz && \
                   rm -rf /usr/local/go && tar -C /usr/local -xzf /tmp/go.tgz && rm /tmp/go.tgz; }}; \
                 ln -sf /usr/local/go/bin/go /usr/local/bin/go",
                v = version
            ),
        )
        .await?;

        ctx.install_unit("bin/server").await
    }
}

struct RustService;

#[async_trait]
impl Bootstrap for RustService {
    async fn bootstrap(&self, ctx: &BootstrapContext<'_>) -> Result<()> {
        ctx.wait_for_init().await?;
        ctx.install_packages(&["curl", "ca-certificates", "build-essential", "pkg-config"])
            .await?;

        let toolchain = ctx.spec.toolchain.as_deref().unwrap_or("stable");
        ctx.run(
            "install rust toolchain",
            format!(
                "export RUSTUP_HOME=/usr/local/rustup CARGO_HOME=/usr/local/cargo; \
                 [ -x /usr/local/cargo/bin/rustup ] || \
                   curl -fsSL https://sh.rustup.rs | sh -s -- -y --no-modify-path --default-toolchain none; \
                 /usr/local/cargo/bin/rustup toolchain list | grep -q '^{t}' || \
                   /usr/local/cargo/bin/rustup toolchain install {t} --profile minimal; \
                 /usr/local/cargo/bin/rustup default {t}; \
                 for b in cargo rustc; do ln -sf /usr/local/cargo/bin/$b /usr/local/bin/$b; done",
                t = toolchain
            ),
        )
        .await?;

        let default_start = format!("target/release/{}", ctx.spec.name);
        ctx.install_unit(&default_start).await
    }
}

struct NodeFrontend;

#[async_trait]
impl Bootstrap for NodeFrontend {
    async fn bootstrap(&self, ctx: &BootstrapContext<'_>) -> Result<()> {
        ctx.wait_for_init().await?;
        ctx.install_packages(&["curl", "ca-certificates"]).await?;

        let major = ctx.spec.toolchain.as_deref().unwrap_or("20");
        ctx.run(
            "install node toolchain",
            format!(
                "node --version 2>/dev/null | grep -q '^v{m}\\.' || {{ \
                   curl -fsSL https://deb.nodesource.com/setup_{m}.x | bash - && \
                   DEBIAN_FRONTEND=noninteractive apt-get install -y -q nodejs; }}",
                m = major
            ),
        )
        .await?;

        ctx.install_unit("npm run start").await
    }
}

struct Proxy;

/// Marker identifying a configuration written by this tool.
pub const EDGE_MARKER: &str = "frontend veza_http";

#[async_trait]
impl Bootstrap for Proxy {
    async fn bootstrap(&self, ctx: &BootstrapContext<'_>) -> Result<()> {
        ctx.wait_for_init().await?;
        ctx.install_packages(&["haproxy"]).await?;

        // Until the edge configurator runs, serve an empty routing table so
        // the listener is up and the port probe can pass.
        let current = ctx.runtime.read_file(ctx.name(), EDGE_CONFIG_PATH).await?;
        let ours = current
            .as_deref()
            .map(|c| String::from_utf8_lossy(c).contains(EDGE_MARKER))
            .unwrap_or(false);
        if !ours {
            let mut edge = Context::new();
            edge.insert("bind_port", &ctx.spec.port);
            edge.insert("routes", &Vec::<String>::new());
            edge.insert("default_backend", &Option::<String>::None);
            let placeholder = ctx.templates.render(EDGE, &edge)?;
            ctx.runtime.write_file(ctx.name(), EDGE_CONFIG_PATH, placeholder.as_bytes()).await?;
            info!(service = %ctx.name(), "Placeholder proxy configuration installed");
        }

        ctx.enable_unit("haproxy", !ours).await
    }
}
