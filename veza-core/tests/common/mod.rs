//! Shared fixtures for integration tests.
//!
//! `MockRuntime` keeps containers, their files, their systemd units and an
//! operation log in memory; `ScriptedProber` answers health probes from
//! whether a service's unit is active, minus the services marked unhealthy.
//! Nothing here needs a hypervisor.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedSender;
use veza_core::adapters::{ContainerRuntime, ExecOutput, RuntimeState, SerializedRuntime};
use veza_core::error::{Result, VezaError};
use veza_core::health::Prober;
use veza_core::network::{BridgeInfo, NetworkDriver};
use veza_core::types::{HealthCheck, HealthStatus, NetworkTopology, ServiceKind, ServiceSpec};
use veza_core::{Catalog, Config, Deployment};

#[derive(Debug, Clone, Default)]
struct MockContainer {
    running: bool,
    files: BTreeMap<String, Vec<u8>>,
    /// Units started at boot.
    enabled: BTreeSet<String>,
    /// Units currently running.
    active: BTreeSet<String>,
}

impl MockContainer {
    /// Follow `systemctl enable|start|restart|stop <unit>` in a command.
    fn track_units(&mut self, command: &str) {
        let tokens: Vec<&str> = command.split_whitespace().collect();
        for window in tokens.windows(3) {
            if window[0] != "systemctl" {
                continue;
            }
            let unit = window[2].trim_end_matches(';').to_string();
            match window[1] {
                "enable" => {
                    self.enabled.insert(unit);
                }
                "start" | "restart" => {
                    self.active.insert(unit);
                }
                "stop" => {
                    self.active.remove(&unit);
                }
                _ => {}
            }
        }
    }
}

/// Concurrent build bookkeeping.
#[derive(Debug, Default)]
struct Builds {
    delay: Option<Duration>,
    in_flight: HashMap<String, usize>,
    peak: HashMap<String, usize>,
    total: usize,
    peak_total: usize,
}

/// Exit code and output for exec calls whose script contains a pattern.
#[derive(Debug, Clone)]
struct ExecRule {
    container: String,
    contains: String,
    exit_code: i32,
    output: String,
}

#[derive(Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    addresses: HashMap<String, Ipv4Addr>,
    ops: Vec<String>,
    rules: Vec<ExecRule>,
    fail_create: BTreeSet<String>,
    leases: u32,
    builds: Builds,
}

/// In-memory container runtime.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

/// Quoted arguments of a generated shell script (`'a' 'b'` -> [a, b]).
fn quoted_args(script: &str) -> Vec<String> {
    script.split('\'').skip(1).step_by(2).map(str::to_string).collect()
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Make exec calls in `container` whose command contains `pattern` fail.
    pub fn fail_exec(&self, container: &str, pattern: &str, exit_code: i32, output: &str) {
        self.lock().rules.push(ExecRule {
            container: container.to_string(),
            contains: pattern.to_string(),
            exit_code,
            output: output.to_string(),
        });
    }

    pub fn clear_failures(&self) {
        self.lock().rules.clear();
    }

    pub fn fail_create(&self, container: &str) {
        self.lock().fail_create.insert(container.to_string());
    }

    /// Seed a container as if created outside this process.
    pub fn seed(&self, name: &str, running: bool) {
        let mut state = self.lock();
        state.containers.insert(name.to_string(), MockContainer { running, ..Default::default() });
        if running {
            let addr = Self::lease(&mut state, name);
            state.addresses.insert(name.to_string(), addr);
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    /// Operations whose log line starts with `verb` (e.g. "create").
    pub fn ops_matching(&self, verb: &str) -> Vec<String> {
        self.ops().into_iter().filter(|op| op.starts_with(verb)).collect()
    }

    pub fn file(&self, container: &str, path: &str) -> Option<Vec<u8>> {
        self.lock().containers.get(container).and_then(|c| c.files.get(path).cloned())
    }

    pub fn put_file(&self, container: &str, path: &str, content: &[u8]) {
        if let Some(c) = self.lock().containers.get_mut(container) {
            c.files.insert(path.to_string(), content.to_vec());
        }
    }

    pub fn exists(&self, container: &str) -> bool {
        self.lock().containers.contains_key(container)
    }

    pub fn is_running(&self, container: &str) -> bool {
        self.lock().containers.get(container).map(|c| c.running).unwrap_or(false)
    }

    /// Whether `unit` runs in `container`; with no unit, whether any does.
    pub fn unit_active(&self, container: &str, unit: Option<&str>) -> bool {
        self.lock()
            .containers
            .get(container)
            .filter(|c| c.running)
            .map(|c| match unit {
                Some(unit) => c.active.contains(unit),
                None => !c.active.is_empty(),
            })
            .unwrap_or(false)
    }

    /// Hold every build open for `delay` so overlapping builds are visible.
    pub fn slow_builds(&self, delay: Duration) {
        self.lock().builds.delay = Some(delay);
    }

    /// Most builds of `container` ever running at once.
    pub fn peak_builds(&self, container: &str) -> usize {
        self.lock().builds.peak.get(container).copied().unwrap_or(0)
    }

    /// Most builds across all containers ever running at once.
    pub fn peak_total_builds(&self) -> usize {
        self.lock().builds.peak_total
    }

    pub fn leased(&self, container: &str) -> Option<Ipv4Addr> {
        self.lock().addresses.get(container).copied()
    }

    /// Container name holding `addr`, if any.
    pub fn name_for(&self, addr: Ipv4Addr) -> Option<String> {
        self.lock().addresses.iter().find(|(_, a)| **a == addr).map(|(n, _)| n.clone())
    }

    /// Next free address inside 10.5.0.0/24; every boot gets a new lease.
    fn lease(state: &mut MockState, name: &str) -> Ipv4Addr {
        let used: BTreeSet<Ipv4Addr> = state
            .addresses
            .iter()
            .filter(|(n, _)| n.as_str() != name)
            .map(|(_, a)| *a)
            .collect();
        loop {
            state.leases += 1;
            let addr = Ipv4Addr::new(10, 5, 0, 10 + (state.leases % 240) as u8);
            if !used.contains(&addr) {
                return addr;
            }
        }
    }

    fn missing(name: &str) -> VezaError {
        VezaError::transport(name, "container not found")
    }

    fn run_script(state: &mut MockState, name: &str, command: &[String]) -> Result<ExecOutput> {
        let joined = command.join(" ");
        state.ops.push(format!("exec {} {}", name, joined));

        let container = state.containers.get(name).ok_or_else(|| Self::missing(name))?;
        if !container.running {
            return Err(VezaError::transport(name, "container is not running"));
        }

        if let Some(rule) =
            state.rules.iter().find(|r| r.container == name && joined.contains(&r.contains))
        {
            return Ok(ExecOutput {
                exit_code: rule.exit_code,
                stdout: String::new(),
                stderr: rule.output.clone(),
            });
        }

        let script = command.last().cloned().unwrap_or_default();
        let container = state.containers.get_mut(name).ok_or_else(|| Self::missing(name))?;
        container.track_units(&joined);
        if script.starts_with("mv -f ") {
            let args = quoted_args(&script);
            if let [src, dst] = args.as_slice() {
                if let Some(content) = container.files.remove(src) {
                    container.files.insert(dst.clone(), content);
                }
            }
        } else if script.starts_with("rm -f ") {
            for path in quoted_args(&script) {
                container.files.remove(&path);
            }
        }

        Ok(ExecOutput::default())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, name: &str, image: &str, bridge: &str) -> Result<()> {
        let mut state = self.lock();
        state.ops.push(format!("create {} {} {}", name, image, bridge));
        if state.fail_create.contains(name) {
            return Err(VezaError::transport(name, "image not found"));
        }
        if state.containers.contains_key(name) {
            return Err(VezaError::transport(name, "container already exists"));
        }
        state.containers.insert(name.to_string(), MockContainer::default());
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.ops.push(format!("start {}", name));
        if !state.containers.contains_key(name) {
            return Err(Self::missing(name));
        }
        let addr = Self::lease(&mut state, name);
        let container = state.containers.get_mut(name).ok_or_else(|| Self::missing(name))?;
        container.running = true;
        container.active = container.enabled.clone();
        state.addresses.insert(name.to_string(), addr);
        Ok(())
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.lock();
        state.ops.push(format!("stop {}", name));
        let container = state.containers.get_mut(name).ok_or_else(|| Self::missing(name))?;
        container.running = false;
        container.active.clear();
        state.addresses.remove(name);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.ops.push(format!("delete {}", name));
        match state.containers.get(name) {
            None => Err(Self::missing(name)),
            Some(c) if c.running => Err(VezaError::transport(name, "container is running")),
            Some(_) => {
                state.containers.remove(name);
                Ok(())
            }
        }
    }

    async fn state(&self, name: &str) -> Result<RuntimeState> {
        Ok(match self.lock().containers.get(name) {
            None => RuntimeState::Missing,
            Some(c) if c.running => RuntimeState::Running,
            Some(_) => RuntimeState::Stopped,
        })
    }

    async fn address(&self, name: &str) -> Result<Option<Ipv4Addr>> {
        Ok(self.lock().addresses.get(name).copied())
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        let mut state = self.lock();
        Self::run_script(&mut state, name, command)
    }

    async fn exec_streaming(
        &self,
        name: &str,
        command: &[String],
        lines: UnboundedSender<String>,
    ) -> Result<i32> {
        let delay = {
            let mut state = self.lock();
            let builds = &mut state.builds;
            let running = builds.in_flight.entry(name.to_string()).or_default();
            *running += 1;
            let running = *running;
            let peak = builds.peak.entry(name.to_string()).or_default();
            *peak = (*peak).max(running);
            builds.total += 1;
            builds.peak_total = builds.peak_total.max(builds.total);
            builds.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let output = {
            let mut state = self.lock();
            let output = Self::run_script(&mut state, name, command);
            if let Some(running) = state.builds.in_flight.get_mut(name) {
                *running -= 1;
            }
            state.builds.total -= 1;
            output?
        };
        let _ = lines.send(format!("building {}", name));
        for line in output.stderr.lines() {
            let _ = lines.send(line.to_string());
        }
        if output.success() {
            let _ = lines.send("done".to_string());
        }
        Ok(output.exit_code)
    }

    async fn push_file(&self, name: &str, local: &Path, remote: &str) -> Result<()> {
        let content = std::fs::read(local)
            .map_err(|e| VezaError::IoError { path: local.to_path_buf(), source: e })?;
        let mut state = self.lock();
        state.ops.push(format!("push {} {}", name, remote));
        let container = state.containers.get_mut(name).ok_or_else(|| Self::missing(name))?;
        container.files.insert(remote.to_string(), content);
        Ok(())
    }

    async fn write_file(&self, name: &str, remote: &str, contents: &[u8]) -> Result<()> {
        let mut state = self.lock();
        state.ops.push(format!("write {} {}", name, remote));
        let container = state.containers.get_mut(name).ok_or_else(|| Self::missing(name))?;
        container.files.insert(remote.to_string(), contents.to_vec());
        Ok(())
    }

    async fn read_file(&self, name: &str, remote: &str) -> Result<Option<Vec<u8>>> {
        let state = self.lock();
        let container = state.containers.get(name).ok_or_else(|| Self::missing(name))?;
        Ok(container.files.get(remote).cloned())
    }

    async fn export(&self, name: &str, archive: &Path) -> Result<()> {
        let image = {
            let mut state = self.lock();
            state.ops.push(format!("export {}", name));
            let container = state.containers.get(name).ok_or_else(|| Self::missing(name))?;
            if container.running {
                return Err(VezaError::transport(name, "container is running"));
            }
            (container.files.clone(), container.enabled.clone())
        };
        let json = serde_json::to_vec(&image).map_err(|e| VezaError::Internal(e.to_string()))?;
        std::fs::write(archive, json)
            .map_err(|e| VezaError::IoError { path: archive.to_path_buf(), source: e })
    }

    async fn import(&self, name: &str, archive: &Path) -> Result<()> {
        let content = std::fs::read(archive)
            .map_err(|e| VezaError::IoError { path: archive.to_path_buf(), source: e })?;
        let (files, enabled): (BTreeMap<String, Vec<u8>>, BTreeSet<String>) =
            serde_json::from_slice(&content).map_err(|e| VezaError::Internal(e.to_string()))?;
        let mut state = self.lock();
        state.ops.push(format!("import {}", name));
        if state.containers.contains_key(name) {
            return Err(VezaError::transport(name, "container already exists"));
        }
        state
            .containers
            .insert(name.to_string(), MockContainer { files, enabled, ..Default::default() });
        Ok(())
    }

    async fn interactive(&self, name: &str, command: &[String]) -> Result<i32> {
        self.lock().ops.push(format!("interactive {} {}", name, command.join(" ")));
        Ok(0)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Bridge driver holding bridges in memory.
#[derive(Default)]
pub struct MockNetworkDriver {
    bridges: Mutex<BTreeMap<String, BridgeInfo>>,
}

impl MockNetworkDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pre-existing bridge with the given gateway CIDR.
    pub fn with_bridge(name: &str, ipv4_cidr: &str) -> Arc<Self> {
        let driver = Self::default();
        driver.bridges.lock().unwrap().insert(
            name.to_string(),
            BridgeInfo {
                name: name.to_string(),
                ipv4_cidr: Some(ipv4_cidr.to_string()),
                nat: true,
                attached: Vec::new(),
            },
        );
        Arc::new(driver)
    }

    pub fn bridge(&self, name: &str) -> Option<BridgeInfo> {
        self.bridges.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl NetworkDriver for MockNetworkDriver {
    async fn inspect(&self, bridge: &str) -> Result<Option<BridgeInfo>> {
        Ok(self.bridge(bridge))
    }

    async fn create(&self, topology: &NetworkTopology) -> Result<()> {
        self.bridges.lock().unwrap().insert(
            topology.bridge_name.clone(),
            BridgeInfo {
                name: topology.bridge_name.clone(),
                ipv4_cidr: Some(topology.gateway_cidr()?),
                nat: topology.nat_enabled,
                attached: Vec::new(),
            },
        );
        Ok(())
    }

    async fn delete(&self, bridge: &str) -> Result<()> {
        self.bridges.lock().unwrap().remove(bridge);
        Ok(())
    }
}

/// Healthy when the service's unit is active, unless marked unhealthy.
pub struct ScriptedProber {
    runtime: Arc<MockRuntime>,
    units: Mutex<HashMap<String, String>>,
    unhealthy: Mutex<BTreeSet<String>>,
}

impl ScriptedProber {
    pub fn new(runtime: Arc<MockRuntime>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            units: Mutex::new(HashMap::new()),
            unhealthy: Mutex::new(BTreeSet::new()),
        })
    }

    /// Answer for `service` from the state of `unit`.
    pub fn watch_unit(&self, service: &str, unit: &str) {
        self.units.lock().unwrap().insert(service.to_string(), unit.to_string());
    }

    pub fn mark_unhealthy(&self, service: &str) {
        self.unhealthy.lock().unwrap().insert(service.to_string());
    }

    pub fn mark_healthy(&self, service: &str) {
        self.unhealthy.lock().unwrap().remove(service);
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(
        &self,
        address: Ipv4Addr,
        _port: u16,
        _check: &HealthCheck,
        _timeout: Duration,
    ) -> HealthStatus {
        let Some(name) = self.runtime.name_for(address) else {
            return HealthStatus::Unhealthy;
        };
        let unit = self.units.lock().unwrap().get(&name).cloned();
        if !self.runtime.unit_active(&name, unit.as_deref()) {
            return HealthStatus::Unhealthy;
        }
        if self.unhealthy.lock().unwrap().contains(&name) {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        }
    }
}

/// A minimal service specification.
pub fn spec(name: &str, kind: ServiceKind, port: u16, depends_on: &[&str]) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        kind,
        runtime_image: String::new(),
        packages: Vec::new(),
        toolchain: None,
        port,
        unit_template: None,
        source_path: None,
        build_cmd: None,
        start_cmd: None,
        health_check: HealthCheck::Port,
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        route: None,
        env: BTreeMap::new(),
    }
}

/// An application service with a source tree, a build command and a route.
pub fn app(name: &str, port: u16, route: &str, depends_on: &[&str]) -> ServiceSpec {
    ServiceSpec {
        source_path: Some(PathBuf::from(name)),
        build_cmd: Some(format!("make {}", name)),
        health_check: HealthCheck::Http { path: "/health".to_string() },
        route: Some(route.to_string()),
        ..spec(name, ServiceKind::CompiledRealtime, port, depends_on)
    }
}

/// Mock collaborators plus a config pointing into a temp directory.
pub struct Harness {
    pub temp: TempDir,
    pub runtime: Arc<MockRuntime>,
    pub driver: Arc<MockNetworkDriver>,
    pub prober: Arc<ScriptedProber>,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_driver(MockNetworkDriver::new())
    }

    pub fn with_driver(driver: Arc<MockNetworkDriver>) -> Self {
        let temp = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        let prober = ScriptedProber::new(runtime.clone());
        let root = temp.path();

        let config = Config {
            readiness_timeout_secs: 1,
            readiness_poll_interval_ms: 20,
            health_probe_timeout_ms: 50,
            address_retries: 5,
            address_retry_interval_ms: 10,
            stop_timeout_secs: 1,
            source_root: root.join("src").to_string_lossy().into_owned(),
            artifacts_dir: root.join("artifacts").to_string_lossy().into_owned(),
            logs_dir: root.join("logs").to_string_lossy().into_owned(),
            edge_dir: root.join("edge").to_string_lossy().into_owned(),
            cache_dir: root.join("cache").to_string_lossy().into_owned(),
            ..Config::default()
        };

        Self { temp, runtime, driver, prober, config }
    }

    /// Write a source file for `service` under the host source root.
    pub fn write_source(&self, service: &str, rel: &str, content: &str) {
        let path = Path::new(&self.config.source_root).join(service).join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub async fn deployment(&self, catalog: Catalog) -> Deployment {
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(SerializedRuntime::new(self.runtime.clone()));
        self.deployment_on(catalog, runtime).await
    }

    /// Deployment talking to the mock without per-container serialization,
    /// so only the orchestrator's own locking orders concurrent work.
    pub async fn unserialized_deployment(&self, catalog: Catalog) -> Deployment {
        self.deployment_on(catalog, self.runtime.clone()).await
    }

    async fn deployment_on(&self, catalog: Catalog, runtime: Arc<dyn ContainerRuntime>) -> Deployment {
        for spec in catalog.services() {
            self.prober.watch_unit(&spec.name, &spec.unit_name());
        }
        Deployment::with_parts(
            self.config.clone(),
            catalog,
            runtime,
            self.driver.clone(),
            self.prober.clone(),
        )
        .await
        .unwrap()
    }
}
