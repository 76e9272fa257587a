//! Incus adapter.
//!
//! Drives system containers through the `incus` CLI. Every verb maps to one
//! CLI invocation; state and addresses are read from `incus list --format json`.

use crate::adapters::{ContainerRuntime, ExecOutput, RuntimeState};
use crate::error::{Result, VezaError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument, warn};

/// Incus container adapter.
pub struct IncusAdapter {
    /// Path to the incus binary
    binary_path: PathBuf,
}

impl IncusAdapter {
    /// Use an explicit binary path.
    pub fn with_binary(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    async fn run(&self, target: &str, args: &[&str]) -> Result<Output> {
        debug!(target, ?args, "incus");
        Command::new(&self.binary_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(&self.binary_path, target, e))
    }

    /// Run and require a zero exit status; returns stdout.
    async fn run_checked(&self, target: &str, args: &[&str]) -> Result<String> {
        let output = self.run(target, args).await?;
        if !output.status.success() {
            return Err(VezaError::transport(
                target,
                format!(
                    "incus {} exited with {}: {}",
                    args.first().copied().unwrap_or_default(),
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn list_json(&self, name: &str) -> Result<String> {
        let filter = format!("^{}$", name);
        self.run_checked(name, &["list", &filter, "--format", "json"]).await
    }
}

#[async_trait]
impl ContainerRuntime for IncusAdapter {
    #[instrument(skip(self), fields(container = %name))]
    async fn create(&self, name: &str, image: &str, bridge: &str) -> Result<()> {
        info!(image, bridge, "Creating container");
        self.run_checked(name, &["init", image, name, "--network", bridge]).await?;
        metrics::counter!("veza_containers_created_total").increment(1);
        Ok(())
    }

    #[instrument(skip(self), fields(container = %name))]
    async fn start(&self, name: &str) -> Result<()> {
        info!("Starting container");
        self.run_checked(name, &["start", name]).await?;
        metrics::counter!("veza_containers_started_total").increment(1);
        Ok(())
    }

    #[instrument(skip(self), fields(container = %name))]
    async fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        info!(timeout_secs = timeout.as_secs(), "Stopping container");
        let secs = timeout.as_secs().max(1).to_string();
        let output = self.run(name, &["stop", name, "--timeout", &secs]).await?;

        if !output.status.success() {
            warn!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Graceful stop failed, forcing"
            );
            self.run_checked(name, &["stop", name, "--force"]).await?;
        }

        metrics::counter!("veza_containers_stopped_total").increment(1);
        Ok(())
    }

    #[instrument(skip(self), fields(container = %name))]
    async fn delete(&self, name: &str) -> Result<()> {
        info!("Deleting container");
        self.run_checked(name, &["delete", name]).await?;
        metrics::counter!("veza_containers_deleted_total").increment(1);
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<RuntimeState> {
        let json = self.list_json(name).await?;
        parse_state(&json, name)
    }

    async fn address(&self, name: &str) -> Result<Option<Ipv4Addr>> {
        let json = self.list_json(name).await?;
        parse_address(&json, name)
    }

    #[instrument(skip(self, command), fields(container = %name))]
    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        let output = Command::new(&self.binary_path)
            .args(["exec", name, "--"])
            .args(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(&self.binary_path, name, e))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    #[instrument(skip(self, command, lines), fields(container = %name))]
    async fn exec_streaming(
        &self,
        name: &str,
        command: &[String],
        lines: UnboundedSender<String>,
    ) -> Result<i32> {
        let mut child = Command::new(&self.binary_path)
            .args(["exec", name, "--"])
            .args(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.binary_path, name, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VezaError::Internal("child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| VezaError::Internal("child stderr not captured".to_string()))?;

        let out_tx = lines.clone();
        let pump_stdout = async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let _ = out_tx.send(line);
            }
        };
        let pump_stderr = async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let _ = lines.send(line);
            }
        };

        let (status, (), ()) = tokio::join!(child.wait(), pump_stdout, pump_stderr);
        let status = status.map_err(|e| VezaError::transport(name, e.to_string()))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn push_file(&self, name: &str, local: &Path, remote: &str) -> Result<()> {
        let local = local.to_string_lossy();
        let dest = format!("{}{}", name, remote);
        self.run_checked(name, &["file", "push", "--create-dirs", &local, &dest]).await?;
        Ok(())
    }

    async fn write_file(&self, name: &str, remote: &str, contents: &[u8]) -> Result<()> {
        let mut staged = tempfile::NamedTempFile::new().map_err(|e| VezaError::IoError {
            path: std::env::temp_dir(),
            source: e,
        })?;
        staged
            .write_all(contents)
            .map_err(|e| VezaError::IoError { path: staged.path().to_path_buf(), source: e })?;
        self.push_file(name, staged.path(), remote).await
    }

    async fn read_file(&self, name: &str, remote: &str) -> Result<Option<Vec<u8>>> {
        let src = format!("{}{}", name, remote);
        let output = self.run(name, &["file", "pull", &src, "-"]).await?;
        if output.status.success() {
            return Ok(Some(output.stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            return Ok(None);
        }
        Err(VezaError::transport(name, format!("reading {}: {}", remote, stderr.trim())))
    }

    #[instrument(skip(self), fields(container = %name))]
    async fn export(&self, name: &str, archive: &Path) -> Result<()> {
        let archive = archive.to_string_lossy();
        self.run_checked(name, &["export", name, &archive]).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(container = %name))]
    async fn import(&self, name: &str, archive: &Path) -> Result<()> {
        let archive = archive.to_string_lossy();
        self.run_checked(name, &["import", &archive, name]).await?;
        Ok(())
    }

    async fn interactive(&self, name: &str, command: &[String]) -> Result<i32> {
        let status = Command::new(&self.binary_path)
            .args(["exec", name, "--"])
            .args(command)
            .status()
            .await
            .map_err(|e| spawn_error(&self.binary_path, name, e))?;
        Ok(status.code().unwrap_or(-1))
    }

    fn name(&self) -> &str {
        "incus"
    }
}

/// Locate a binary in common locations, then `PATH`.
pub fn find_binary(binary: &str) -> Result<PathBuf> {
    let mut candidates = vec![
        PathBuf::from("/usr/bin").join(binary),
        PathBuf::from("/usr/local/bin").join(binary),
        PathBuf::from("/snap/bin").join(binary),
    ];
    if let Some(path) = std::env::var_os("PATH") {
        candidates.extend(std::env::split_paths(&path).map(|dir| dir.join(binary)));
    }

    candidates
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| VezaError::RuntimeMissing { binary: binary.to_string() })
}

fn spawn_error(binary: &Path, target: &str, e: std::io::Error) -> VezaError {
    if e.kind() == std::io::ErrorKind::NotFound {
        VezaError::RuntimeMissing { binary: binary.to_string_lossy().into_owned() }
    } else {
        VezaError::transport(target, e.to_string())
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("not found") || lower.contains("no such file")
}

#[derive(Debug, Deserialize)]
struct ListedInstance {
    name: String,
    status: String,
    #[serde(default)]
    state: Option<ListedState>,
}

#[derive(Debug, Deserialize)]
struct ListedState {
    #[serde(default)]
    network: Option<HashMap<String, ListedNic>>,
}

#[derive(Debug, Deserialize)]
struct ListedNic {
    #[serde(default)]
    addresses: Vec<ListedAddress>,
}

#[derive(Debug, Deserialize)]
struct ListedAddress {
    family: String,
    address: String,
    #[serde(default)]
    scope: String,
}

fn find_instance(json: &str, name: &str) -> Result<Option<ListedInstance>> {
    let listed: Vec<ListedInstance> = serde_json::from_str(json)
        .map_err(|e| VezaError::transport(name, format!("unparseable incus list output: {}", e)))?;
    Ok(listed.into_iter().find(|i| i.name == name))
}

fn parse_state(json: &str, name: &str) -> Result<RuntimeState> {
    Ok(match find_instance(json, name)? {
        None => RuntimeState::Missing,
        Some(i) if i.status.eq_ignore_ascii_case("running") => RuntimeState::Running,
        Some(_) => RuntimeState::Stopped,
    })
}

fn parse_address(json: &str, name: &str) -> Result<Option<Ipv4Addr>> {
    let Some(instance) = find_instance(json, name)? else {
        return Ok(None);
    };
    let Some(nics) = instance.state.and_then(|s| s.network) else {
        return Ok(None);
    };

    let mut nic_names: Vec<&String> = nics.keys().filter(|n| n.as_str() != "lo").collect();
    nic_names.sort();

    for nic in nic_names {
        for addr in &nics[nic].addresses {
            if addr.family == "inet" && addr.scope == "global" {
                if let Ok(ip) = addr.address.parse::<Ipv4Addr>() {
                    return Ok(Some(ip));
                }
            }
        }
    }
    Ok(None)
}
