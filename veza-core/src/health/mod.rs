//! Health monitor.
//!
//! Probes each service's declared health check. A single snapshot is only
//! eventually consistent; anything that needs certainty goes through
//! [`HealthMonitor::wait_healthy`], which polls with a fixed backoff.

use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::{Result, VezaError};
use crate::network::NetworkProvisioner;
use crate::retry::RetryPolicy;
use crate::state::InstanceRegistry;
use crate::types::{HealthCheck, HealthStatus, LifecycleState, ServiceSpec};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

/// Liveness probe seam.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `check` against `address:port` within `timeout`.
    async fn probe(
        &self,
        address: Ipv4Addr,
        port: u16,
        check: &HealthCheck,
        timeout: Duration,
    ) -> HealthStatus;
}

/// TCP connect and HTTP GET probes.
pub struct NetworkProber {
    client: reqwest::Client,
}

impl NetworkProber {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| VezaError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(
        &self,
        address: Ipv4Addr,
        port: u16,
        check: &HealthCheck,
        timeout: Duration,
    ) -> HealthStatus {
        match check {
            HealthCheck::Port => {
                match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
                    Ok(Ok(_)) => HealthStatus::Healthy,
                    Ok(Err(e)) => {
                        debug!(%address, port, error = %e, "Connect refused");
                        HealthStatus::Unhealthy
                    }
                    Err(_) => HealthStatus::Unhealthy,
                }
            }
            HealthCheck::Http { path } => {
                let url = format!("http://{}:{}{}", address, port, path);
                match self.client.get(&url).timeout(timeout).send().await {
                    Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                        HealthStatus::Healthy
                    }
                    Ok(resp) => {
                        debug!(%url, status = %resp.status(), "Unhealthy response");
                        HealthStatus::Unhealthy
                    }
                    Err(e) => {
                        debug!(%url, error = %e, "Request failed");
                        HealthStatus::Unhealthy
                    }
                }
            }
        }
    }
}

/// Aggregates per-service health.
pub struct HealthMonitor {
    prober: Arc<dyn Prober>,
    network: Arc<NetworkProvisioner>,
    registry: InstanceRegistry,
    probe_timeout: Duration,
    poll_interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        prober: Arc<dyn Prober>,
        network: Arc<NetworkProvisioner>,
        registry: InstanceRegistry,
        config: &Config,
    ) -> Self {
        Self {
            prober,
            network,
            registry,
            probe_timeout: config.health_probe_timeout(),
            poll_interval: config.readiness_poll_interval(),
        }
    }

    /// Probe one service regardless of its lifecycle state.
    ///
    /// A container with no address is unreachable and reported Unhealthy.
    pub async fn probe(&self, spec: &ServiceSpec) -> HealthStatus {
        metrics::counter!("veza_health_probes_total").increment(1);

        let address = match self.network.lookup(&spec.name).await {
            Ok(Some(addr)) => addr,
            Ok(None) => return HealthStatus::Unhealthy,
            Err(e) => {
                debug!(service = %spec.name, error = %e, "Address lookup failed");
                return HealthStatus::Unhealthy;
            }
        };

        let status =
            self.prober.probe(address, spec.port, &spec.health_check, self.probe_timeout).await;
        if status == HealthStatus::Unhealthy {
            metrics::counter!("veza_health_probe_failures_total").increment(1);
        }
        status
    }

    /// Health of one service: Unknown unless its container is Running.
    pub async fn check(&self, spec: &ServiceSpec) -> HealthStatus {
        if self.registry.state(&spec.name) != LifecycleState::Running {
            return HealthStatus::Unknown;
        }
        let status = self.probe(spec).await;
        self.registry.set_health(&spec.name, status);
        status
    }

    /// Snapshot of every service's health, probed concurrently.
    #[instrument(skip_all)]
    pub async fn check_all(&self, catalog: &Catalog) -> BTreeMap<String, HealthStatus> {
        let results = join_all(
            catalog
                .services()
                .iter()
                .map(|spec| async move { (spec.name.clone(), self.check(spec).await) }),
        )
        .await;
        results.into_iter().collect()
    }

    /// Poll until `spec` probes Healthy or `timeout` elapses.
    #[instrument(skip(self, spec), fields(service = %spec.name))]
    pub async fn wait_healthy(&self, spec: &ServiceSpec, timeout: Duration) -> Result<()> {
        let policy = RetryPolicy::within(timeout, self.poll_interval);
        let healthy = policy
            .poll(|| async {
                Ok((self.probe(spec).await == HealthStatus::Healthy).then_some(()))
            })
            .await?;

        match healthy {
            Some(()) => {
                debug!("Healthy");
                Ok(())
            }
            None => Err(VezaError::Timeout {
                target: spec.name.clone(),
                operation: "health check".to_string(),
                after: timeout,
                port: Some(spec.port),
            }),
        }
    }

    /// Promote a Provisioning instance to Running once it probes Healthy.
    ///
    /// On timeout the instance becomes Failed and the timeout is returned.
    #[instrument(skip(self, spec), fields(service = %spec.name))]
    pub async fn await_ready(&self, spec: &ServiceSpec, timeout: Duration) -> Result<()> {
        match self.wait_healthy(spec, timeout).await {
            Ok(()) => {
                self.registry.set_address(&spec.name, self.network.cached(&spec.name));
                self.registry.transition(&spec.name, LifecycleState::Running)?;
                self.registry.set_health(&spec.name, HealthStatus::Healthy);
                info!("Ready");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Not ready");
                self.registry.transition(&spec.name, LifecycleState::Failed)?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!("{}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status_line);
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_port_probe() {
        let prober = NetworkProber::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let status = prober
            .probe(Ipv4Addr::LOCALHOST, port, &HealthCheck::Port, Duration::from_secs(1))
            .await;
        assert_eq!(status, HealthStatus::Healthy);

        drop(listener);
        let status = prober
            .probe(Ipv4Addr::LOCALHOST, port, &HealthCheck::Port, Duration::from_secs(1))
            .await;
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_http_probe_status_classes() {
        let prober = NetworkProber::new().unwrap();
        let check = HealthCheck::Http { path: "/health".to_string() };

        let port = serve_once("HTTP/1.1 200 OK").await;
        let status = prober.probe(Ipv4Addr::LOCALHOST, port, &check, Duration::from_secs(2)).await;
        assert_eq!(status, HealthStatus::Healthy);

        let port = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let status = prober.probe(Ipv4Addr::LOCALHOST, port, &check, Duration::from_secs(2)).await;
        assert_eq!(status, HealthStatus::Unhealthy);
    }
}
