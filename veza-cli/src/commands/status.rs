//! `vezactl status | ips`

use super::Options;
use anyhow::Result;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};
use veza_core::{HealthStatus, LifecycleState, ServiceStatus};

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "SERVICE")]
    service: String,
    #[tabled(rename = "TIER")]
    tier: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "HEALTH")]
    health: String,
    #[tabled(rename = "ADDRESS")]
    address: String,
}

#[derive(Tabled)]
struct IpRow {
    #[tabled(rename = "SERVICE")]
    service: String,
    #[tabled(rename = "IP")]
    ip: String,
}

fn colour_state(state: LifecycleState) -> String {
    match state {
        LifecycleState::Running => state.to_string().green().to_string(),
        LifecycleState::Failed => state.to_string().red().to_string(),
        LifecycleState::Provisioning => state.to_string().yellow().to_string(),
        LifecycleState::Stopped | LifecycleState::Absent => state.to_string().dimmed().to_string(),
    }
}

fn colour_health(health: HealthStatus) -> String {
    match health {
        HealthStatus::Healthy => health.to_string().green().to_string(),
        HealthStatus::Unhealthy => health.to_string().red().to_string(),
        HealthStatus::Unknown => health.to_string().dimmed().to_string(),
    }
}

pub fn print_status(statuses: &[ServiceStatus]) {
    let rows: Vec<StatusRow> = statuses
        .iter()
        .map(|s| StatusRow {
            service: s.service.clone(),
            tier: s.tier.to_string(),
            state: colour_state(s.state),
            health: colour_health(s.health),
            address: s
                .address
                .map(|a| format!("{}:{}", a, s.port))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);
}

/// Show every service's state and health.
pub async fn status(options: &Options) -> Result<i32> {
    let deployment = options.open().await?;
    let statuses = deployment.status().await;
    print_status(&statuses);

    let unhealthy = statuses
        .iter()
        .any(|s| s.state == LifecycleState::Running && s.health != HealthStatus::Healthy);
    Ok(if unhealthy { 1 } else { 0 })
}

/// List addresses of running containers.
pub async fn ips(options: &Options) -> Result<i32> {
    let deployment = options.open().await?;
    let addresses = deployment.ips().await?;

    if addresses.is_empty() {
        println!("No containers running");
        return Ok(0);
    }

    let rows: Vec<IpRow> = addresses
        .into_iter()
        .map(|(service, ip)| IpRow { service, ip: ip.to_string() })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);
    Ok(0)
}
