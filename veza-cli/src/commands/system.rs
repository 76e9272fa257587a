//! `vezactl setup | create | stop | clean`

use super::{print_edge, print_failures, print_report, spinner, Options};
use anyhow::Result;
use colored::Colorize;
use std::io::{self, Write};
use veza_core::network::EnsureOutcome;
use veza_core::provisioner::Outcome;

/// Prepare the host.
pub async fn setup(options: &Options) -> Result<i32> {
    let deployment = options.open().await?;
    let outcome = deployment.setup().await?;

    let topology = deployment.config().network();
    match outcome {
        EnsureOutcome::Created => println!(
            "{} Bridge {} created ({})",
            "✓".green().bold(),
            topology.bridge_name.bold(),
            topology.subnet_cidr
        ),
        EnsureOutcome::Unchanged => println!(
            "{} Bridge {} already configured ({})",
            "✓".green().bold(),
            topology.bridge_name.bold(),
            topology.subnet_cidr
        ),
    }
    println!("  runtime: {}", deployment.runtime_name());
    println!("  artifacts: {}", deployment.config().artifacts_dir().display());
    Ok(0)
}

/// Provision every container.
pub async fn create(options: &Options, force: bool) -> Result<i32> {
    let deployment = options.open().await?;

    let spinner = spinner(format!(
        "Provisioning {} services (this may take a while)...",
        deployment.catalog().len()
    ));
    let report = deployment.create(force).await;
    spinner.finish_and_clear();
    let report = report?;

    for entry in &report.provision.outcomes {
        match &entry.outcome {
            Outcome::Failed(failure) => print_failures([failure]),
            Outcome::Skipped { .. } => println!("{} {}", "-".yellow().bold(), entry),
            _ => println!("{} {} [{}]", "✓".green().bold(), entry, entry.tier),
        }
    }

    let destructive = report.provision.destructive();
    if !destructive.is_empty() {
        println!("  recreated: {}", destructive.join(", "));
    }

    print_edge(&report.edge);

    Ok(report.exit_code())
}

/// Stop every container.
pub async fn stop(options: &Options) -> Result<i32> {
    let deployment = options.open().await?;
    let report = deployment.stop().await;
    print_report(&report, |service, _| format!("{}: stopped", service));
    Ok(report.exit_code())
}

/// Delete every container, optionally the bridge too.
pub async fn clean(options: &Options, yes: bool, network: bool) -> Result<i32> {
    let deployment = options.open().await?;

    if !yes {
        println!("WARNING! This will delete every container in the topology:");
        for spec in deployment.catalog().services() {
            println!("  - {}", spec.name);
        }
        if network {
            println!("  - bridge {}", deployment.config().bridge_name);
        }
        println!();

        print!("Are you sure you want to continue? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(0);
        }
    }

    let report = deployment.clean(network).await?;
    print_report(&report.containers, |service, _| format!("{}: deleted", service));
    if report.network_removed {
        println!("{} Bridge {} deleted", "✓".green().bold(), deployment.config().bridge_name);
    } else if network && !report.containers.is_success() {
        eprintln!("Bridge kept: some containers could not be deleted");
    }
    Ok(report.containers.exit_code())
}
