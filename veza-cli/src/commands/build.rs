//! `vezactl sync | build | restart | deploy`

use super::{print_failures, print_report, spinner, Options};
use anyhow::Result;
use colored::Colorize;
use veza_core::build::BuildLog;
use veza_core::sync::SyncStats;

fn describe_sync(service: &str, stats: &SyncStats) -> String {
    if stats.is_noop() {
        format!("{}: up to date ({} files)", service, stats.scanned)
    } else {
        format!(
            "{}: {} pushed, {} removed, {} unchanged ({} KiB)",
            service,
            stats.pushed,
            stats.removed,
            stats.unchanged(),
            stats.bytes / 1024
        )
    }
}

fn describe_build(service: &str, log: &BuildLog) -> String {
    format!("{}: built in {:.1}s (log: {})", service, log.duration.as_secs_f64(), log.log_path.display())
}

pub async fn sync(options: &Options, services: &[String]) -> Result<i32> {
    let deployment = options.open().await?;
    let report = deployment.sync(services).await?;
    print_report(&report, describe_sync);
    Ok(report.exit_code())
}

pub async fn build(options: &Options, services: &[String]) -> Result<i32> {
    let deployment = options.open().await?;

    let spinner = spinner("Building...");
    let report = deployment.build(services).await;
    spinner.finish_and_clear();
    let report = report?;

    print_report(&report, describe_build);
    Ok(report.exit_code())
}

pub async fn restart(options: &Options, services: &[String]) -> Result<i32> {
    let deployment = options.open().await?;

    let spinner = spinner("Restarting services...");
    let report = deployment.restart(services).await;
    spinner.finish_and_clear();
    let report = report?;

    print_report(&report, |service, _| format!("{}: healthy", service));
    Ok(report.exit_code())
}

pub async fn deploy(options: &Options, services: &[String]) -> Result<i32> {
    let deployment = options.open().await?;

    let spinner = spinner("Deploying (sync, build, restart, edge)...");
    let report = deployment.deploy(services).await;
    spinner.finish_and_clear();
    let report = report?;

    println!("{}", "[1/4] sync".bold().blue());
    for (service, stats) in &report.sync.succeeded {
        println!("  {}", describe_sync(service, stats));
    }
    println!("{}", "[2/4] build".bold().blue());
    for (service, log) in &report.build.succeeded {
        println!("  {}", describe_build(service, log));
    }
    println!("{}", "[3/4] restart".bold().blue());
    for (service, ()) in &report.restart.succeeded {
        println!("  {}: healthy", service);
    }
    println!("{}", "[4/4] edge".bold().blue());
    match &report.edge {
        Some(Ok(edge)) => {
            let verb = if edge.changed { "reloaded" } else { "unchanged" };
            println!("  {} with {} routes", verb, edge.routes.len());
            if !edge.omitted.is_empty() {
                println!("  omitted (no address): {}", edge.omitted.join(", "));
            }
        }
        Some(Err(e)) => eprintln!("  {} {}", "✗".red().bold(), e),
        None => println!("  proxy not running, skipped"),
    }
    println!();

    super::status::print_status(&report.status);
    print_failures(report.failures());
    Ok(report.exit_code())
}
