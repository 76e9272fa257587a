//! `vezactl export | import`

use super::{print_edge, print_report, spinner, Options};
use anyhow::Result;

pub async fn export(options: &Options, services: &[String]) -> Result<i32> {
    let deployment = options.open().await?;

    let spinner = spinner("Exporting containers...");
    let report = deployment.export(services).await;
    spinner.finish_and_clear();
    let report = report?;

    print_report(&report.services, |service, artifact| {
        format!("{}: {}", service, artifact.archive_path.display())
    });
    print_edge(&report.edge);
    Ok(report.exit_code())
}

pub async fn import(options: &Options, services: &[String], force: bool) -> Result<i32> {
    let deployment = options.open().await?;

    let spinner = spinner("Importing containers and waiting for health...");
    let report = deployment.import(services, force).await;
    spinner.finish_and_clear();
    let report = report?;

    print_report(&report.services, |service, instance| {
        let address = instance.address.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
        format!("{}: {} ({})", service, instance.lifecycle_state, address)
    });
    print_edge(&report.edge);
    Ok(report.exit_code())
}
