//! CLI command implementations

pub mod archive;
pub mod build;
pub mod logs;
pub mod status;
pub mod system;

use anyhow::Result;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use veza_core::edge::EdgeReport;
use veza_core::{Catalog, Config, Deployment, StepFailure, StepReport};

/// Global options shared by every subcommand.
pub struct Options {
    pub catalog: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

impl Options {
    pub fn config(&self) -> Result<Config> {
        let config = match &self.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };
        Ok(config)
    }

    pub fn catalog(&self) -> Result<Catalog> {
        let catalog = match &self.catalog {
            Some(path) => Catalog::load(path)?,
            None => Catalog::builtin()?,
        };
        Ok(catalog)
    }

    /// Connect to the runtime and observe the topology.
    pub async fn open(&self) -> Result<Deployment> {
        let deployment = Deployment::open(self.config()?, self.catalog()?).await?;
        Ok(deployment)
    }
}

pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .map(|s| s.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]))
    {
        spinner.set_style(style);
    }
    spinner.set_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

pub fn print_failures<'a>(failures: impl IntoIterator<Item = &'a StepFailure>) {
    for failure in failures {
        eprintln!("{} {}", "✗".red().bold(), failure);
    }
}

/// Print one line per success via `describe`, then every failure.
pub fn print_report<T>(report: &StepReport<T>, describe: impl Fn(&str, &T) -> String) {
    for (service, value) in &report.succeeded {
        println!("{} {}", "✓".green().bold(), describe(service, value));
    }
    print_failures(&report.failed);
}

/// Outcome of an edge reconfiguration, if one was attempted.
pub fn print_edge(edge: &Option<veza_core::Result<EdgeReport>>) {
    match edge {
        Some(Ok(edge)) => {
            let verb = if edge.changed { "applied" } else { "unchanged" };
            println!("{} Edge routes {} ({} routes)", "✓".green().bold(), verb, edge.routes.len());
            if !edge.omitted.is_empty() {
                println!("  omitted (no address): {}", edge.omitted.join(", "));
            }
        }
        Some(Err(e)) => eprintln!("{} edge: {}", "✗".red().bold(), e),
        None => {}
    }
}
