use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use veza_core::VezaError;

mod commands;

use commands::Options;

#[derive(Parser)]
#[command(name = "vezactl")]
#[command(about = "Provision, build and deploy the Veza container topology", long_about = None)]
struct Cli {
    /// Service catalog (YAML); defaults to the built-in topology
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Configuration file (JSON); defaults to <config dir>/config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the host: bridge network and local directories
    Setup,

    /// Provision every container in dependency order
    Create {
        /// Recreate containers that already exist
        #[arg(long)]
        force: bool,
    },

    /// Export containers to archives (running ones are stopped and restarted)
    Export {
        /// Services to export (default: all)
        services: Vec<String>,
    },

    /// Import containers from previously exported archives
    Import {
        /// Services to import (default: every archive present)
        services: Vec<String>,

        /// Replace containers that already exist
        #[arg(long)]
        force: bool,
    },

    /// Push changed source files into containers
    Sync {
        /// Services to sync (default: every service with a source tree)
        services: Vec<String>,
    },

    /// Run build commands inside containers
    Build {
        /// Services to build (default: every buildable service)
        services: Vec<String>,
    },

    /// Restart service units and wait for health
    Restart {
        /// Services to restart (default: application tier)
        services: Vec<String>,
    },

    /// Sync, build, restart and reconfigure the edge proxy
    Deploy {
        /// Services to deploy (default: every buildable service)
        services: Vec<String>,
    },

    /// Show state, address and health of every service
    Status,

    /// Show a service's unit journal
    Logs {
        service: String,

        /// Number of lines
        #[arg(short = 'n', long, default_value = "100")]
        lines: usize,

        /// Keep streaming new entries
        #[arg(short, long)]
        follow: bool,
    },

    /// Open a shell inside a service's container
    Shell { service: String },

    /// Stop every container (edge first)
    Stop,

    /// Delete every container
    Clean {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Also delete the bridge network
        #[arg(long)]
        network: bool,
    },

    /// List container addresses
    Ips,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let options = Options { catalog: cli.catalog, config: cli.config };

    match run(cli.command, &options).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            let code = e.downcast_ref::<VezaError>().map(VezaError::exit_code).unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(command: Commands, options: &Options) -> Result<i32> {
    let config = options.config()?;
    if let Err(e) = veza_core::init_observability(&config.log_level) {
        eprintln!("warning: logging disabled: {}", e);
    }

    match command {
        Commands::Setup => commands::system::setup(options).await,
        Commands::Create { force } => commands::system::create(options, force).await,
        Commands::Export { services } => commands::archive::export(options, &services).await,
        Commands::Import { services, force } => {
            commands::archive::import(options, &services, force).await
        }
        Commands::Sync { services } => commands::build::sync(options, &services).await,
        Commands::Build { services } => commands::build::build(options, &services).await,
        Commands::Restart { services } => commands::build::restart(options, &services).await,
        Commands::Deploy { services } => commands::build::deploy(options, &services).await,
        Commands::Status => commands::status::status(options).await,
        Commands::Logs { service, lines, follow } => {
            commands::logs::logs(options, &service, lines, follow).await
        }
        Commands::Shell { service } => commands::logs::shell(options, &service).await,
        Commands::Stop => commands::system::stop(options).await,
        Commands::Clean { yes, network } => commands::system::clean(options, yes, network).await,
        Commands::Ips => commands::status::ips(options).await,
    }
}
