use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use virtflow_core::Config;

mod commands;

#[derive(Parser)]
#[command(name = "virtflow")]
#[command(about = "Move GPU device groups between host drivers and vfio-pci", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ~/.config/virtflow/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the current driver of PCI devices
    Status {
        /// PCI addresses (e.g. 0000:01:00.0)
        #[arg(required = true)]
        addresses: Vec<String>,
    },

    /// Bind a device group to vfio-pci
    Bind(commands::GroupArgs),

    /// Return a device group to its host driver
    Unbind(commands::GroupArgs),

    /// Make sure the VFIO kernel modules are loaded
    Modules,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let level = match cli.verbose {
        0 => config.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    if let Err(e) = virtflow_core::observability::init(level) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }
    debug!(
        worker = %config.worker_path.display(),
        launcher = ?config.privilege_launcher,
        sysfs = %config.sysfs_root.display(),
        "Loaded configuration"
    );

    match cli.command {
        Commands::Status { addresses } => commands::status(&config, &addresses)?,
        Commands::Bind(args) => commands::bind(&config, &args).await?,
        Commands::Unbind(args) => commands::unbind(&config, &args).await?,
        Commands::Modules => commands::modules(&config).await?,
    }

    Ok(())
}
