//! virtflow-worker
//!
//! Disposable privileged process that rebinds one PCI device group. It is
//! started by the orchestrator once per request and exits when done:
//!
//! ```text
//! virtflow-worker bind   <addr>|<vendor>|<device> ...
//! virtflow-worker unbind <nvidia|amdgpu|nouveau> <addr> ...
//! ```
//!
//! Progress goes to stdout, diagnostics to stderr. Exit code 0 means every
//! device reached the target state, 1 means at least one did not, 2 means
//! the arguments could not be decoded.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, warn};
use virtflow_core::vfio::{
    Executor, Modprobe, WorkerRequest, DEFAULT_LOAD_TIMEOUT, EXIT_USAGE, SYSFS_ROOT,
};

#[derive(Parser)]
#[command(name = "virtflow-worker")]
#[command(about = "Rebind a PCI device group between its host driver and vfio-pci", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move devices onto vfio-pci
    Bind {
        /// Devices as address|vendor|device (e.g. 0000:01:00.0|10de|2184)
        #[arg(required = true)]
        devices: Vec<String>,
    },

    /// Return devices to their host driver
    Unbind {
        /// Host driver: nvidia, amdgpu or nouveau
        host_driver: String,

        /// PCI addresses (e.g. 0000:01:00.0)
        #[arg(required = true)]
        addresses: Vec<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = virtflow_core::observability::init("warn") {
        eprintln!("virtflow-worker: logging unavailable: {}", e);
    }

    // clap exits with status 2 on a usage error, same as EXIT_USAGE
    let cli = Cli::parse();

    let request = match cli.command {
        Commands::Bind { devices } => WorkerRequest::bind(&devices),
        Commands::Unbind { host_driver, addresses } => {
            WorkerRequest::unbind(&host_driver, &addresses)
        }
    };
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Invalid arguments");
            eprintln!("virtflow-worker: {}", e);
            std::process::exit(EXIT_USAGE);
        }
    };

    let loader = Modprobe::new(vec!["modprobe".to_string()], "/proc/modules", DEFAULT_LOAD_TIMEOUT);
    let executor = Executor::new(SYSFS_ROOT).with_module_loader(Arc::new(loader));

    let mut stdout = std::io::stdout();
    let report = executor.execute(&request, &mut stdout).await;

    for result in report.results.iter().filter(|r| !r.ok) {
        warn!(address = %result.address, state = %result.state, "Device did not reach target state");
        eprintln!("virtflow-worker: {} is {}", result.address, result.state);
    }
    if !report.skipped.is_empty() {
        eprintln!("virtflow-worker: not attempted: {}", report.skipped.join(", "));
    }

    std::process::exit(report.exit_code());
}
