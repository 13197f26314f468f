//! `virtflow bind` and `virtflow unbind` commands

use crate::commands::status::colorize;
use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use tracing::{debug, info};
use virtflow_core::vfio::{decode_device, WorkerAction};
use virtflow_core::{BindError, Config, DeviceGroup, RebindReport, Rebinder, Vendor};

/// How a device group is given on the command line.
#[derive(Args, Debug)]
pub struct GroupArgs {
    /// Device group as JSON ({"display_name", "vendor", "members"})
    #[arg(short, long, conflicts_with_all = ["devices", "name", "vendor"])]
    group: Option<PathBuf>,

    /// Display name (defaults to the first address)
    #[arg(short, long)]
    name: Option<String>,

    /// Vendor: nvidia, amd or other (defaults to the first device's vendor ID)
    #[arg(long)]
    vendor: Option<Vendor>,

    /// Run the worker even if the group already looks settled
    #[arg(short, long)]
    force: bool,

    /// Devices as address|vendor|device, every function of the IOMMU group
    devices: Vec<String>,
}

impl GroupArgs {
    fn resolve(&self) -> Result<DeviceGroup> {
        if let Some(path) = &self.group {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            return serde_json::from_str(&content)
                .with_context(|| format!("Invalid device group in {}", path.display()));
        }

        if self.devices.is_empty() {
            bail!("Specify the group's devices or --group FILE");
        }
        let members = self
            .devices
            .iter()
            .map(|d| decode_device(d))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let vendor = self.vendor.unwrap_or_else(|| Vendor::from_vendor_id(members[0].vendor_id()));
        let name = self.name.clone().unwrap_or_else(|| members[0].address().to_string());
        Ok(DeviceGroup::new(name, vendor, members)?)
    }
}

/// Bind a group to vfio-pci.
pub async fn bind(config: &Config, args: &GroupArgs) -> Result<()> {
    rebind(config, args, WorkerAction::Bind).await
}

/// Return a group to its host driver.
pub async fn unbind(config: &Config, args: &GroupArgs) -> Result<()> {
    rebind(config, args, WorkerAction::Unbind).await
}

async fn rebind(config: &Config, args: &GroupArgs, action: WorkerAction) -> Result<()> {
    let group = args.resolve()?;
    debug!(group = %group, vendor = %group.vendor(), action = %action, "Resolved device group");
    let rebinder = Rebinder::new(config);

    if !args.force && rebinder.inspector().is_settled(&group, action) {
        info!(group = %group.display_name(), action = %action, "Group already settled");
        println!(
            "{} {} is already in place, nothing to do",
            "✓".green().bold(),
            group.display_name().bold()
        );
        return Ok(());
    }

    println!("{} {}...", verb(action), group.display_name().bold());
    let result = match action {
        WorkerAction::Bind => rebinder.bind(&group).await,
        WorkerAction::Unbind => rebinder.unbind(&group).await,
    };

    match result {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "✗".red().bold(), e);
            if let Some(warning) = e.module_warning() {
                println!("{} {}", "!".yellow().bold(), warning);
            }
            if !matches!(e, BindError::LaunchFailed { .. }) {
                println!("Current state:");
                for (address, state) in rebinder.inspector().group_states(&group) {
                    println!("  {:<15} {}", address, colorize(&state));
                }
            }
            if e.is_retryable() {
                println!("Nothing was changed; it is safe to retry.");
            }
            Err(e.into())
        }
    }
}

fn verb(action: WorkerAction) -> &'static str {
    match action {
        WorkerAction::Bind => "Binding",
        WorkerAction::Unbind => "Restoring",
    }
}

fn print_report(report: &RebindReport) {
    if let Some(warning) = &report.module_warning {
        println!("{} {}", "!".yellow().bold(), warning);
    }
    let target = match report.action {
        WorkerAction::Bind => "vfio-pci",
        WorkerAction::Unbind => "host driver",
    };
    println!("{} {} moved to {}", "✓".green().bold(), report.group.bold(), target);
    for (address, state) in &report.states {
        println!("  {:<15} {}", address, colorize(state));
    }
}
