//! `virtflow modules` command

use anyhow::Result;
use colored::Colorize;
use virtflow_core::{Config, Rebinder};

/// Load the VFIO modules if vfio-pci is not available yet.
pub async fn modules(config: &Config) -> Result<()> {
    let rebinder = Rebinder::new(config);
    let guard = rebinder.module_guard();

    if guard.vfio_available().await {
        println!("{} vfio-pci is available", "✓".green().bold());
        return Ok(());
    }

    match guard.ensure_vfio_loaded().await {
        Ok(()) => {
            println!("{} VFIO modules loaded", "✓".green().bold());
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "✗".red().bold(), e);
            anyhow::bail!("vfio-pci is not available")
        }
    }
}
