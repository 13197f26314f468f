//! `virtflow status` command

use anyhow::Result;
use colored::Colorize;
use virtflow_core::vfio::is_valid_pci_address;
use virtflow_core::{BindingState, Config, Inspector};

/// Print the current binding of each address.
pub fn status(config: &Config, addresses: &[String]) -> Result<()> {
    let inspector = Inspector::new(&config.sysfs_root);

    println!("{:<15} {:<20}", "PCI ADDRESS", "DRIVER");
    println!("{}", "-".repeat(36));

    for address in addresses {
        let address = address.to_ascii_lowercase();
        if !is_valid_pci_address(&address) {
            println!("{:<15} {}", address, "invalid address".red());
            continue;
        }
        println!("{:<15} {}", address, colorize(&inspector.current_driver(&address)));
    }

    Ok(())
}

pub(crate) fn colorize(state: &BindingState) -> String {
    match state {
        BindingState::VfioBound => state.to_string().green().to_string(),
        BindingState::HostDriver(_) => state.to_string(),
        BindingState::Unbound => state.to_string().yellow().to_string(),
        BindingState::Unknown => state.to_string().red().to_string(),
    }
}
