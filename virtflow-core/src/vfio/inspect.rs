//! Read-only view of kernel driver bindings.
//!
//! State is resolved from the `driver` symlink on every call and never cached:
//! the kernel is the only source of truth, and it can change underneath us
//! (a crashed worker, a manual rebind, a reboot).

use crate::vfio::device::{is_valid_pci_address, DeviceGroup};
use crate::vfio::protocol::WorkerAction;
use crate::vfio::VFIO_PCI_DRIVER;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default sysfs mount point.
pub const SYSFS_ROOT: &str = "/sys";

/// Driver binding of one PCI function, as the kernel reports it right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingState {
    /// Bound to a host driver (nvidia, amdgpu, snd_hda_intel, ...).
    HostDriver(String),
    /// Bound to vfio-pci.
    VfioBound,
    /// Present but not bound to any driver.
    Unbound,
    /// Could not be determined.
    Unknown,
}

impl BindingState {
    pub fn is_vfio(&self) -> bool {
        matches!(self, Self::VfioBound)
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostDriver(name) => write!(f, "bound to {}", name),
            Self::VfioBound => write!(f, "bound to {}", VFIO_PCI_DRIVER),
            Self::Unbound => f.write_str("unbound"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Resolves binding state under a sysfs root.
#[derive(Debug, Clone)]
pub struct Inspector {
    sysfs_root: PathBuf,
}

impl Default for Inspector {
    fn default() -> Self {
        Self::new(SYSFS_ROOT)
    }
}

impl Inspector {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self { sysfs_root: sysfs_root.into() }
    }

    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    /// `<root>/bus/pci/devices/<address>`
    pub fn device_path(&self, address: &str) -> PathBuf {
        self.sysfs_root.join("bus/pci/devices").join(address)
    }

    /// `<root>/bus/pci/drivers/<driver>`
    pub fn driver_path(&self, driver: &str) -> PathBuf {
        self.sysfs_root.join("bus/pci/drivers").join(driver)
    }

    /// Current driver binding for a PCI address.
    ///
    /// Never fails: anything that prevents a clear answer is `Unknown`.
    pub fn current_driver(&self, address: &str) -> BindingState {
        if !is_valid_pci_address(address) {
            return BindingState::Unknown;
        }

        let device_path = self.device_path(address);
        let state = read_driver_link(&device_path);
        debug!(address = %address, state = %state, "Read driver binding");
        state
    }

    /// Current state of every member, in group order.
    pub fn group_states(&self, group: &DeviceGroup) -> Vec<(String, BindingState)> {
        group.addresses().map(|addr| (addr.to_string(), self.current_driver(addr))).collect()
    }

    /// Whether every member already sits where `action` would put it.
    ///
    /// Callers use this to skip a privileged spawn; correctness never depends on it.
    pub fn is_settled(&self, group: &DeviceGroup, action: WorkerAction) -> bool {
        group.addresses().all(|addr| {
            let state = self.current_driver(addr);
            match action {
                WorkerAction::Bind => state.is_vfio(),
                WorkerAction::Unbind => {
                    matches!(state, BindingState::HostDriver(_) | BindingState::Unbound)
                }
            }
        })
    }
}

/// Resolve a device's driver symlink.
fn read_driver_link(device_path: &Path) -> BindingState {
    let driver_link = device_path.join("driver");
    match fs::read_link(&driver_link) {
        Ok(target) => match target.file_name() {
            Some(name) if name == VFIO_PCI_DRIVER => BindingState::VfioBound,
            Some(name) => BindingState::HostDriver(name.to_string_lossy().to_string()),
            None => BindingState::Unknown,
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {
            // No link: unbound if the device itself is still there
            if device_path.is_dir() {
                BindingState::Unbound
            } else {
                BindingState::Unknown
            }
        }
        Err(_) => BindingState::Unknown,
    }
}

/// Current driver binding for a PCI address under `/sys`.
pub fn current_driver(address: &str) -> BindingState {
    Inspector::default().current_driver(address)
}
