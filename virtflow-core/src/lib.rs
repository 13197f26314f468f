//! virtflow core library
//!
//! Crash-isolated rebinding of PCI device groups between their host drivers
//! and vfio-pci, for GPU passthrough to virtual machines.

pub mod config;
pub mod error;
pub mod observability;
pub mod paths;
pub mod vfio;

// Re-export commonly used items
pub use config::Config;
pub use error::{BindError, ModelError, ModuleError, ProtocolError, Result, VirtflowError};
pub use observability::init as init_observability;
pub use vfio::{
    current_driver, BindingState, DeviceGroup, HostDriver, Inspector, PciFunction, RebindReport,
    Rebinder, Vendor,
};
