//! VFIO rebinding of PCI device groups.
//!
//! Moves a GPU and its IOMMU-group siblings between the host driver and
//! vfio-pci so the group can be handed to a VM and later returned.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  orchestrator process (long-lived)                          │
//! │                                                             │
//! │  Rebinder::bind / unbind(group)                             │
//! │  ├── ModuleGuard::ensure_vfio_loaded()   (bind only)        │
//! │  ├── WorkerInvocation::to_args()                            │
//! │  ├── spawn worker, wait ≤ 60s, SIGTERM/SIGKILL on overrun   │
//! │  └── Inspector::current_driver() on every member            │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │ argv / stdout / stderr / exit code
//! ┌──────────────────────────▼──────────────────────────────────┐
//! │  virtflow-worker (privileged, one per request)              │
//! │  └── Executor: unbind, driver_override, new_id, bind        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Safety
//!
//! - **Crash isolation**: every sysfs write happens in the worker. A kernel
//!   fault or hang during the rebind can take the worker down, never the caller.
//!
//! - **Group atomicity**: there is no entry point for a single function. A
//!   [`DeviceGroup`] always carries every member of its IOMMU group.
//!
//! - **No cached state**: [`BindingState`] is re-read from sysfs on every query.
//!
//! # Usage
//!
//! ```rust,ignore
//! use virtflow_core::{Config, Rebinder};
//!
//! let rebinder = Rebinder::new(&Config::load()?);
//! rebinder.bind(&group).await?;
//! // ... run the VM ...
//! rebinder.unbind(&group).await?;
//! ```

mod device;
mod executor;
mod inspect;
mod modules;
mod orchestrator;
mod protocol;

/// Kernel name of the passthrough driver.
pub const VFIO_PCI_DRIVER: &str = "vfio-pci";

pub use device::{is_valid_pci_address, DeviceGroup, HostDriver, PciFunction, Vendor};
pub use executor::{DeviceResult, ExecutionReport, Executor, DEFAULT_SETTLE};
pub use inspect::{current_driver, BindingState, Inspector, SYSFS_ROOT};
pub use modules::{
    ModuleGuard, ModuleLoader, Modprobe, DEFAULT_LOAD_TIMEOUT, NVIDIA_MODULES, VFIO_MODULES,
};
pub use orchestrator::{
    classify, RebindReport, Rebinder, WorkerCommand, DEFAULT_TERMINATION_GRACE,
    DEFAULT_WORKER_TIMEOUT,
};
pub use protocol::{
    decode_device, encode_device, WorkerAction, WorkerInvocation, WorkerOutcome, WorkerRequest,
    EXIT_FAILURE, EXIT_SUCCESS, EXIT_USAGE, PROGRESS_PREFIX,
};
