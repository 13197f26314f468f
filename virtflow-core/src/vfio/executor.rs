//! Worker-side rebind executor.
//!
//! This is the only code that writes to the kernel's driver-binding files. It
//! runs inside the disposable `virtflow-worker` process, never inside the
//! orchestrator, so a kernel fault or hang here cannot take the caller down.
//!
//! # Bind
//!
//! If any NVIDIA function is not on vfio-pci yet, the NVIDIA driver modules
//! are unloaded first (best effort), so `nvidia_drm` and friends release the
//! card. Then, per device:
//!
//! 1. Unbind from the current host driver
//! 2. Set `driver_override` and re-probe (if the kernel supports it)
//! 3. Otherwise register vendor:device with vfio-pci (`new_id`) and bind
//! 4. Re-read the driver link; stop at the first device that did not move
//!
//! # Unbind, per device
//!
//! 1. Clear `driver_override`, unbind from vfio-pci, drop the `new_id` entry
//! 2. Bind to the host driver, or let the kernel match via `drivers_probe`
//! 3. Success as long as the device is no longer on vfio-pci

use crate::vfio::device::{vendor, HostDriver, PciFunction};
use crate::vfio::inspect::{BindingState, Inspector};
use crate::vfio::modules::{ModuleLoader, NVIDIA_MODULES};
use crate::vfio::protocol::{WorkerRequest, EXIT_FAILURE, EXIT_SUCCESS, PROGRESS_PREFIX};
use crate::vfio::VFIO_PCI_DRIVER;
use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default pause after each kernel write, giving the driver core time to settle.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(300);

/// Final state of one device after the executor ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceResult {
    pub address: String,
    pub state: BindingState,
    pub ok: bool,
}

/// Aggregate result of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub results: Vec<DeviceResult>,
    /// Devices never attempted because an earlier device failed.
    pub skipped: Vec<String>,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.skipped.is_empty() && self.results.iter().all(|r| r.ok)
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        }
    }
}

/// Progress narrative on the worker's stdout.
struct Progress<'w> {
    out: &'w mut (dyn Write + Send),
}

impl Progress<'_> {
    fn line(&mut self, message: impl Display) {
        // stdout is best effort; a closed pipe must not fail the rebind
        let _ = writeln!(self.out, "{} {}", PROGRESS_PREFIX, message);
        let _ = self.out.flush();
    }
}

/// Performs driver rebinds against a sysfs tree.
#[derive(Clone)]
pub struct Executor {
    inspector: Inspector,
    settle: Duration,
    modules: Option<Arc<dyn ModuleLoader>>,
}

impl Executor {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self { inspector: Inspector::new(sysfs_root), settle: DEFAULT_SETTLE, modules: None }
    }

    /// Pause after each kernel write.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Loader used to bring the host driver back before an unbind.
    pub fn with_module_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.modules = Some(loader);
        self
    }

    /// Run a decoded request, narrating progress to `out`.
    pub async fn execute(
        &self,
        request: &WorkerRequest,
        out: &mut (dyn Write + Send),
    ) -> ExecutionReport {
        let mut progress = Progress { out };
        let report = match request {
            WorkerRequest::Bind { devices } => self.bind_all(devices, &mut progress).await,
            WorkerRequest::Unbind { host_driver, addresses } => {
                self.unbind_all(*host_driver, addresses, &mut progress).await
            }
        };

        if report.succeeded() {
            progress.line(format_args!(
                "{} complete for {} device(s)",
                request.action(),
                report.results.len()
            ));
        } else {
            progress.line(format_args!("{} failed", request.action()));
        }
        report
    }

    async fn bind_all(&self, devices: &[PciFunction], p: &mut Progress<'_>) -> ExecutionReport {
        p.line(format_args!("Starting VFIO bind for {} device(s)", devices.len()));
        self.release_nvidia(devices, p).await;
        let mut report = ExecutionReport::default();

        for (i, device) in devices.iter().enumerate() {
            let result = self.bind_device(device, p).await;
            let ok = result.ok;
            report.results.push(result);

            if !ok {
                // Stop at the first failure; later siblings stay untouched
                report.skipped =
                    devices[i + 1..].iter().map(|d| d.address().to_string()).collect();
                for addr in &report.skipped {
                    p.line(format_args!("{}: skipped", addr));
                }
                break;
            }
        }
        report
    }

    /// Unload the NVIDIA modules if an NVIDIA function still has to move.
    async fn release_nvidia(&self, devices: &[PciFunction], p: &mut Progress<'_>) {
        let Some(loader) = &self.modules else {
            return;
        };
        let pending = devices.iter().any(|d| {
            d.vendor_id() == vendor::NVIDIA && !self.inspector.current_driver(d.address()).is_vfio()
        });
        if !pending {
            return;
        }

        for module in NVIDIA_MODULES {
            match loader.unload(module).await {
                Ok(()) => p.line(format_args!("Unloaded {}", module)),
                Err(e) => {
                    debug!(module = %module, error = %e, "NVIDIA module not unloaded");
                    p.line(format_args!("Could not unload {}: {}", module, e));
                }
            }
        }
        self.settle().await;
    }

    async fn bind_device(&self, device: &PciFunction, p: &mut Progress<'_>) -> DeviceResult {
        let addr = device.address();
        let device_path = self.inspector.device_path(addr);
        p.line(format_args!("{}: processing", addr));

        if !device_path.is_dir() {
            p.line(format_args!("{}: device not present", addr));
            return DeviceResult { address: addr.to_string(), state: BindingState::Unknown, ok: false };
        }

        match self.inspector.current_driver(addr) {
            BindingState::VfioBound => {
                p.line(format_args!("{}: already bound to {}", addr, VFIO_PCI_DRIVER));
                return DeviceResult {
                    address: addr.to_string(),
                    state: BindingState::VfioBound,
                    ok: true,
                };
            }
            BindingState::HostDriver(driver) => {
                p.line(format_args!("{}: unbinding from {}", addr, driver));
                if let Err(e) = write_attr(&device_path.join("driver/unbind"), addr) {
                    p.line(format_args!("{}: unbind from {} failed: {}", addr, driver, e));
                }
                self.settle().await;
            }
            BindingState::Unbound => p.line(format_args!("{}: no driver bound", addr)),
            BindingState::Unknown => p.line(format_args!("{}: driver state unknown", addr)),
        }

        if self.bind_via_override(addr, &device_path, p).await {
            return self.finish_bind(addr, p);
        }

        self.register_device_id(device, p).await;
        if !self.inspector.current_driver(addr).is_vfio() {
            p.line(format_args!("{}: binding to {}", addr, VFIO_PCI_DRIVER));
            let bind_path = self.inspector.driver_path(VFIO_PCI_DRIVER).join("bind");
            if let Err(e) = write_attr(&bind_path, addr) {
                // new_id may already have auto-bound it; the re-read below decides
                debug!(address = %addr, error = %e, "vfio-pci bind write failed");
                p.line(format_args!("{}: bind write failed: {}", addr, e));
            }
            self.settle().await;
        }

        self.finish_bind(addr, p)
    }

    /// Try `driver_override` + `drivers_probe`. Returns true if now on vfio-pci.
    async fn bind_via_override(&self, addr: &str, device_path: &Path, p: &mut Progress<'_>) -> bool {
        let override_path = device_path.join("driver_override");
        if !override_path.exists() {
            return false;
        }

        p.line(format_args!("{}: setting driver_override to {}", addr, VFIO_PCI_DRIVER));
        if let Err(e) = write_attr(&override_path, VFIO_PCI_DRIVER) {
            p.line(format_args!("{}: driver_override failed: {}", addr, e));
            return false;
        }

        let probe_path = self.inspector.sysfs_root().join("bus/pci/drivers_probe");
        if let Err(e) = write_attr(&probe_path, addr) {
            p.line(format_args!("{}: drivers_probe failed: {}", addr, e));
        }
        self.settle().await;

        self.inspector.current_driver(addr).is_vfio()
    }

    /// Register vendor:device with vfio-pci so the kernel will match it.
    async fn register_device_id(&self, device: &PciFunction, p: &mut Progress<'_>) {
        let new_id_path = self.inspector.driver_path(VFIO_PCI_DRIVER).join("new_id");
        let id_string = format!("{} {}", device.vendor_id(), device.device_id());
        p.line(format_args!(
            "{}: registering {}:{} with {}",
            device.address(),
            device.vendor_id(),
            device.device_id(),
            VFIO_PCI_DRIVER
        ));

        match write_attr(&new_id_path, &id_string) {
            Ok(()) => {}
            Err(e) if is_already_registered(&e) => {
                debug!(id = %id_string, "Device ID already registered with vfio-pci");
            }
            Err(e) => p.line(format_args!("{}: new_id failed: {}", device.address(), e)),
        }
        self.settle().await;
    }

    fn finish_bind(&self, addr: &str, p: &mut Progress<'_>) -> DeviceResult {
        let state = self.inspector.current_driver(addr);
        let ok = state.is_vfio();
        if ok {
            p.line(format_args!("{}: bound to {}", addr, VFIO_PCI_DRIVER));
        } else {
            p.line(format_args!("{}: failed to bind to {} ({})", addr, VFIO_PCI_DRIVER, state));
        }
        DeviceResult { address: addr.to_string(), state, ok }
    }

    async fn unbind_all(
        &self,
        host_driver: HostDriver,
        addresses: &[String],
        p: &mut Progress<'_>,
    ) -> ExecutionReport {
        p.line(format_args!(
            "Starting VFIO unbind for {} device(s), restoring {}",
            addresses.len(),
            host_driver
        ));
        self.ensure_host_driver(host_driver, p).await;

        // Unbind keeps going past failed devices
        let mut report = ExecutionReport::default();
        for addr in addresses {
            report.results.push(self.unbind_device(addr, host_driver, p).await);
        }
        report
    }

    /// Load the host driver module if its sysfs directory is missing.
    async fn ensure_host_driver(&self, host_driver: HostDriver, p: &mut Progress<'_>) {
        if self.inspector.driver_path(host_driver.as_str()).exists() {
            return;
        }
        let Some(loader) = &self.modules else {
            return;
        };

        p.line(format_args!("Loading {} driver", host_driver));
        if let Err(e) = loader.load(host_driver.as_str()).await {
            warn!(driver = %host_driver, error = %e, "Could not load host driver");
            p.line(format_args!("Could not load {}: {}", host_driver, e));
        }
    }

    async fn unbind_device(
        &self,
        addr: &str,
        host_driver: HostDriver,
        p: &mut Progress<'_>,
    ) -> DeviceResult {
        let device_path = self.inspector.device_path(addr);
        p.line(format_args!("{}: processing", addr));

        if !device_path.is_dir() {
            p.line(format_args!("{}: device not present", addr));
            return DeviceResult { address: addr.to_string(), state: BindingState::Unknown, ok: false };
        }

        let override_path = device_path.join("driver_override");
        if override_path.exists() {
            if let Err(e) = write_attr(&override_path, "\n") {
                p.line(format_args!("{}: clearing driver_override failed: {}", addr, e));
            }
        }

        if self.inspector.current_driver(addr).is_vfio() {
            p.line(format_args!("{}: unbinding from {}", addr, VFIO_PCI_DRIVER));
            if let Err(e) = write_attr(&device_path.join("driver/unbind"), addr) {
                p.line(format_args!("{}: unbind from {} failed: {}", addr, VFIO_PCI_DRIVER, e));
            }
            self.settle().await;
        }

        self.remove_device_id(addr, &device_path);

        if !matches!(self.inspector.current_driver(addr), BindingState::HostDriver(_)) {
            p.line(format_args!("{}: binding to {}", addr, host_driver));
            let bind_path = self.inspector.driver_path(host_driver.as_str()).join("bind");
            if let Err(e) = write_attr(&bind_path, addr) {
                // Siblings (audio, USB) belong to other drivers; let the kernel match them
                p.line(format_args!("{}: {} refused ({}), probing", addr, host_driver, e));
                let probe_path = self.inspector.sysfs_root().join("bus/pci/drivers_probe");
                if let Err(e) = write_attr(&probe_path, addr) {
                    p.line(format_args!("{}: drivers_probe failed: {}", addr, e));
                }
            }
            self.settle().await;
        }

        let state = self.inspector.current_driver(addr);
        let ok = !matches!(state, BindingState::VfioBound | BindingState::Unknown);
        if ok {
            p.line(format_args!("{}: restored ({})", addr, state));
        } else {
            p.line(format_args!("{}: failed to leave {} ({})", addr, VFIO_PCI_DRIVER, state));
        }
        DeviceResult { address: addr.to_string(), state, ok }
    }

    /// Drop the dynamic ID so vfio-pci does not reclaim the device on probe.
    fn remove_device_id(&self, addr: &str, device_path: &Path) {
        let remove_id_path = self.inspector.driver_path(VFIO_PCI_DRIVER).join("remove_id");
        if !remove_id_path.exists() {
            return;
        }

        let (Some(vendor_id), Some(device_id)) =
            (read_id(&device_path.join("vendor")), read_id(&device_path.join("device")))
        else {
            return;
        };

        if let Err(e) = write_attr(&remove_id_path, &format!("{} {}", vendor_id, device_id)) {
            // ENODEV: the ID was never registered dynamically
            debug!(address = %addr, error = %e, "remove_id write failed");
        }
    }

    async fn settle(&self) {
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
    }
}

/// Write a sysfs attribute. Never creates files.
fn write_attr(path: &Path, value: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(value.as_bytes())
}

/// Read a `0x10de`-style ID file as `10de`.
fn read_id(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().trim_start_matches("0x").to_ascii_lowercase())
        .filter(|s| !s.is_empty())
}

/// `new_id` answers EEXIST or EBUSY when the ID is already known.
fn is_already_registered(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EEXIST) | Some(libc::EBUSY))
}
