//! VFIO kernel module availability.
//!
//! Binding fails deterministically at the worker stage when vfio-pci is not
//! loaded, so the orchestrator runs [`ModuleGuard::ensure_vfio_loaded`] before
//! every bind. The check is cheap and idempotent.

use crate::error::ModuleError;
use crate::vfio::inspect::SYSFS_ROOT;
use crate::vfio::VFIO_PCI_DRIVER;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Modules required for vfio-pci, in dependency order.
pub const VFIO_MODULES: [&str; 3] = ["vfio", "vfio_iommu_type1", "vfio_pci"];

/// NVIDIA driver modules, in removal order (dependents first).
pub const NVIDIA_MODULES: [&str; 4] = ["nvidia_uvm", "nvidia_drm", "nvidia_modeset", "nvidia"];

/// Module name of the passthrough driver as listed in /proc/modules.
const VFIO_PCI_MODULE: &str = "vfio_pci";

/// Default per-module load timeout.
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of truth for loaded kernel modules, and a way to load more.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Names of currently loaded modules.
    async fn loaded_modules(&self) -> Result<HashSet<String>, ModuleError>;

    /// Load one module. All-or-nothing per module.
    async fn load(&self, module: &str) -> Result<(), ModuleError>;

    /// Unload one module.
    async fn unload(&self, module: &str) -> Result<(), ModuleError>;
}

/// Loads modules with modprobe, reads loaded ones from /proc/modules.
#[derive(Debug, Clone)]
pub struct Modprobe {
    /// Command prefix; the module name is appended (e.g. `sudo -n modprobe`).
    command: Vec<String>,
    proc_modules: PathBuf,
    timeout: Duration,
}

impl Modprobe {
    pub fn new(command: Vec<String>, proc_modules: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self { command, proc_modules: proc_modules.into(), timeout }
    }
}

impl Default for Modprobe {
    fn default() -> Self {
        Self::new(vec!["modprobe".to_string()], "/proc/modules", DEFAULT_LOAD_TIMEOUT)
    }
}

#[async_trait]
impl ModuleLoader for Modprobe {
    async fn loaded_modules(&self) -> Result<HashSet<String>, ModuleError> {
        let content = tokio::fs::read_to_string(&self.proc_modules).await.map_err(|e| {
            ModuleError::QueryFailed { path: self.proc_modules.clone(), source: e }
        })?;

        Ok(content
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    async fn load(&self, module: &str) -> Result<(), ModuleError> {
        self.run(&[], module).await.map_err(|failure| match failure {
            Failure::TimedOut => {
                ModuleError::LoadTimedOut { module: module.to_string(), after: self.timeout }
            }
            Failure::Failed(reason) => {
                ModuleError::LoadFailed { module: module.to_string(), reason }
            }
        })
    }

    async fn unload(&self, module: &str) -> Result<(), ModuleError> {
        self.run(&["-r"], module).await.map_err(|failure| match failure {
            Failure::TimedOut => {
                ModuleError::UnloadTimedOut { module: module.to_string(), after: self.timeout }
            }
            Failure::Failed(reason) => {
                ModuleError::UnloadFailed { module: module.to_string(), reason }
            }
        })
    }
}

/// Why one modprobe run did not succeed.
enum Failure {
    TimedOut,
    Failed(String),
}

impl Modprobe {
    /// Run the modprobe command with `flags` and `module`, bounded by the timeout.
    async fn run(&self, flags: &[&str], module: &str) -> Result<(), Failure> {
        let (program, prefix) = self
            .command
            .split_first()
            .ok_or_else(|| Failure::Failed("empty modprobe command".to_string()))?;

        debug!(module = %module, command = ?self.command, flags = ?flags, "Running modprobe");

        let output = Command::new(program)
            .args(prefix)
            .args(flags)
            .arg(module)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| Failure::TimedOut)?
            .map_err(|e| Failure::Failed(e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Failure::Failed(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }
}

/// Makes sure vfio-pci is available before a bind.
#[derive(Clone)]
pub struct ModuleGuard {
    loader: Arc<dyn ModuleLoader>,
    vfio_driver_path: PathBuf,
}

impl ModuleGuard {
    pub fn new(loader: Arc<dyn ModuleLoader>, sysfs_root: impl Into<PathBuf>) -> Self {
        let vfio_driver_path = sysfs_root.into().join("bus/pci/drivers").join(VFIO_PCI_DRIVER);
        Self { loader, vfio_driver_path }
    }

    pub fn loader(&self) -> &Arc<dyn ModuleLoader> {
        &self.loader
    }

    /// Whether vfio-pci is usable, either as a loaded module or built in.
    pub async fn vfio_available(&self) -> bool {
        if self.vfio_driver_path.exists() {
            return true;
        }
        match self.loader.loaded_modules().await {
            Ok(modules) => modules.contains(VFIO_PCI_MODULE),
            Err(e) => {
                debug!(error = %e, "Could not list loaded modules");
                false
            }
        }
    }

    /// Load the VFIO modules if vfio-pci is missing.
    ///
    /// Every module is attempted even after a failure. The error is soft: the
    /// caller logs it and may still try to bind.
    pub async fn ensure_vfio_loaded(&self) -> Result<(), ModuleError> {
        if self.vfio_available().await {
            debug!("vfio-pci already available");
            return Ok(());
        }

        info!("Loading VFIO modules");
        let mut failed = Vec::new();
        for module in VFIO_MODULES {
            if let Err(e) = self.loader.load(module).await {
                warn!(module = %module, error = %e, "Failed to load kernel module");
                failed.push(module.to_string());
            }
        }

        if self.vfio_available().await {
            info!("VFIO modules loaded");
            Ok(())
        } else {
            warn!(failed = ?failed, "vfio-pci still unavailable");
            Err(ModuleError::StillMissing { failed })
        }
    }
}

impl Default for ModuleGuard {
    fn default() -> Self {
        Self::new(Arc::new(Modprobe::default()), SYSFS_ROOT)
    }
}
