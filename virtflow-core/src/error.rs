//! Error types for virtflow.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Rebind failures keep infrastructure problems (`LaunchFailed`) apart from
//! kernel or hardware rejections (`Timeout`, `WorkerFailed`), since only the
//! former is worth retrying without an operator looking at the device first.

use crate::vfio::BindingState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for configuration and filesystem operations.
pub type Result<T> = std::result::Result<T, VirtflowError>;

/// General error type for configuration and I/O.
#[derive(Error, Debug)]
pub enum VirtflowError {
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Rejected device or group description.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Invalid PCI address format: {address} (expected: 0000:01:00.0)")]
    InvalidAddress { address: String },

    #[error("Invalid PCI {field} ID: {value} (expected 4 hex digits)")]
    InvalidId { field: &'static str, value: String },

    #[error("Unknown vendor '{0}' (expected nvidia, amd or other)")]
    UnknownVendor(String),

    #[error("Device group {name:?} has no member functions")]
    EmptyGroup { name: String },

    #[error("Device group {name:?} lists {address} more than once")]
    DuplicateAddress { name: String, address: String },
}

/// Malformed worker argument vector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("No operation specified")]
    MissingAction,

    #[error("Unknown operation '{0}'")]
    UnknownAction(String),

    #[error("Malformed device argument '{arg}': {reason}")]
    MalformedDevice { arg: String, reason: String },

    #[error("No driver name specified")]
    MissingHostDriver,

    #[error("Unknown host driver '{0}' (expected nvidia, amdgpu or nouveau)")]
    UnknownHostDriver(String),

    #[error("No devices specified")]
    NoDevices,
}

/// Kernel module loading failures. These are soft: callers log them and carry on.
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Failed to read loaded modules from {path:?}: {source}")]
    QueryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load kernel module {module}: {reason}")]
    LoadFailed { module: String, reason: String },

    #[error("Loading kernel module {module} timed out after {after:?}")]
    LoadTimedOut { module: String, after: Duration },

    #[error("Failed to unload kernel module {module}: {reason}")]
    UnloadFailed { module: String, reason: String },

    #[error("Unloading kernel module {module} timed out after {after:?}")]
    UnloadTimedOut { module: String, after: Duration },

    #[error("vfio-pci still unavailable after module loading (failed: {})", failed.join(", "))]
    StillMissing { failed: Vec<String> },
}

/// Outcome classification of a failed bind/unbind call.
///
/// Failures after the worker started carry the module guard's warning, if the
/// VFIO modules could not be confirmed before a bind.
#[derive(Error, Debug)]
pub enum BindError {
    #[error("Failed to launch worker {program:?}: {source}")]
    LaunchFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker timed out after {after:?}; group state is indeterminate")]
    Timeout { after: Duration, module_warning: Option<Arc<ModuleError>> },

    #[error("Worker failed with exit code {code}: {}", stderr.trim())]
    WorkerFailed { code: i32, stderr: String, module_warning: Option<Arc<ModuleError>> },

    #[error("Device {address} is {state} after the worker reported success")]
    VerificationFailed {
        address: String,
        state: BindingState,
        module_warning: Option<Arc<ModuleError>>,
    },
}

impl BindError {
    /// Whether retrying without inspecting the hardware is sensible.
    ///
    /// Only a launch failure qualifies: nothing touched the kernel. After a
    /// timeout or worker failure the group may be half-bound.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LaunchFailed { .. })
    }

    /// The module guard's warning from before the worker ran, if any.
    pub fn module_warning(&self) -> Option<&ModuleError> {
        match self {
            Self::LaunchFailed { .. } => None,
            Self::Timeout { module_warning, .. }
            | Self::WorkerFailed { module_warning, .. }
            | Self::VerificationFailed { module_warning, .. } => module_warning.as_deref(),
        }
    }

    /// Attach the module guard's warning to a post-launch failure.
    pub(crate) fn with_module_warning(mut self, warning: Option<Arc<ModuleError>>) -> Self {
        match &mut self {
            Self::LaunchFailed { .. } => {}
            Self::Timeout { module_warning, .. }
            | Self::WorkerFailed { module_warning, .. }
            | Self::VerificationFailed { module_warning, .. } => *module_warning = warning,
        }
        self
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LaunchFailed { .. } => "launch_failed",
            Self::Timeout { .. } => "timeout",
            Self::WorkerFailed { .. } => "worker_failed",
            Self::VerificationFailed { .. } => "verification_failed",
        }
    }
}
