//! Centralized path configuration for virtflow.
//!
//! All installation paths go through this module so the CLI, the worker and
//! embedding applications agree on where things live.

use std::path::PathBuf;

/// Installed location of the worker when nothing else is found.
pub const DEFAULT_WORKER_PATH: &str = "/usr/libexec/virtflow/virtflow-worker";

/// File name of the worker binary.
pub const WORKER_BINARY: &str = "virtflow-worker";

/// Get the virtflow configuration directory.
///
/// Resolution order:
/// 1. `VIRTFLOW_CONFIG_DIR` environment variable
/// 2. `$XDG_CONFIG_HOME/virtflow` (or platform equivalent)
/// 3. `/etc/virtflow`
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VIRTFLOW_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir().map(|d| d.join("virtflow")).unwrap_or_else(|| PathBuf::from("/etc/virtflow"))
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Get the worker binary path.
///
/// Resolution order:
/// 1. `VIRTFLOW_WORKER` environment variable
/// 2. `virtflow-worker` next to the running executable
/// 3. `/usr/libexec/virtflow/virtflow-worker`
pub fn worker_path() -> PathBuf {
    if let Ok(path) = std::env::var("VIRTFLOW_WORKER") {
        return PathBuf::from(path);
    }

    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY)))
        .filter(|path| path.exists());

    sibling.unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_PATH))
}

/// Whether the current process runs as root.
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}
