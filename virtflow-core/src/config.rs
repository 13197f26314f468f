//! Configuration management.

use crate::error::{Result, VirtflowError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persistent configuration for virtflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker executable.
    pub worker_path: PathBuf,
    /// Argv prefix that runs the worker with privilege (`sudo -n`).
    pub privilege_launcher: Vec<String>,
    pub worker_timeout_secs: u64,
    /// SIGTERM to SIGKILL delay for a timed-out worker.
    pub termination_grace_ms: u64,
    pub module_load_timeout_secs: u64,
    /// Module load command; the module name is appended.
    pub modprobe_command: Vec<String>,
    pub sysfs_root: PathBuf,
    pub proc_modules: PathBuf,
    /// Re-read driver links after the worker reports success.
    pub verify_after_run: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let (launcher, modprobe): (&[&str], &[&str]) = if paths::is_root() {
            (&[], &["modprobe"])
        } else {
            (&["sudo", "-n"], &["sudo", "-n", "modprobe"])
        };

        Self {
            worker_path: paths::worker_path(),
            privilege_launcher: launcher.iter().map(|s| s.to_string()).collect(),
            worker_timeout_secs: 60,
            termination_grace_ms: 2000,
            module_load_timeout_secs: 5,
            modprobe_command: modprobe.iter().map(|s| s.to_string()).collect(),
            sysfs_root: PathBuf::from("/sys"),
            proc_modules: PathBuf::from("/proc/modules"),
            verify_after_run: true,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_path()
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`; defaults if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| VirtflowError::IoError { path: path.to_path_buf(), source: e })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            VirtflowError::InvalidConfig { reason: format!("Failed to parse {}: {}", path.display(), e) }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VirtflowError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| VirtflowError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(&path, content).map_err(|e| VirtflowError::IoError { path, source: e })
    }

    fn validate(&self) -> Result<()> {
        if self.worker_timeout_secs == 0 {
            return Err(VirtflowError::InvalidConfig {
                reason: "worker_timeout_secs must be greater than 0".to_string(),
            });
        }
        if self.modprobe_command.is_empty() {
            return Err(VirtflowError::InvalidConfig {
                reason: "modprobe_command must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
