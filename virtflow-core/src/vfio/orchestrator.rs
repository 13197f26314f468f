//! Rebind orchestrator.
//!
//! The orchestrator never writes to sysfs itself. Each bind/unbind spawns a
//! fresh `virtflow-worker` process, waits for it under a hard timeout, and then
//! checks the result against the kernel's driver links rather than trusting
//! the worker's word.

use crate::config::Config;
use crate::error::{BindError, ModuleError};
use crate::vfio::device::DeviceGroup;
use crate::vfio::inspect::{BindingState, Inspector};
use crate::vfio::modules::{ModuleGuard, ModuleLoader, Modprobe};
use crate::vfio::protocol::{WorkerAction, WorkerInvocation, WorkerOutcome};
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Hard limit on one worker run.
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(60);

/// Delay between SIGTERM and SIGKILL for a worker that overran its timeout.
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for output pipes after the worker is gone.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Successful rebind.
#[derive(Debug, Clone)]
pub struct RebindReport {
    pub action: WorkerAction,
    pub group: String,
    pub outcome: WorkerOutcome,
    /// Set when the VFIO modules could not be confirmed before a bind.
    pub module_warning: Option<Arc<ModuleError>>,
    /// Member states after the run (empty if verification is disabled).
    pub states: Vec<(String, BindingState)>,
}

/// How the worker is started: an optional privilege launcher, then the worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    /// Argv prefix, e.g. `["sudo", "-n"]`. Empty runs the worker directly.
    pub launcher: Vec<String>,
}

impl WorkerCommand {
    fn build(&self, args: &[String]) -> Command {
        let mut command = match self.launcher.split_first() {
            Some((launcher, launcher_args)) => {
                let mut c = Command::new(launcher);
                c.args(launcher_args).arg(&self.program);
                c
            }
            None => Command::new(&self.program),
        };
        command.args(args);
        command
    }

    /// What the launch error should name: the first thing we tried to exec.
    fn exec_target(&self) -> PathBuf {
        self.launcher.first().map(PathBuf::from).unwrap_or_else(|| self.program.clone())
    }
}

type LockMap = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Per-address exclusion.
///
/// A call holds the locks of every member address for its whole duration, so
/// two calls touching overlapping addresses never interleave while disjoint
/// groups proceed in parallel. Locks are taken in sorted order. An entry is
/// dropped from the map once nobody holds or waits on it.
#[derive(Debug, Default)]
struct AddressLocks {
    locks: LockMap,
}

/// Locks held for one call; releases and prunes on drop.
struct HeldLocks {
    guards: Vec<OwnedMutexGuard<()>>,
    addresses: Vec<String>,
    locks: LockMap,
}

impl AddressLocks {
    async fn acquire(&self, group: &DeviceGroup) -> HeldLocks {
        let mut addresses: Vec<String> = group.addresses().map(str::to_string).collect();
        addresses.sort_unstable();

        let handles: Vec<Arc<Mutex<()>>> = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            addresses.iter().map(|addr| locks.entry(addr.clone()).or_default().clone()).collect()
        };

        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }
        HeldLocks { guards, addresses, locks: self.locks.clone() }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        self.guards.clear();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        for addr in &self.addresses {
            // Only the map's own reference left: no holder, no waiter
            if locks.get(addr).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(addr);
            }
        }
    }
}

/// Entry point for bind/unbind requests.
pub struct Rebinder {
    worker: WorkerCommand,
    timeout: Duration,
    termination_grace: Duration,
    guard: ModuleGuard,
    inspector: Inspector,
    verify: bool,
    locks: AddressLocks,
}

impl Rebinder {
    /// Build from configuration.
    pub fn new(config: &Config) -> Self {
        let loader = Modprobe::new(
            config.modprobe_command.clone(),
            &config.proc_modules,
            Duration::from_secs(config.module_load_timeout_secs),
        );

        Self {
            worker: WorkerCommand {
                program: config.worker_path.clone(),
                launcher: config.privilege_launcher.clone(),
            },
            timeout: Duration::from_secs(config.worker_timeout_secs),
            termination_grace: Duration::from_millis(config.termination_grace_ms),
            guard: ModuleGuard::new(Arc::new(loader), &config.sysfs_root),
            inspector: Inspector::new(&config.sysfs_root),
            verify: config.verify_after_run,
            locks: AddressLocks::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    pub fn with_launcher(mut self, launcher: Vec<String>) -> Self {
        self.worker.launcher = launcher;
        self
    }

    pub fn with_module_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.guard = ModuleGuard::new(loader, self.inspector.sysfs_root());
        self
    }

    pub fn inspector(&self) -> &Inspector {
        &self.inspector
    }

    pub fn module_guard(&self) -> &ModuleGuard {
        &self.guard
    }

    /// Current binding of one address. Always re-read from sysfs.
    pub fn current_driver(&self, address: &str) -> BindingState {
        self.inspector.current_driver(address)
    }

    /// Move a whole group onto vfio-pci.
    #[instrument(skip(self, group), fields(group = %group.display_name()))]
    pub async fn bind(&self, group: &DeviceGroup) -> Result<RebindReport, BindError> {
        let _locks = self.locks.acquire(group).await;
        info!(devices = group.members().len(), "Binding group to vfio-pci");

        let module_warning = match self.guard.ensure_vfio_loaded().await {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "VFIO modules not confirmed loaded; bind will likely fail");
                Some(Arc::new(e))
            }
        };

        match self.run(WorkerInvocation::bind(group)).await {
            Ok(mut report) => {
                report.module_warning = module_warning;
                Ok(report)
            }
            Err(e) => Err(e.with_module_warning(module_warning)),
        }
    }

    /// Return a whole group to its host driver.
    #[instrument(skip(self, group), fields(group = %group.display_name()))]
    pub async fn unbind(&self, group: &DeviceGroup) -> Result<RebindReport, BindError> {
        let _locks = self.locks.acquire(group).await;
        info!(
            devices = group.members().len(),
            host_driver = %group.host_driver(),
            "Restoring group to host driver"
        );
        self.run(WorkerInvocation::unbind(group)).await
    }

    async fn run(&self, invocation: WorkerInvocation<'_>) -> Result<RebindReport, BindError> {
        let action = invocation.action;
        let start = Instant::now();

        let result = self
            .spawn_and_wait(&invocation.to_args())
            .await
            .and_then(|outcome| classify(outcome, self.timeout))
            .and_then(|outcome| self.verify(invocation.group, action, outcome));

        let label = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        metrics::counter!("virtflow_rebind_total", "action" => action.as_str(), "outcome" => label)
            .increment(1);
        metrics::histogram!("virtflow_rebind_duration_seconds", "action" => action.as_str())
            .record(start.elapsed().as_secs_f64());

        match &result {
            Ok(_) => info!(action = %action, elapsed = ?start.elapsed(), "Rebind succeeded"),
            Err(e) => error!(action = %action, error = %e, "Rebind failed"),
        }
        result
    }

    /// Spawn the worker and wait for it, bounded by the timeout.
    async fn spawn_and_wait(&self, args: &[String]) -> Result<WorkerOutcome, BindError> {
        let mut command = self.worker.build(args);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group: terminal signals aimed at us do not reach it,
            // and a timeout can signal the launcher and worker together
            .process_group(0)
            .kill_on_drop(true);

        debug!(program = ?self.worker.program, launcher = ?self.worker.launcher, args = ?args, "Launching worker");

        let mut child = command.spawn().map_err(|e| BindError::LaunchFailed {
            program: self.worker.exec_target(),
            source: e,
        })?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.kill().await;
                return Err(BindError::LaunchFailed {
                    program: self.worker.exec_target(),
                    source: std::io::Error::other("worker output pipes unavailable"),
                });
            }
        };

        let stdout_task = tokio::spawn(log_lines(stdout));
        let stderr_task = tokio::spawn(read_all(stderr));

        let (status, timed_out) = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => (status.ok(), false),
            Err(_) => {
                warn!(timeout = ?self.timeout, pid = ?child.id(), "Worker timed out, terminating");
                (terminate(&mut child, self.termination_grace).await, true)
            }
        };

        let stdout_lines = join_pipe(stdout_task).await.unwrap_or_default();
        let stderr = join_pipe(stderr_task).await.unwrap_or_default();

        Ok(WorkerOutcome {
            exit_code: status.map(exit_code).unwrap_or(-1),
            stdout_lines,
            stderr,
            timed_out,
        })
    }

    /// Re-read every member's driver link after a successful run.
    fn verify(
        &self,
        group: &DeviceGroup,
        action: WorkerAction,
        outcome: WorkerOutcome,
    ) -> Result<RebindReport, BindError> {
        let mut report = RebindReport {
            action,
            group: group.display_name().to_string(),
            outcome,
            module_warning: None,
            states: Vec::new(),
        };
        if !self.verify {
            return Ok(report);
        }

        for (address, state) in self.inspector.group_states(group) {
            let reached = match (action, &state) {
                (WorkerAction::Bind, state) => state.is_vfio(),
                (WorkerAction::Unbind, BindingState::VfioBound) => false,
                (WorkerAction::Unbind, BindingState::Unknown) => {
                    warn!(address = %address, "Cannot confirm device left vfio-pci");
                    true
                }
                (WorkerAction::Unbind, _) => true,
            };
            if !reached {
                return Err(BindError::VerificationFailed { address, state, module_warning: None });
            }
            report.states.push((address, state));
        }
        Ok(report)
    }
}

/// Turn a finished worker run into success or a tagged failure.
pub fn classify(outcome: WorkerOutcome, timeout: Duration) -> Result<WorkerOutcome, BindError> {
    if outcome.timed_out {
        return Err(BindError::Timeout { after: timeout, module_warning: None });
    }
    if outcome.succeeded() {
        Ok(outcome)
    } else {
        Err(BindError::WorkerFailed {
            code: outcome.exit_code,
            stderr: outcome.stderr,
            module_warning: None,
        })
    }
}

/// SIGTERM the worker's process group, then SIGKILL it after the grace period.
///
/// The direct child may be a launcher (`sudo`) rather than the worker, so both
/// signals go to the whole group.
async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let pgid = child.id().map(|pid| pid as libc::pid_t);
    if let Some(pgid) = pgid {
        signal_group(pgid, libc::SIGTERM);
    }

    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            warn!("Worker ignored SIGTERM, killing");
            None
        }
    };

    // The launcher may have exited while the worker behind it ignored SIGTERM
    if let Some(pgid) = pgid {
        signal_group(pgid, libc::SIGKILL);
    }

    match status {
        Some(status) => Some(status),
        None => {
            if let Err(e) = child.kill().await {
                error!(error = %e, "Failed to kill worker");
            }
            child.wait().await.ok()
        }
    }
}

fn signal_group(pgid: libc::pid_t, signal: libc::c_int) {
    // SAFETY: plain kill(2) on the group we created with process_group(0)
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: the whole group is already gone
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pgid, signal, error = %err, "Signalling worker group failed");
        }
    }
}

/// Exit code, or `128 + signal` for a signal death.
fn exit_code(status: ExitStatus) -> i32 {
    status.code().or_else(|| status.signal().map(|s| 128 + s)).unwrap_or(-1)
}

/// Forward each stdout line to the log as it arrives.
async fn log_lines<R: AsyncRead + Unpin>(reader: R) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut collected = Vec::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!(target: "virtflow::worker", "worker: {}", line);
                collected.push(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Worker stdout read failed");
                break;
            }
        }
    }
    collected
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, "Worker stderr read failed");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Collect a pipe reader; a stray grandchild holding the pipe open must not hang us.
async fn join_pipe<T>(mut task: JoinHandle<T>) -> Option<T> {
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut task).await {
        Ok(joined) => joined.ok(),
        Err(_) => {
            task.abort();
            None
        }
    }
}

impl std::fmt::Debug for Rebinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rebinder")
            .field("worker", &self.worker)
            .field("timeout", &self.timeout)
            .field("sysfs_root", &self.inspector.sysfs_root())
            .field("verify", &self.verify)
            .finish()
    }
}
