//! Integration tests for group rebinding.
//!
//! These tests drive the real orchestrator against:
//! - a fake sysfs tree in a temp directory
//! - shell-script stand-ins for the worker, run through `/bin/sh`
//!
//! The stubs flip `driver` symlinks the way the kernel would, fail halfway,
//! lie about success, or hang, so every outcome path is exercised without
//! touching real hardware.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use virtflow_core::{
    BindError, BindingState, Config, DeviceGroup, PciFunction, Rebinder, Vendor,
};

const GPU: &str = "0000:01:00.0";
const AUDIO: &str = "0000:01:00.1";

/// Flips every named device onto the requested driver, then exits 0.
const FLIP_WORKER: &str = r#"
printf '%s\n' "$@" > "$ROOT/args"
action="$1"; shift
if [ "$action" = bind ]; then
    for dev in "$@"; do
        addr="${dev%%[|]*}"
        ln -sfn "$ROOT/bus/pci/drivers/vfio-pci" "$ROOT/bus/pci/devices/$addr/driver"
        echo "[worker] $addr bound to vfio-pci"
    done
else
    driver="$1"; shift
    for addr in "$@"; do
        ln -sfn "$ROOT/bus/pci/drivers/$driver" "$ROOT/bus/pci/devices/$addr/driver"
        echo "[worker] $addr bound to $driver"
    done
fi
exit 0
"#;

/// Test fixture: a fake sysfs root plus a directory for worker stubs.
struct Fixture {
    sysfs: TempDir,
    scripts: TempDir,
}

impl Fixture {
    /// Sysfs with an NVIDIA GPU and its audio function on their host drivers.
    fn new() -> Self {
        let sysfs = TempDir::new().unwrap();
        for driver in ["nvidia", "snd_hda_intel", "vfio-pci", "nouveau", "amdgpu"] {
            fs::create_dir_all(sysfs.path().join("bus/pci/drivers").join(driver)).unwrap();
        }
        let fixture = Self { sysfs, scripts: TempDir::new().unwrap() };
        fixture.add_device(GPU, Some("nvidia"));
        fixture.add_device(AUDIO, Some("snd_hda_intel"));
        fixture
    }

    fn root(&self) -> &Path {
        self.sysfs.path()
    }

    fn add_device(&self, address: &str, driver: Option<&str>) {
        let device = self.root().join("bus/pci/devices").join(address);
        fs::create_dir_all(&device).unwrap();
        if let Some(driver) = driver {
            symlink(self.root().join("bus/pci/drivers").join(driver), device.join("driver"))
                .unwrap();
        }
    }

    /// Write a worker stub; `$ROOT` inside it points at the fake sysfs.
    fn worker(&self, name: &str, body: &str) -> PathBuf {
        let path = self.scripts.path().join(name);
        let script = format!("ROOT='{}'\n{}", self.root().display(), body);
        fs::write(&path, script).unwrap();
        path
    }

    fn config(&self, worker: PathBuf) -> Config {
        Config {
            worker_path: worker,
            privilege_launcher: vec!["/bin/sh".to_string()],
            modprobe_command: vec!["false".to_string()],
            sysfs_root: self.root().to_path_buf(),
            proc_modules: self.root().join("modules"),
            ..Config::default()
        }
    }

    fn rebinder(&self, body: &str) -> Rebinder {
        let worker = self.worker("worker.sh", body);
        Rebinder::new(&self.config(worker))
    }

    fn recorded_args(&self) -> Vec<String> {
        fs::read_to_string(self.root().join("args"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

fn rtx_2060() -> DeviceGroup {
    DeviceGroup::new(
        "GeForce RTX 2060",
        Vendor::Nvidia,
        vec![
            PciFunction::new(GPU, "10de", "2184", Some("nvidia".to_string())).unwrap(),
            PciFunction::new(AUDIO, "10de", "1aeb", Some("snd_hda_intel".to_string())).unwrap(),
        ],
    )
    .unwrap()
}

/// Whether `pid` is still running. A zombie awaiting its reaper counts as dead.
fn pid_is_alive(pid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence
    if unsafe { libc::kill(pid, 0) } != 0 {
        return false;
    }
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map_or(true, |(_, rest)| !rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

/// Orphans are reaped by init asynchronously; give it a moment.
async fn wait_until_dead(pid: i32) -> bool {
    for _ in 0..50 {
        if !pid_is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_bind_moves_every_member_to_vfio() {
    let fixture = Fixture::new();
    let rebinder = fixture.rebinder(FLIP_WORKER);
    let group = rtx_2060();

    let report = rebinder.bind(&group).await.unwrap();

    assert_eq!(report.group, "GeForce RTX 2060");
    assert!(report.module_warning.is_none());
    assert_eq!(rebinder.current_driver(GPU), BindingState::VfioBound);
    assert_eq!(rebinder.current_driver(AUDIO), BindingState::VfioBound);
    assert_eq!(report.states.len(), 2);
    assert!(report.outcome.stdout_lines.iter().any(|l| l.starts_with("[worker]")));
}

#[tokio::test]
async fn test_worker_receives_exact_arguments() {
    let fixture = Fixture::new();
    let rebinder = fixture.rebinder(FLIP_WORKER);
    let group = rtx_2060();

    rebinder.bind(&group).await.unwrap();
    assert_eq!(
        fixture.recorded_args(),
        vec!["bind", "0000:01:00.0|10de|2184", "0000:01:00.1|10de|1aeb"]
    );

    rebinder.unbind(&group).await.unwrap();
    assert_eq!(fixture.recorded_args(), vec!["unbind", "nvidia", GPU, AUDIO]);
}

#[tokio::test]
async fn test_unbind_restores_host_driver() {
    let fixture = Fixture::new();
    let rebinder = fixture.rebinder(FLIP_WORKER);
    let group = rtx_2060();

    rebinder.bind(&group).await.unwrap();
    rebinder.unbind(&group).await.unwrap();

    assert_eq!(rebinder.current_driver(GPU), BindingState::HostDriver("nvidia".to_string()));
    assert!(!rebinder.current_driver(AUDIO).is_vfio());
}

#[tokio::test]
async fn test_rebind_is_idempotent() {
    let fixture = Fixture::new();
    let rebinder = fixture.rebinder(FLIP_WORKER);
    let group = rtx_2060();

    rebinder.bind(&group).await.unwrap();
    rebinder.bind(&group).await.unwrap();
    assert_eq!(rebinder.current_driver(GPU), BindingState::VfioBound);
    assert!(rebinder.inspector().is_settled(&group, virtflow_core::vfio::WorkerAction::Bind));

    rebinder.unbind(&group).await.unwrap();
    rebinder.unbind(&group).await.unwrap();
    assert_eq!(rebinder.current_driver(GPU), BindingState::HostDriver("nvidia".to_string()));
}

#[tokio::test]
async fn test_other_vendor_falls_back_to_nouveau() {
    let fixture = Fixture::new();
    fixture.add_device("0000:02:00.0", Some("vfio-pci"));
    let rebinder = fixture.rebinder(FLIP_WORKER);
    let group = DeviceGroup::new(
        "Unlabelled card",
        Vendor::Other,
        vec![PciFunction::new("0000:02:00.0", "1234", "5678", None).unwrap()],
    )
    .unwrap();

    rebinder.unbind(&group).await.unwrap();
    assert_eq!(fixture.recorded_args(), vec!["unbind", "nouveau", "0000:02:00.0"]);
    assert_eq!(
        rebinder.current_driver("0000:02:00.0"),
        BindingState::HostDriver("nouveau".to_string())
    );
}

#[tokio::test]
async fn test_partial_failure_is_reported_as_failure() {
    let fixture = Fixture::new();
    let rebinder = fixture.rebinder(
        r#"
ln -sfn "$ROOT/bus/pci/drivers/vfio-pci" "$ROOT/bus/pci/devices/0000:01:00.0/driver"
echo "[worker] 0000:01:00.0 bound to vfio-pci"
echo "0000:01:00.1: driver refused detach" >&2
exit 1
"#,
    );

    let err = rebinder.bind(&rtx_2060()).await.unwrap_err();
    match &err {
        BindError::WorkerFailed { code, stderr, .. } => {
            assert_eq!(*code, 1);
            assert!(stderr.contains("refused detach"));
        }
        other => panic!("expected WorkerFailed, got {other:?}"),
    }
    assert!(!err.is_retryable());

    // Group is half-bound; only the inspector can tell
    assert_eq!(rebinder.current_driver(GPU), BindingState::VfioBound);
    assert_eq!(
        rebinder.current_driver(AUDIO),
        BindingState::HostDriver("snd_hda_intel".to_string())
    );
}

#[tokio::test]
async fn test_worker_claiming_success_is_verified() {
    let fixture = Fixture::new();
    let rebinder = fixture.rebinder("echo \"[worker] done\"\nexit 0\n");

    let err = rebinder.bind(&rtx_2060()).await.unwrap_err();
    assert!(matches!(
        err,
        BindError::VerificationFailed { ref address, state: BindingState::HostDriver(_), .. }
            if address == GPU
    ));
}

#[tokio::test]
async fn test_verification_can_be_disabled() {
    let fixture = Fixture::new();
    let worker = fixture.worker("noop.sh", "exit 0\n");
    let config = Config { verify_after_run: false, ..fixture.config(worker) };

    let report = Rebinder::new(&config).bind(&rtx_2060()).await.unwrap();
    assert!(report.states.is_empty());
}

#[tokio::test]
async fn test_hung_worker_is_killed_at_timeout() {
    let fixture = Fixture::new();
    let rebinder = fixture
        .rebinder("echo $$ > \"$ROOT/pid\"\nexec sleep 30\n")
        .with_timeout(Duration::from_millis(500))
        .with_termination_grace(Duration::from_millis(500));

    let start = Instant::now();
    let err = rebinder.bind(&rtx_2060()).await.unwrap_err();

    assert!(matches!(err, BindError::Timeout { after, .. } if after == Duration::from_millis(500)));
    assert!(start.elapsed() < Duration::from_secs(10));

    let pid: i32 = fs::read_to_string(fixture.root().join("pid")).unwrap().trim().parse().unwrap();
    assert!(wait_until_dead(pid).await, "worker {pid} survived the timeout");
}

#[tokio::test]
async fn test_worker_ignoring_sigterm_is_killed() {
    let fixture = Fixture::new();
    let rebinder = fixture
        .rebinder("trap '' TERM\necho $$ > \"$ROOT/pid\"\nwhile :; do sleep 1; done\n")
        .with_timeout(Duration::from_millis(500))
        .with_termination_grace(Duration::from_millis(200));

    let err = rebinder.unbind(&rtx_2060()).await.unwrap_err();
    assert!(matches!(err, BindError::Timeout { .. }));

    let pid: i32 = fs::read_to_string(fixture.root().join("pid")).unwrap().trim().parse().unwrap();
    assert!(wait_until_dead(pid).await, "worker {pid} survived SIGKILL");
}

#[tokio::test]
async fn test_worker_behind_launcher_is_killed() {
    let fixture = Fixture::new();
    // A launcher that stays resident as the worker's parent, like sudo
    let launcher = fixture.worker("launcher.sh", "trap '' TERM\n/bin/sh \"$@\"\n");
    let worker = fixture.worker("worker.sh", "echo $$ > \"$ROOT/pid\"\nwhile :; do sleep 1; done\n");
    let config = Config {
        privilege_launcher: vec!["/bin/sh".to_string(), launcher.display().to_string()],
        ..fixture.config(worker)
    };
    let rebinder = Rebinder::new(&config)
        .with_timeout(Duration::from_millis(500))
        .with_termination_grace(Duration::from_millis(200));

    let err = rebinder.bind(&rtx_2060()).await.unwrap_err();
    assert!(matches!(err, BindError::Timeout { .. }));

    let pid: i32 = fs::read_to_string(fixture.root().join("pid")).unwrap().trim().parse().unwrap();
    assert!(wait_until_dead(pid).await, "worker {pid} outlived its launcher");
}

#[tokio::test]
async fn test_launch_failure_leaves_orchestrator_usable() {
    let fixture = Fixture::new();
    let config = Config {
        privilege_launcher: Vec::new(),
        ..fixture.config(fixture.scripts.path().join("does-not-exist"))
    };
    let rebinder = Rebinder::new(&config);

    let err = rebinder.bind(&rtx_2060()).await.unwrap_err();
    assert!(matches!(err, BindError::LaunchFailed { .. }));
    assert!(err.is_retryable());

    // Nothing was touched and the other components still answer
    assert_eq!(rebinder.current_driver(GPU), BindingState::HostDriver("nvidia".to_string()));
    assert!(rebinder.module_guard().vfio_available().await);
    let err = rebinder.unbind(&rtx_2060()).await.unwrap_err();
    assert!(matches!(err, BindError::LaunchFailed { .. }));
}

#[tokio::test]
async fn test_missing_vfio_module_is_a_warning() {
    let fixture = Fixture::new();
    fs::remove_dir(fixture.root().join("bus/pci/drivers/vfio-pci")).unwrap();
    let rebinder = fixture.rebinder(FLIP_WORKER);

    // modprobe is `false`, so loading fails, yet the worker still runs
    let report = rebinder.bind(&rtx_2060()).await.unwrap();
    assert!(report.module_warning.is_some());
    assert_eq!(rebinder.current_driver(GPU), BindingState::VfioBound);
}

#[tokio::test]
async fn test_failed_bind_keeps_module_warning() {
    let fixture = Fixture::new();
    fs::remove_dir(fixture.root().join("bus/pci/drivers/vfio-pci")).unwrap();
    let rebinder = fixture.rebinder("echo \"no vfio-pci driver\" >&2\nexit 1\n");

    let err = rebinder.bind(&rtx_2060()).await.unwrap_err();
    assert!(matches!(err, BindError::WorkerFailed { .. }));
    assert!(matches!(
        err.module_warning(),
        Some(virtflow_core::ModuleError::StillMissing { .. })
    ));
}

#[tokio::test]
async fn test_same_group_is_serialized() {
    let fixture = Fixture::new();
    let body = format!(
        "echo \"start $$\" >> \"$ROOT/log\"\nsleep 0.3\necho \"end $$\" >> \"$ROOT/log\"\n{}",
        FLIP_WORKER
    );
    let rebinder = fixture.rebinder(&body);
    let group = rtx_2060();

    let (first, second) = tokio::join!(rebinder.bind(&group), rebinder.bind(&group));
    first.unwrap();
    second.unwrap();

    let log = fs::read_to_string(fixture.root().join("log")).unwrap();
    let events: Vec<&str> =
        log.lines().map(|l| l.split_whitespace().next().unwrap_or_default()).collect();
    assert_eq!(events, vec!["start", "end", "start", "end"]);
}

#[tokio::test]
async fn test_disjoint_groups_run_concurrently() {
    let fixture = Fixture::new();
    fixture.add_device("0000:02:00.0", Some("amdgpu"));
    let body = format!(
        "echo \"start $$\" >> \"$ROOT/log\"\nsleep 1\necho \"end $$\" >> \"$ROOT/log\"\n{}",
        FLIP_WORKER
    );
    let rebinder = fixture.rebinder(&body);
    let nvidia = rtx_2060();
    let amd = DeviceGroup::new(
        "Radeon RX 6600",
        Vendor::Amd,
        vec![PciFunction::new("0000:02:00.0", "1002", "73ff", None).unwrap()],
    )
    .unwrap();

    let (first, second) = tokio::join!(rebinder.bind(&nvidia), rebinder.bind(&amd));
    first.unwrap();
    second.unwrap();

    let log = fs::read_to_string(fixture.root().join("log")).unwrap();
    let events: Vec<&str> =
        log.lines().map(|l| l.split_whitespace().next().unwrap_or_default()).collect();
    assert_eq!(&events[..2], &["start", "start"]);
}
