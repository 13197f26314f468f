//! Argument and exit-code contract between the orchestrator and the worker.
//!
//! # Argument vector
//!
//! ```text
//! bind   <addr>|<vendor>|<device> ...
//! unbind <nvidia|amdgpu|nouveau> <addr> ...
//! ```
//!
//! PCI addresses and hex IDs cannot contain `|`, so no escaping is needed.
//!
//! # Output
//!
//! - stdout: one progress line per device per step, for logs only
//! - stderr: diagnostics, surfaced in `BindError::WorkerFailed`
//! - exit code: `0` only if every device reached the target state

use crate::error::ProtocolError;
use crate::vfio::device::{DeviceGroup, HostDriver, PciFunction};
use std::fmt;

/// Every device reached the target state.
pub const EXIT_SUCCESS: i32 = 0;
/// At least one device did not reach the target state.
pub const EXIT_FAILURE: i32 = 1;
/// The argument vector could not be decoded.
pub const EXIT_USAGE: i32 = 2;

/// Prefix of every worker progress line.
pub const PROGRESS_PREFIX: &str = "[worker]";

const FIELD_SEPARATOR: char = '|';

/// Direction of a rebind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerAction {
    /// Host driver -> vfio-pci
    Bind,
    /// vfio-pci -> host driver
    Unbind,
}

impl WorkerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bind => "bind",
            Self::Unbind => "unbind",
        }
    }
}

impl fmt::Display for WorkerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request to the worker, built fresh per call.
#[derive(Debug, Clone)]
pub struct WorkerInvocation<'a> {
    pub action: WorkerAction,
    pub group: &'a DeviceGroup,
}

impl<'a> WorkerInvocation<'a> {
    pub fn bind(group: &'a DeviceGroup) -> Self {
        Self { action: WorkerAction::Bind, group }
    }

    pub fn unbind(group: &'a DeviceGroup) -> Self {
        Self { action: WorkerAction::Unbind, group }
    }

    /// Host driver named on the unbind command line.
    pub fn host_driver_hint(&self) -> Option<HostDriver> {
        match self.action {
            WorkerAction::Bind => None,
            WorkerAction::Unbind => Some(self.group.host_driver()),
        }
    }

    /// Encode as the worker's argument vector (without the program name).
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.action.as_str().to_string()];
        match self.action {
            WorkerAction::Bind => {
                args.extend(self.group.members().iter().map(encode_device));
            }
            WorkerAction::Unbind => {
                args.push(self.group.host_driver().as_str().to_string());
                args.extend(self.group.addresses().map(str::to_string));
            }
        }
        args
    }
}

/// `address|vendor_id|device_id`
pub fn encode_device(function: &PciFunction) -> String {
    format!(
        "{}{sep}{}{sep}{}",
        function.address(),
        function.vendor_id(),
        function.device_id(),
        sep = FIELD_SEPARATOR
    )
}

/// Parse one `address|vendor_id|device_id` triple.
pub fn decode_device(arg: &str) -> Result<PciFunction, ProtocolError> {
    let fields: Vec<&str> = arg.split(FIELD_SEPARATOR).collect();
    let [address, vendor_id, device_id] = fields.as_slice() else {
        return Err(ProtocolError::MalformedDevice {
            arg: arg.to_string(),
            reason: format!("expected 3 '|'-separated fields, got {}", fields.len()),
        });
    };

    PciFunction::new(address, vendor_id, device_id, None).map_err(|e| {
        ProtocolError::MalformedDevice { arg: arg.to_string(), reason: e.to_string() }
    })
}

/// A decoded worker request, as seen from inside the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRequest {
    Bind { devices: Vec<PciFunction> },
    Unbind { host_driver: HostDriver, addresses: Vec<String> },
}

impl WorkerRequest {
    /// Decode `bind` device triples.
    pub fn bind<S: AsRef<str>>(devices: &[S]) -> Result<Self, ProtocolError> {
        if devices.is_empty() {
            return Err(ProtocolError::NoDevices);
        }
        let devices = devices.iter().map(|d| decode_device(d.as_ref())).collect::<Result<_, _>>()?;
        Ok(Self::Bind { devices })
    }

    /// Decode `unbind` host driver and addresses.
    pub fn unbind<S: AsRef<str>>(host_driver: &str, addresses: &[S]) -> Result<Self, ProtocolError> {
        let host_driver: HostDriver = host_driver.parse()?;
        if addresses.is_empty() {
            return Err(ProtocolError::NoDevices);
        }

        let mut decoded = Vec::with_capacity(addresses.len());
        for addr in addresses {
            let addr = addr.as_ref();
            if !crate::vfio::device::is_valid_pci_address(addr) {
                return Err(ProtocolError::MalformedDevice {
                    arg: addr.to_string(),
                    reason: "not a PCI address".to_string(),
                });
            }
            decoded.push(addr.to_ascii_lowercase());
        }
        Ok(Self::Unbind { host_driver, addresses: decoded })
    }

    /// Decode a full argument vector (without the program name).
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self, ProtocolError> {
        let (action, rest) = args.split_first().ok_or(ProtocolError::MissingAction)?;
        match action.as_ref() {
            "bind" => Self::bind(rest),
            "unbind" => {
                let (driver, addresses) =
                    rest.split_first().ok_or(ProtocolError::MissingHostDriver)?;
                Self::unbind(driver.as_ref(), addresses)
            }
            other => Err(ProtocolError::UnknownAction(other.to_string())),
        }
    }

    pub fn action(&self) -> WorkerAction {
        match self {
            Self::Bind { .. } => WorkerAction::Bind,
            Self::Unbind { .. } => WorkerAction::Unbind,
        }
    }
}

/// What came back from one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOutcome {
    /// Process exit code; `128 + signal` if the worker was killed by a signal.
    pub exit_code: i32,
    pub stdout_lines: Vec<String>,
    pub stderr: String,
    pub timed_out: bool,
}

impl WorkerOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == EXIT_SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfio::device::Vendor;

    fn rtx_group(vendor: Vendor) -> DeviceGroup {
        DeviceGroup::new(
            "GeForce RTX 2060",
            vendor,
            vec![
                PciFunction::new("0000:01:00.0", "10de", "2184", Some("nvidia".into())).unwrap(),
                PciFunction::new("0000:01:00.1", "10de", "1aeb", None).unwrap(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_bind_args() {
        let group = rtx_group(Vendor::Nvidia);
        assert_eq!(
            WorkerInvocation::bind(&group).to_args(),
            vec!["bind", "0000:01:00.0|10de|2184", "0000:01:00.1|10de|1aeb"]
        );
        assert_eq!(WorkerInvocation::bind(&group).host_driver_hint(), None);
    }

    #[test]
    fn test_unbind_args() {
        let group = rtx_group(Vendor::Nvidia);
        assert_eq!(
            WorkerInvocation::unbind(&group).to_args(),
            vec!["unbind", "nvidia", "0000:01:00.0", "0000:01:00.1"]
        );
    }

    #[test]
    fn test_unbind_host_driver_fallback() {
        let group = rtx_group(Vendor::Other);
        let args = WorkerInvocation::unbind(&group).to_args();
        assert_eq!(args[1], "nouveau");

        let group = rtx_group(Vendor::Amd);
        assert_eq!(WorkerInvocation::unbind(&group).host_driver_hint(), Some(HostDriver::Amdgpu));
    }

    #[test]
    fn test_worker_decodes_what_orchestrator_encodes() {
        let group = rtx_group(Vendor::Nvidia);
        let request = WorkerRequest::parse(&WorkerInvocation::bind(&group).to_args()).unwrap();
        // original_driver stays on the orchestrator side; the argv never carries it
        let expected: Vec<PciFunction> = group
            .members()
            .iter()
            .map(|m| PciFunction::new(m.address(), m.vendor_id(), m.device_id(), None).unwrap())
            .collect();
        assert_eq!(request, WorkerRequest::Bind { devices: expected });
        assert!(group.members()[0].original_driver().is_some());

        let request = WorkerRequest::parse(&WorkerInvocation::unbind(&group).to_args()).unwrap();
        assert_eq!(
            request,
            WorkerRequest::Unbind {
                host_driver: HostDriver::Nvidia,
                addresses: vec!["0000:01:00.0".to_string(), "0000:01:00.1".to_string()],
            }
        );
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert_eq!(WorkerRequest::parse::<&str>(&[]), Err(ProtocolError::MissingAction));
        assert_eq!(WorkerRequest::parse(&["bind"]), Err(ProtocolError::NoDevices));
        assert_eq!(WorkerRequest::parse(&["unbind"]), Err(ProtocolError::MissingHostDriver));
        assert_eq!(
            WorkerRequest::parse(&["unbind", "radeon", "0000:01:00.0"]),
            Err(ProtocolError::UnknownHostDriver("radeon".to_string()))
        );
        assert_eq!(
            WorkerRequest::parse(&["rescan"]),
            Err(ProtocolError::UnknownAction("rescan".to_string()))
        );
        assert!(matches!(
            WorkerRequest::parse(&["bind", "0000:01:00.0|10de"]),
            Err(ProtocolError::MalformedDevice { .. })
        ));
        assert!(matches!(
            WorkerRequest::parse(&["unbind", "nvidia", "01:00.0"]),
            Err(ProtocolError::MalformedDevice { .. })
        ));
    }
}
