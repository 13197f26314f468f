//! PCI function and device group model.
//!
//! A [`DeviceGroup`] is the unit of rebinding: every function of a GPU that
//! shares its IOMMU group (HDMI audio, USB-C controller, ...) travels with it.
//! Rebinding always takes a whole group; no entry point accepts a single function.

use crate::error::ModelError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Regular expression to validate PCI address format: 0000:01:00.0
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// Known GPU vendor IDs.
pub mod vendor {
    pub const NVIDIA: &str = "10de";
    pub const AMD: &str = "1002";
}

/// Validate PCI address format.
pub fn is_valid_pci_address(address: &str) -> bool {
    PCI_ADDRESS_REGEX.is_match(address)
}

/// Normalize a 16-bit hex ID: strip `0x`, lower-case, require 4 digits.
fn normalize_id(field: &'static str, value: &str) -> Result<String, ModelError> {
    let id = value.trim().trim_start_matches("0x").to_ascii_lowercase();
    if id.len() == 4 && id.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(id)
    } else {
        Err(ModelError::InvalidId { field, value: value.to_string() })
    }
}

/// One PCI function of a device group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFunction", into = "RawFunction")]
pub struct PciFunction {
    address: String,
    vendor_id: String,
    device_id: String,
    original_driver: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct RawFunction {
    address: String,
    vendor_id: String,
    device_id: String,
    #[serde(default)]
    original_driver: Option<String>,
}

impl TryFrom<RawFunction> for PciFunction {
    type Error = ModelError;

    fn try_from(raw: RawFunction) -> Result<Self, Self::Error> {
        Self::new(&raw.address, &raw.vendor_id, &raw.device_id, raw.original_driver)
    }
}

impl From<PciFunction> for RawFunction {
    fn from(f: PciFunction) -> Self {
        Self {
            address: f.address,
            vendor_id: f.vendor_id,
            device_id: f.device_id,
            original_driver: f.original_driver,
        }
    }
}

impl PciFunction {
    /// Create a function description, validating address and IDs.
    pub fn new(
        address: &str,
        vendor_id: &str,
        device_id: &str,
        original_driver: Option<String>,
    ) -> Result<Self, ModelError> {
        if !is_valid_pci_address(address) {
            return Err(ModelError::InvalidAddress { address: address.to_string() });
        }

        Ok(Self {
            address: address.to_ascii_lowercase(),
            vendor_id: normalize_id("vendor", vendor_id)?,
            device_id: normalize_id("device", device_id)?,
            original_driver: original_driver.filter(|d| !d.is_empty()),
        })
    }

    /// PCI address (e.g., "0000:01:00.0")
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Vendor ID (e.g., "10de" for NVIDIA)
    pub fn vendor_id(&self) -> &str {
        &self.vendor_id
    }

    /// Device ID (e.g., "2184")
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Driver the function was bound to when discovered, if known.
    pub fn original_driver(&self) -> Option<&str> {
        self.original_driver.as_deref()
    }
}

/// GPU vendor of a device group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Nvidia,
    Amd,
    Other,
}

impl Vendor {
    /// Map a PCI vendor ID to a vendor.
    pub fn from_vendor_id(vendor_id: &str) -> Self {
        match vendor_id.trim_start_matches("0x").to_ascii_lowercase().as_str() {
            vendor::NVIDIA => Self::Nvidia,
            vendor::AMD => Self::Amd,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nvidia => "NVIDIA",
            Self::Amd => "AMD",
            Self::Other => "Other",
        })
    }
}

impl FromStr for Vendor {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nvidia" => Ok(Self::Nvidia),
            "amd" => Ok(Self::Amd),
            "other" => Ok(Self::Other),
            _ => Err(ModelError::UnknownVendor(s.to_string())),
        }
    }
}

/// Host driver a group is returned to on unbind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostDriver {
    Nvidia,
    Amdgpu,
    Nouveau,
}

impl HostDriver {
    /// Pick the host driver for a vendor; unrecognized vendors get nouveau.
    pub fn for_vendor(vendor: Vendor) -> Self {
        match vendor {
            Vendor::Nvidia => Self::Nvidia,
            Vendor::Amd => Self::Amdgpu,
            Vendor::Other => Self::Nouveau,
        }
    }

    /// Driver name as it appears under /sys/bus/pci/drivers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nvidia => "nvidia",
            Self::Amdgpu => "amdgpu",
            Self::Nouveau => "nouveau",
        }
    }
}

impl fmt::Display for HostDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostDriver {
    type Err = crate::error::ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nvidia" => Ok(Self::Nvidia),
            "amdgpu" => Ok(Self::Amdgpu),
            "nouveau" => Ok(Self::Nouveau),
            other => Err(crate::error::ProtocolError::UnknownHostDriver(other.to_string())),
        }
    }
}

/// A passthrough-capable hardware unit: all functions of one IOMMU group.
///
/// Immutable once built; the member list is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawGroup", into = "RawGroup")]
pub struct DeviceGroup {
    display_name: String,
    vendor: Vendor,
    members: Vec<PciFunction>,
}

#[derive(Serialize, Deserialize)]
struct RawGroup {
    display_name: String,
    vendor: Vendor,
    members: Vec<PciFunction>,
}

impl TryFrom<RawGroup> for DeviceGroup {
    type Error = ModelError;

    fn try_from(raw: RawGroup) -> Result<Self, Self::Error> {
        Self::new(raw.display_name, raw.vendor, raw.members)
    }
}

impl From<DeviceGroup> for RawGroup {
    fn from(g: DeviceGroup) -> Self {
        Self { display_name: g.display_name, vendor: g.vendor, members: g.members }
    }
}

impl DeviceGroup {
    /// Build a group. Rejects empty member lists and repeated addresses.
    pub fn new(
        display_name: impl Into<String>,
        vendor: Vendor,
        members: Vec<PciFunction>,
    ) -> Result<Self, ModelError> {
        let display_name = display_name.into();
        if members.is_empty() {
            return Err(ModelError::EmptyGroup { name: display_name });
        }

        let mut seen = HashSet::new();
        for member in &members {
            if !seen.insert(member.address()) {
                return Err(ModelError::DuplicateAddress {
                    name: display_name,
                    address: member.address().to_string(),
                });
            }
        }

        Ok(Self { display_name, vendor, members })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    /// Member functions in rebind order.
    pub fn members(&self) -> &[PciFunction] {
        &self.members
    }

    /// Member addresses in rebind order.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(PciFunction::address)
    }

    /// Host driver this group returns to on unbind.
    pub fn host_driver(&self) -> HostDriver {
        HostDriver::for_vendor(self.vendor)
    }
}

impl fmt::Display for DeviceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.display_name, self.members.len())
    }
}
