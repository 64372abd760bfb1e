//! Request payloads for mutating operations.

use super::api::ManagedObjectRef;
use super::devices::VirtualDevice;
use crate::errors::BuildError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Firmware type of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Firmware {
    /// Legacy BIOS.
    #[default]
    #[serde(rename = "bios")]
    Bios,
    /// UEFI.
    #[serde(rename = "efi")]
    Efi,
    /// UEFI with secure boot enabled.
    #[serde(rename = "efi-secure")]
    EfiSecure,
}

impl Firmware {
    /// Returns the firmware value the management plane expects.
    #[must_use]
    pub fn remote_name(self) -> &'static str {
        match self {
            Self::Bios => "bios",
            Self::Efi | Self::EfiSecure => "efi",
        }
    }

    /// Returns true if secure boot must be enabled.
    #[must_use]
    pub fn secure_boot(self) -> bool {
        matches!(self, Self::EfiSecure)
    }
}

/// A device class in the boot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootDevice {
    /// First hard disk.
    Disk,
    /// First CD-ROM.
    Cdrom,
    /// First floppy drive.
    Floppy,
    /// Network boot.
    Ethernet,
}

impl FromStr for BootDevice {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "disk" => Ok(Self::Disk),
            "cdrom" => Ok(Self::Cdrom),
            "floppy" => Ok(Self::Floppy),
            "ethernet" | "net" => Ok(Self::Ethernet),
            other => Err(BuildError::Validation(format!("unknown boot device '{other}'"))),
        }
    }
}

impl fmt::Display for BootDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk => f.write_str("disk"),
            Self::Cdrom => f.write_str("cdrom"),
            Self::Floppy => f.write_str("floppy"),
            Self::Ethernet => f.write_str("ethernet"),
        }
    }
}

/// Parses a comma separated boot order such as `disk,cdrom`.
pub fn parse_boot_order(value: &str) -> Result<Vec<BootDevice>, BuildError> {
    value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Modifier keys held while a scan code is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyModifiers {
    /// Left control.
    pub left_control: bool,
    /// Left shift.
    pub left_shift: bool,
    /// Left alt.
    pub left_alt: bool,
    /// Left GUI (super/windows) key.
    pub left_gui: bool,
    /// Right control.
    pub right_control: bool,
    /// Right shift.
    pub right_shift: bool,
    /// Right alt.
    pub right_alt: bool,
    /// Right GUI key.
    pub right_gui: bool,
}

impl KeyModifiers {
    /// Returns true when no modifier is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One USB HID key event sent to the VM console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbScanCode {
    /// HID usage ID from the keyboard page.
    pub usage: u8,
    /// Modifiers held while the key is pressed.
    pub modifiers: KeyModifiers,
}

impl UsbScanCode {
    /// The value the management plane expects: `(usage << 16) | 7`.
    #[must_use]
    pub fn hid_code(&self) -> i32 {
        (i32::from(self.usage) << 16) | 7
    }
}

/// A vApp property assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VAppPropertyChange {
    /// Remote property key (numeric).
    pub key: i32,
    /// Property id as declared in the schema.
    pub id: String,
    /// New value.
    pub value: String,
}

/// How a device change is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceOperation {
    /// Add a new device.
    Add,
    /// Edit an existing device.
    Edit,
    /// Remove an existing device.
    Remove,
}

/// Backing file handling for a device change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    /// Create the backing file.
    Create,
    /// Destroy the backing file.
    Destroy,
    /// Replace the backing file.
    Replace,
}

/// A single device delta inside a [`ConfigSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceChange {
    /// The operation.
    pub operation: DeviceOperation,
    /// The device after the change (or the device being removed).
    pub device: VirtualDevice,
    /// Backing file handling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_operation: Option<FileOperation>,
}

impl DeviceChange {
    /// Adds a device.
    #[must_use]
    pub fn add(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Add,
            device,
            file_operation: None,
        }
    }

    /// Edits a device.
    #[must_use]
    pub fn edit(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Edit,
            device,
            file_operation: None,
        }
    }

    /// Removes a device.
    #[must_use]
    pub fn remove(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Remove,
            device,
            file_operation: None,
        }
    }

    /// Sets the backing file operation.
    #[must_use]
    pub fn with_file_operation(mut self, op: FileOperation) -> Self {
        self.file_operation = Some(op);
        self
    }
}

/// A configuration delta. Unset fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSpec {
    /// Virtual CPU count.
    pub num_cpus: Option<i32>,
    /// Cores per virtual socket.
    pub cores_per_socket: Option<i32>,
    /// Memory in MiB.
    pub memory_mb: Option<i64>,
    /// CPU reservation in MHz.
    pub cpu_reservation: Option<i64>,
    /// CPU limit in MHz.
    pub cpu_limit: Option<i64>,
    /// Memory reservation in MiB.
    pub memory_reservation: Option<i64>,
    /// Reserve all guest memory.
    pub memory_reservation_locked_to_max: Option<bool>,
    /// Allow CPU hot add.
    pub cpu_hot_add: Option<bool>,
    /// Allow memory hot add.
    pub memory_hot_add: Option<bool>,
    /// Expose hardware virtualization to the guest.
    pub nested_hv: Option<bool>,
    /// Video memory in KiB.
    pub video_ram_kb: Option<i64>,
    /// Firmware type.
    pub firmware: Option<Firmware>,
    /// Notes shown in the inventory.
    pub annotation: Option<String>,
    /// Boot device order.
    pub boot_order: Option<Vec<BootDevice>>,
    /// Advanced `extraConfig` entries.
    pub extra_config: BTreeMap<String, String>,
    /// vApp property assignments.
    pub vapp_properties: Vec<VAppPropertyChange>,
    /// Device deltas.
    pub device_changes: Vec<DeviceChange>,
}

impl ConfigSpec {
    /// Creates an empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if applying this delta would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Appends a device change.
    #[must_use]
    pub fn with_device_change(mut self, change: DeviceChange) -> Self {
        self.device_changes.push(change);
        self
    }
}

/// A disk to create with a new VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Size in MiB.
    pub size_mb: i64,
    /// Thin provisioning.
    pub thin_provisioned: bool,
    /// Eagerly scrub (only for thick disks).
    pub eagerly_scrub: bool,
    /// Index into [`CreateSpec::disk_controllers`].
    pub controller_index: usize,
    /// Datastore the disk is placed on.
    pub datastore: ManagedObjectRef,
}

/// A network adapter to create with a new VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NicSpec {
    /// Backing network.
    pub network: ManagedObjectRef,
    /// Adapter model (`vmxnet3`, `e1000`...).
    pub adapter_type: String,
    /// Static MAC address.
    pub mac_address: Option<String>,
    /// Enable DirectPath I/O passthrough.
    pub passthrough: Option<bool>,
}

/// Definition of a VM created from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSpec {
    /// Name of the new object.
    pub name: String,
    /// Guest OS identifier, e.g. `otherGuest64`.
    pub guest_os_type: String,
    /// Notes shown in the inventory.
    pub annotation: Option<String>,
    /// Virtual CPU count.
    pub num_cpus: i32,
    /// Memory in MiB.
    pub memory_mb: i64,
    /// Firmware type.
    pub firmware: Firmware,
    /// Virtual hardware version.
    pub hardware_version: Option<u32>,
    /// Datastore holding the VM files.
    pub datastore: ManagedObjectRef,
    /// Controller types, e.g. `pvscsi`.
    pub disk_controllers: Vec<String>,
    /// Disks to create.
    pub disks: Vec<DiskSpec>,
    /// Network adapters to create.
    pub nics: Vec<NicSpec>,
    /// Add a USB controller.
    pub usb_controller: bool,
}

/// Definition of a clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneSpec {
    /// Name of the new object.
    pub name: String,
    /// Destination folder.
    pub folder: ManagedObjectRef,
    /// Destination resource pool.
    pub resource_pool: ManagedObjectRef,
    /// Pinned host.
    pub host: Option<ManagedObjectRef>,
    /// Target datastore.
    pub datastore: Option<ManagedObjectRef>,
    /// Share disks with the source through a delta disk.
    pub linked_clone: bool,
    /// Notes shown in the inventory.
    pub annotation: Option<String>,
    /// Replaces the backing network of the first adapter.
    pub network: Option<ManagedObjectRef>,
    /// Static MAC address for the first adapter.
    pub mac_address: Option<String>,
}

/// Definition of a content library item captured from a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSpec {
    /// Name of the new object.
    pub name: String,
    /// Item description.
    pub description: String,
    /// Store as an OVF package instead of a VM template.
    pub ovf: bool,
    /// Target datastore.
    pub datastore: Option<ManagedObjectRef>,
    /// Destination folder.
    pub folder: Option<ManagedObjectRef>,
    /// Destination resource pool.
    pub resource_pool: Option<ManagedObjectRef>,
    /// Pinned host.
    pub host: Option<ManagedObjectRef>,
}
