//! Virtual hardware as read from `config.hardware.device`.

use serde::{Deserialize, Serialize};

/// A virtual device attached to a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VirtualDevice {
    /// A virtual disk.
    Disk {
        /// Device key (negative for devices not yet created).
        key: i32,
        /// Controller the disk hangs off.
        controller_key: i32,
        /// Capacity in KiB.
        capacity_kb: i64,
        /// Backing file, e.g. `[ds1] vm/vm.vmdk`.
        #[serde(default)]
        file_name: Option<String>,
        /// Thin provisioned.
        #[serde(default)]
        thin_provisioned: bool,
    },
    /// A CD-ROM drive.
    Cdrom {
        /// Device key.
        key: i32,
        /// Controller key.
        controller_key: i32,
        /// Mounted ISO, if any.
        #[serde(default)]
        iso_path: Option<String>,
        /// Whether the medium is connected.
        #[serde(default)]
        connected: bool,
    },
    /// A floppy drive.
    Floppy {
        /// Device key.
        key: i32,
        /// Mounted image, if any.
        #[serde(default)]
        image_path: Option<String>,
    },
    /// A network adapter.
    Ethernet {
        /// Device key.
        key: i32,
        /// Backing network name.
        network: String,
        /// Adapter model.
        adapter_type: String,
        /// MAC address.
        #[serde(default)]
        mac_address: Option<String>,
    },
    /// A storage or bus controller.
    Controller {
        /// Device key.
        key: i32,
        /// `ide`, `sata`, `pvscsi`, `lsilogic`, `nvme`, `usb`...
        controller_type: String,
        /// Bus number.
        bus_number: i32,
    },
    /// Anything the builder does not manage.
    Other {
        /// Device key.
        key: i32,
        /// Remote device label.
        label: String,
    },
}

impl VirtualDevice {
    /// Returns the device key.
    #[must_use]
    pub fn key(&self) -> i32 {
        match self {
            Self::Disk { key, .. }
            | Self::Cdrom { key, .. }
            | Self::Floppy { key, .. }
            | Self::Ethernet { key, .. }
            | Self::Controller { key, .. }
            | Self::Other { key, .. } => *key,
        }
    }

    /// Returns true for disks.
    #[must_use]
    pub fn is_disk(&self) -> bool {
        matches!(self, Self::Disk { .. })
    }

    /// Returns true for CD-ROM drives.
    #[must_use]
    pub fn is_cdrom(&self) -> bool {
        matches!(self, Self::Cdrom { .. })
    }

    /// Returns true for floppy drives.
    #[must_use]
    pub fn is_floppy(&self) -> bool {
        matches!(self, Self::Floppy { .. })
    }
}

/// The device list of one VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceList(pub Vec<VirtualDevice>);

impl DeviceList {
    /// Returns all disks.
    pub fn disks(&self) -> impl Iterator<Item = &VirtualDevice> {
        self.0.iter().filter(|d| d.is_disk())
    }

    /// Returns all CD-ROM drives.
    pub fn cdroms(&self) -> impl Iterator<Item = &VirtualDevice> {
        self.0.iter().filter(|d| d.is_cdrom())
    }

    /// Returns all floppy drives.
    pub fn floppies(&self) -> impl Iterator<Item = &VirtualDevice> {
        self.0.iter().filter(|d| d.is_floppy())
    }

    /// Finds a controller by type, e.g. `ide` or `sata`.
    #[must_use]
    pub fn controller(&self, controller_type: &str) -> Option<&VirtualDevice> {
        self.0.iter().find(|d| {
            matches!(d, VirtualDevice::Controller { controller_type: t, .. } if t == controller_type)
        })
    }

    /// Returns a key not used by any device, for new devices.
    #[must_use]
    pub fn next_new_key(&self) -> i32 {
        self.0.iter().map(VirtualDevice::key).filter(|k| *k < 0).min().unwrap_or(0) - 1
    }

    /// Number of devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the VM has no devices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
