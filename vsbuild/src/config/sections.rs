//! Configuration sections.

use crate::driver::{Credentials, DriverSettings, Firmware};
use crate::utils::duration::serde_str;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Management API endpoint and login.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server host name or address.
    pub vcenter_server: String,
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Skip TLS certificate verification.
    pub insecure_connection: bool,
    /// Datacenter to work in. Optional when the server has only one.
    pub datacenter: Option<String>,
    /// How often remote tasks are polled.
    #[serde(with = "serde_str")]
    pub task_poll_interval: Duration,
    /// Upper bound for one remote task.
    #[serde(with = "serde_str")]
    pub task_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let settings = DriverSettings::default();
        Self {
            vcenter_server: String::new(),
            username: String::new(),
            password: String::new(),
            insecure_connection: false,
            datacenter: None,
            task_poll_interval: settings.task_poll_interval,
            task_timeout: settings.task_timeout,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("vcenter_server", &self.vcenter_server)
            .field("username", &self.username)
            .field("insecure_connection", &self.insecure_connection)
            .field("datacenter", &self.datacenter)
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    /// Login material for the driver.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            server: self.vcenter_server.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            insecure: self.insecure_connection,
        }
    }

    /// Task wait tunables for the driver.
    #[must_use]
    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            task_poll_interval: self.task_poll_interval,
            task_timeout: self.task_timeout,
        }
    }
}

/// Where the VM is placed in the inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// VM folder path. Empty means the datacenter's root folder.
    pub folder: String,
    /// Cluster name.
    pub cluster: Option<String>,
    /// Host name.
    pub host: Option<String>,
    /// Resource pool path.
    pub resource_pool: Option<String>,
    /// Datastore name. Excludes `datastore_cluster`.
    pub datastore: Option<String>,
    /// Datastore cluster name. Excludes `datastore`.
    pub datastore_cluster: Option<String>,
}

/// CPU, memory and machine-level settings applied by the hardware step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Virtual CPU count.
    pub cpus: Option<i32>,
    /// Cores per socket.
    pub cpu_cores: Option<i32>,
    /// CPU reservation in MHz.
    pub cpu_reservation: Option<i64>,
    /// CPU limit in MHz.
    pub cpu_limit: Option<i64>,
    /// Allow CPU hot add.
    pub cpu_hot_plug: bool,
    /// Memory in MiB.
    pub ram_mb: Option<i64>,
    /// Memory reservation in MiB.
    pub ram_reservation: Option<i64>,
    /// Reserve all guest memory.
    pub ram_reserve_all: bool,
    /// Allow memory hot add.
    pub memory_hot_plug: bool,
    /// Expose hardware virtualization to the guest.
    pub nested_hv: bool,
    /// Video memory in KiB.
    pub video_ram: Option<i64>,
    /// Firmware type.
    pub firmware: Option<Firmware>,
    /// Grows the primary disk of a cloned VM to this size.
    pub disk_size_mb: Option<i64>,
    /// Advanced settings written to the VM's extra config.
    pub configuration_parameters: BTreeMap<String, String>,
    /// vApp property values for a cloned VM.
    pub vapp_properties: BTreeMap<String, String>,
}

/// One disk of a VM created from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Size in MiB.
    pub disk_size_mb: i64,
    /// Thin provisioning.
    pub disk_thin_provisioned: bool,
    /// Eagerly scrub a thick disk.
    pub disk_eagerly_scrub: bool,
    /// Index into `disk_controller_type`.
    pub disk_controller_index: usize,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            disk_size_mb: 0,
            disk_thin_provisioned: true,
            disk_eagerly_scrub: false,
            disk_controller_index: 0,
        }
    }
}

/// One network adapter of a VM created from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NicConfig {
    /// Network name.
    pub network: String,
    /// Adapter model.
    pub network_card: String,
    /// Static MAC address.
    pub mac_address: Option<String>,
    /// DirectPath I/O passthrough.
    pub passthrough: Option<bool>,
}

impl Default for NicConfig {
    fn default() -> Self {
        Self {
            network: String::new(),
            network_card: "vmxnet3".to_string(),
            mac_address: None,
            passthrough: None,
        }
    }
}

/// Create a VM from scratch and install it from ISO media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateConfig {
    /// Guest OS identifier.
    pub guest_os_type: String,
    /// Virtual hardware version.
    pub vm_version: Option<u32>,
    /// Disk controller types, in index order.
    pub disk_controller_type: Vec<String>,
    /// Disks.
    pub storage: Vec<DiskConfig>,
    /// Network adapters.
    pub network_adapters: Vec<NicConfig>,
    /// Add a USB controller.
    pub usb_controller: bool,
    /// Inventory notes.
    pub notes: Option<String>,
}

impl Default for CreateConfig {
    fn default() -> Self {
        Self {
            guest_os_type: "otherGuest".to_string(),
            vm_version: None,
            disk_controller_type: vec!["lsilogic".to_string()],
            storage: Vec::new(),
            network_adapters: Vec::new(),
            usb_controller: false,
            notes: None,
        }
    }
}

/// Clone an existing VM or template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneConfig {
    /// Source VM or template name.
    pub template: String,
    /// Create a linked clone.
    pub linked_clone: bool,
    /// Replaces the network of the first adapter.
    pub network: Option<String>,
    /// Static MAC address for the first adapter.
    pub mac_address: Option<String>,
    /// Inventory notes.
    pub notes: Option<String>,
}

/// ISO media: downloads, local cache and remote datastore cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsoConfig {
    /// Sources to download (or local files) and upload.
    pub iso_urls: Vec<String>,
    /// Expected checksum: `sha256:<hex>`, `sha512:<hex>`, `md5:<hex>`,
    /// a bare digest, or `none`.
    pub iso_checksum: String,
    /// ISOs already on a datastore, as `[datastore] path`.
    pub iso_paths: Vec<String>,
    /// Local download cache directory.
    pub cache_dir: PathBuf,
    /// Delete a cached download and fetch again.
    pub local_cache_overwrite: bool,
    /// Datastore for uploaded media. Defaults to the VM's datastore.
    pub remote_cache_datastore: Option<String>,
    /// Directory on the datastore for uploaded media.
    pub remote_cache_path: String,
    /// Replace media that already exists on the datastore.
    pub remote_cache_overwrite: bool,
    /// Delete media uploaded by this run after a successful build too.
    pub remote_cache_cleanup: bool,
}

impl Default for IsoConfig {
    fn default() -> Self {
        Self {
            iso_urls: Vec::new(),
            iso_checksum: "none".to_string(),
            iso_paths: Vec::new(),
            cache_dir: PathBuf::from("vsbuild_cache"),
            local_cache_overwrite: false,
            remote_cache_datastore: None,
            remote_cache_path: "vsbuild_cache".to_string(),
            remote_cache_overwrite: false,
            remote_cache_cleanup: false,
        }
    }
}

/// CD-ROM drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdromConfig {
    /// Controller type the drives attach to (`ide` or `sata`).
    pub cdrom_type: String,
    /// A locally generated ISO (e.g. cloud-init seed) to upload and attach.
    pub cd_image: Option<PathBuf>,
    /// Remove the drives after the guest is shut down instead of only
    /// ejecting their media.
    pub remove_cdrom: bool,
}

impl Default for CdromConfig {
    fn default() -> Self {
        Self {
            cdrom_type: "ide".to_string(),
            cd_image: None,
            remove_cdrom: false,
        }
    }
}

/// Floppy drive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloppyConfig {
    /// Image already on a datastore, as `[datastore] path`.
    pub floppy_img_path: Option<String>,
    /// Local image to upload.
    pub floppy_image: Option<PathBuf>,
}

impl FloppyConfig {
    /// True if a floppy drive should be attached.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.floppy_img_path.is_some() || self.floppy_image.is_some()
    }
}

/// Boot order and the typed boot command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Comma separated devices, e.g. `disk,cdrom`.
    pub boot_order: Option<String>,
    /// Delay between power on and typing.
    #[serde(with = "serde_str")]
    pub boot_wait: Duration,
    /// Key sequences, concatenated.
    pub boot_command: Vec<String>,
    /// Pause between key groups.
    #[serde(with = "serde_str")]
    pub boot_keygroup_interval: Duration,
    /// Address of the boot-time HTTP server, for `{{ .HTTPIP }}`.
    pub http_ip: Option<String>,
    /// Port of the boot-time HTTP server, for `{{ .HTTPPort }}`.
    pub http_port: Option<u16>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            boot_order: None,
            boot_wait: Duration::from_secs(10),
            boot_command: Vec::new(),
            boot_keygroup_interval: Duration::from_millis(100),
            http_ip: None,
            http_port: None,
        }
    }
}

/// Waiting for the guest to report an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitIpConfig {
    /// Skip the wait; no provisioning runs.
    pub disable: bool,
    /// Upper bound for the whole wait.
    #[serde(with = "serde_str")]
    pub ip_wait_timeout: Duration,
    /// How long an address must stay unchanged.
    #[serde(with = "serde_str")]
    pub ip_settle_timeout: Duration,
    /// Only accept addresses in this prefix.
    pub ip_wait_address: Option<String>,
    /// How often `guest.ipAddress` is read.
    #[serde(with = "serde_str")]
    pub poll_interval: Duration,
}

impl Default for WaitIpConfig {
    fn default() -> Self {
        Self {
            disable: false,
            ip_wait_timeout: Duration::from_secs(30 * 60),
            ip_settle_timeout: Duration::from_secs(5),
            ip_wait_address: None,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Guest shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Command run in the guest. Without one, guest tools shut it down.
    pub shutdown_command: Option<String>,
    /// Upper bound for the guest to power off.
    #[serde(with = "serde_str")]
    pub shutdown_timeout: Duration,
    /// How often the power state is read. Must not exceed the timeout.
    #[serde(with = "serde_str")]
    pub poll_interval: Duration,
    /// Send no shutdown; wait up to `shutdown_timeout` for the guest to
    /// power itself off.
    pub disable_shutdown: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            shutdown_command: None,
            shutdown_timeout: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(1),
            disable_shutdown: false,
        }
    }
}

/// Import into a content library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentLibraryConfig {
    /// Library name.
    pub library: String,
    /// Item name. Defaults to the VM name.
    pub name: Option<String>,
    /// Item description.
    pub description: String,
    /// Store as OVF instead of a VM template.
    pub ovf: bool,
    /// Destroy the VM after import.
    pub destroy: bool,
    /// Skip the import entirely.
    pub skip_import: bool,
    /// Datastore for the item. Defaults to the library's first datastore.
    pub datastore: Option<String>,
    /// Publish the item to subscribers after import.
    pub publish: bool,
    /// Upper bound for publishing.
    #[serde(with = "serde_str")]
    pub publish_timeout: Duration,
}

impl Default for ContentLibraryConfig {
    fn default() -> Self {
        Self {
            library: String::new(),
            name: None,
            description: String::new(),
            ovf: false,
            destroy: false,
            skip_import: false,
            datastore: None,
            publish: false,
            publish_timeout: Duration::from_secs(30 * 60),
        }
    }
}
