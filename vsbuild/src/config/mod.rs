//! Build configuration.
//!
//! [`BuildConfig`] is decoded from JSON with every field optional, then
//! checked with [`BuildConfig::validate`], which reports every problem at
//! once. Durations are written as strings like `"90s"` or `"1h30m"`.

mod sections;

pub use sections::{
    BootConfig, CdromConfig, CloneConfig, ConnectionConfig, ContentLibraryConfig, CreateConfig,
    DiskConfig, FloppyConfig, HardwareConfig, IsoConfig, LocationConfig, NicConfig,
    ShutdownConfig, WaitIpConfig,
};

use crate::bootcommand;
use crate::driver::spec::parse_boot_order;
use crate::errors::ConfigError;
use crate::resolver::DatastoreTarget;
use crate::upload::Checksum;
use crate::utils::{Cidr, DatastorePath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default snapshot name.
pub const DEFAULT_SNAPSHOT_NAME: &str = "Created by vsbuild";

/// How the VM comes into existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceConfig {
    /// Create an empty VM and install from ISO.
    Iso(CreateConfig),
    /// Clone an existing VM or template.
    Clone(CloneConfig),
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Iso(CreateConfig::default())
    }
}

/// Everything one build needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Name of the VM to build.
    pub vm_name: String,
    /// Endpoint and login.
    pub connection: ConnectionConfig,
    /// Inventory placement.
    pub location: LocationConfig,
    /// Hardware settings.
    pub hardware: HardwareConfig,
    /// Create from ISO or clone.
    pub source: SourceConfig,
    /// ISO media.
    pub iso: IsoConfig,
    /// CD-ROM drives.
    pub cdrom: CdromConfig,
    /// Floppy drive.
    pub floppy: FloppyConfig,
    /// Boot order and boot command.
    pub boot: BootConfig,
    /// Guest address wait.
    pub wait_ip: WaitIpConfig,
    /// Guest shutdown.
    pub shutdown: ShutdownConfig,
    /// Content library import.
    pub content_library: Option<ContentLibraryConfig>,
    /// Take a snapshot at the end of the build.
    pub create_snapshot: bool,
    /// Snapshot name.
    pub snapshot_name: String,
    /// Mark the VM as template at the end of the build.
    pub convert_to_template: bool,
    /// Keep the VM when the build fails or is cancelled.
    pub keep_on_error: bool,
    /// Directory whose files are listed in the artifact.
    pub output_directory: Option<PathBuf>,
    /// Labels added to the artifact after the collected VM metadata.
    pub labels: BTreeMap<String, String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            vm_name: String::new(),
            connection: ConnectionConfig::default(),
            location: LocationConfig::default(),
            hardware: HardwareConfig::default(),
            source: SourceConfig::default(),
            iso: IsoConfig::default(),
            cdrom: CdromConfig::default(),
            floppy: FloppyConfig::default(),
            boot: BootConfig::default(),
            wait_ip: WaitIpConfig::default(),
            shutdown: ShutdownConfig::default(),
            content_library: None,
            create_snapshot: false,
            snapshot_name: DEFAULT_SNAPSHOT_NAME.to_string(),
            convert_to_template: false,
            keep_on_error: false,
            output_directory: None,
            labels: BTreeMap::new(),
        }
    }
}

impl BuildConfig {
    /// Creates a configuration for `vm_name` with every other setting at
    /// its default.
    #[must_use]
    pub fn new(vm_name: impl Into<String>) -> Self {
        Self {
            vm_name: vm_name.into(),
            ..Self::default()
        }
    }

    /// Decodes a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::new(format!("malformed configuration: {e}")))
    }

    /// Reads and decodes a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::new(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Sets the connection section.
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Sets the location section.
    #[must_use]
    pub fn with_location(mut self, location: LocationConfig) -> Self {
        self.location = location;
        self
    }

    /// Sets the hardware section.
    #[must_use]
    pub fn with_hardware(mut self, hardware: HardwareConfig) -> Self {
        self.hardware = hardware;
        self
    }

    /// Sets the source.
    #[must_use]
    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.source = source;
        self
    }

    /// Sets the ISO section.
    #[must_use]
    pub fn with_iso(mut self, iso: IsoConfig) -> Self {
        self.iso = iso;
        self
    }

    /// Sets the CD-ROM section.
    #[must_use]
    pub fn with_cdrom(mut self, cdrom: CdromConfig) -> Self {
        self.cdrom = cdrom;
        self
    }

    /// Sets the floppy section.
    #[must_use]
    pub fn with_floppy(mut self, floppy: FloppyConfig) -> Self {
        self.floppy = floppy;
        self
    }

    /// Sets the boot section.
    #[must_use]
    pub fn with_boot(mut self, boot: BootConfig) -> Self {
        self.boot = boot;
        self
    }

    /// Sets the IP wait section.
    #[must_use]
    pub fn with_wait_ip(mut self, wait_ip: WaitIpConfig) -> Self {
        self.wait_ip = wait_ip;
        self
    }

    /// Sets the shutdown section.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownConfig) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Enables content library import.
    #[must_use]
    pub fn with_content_library(mut self, content_library: ContentLibraryConfig) -> Self {
        self.content_library = Some(content_library);
        self
    }

    /// Enables the final snapshot.
    #[must_use]
    pub fn with_snapshot(mut self, name: impl Into<String>) -> Self {
        self.create_snapshot = true;
        self.snapshot_name = name.into();
        self
    }

    /// Converts the VM to a template at the end.
    #[must_use]
    pub fn with_convert_to_template(mut self, convert: bool) -> Self {
        self.convert_to_template = convert;
        self
    }

    /// Keeps the VM on failure.
    #[must_use]
    pub fn with_keep_on_error(mut self, keep: bool) -> Self {
        self.keep_on_error = keep;
        self
    }

    /// Lists the files of `dir` in the artifact.
    #[must_use]
    pub fn with_output_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_directory = Some(dir.into());
        self
    }

    /// Adds an artifact label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// The datastore target, if one is configured.
    #[must_use]
    pub fn datastore_target(&self) -> Option<DatastoreTarget> {
        let non_empty = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_string);
        non_empty(&self.location.datastore)
            .map(DatastoreTarget::Direct)
            .or_else(|| non_empty(&self.location.datastore_cluster).map(DatastoreTarget::Group))
    }

    /// True when the VM is cloned rather than created.
    #[must_use]
    pub fn is_clone(&self) -> bool {
        matches!(self.source, SourceConfig::Clone(_))
    }

    /// Checks the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.vm_name.trim().is_empty() {
            errors.push("vm_name is required".to_string());
        }
        if self.connection.vcenter_server.is_empty() {
            errors.push("connection.vcenter_server is required".to_string());
        }
        if self.connection.username.is_empty() {
            errors.push("connection.username is required".to_string());
        }
        if self.connection.task_poll_interval.is_zero() {
            errors.push("connection.task_poll_interval must be greater than zero".to_string());
        }

        self.validate_location(&mut errors);
        self.validate_hardware(&mut errors);
        self.validate_source(&mut errors);
        self.validate_media(&mut errors);
        self.validate_boot(&mut errors);
        self.validate_waits(&mut errors);
        self.validate_content_library(&mut errors);

        if self.create_snapshot && self.snapshot_name.trim().is_empty() {
            errors.push("snapshot_name must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::from_errors(errors))
        }
    }

    fn validate_location(&self, errors: &mut Vec<String>) {
        let location = &self.location;
        let set = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());

        if set(&location.datastore) && set(&location.datastore_cluster) {
            errors.push("location.datastore and location.datastore_cluster are mutually exclusive".to_string());
        }
        if !set(&location.cluster) && !set(&location.host) && !set(&location.resource_pool) {
            errors.push("one of location.cluster, location.host or location.resource_pool is required".to_string());
        }
        if !self.is_clone() && self.datastore_target().is_none() {
            errors.push("location.datastore or location.datastore_cluster is required".to_string());
        }
    }

    fn validate_hardware(&self, errors: &mut Vec<String>) {
        let hw = &self.hardware;
        if hw.cpus.is_some_and(|n| n < 1) {
            errors.push("hardware.cpus must be at least 1".to_string());
        }
        if let (Some(cpus), Some(cores)) = (hw.cpus, hw.cpu_cores) {
            if cores < 1 || cpus % cores != 0 {
                errors.push(format!("hardware.cpu_cores ({cores}) must divide hardware.cpus ({cpus})"));
            }
        }
        if hw.ram_mb.is_some_and(|n| n < 4) {
            errors.push("hardware.ram_mb must be at least 4".to_string());
        }
        if hw.disk_size_mb.is_some_and(|n| n <= 0) {
            errors.push("hardware.disk_size_mb must be positive".to_string());
        }
        if !self.is_clone() && !hw.vapp_properties.is_empty() {
            errors.push("hardware.vapp_properties only apply to cloned VMs".to_string());
        }
    }

    fn validate_source(&self, errors: &mut Vec<String>) {
        match &self.source {
            SourceConfig::Iso(create) => {
                if create.guest_os_type.is_empty() {
                    errors.push("source.iso.guest_os_type is required".to_string());
                }
                if create.disk_controller_type.is_empty() && !create.storage.is_empty() {
                    errors.push("source.iso.disk_controller_type is required when disks are defined".to_string());
                }
                for (i, disk) in create.storage.iter().enumerate() {
                    if disk.disk_size_mb <= 0 {
                        errors.push(format!("source.iso.storage[{i}].disk_size_mb must be positive"));
                    }
                    if disk.disk_controller_index >= create.disk_controller_type.len() {
                        errors.push(format!(
                            "source.iso.storage[{i}].disk_controller_index {} has no matching controller",
                            disk.disk_controller_index
                        ));
                    }
                    if disk.disk_thin_provisioned && disk.disk_eagerly_scrub {
                        errors.push(format!(
                            "source.iso.storage[{i}] cannot be both thin provisioned and eagerly scrubbed"
                        ));
                    }
                }
                for (i, nic) in create.network_adapters.iter().enumerate() {
                    if nic.network_card.is_empty() {
                        errors.push(format!("source.iso.network_adapters[{i}].network_card is required"));
                    }
                }
            }
            SourceConfig::Clone(clone) => {
                if clone.template.is_empty() {
                    errors.push("source.clone.template is required".to_string());
                }
                if clone.linked_clone && self.hardware.disk_size_mb.is_some() {
                    errors.push("hardware.disk_size_mb cannot be used with a linked clone".to_string());
                }
            }
        }
    }

    fn validate_media(&self, errors: &mut Vec<String>) {
        if let Err(e) = self.iso.iso_checksum.parse::<Checksum>() {
            errors.push(format!("iso.iso_checksum: {e}"));
        }
        if !matches!(self.iso.iso_checksum.parse::<Checksum>(), Ok(Checksum::None))
            && self.iso.iso_urls.len() > 1
        {
            errors.push("iso.iso_checksum can only verify a single iso_urls entry".to_string());
        }
        for path in &self.iso.iso_paths {
            if path.parse::<DatastorePath>().is_err() {
                errors.push(format!("iso.iso_paths entry '{path}' is not a '[datastore] path'"));
            }
        }
        if let Some(path) = &self.floppy.floppy_img_path {
            if path.parse::<DatastorePath>().is_err() {
                errors.push(format!("floppy.floppy_img_path '{path}' is not a '[datastore] path'"));
            }
        }
        if self.floppy.floppy_img_path.is_some() && self.floppy.floppy_image.is_some() {
            errors.push("floppy.floppy_img_path and floppy.floppy_image are mutually exclusive".to_string());
        }
        if !matches!(self.cdrom.cdrom_type.as_str(), "ide" | "sata") {
            errors.push(format!("cdrom.cdrom_type '{}' must be 'ide' or 'sata'", self.cdrom.cdrom_type));
        }
    }

    fn validate_boot(&self, errors: &mut Vec<String>) {
        if let Some(order) = &self.boot.boot_order {
            if let Err(e) = parse_boot_order(order) {
                errors.push(format!("boot.boot_order: {e}"));
            }
        }
        if let Err(e) = bootcommand::parse(&self.boot.boot_command.concat()) {
            errors.push(format!("boot.boot_command: {e}"));
        }
    }

    fn validate_waits(&self, errors: &mut Vec<String>) {
        let shutdown = &self.shutdown;
        if shutdown.poll_interval.is_zero() {
            errors.push("shutdown.poll_interval must be greater than zero".to_string());
        }
        if shutdown.poll_interval > shutdown.shutdown_timeout {
            errors.push("shutdown.poll_interval must not exceed shutdown.shutdown_timeout".to_string());
        }

        let wait = &self.wait_ip;
        if let Some(cidr) = &wait.ip_wait_address {
            if let Err(e) = cidr.parse::<Cidr>() {
                errors.push(format!("wait_ip.ip_wait_address: {e}"));
            }
        }
        if !wait.disable && wait.poll_interval.is_zero() {
            errors.push("wait_ip.poll_interval must be greater than zero".to_string());
        }
    }

    fn validate_content_library(&self, errors: &mut Vec<String>) {
        let Some(library) = &self.content_library else {
            return;
        };
        if library.library.trim().is_empty() {
            errors.push("content_library.library is required".to_string());
        }
        if library.destroy && self.convert_to_template {
            errors.push("content_library.destroy cannot be combined with convert_to_template".to_string());
        }
        if library.ovf && library.publish {
            errors.push("content_library.publish is only supported for VM template items".to_string());
        }
        if library.publish && library.publish_timeout.is_zero() {
            errors.push("content_library.publish_timeout must be greater than zero".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn valid() -> BuildConfig {
        BuildConfig::new("ubuntu")
            .with_connection(ConnectionConfig {
                vcenter_server: "vc.example.com".into(),
                username: "builder".into(),
                password: "secret".into(),
                ..ConnectionConfig::default()
            })
            .with_location(LocationConfig {
                cluster: Some("cluster1".into()),
                datastore: Some("datastore1".into()),
                ..LocationConfig::default()
            })
    }

    #[test]
    fn test_valid_config() {
        assert_ok!(valid().validate());
    }

    #[test]
    fn test_decodes_json_with_duration_strings() {
        let config = BuildConfig::from_json_str(
            r#"{
                "vm_name": "ubuntu",
                "connection": {"vcenter_server": "vc", "username": "u", "password": "p"},
                "location": {"cluster": "cluster1", "datastore_cluster": "dsc1"},
                "source": {"clone": {"template": "base", "linked_clone": true}},
                "shutdown": {"shutdown_timeout": "2s", "poll_interval": "250ms"},
                "boot": {"boot_wait": "1m30s"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.shutdown.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(config.shutdown.poll_interval, Duration::from_millis(250));
        assert_eq!(config.boot.boot_wait, Duration::from_secs(90));
        assert_eq!(config.datastore_target(), Some(DatastoreTarget::Group("dsc1".into())));
        assert!(config.is_clone());
        assert_eq!(config.snapshot_name, DEFAULT_SNAPSHOT_NAME);
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_duration_is_rejected() {
        let err = BuildConfig::from_json_str(r#"{"shutdown": {"shutdown_timeout": "soon"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("malformed configuration"));
    }

    #[test]
    fn test_datastore_and_cluster_are_exclusive() {
        let mut config = valid();
        config.location.datastore_cluster = Some("dsc1".into());
        let err = config.validate().unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("mutually exclusive")));
    }

    #[test]
    fn test_poll_interval_must_not_exceed_timeout() {
        let mut config = valid();
        config.shutdown.shutdown_timeout = Duration::from_secs(2);
        config.shutdown.poll_interval = Duration::from_secs(5);
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.errors,
            vec!["shutdown.poll_interval must not exceed shutdown.shutdown_timeout".to_string()]
        );
    }

    #[test]
    fn test_collects_every_problem() {
        let config = BuildConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.errors.len() >= 4, "{:?}", err.errors);
        assert!(err.errors.contains(&"vm_name is required".to_string()));
    }

    #[test]
    fn test_rejects_bad_boot_order_and_cidr() {
        let mut config = valid();
        config.boot.boot_order = Some("disk,usb".into());
        config.wait_ip.ip_wait_address = Some("10.0.0.0/40".into());
        let err = config.validate().unwrap_err();
        assert_eq!(err.errors.len(), 2);
    }

    #[test]
    fn test_destroy_conflicts_with_template() {
        let config = valid()
            .with_convert_to_template(true)
            .with_content_library(ContentLibraryConfig {
                library: "builds".into(),
                destroy: true,
                ..ContentLibraryConfig::default()
            });
        assert_err!(config.validate());
    }

    #[test]
    fn test_password_not_in_debug() {
        let rendered = format!("{:?}", valid().connection);
        assert!(!rendered.contains("secret"));
    }
}
