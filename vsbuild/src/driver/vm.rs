//! Virtual machine operations.

use super::api::{ManagedObjectRef, Operation, PropertyMap};
use super::client::{created_object, Driver};
use super::devices::{DeviceList, VirtualDevice};
use super::inventory::ResourcePool;
use super::spec::{BootDevice, CloneSpec, ConfigSpec, DeviceChange, UsbScanCode, VAppPropertyChange};
use crate::cancellation::{poll_until, WaitOutcome};
use crate::errors::{BuildError, BuildResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Power state as reported by `runtime.powerState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    /// Running.
    PoweredOn,
    /// Stopped.
    PoweredOff,
    /// Suspended to disk.
    Suspended,
}

/// One declared vApp property, from `config.vAppConfig.property`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VAppPropertyInfo {
    /// Numeric key.
    pub key: i32,
    /// Property id.
    pub id: String,
    /// Whether the property may be changed after deployment.
    #[serde(default)]
    pub user_configurable: bool,
    /// Current value.
    #[serde(default)]
    pub value: Option<String>,
}

/// A remote virtual machine plus the driver that operates on it.
#[derive(Debug, Clone)]
pub struct VirtualMachine {
    driver: Driver,
    reference: ManagedObjectRef,
}

impl VirtualMachine {
    /// Wraps a VM reference.
    #[must_use]
    pub fn new(driver: Driver, reference: ManagedObjectRef) -> Self {
        Self { driver, reference }
    }

    /// The managed object reference.
    #[must_use]
    pub fn reference(&self) -> &ManagedObjectRef {
        &self.reference
    }

    /// The driver bound to this VM.
    #[must_use]
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Reads properties. Prefer a minimal path list: an empty list fetches
    /// everything, which is the most expensive read.
    pub async fn info(&self, paths: &[&str]) -> BuildResult<PropertyMap> {
        self.driver.properties(&self.reference, paths).await
    }

    /// The VM name.
    pub async fn name(&self) -> BuildResult<String> {
        self.driver.object_name(&self.reference).await
    }

    /// Current virtual hardware.
    pub async fn devices(&self) -> BuildResult<DeviceList> {
        self.driver
            .property(&self.reference, "config.hardware.device")
            .await
    }

    /// Current power state.
    pub async fn power_state(&self) -> BuildResult<PowerState> {
        self.driver.property(&self.reference, "runtime.powerState").await
    }

    /// Whether the VM is marked as template.
    pub async fn is_template(&self) -> BuildResult<bool> {
        Ok(self
            .driver
            .property::<Option<bool>>(&self.reference, "config.template")
            .await?
            .unwrap_or(false))
    }

    /// First guest IP address reported by tools, if any.
    pub async fn guest_ip(&self) -> BuildResult<Option<String>> {
        let ip: Option<String> = self.driver.property(&self.reference, "guest.ipAddress").await?;
        Ok(ip.filter(|ip| !ip.is_empty()))
    }

    /// Powers the VM on.
    pub async fn power_on(&self) -> BuildResult<()> {
        self.driver
            .execute(Operation::PowerOn {
                vm: self.reference.clone(),
            })
            .await?;
        info!(vm = %self.reference.id, "powered on");
        Ok(())
    }

    /// Hard powers the VM off. A VM that is already off is left alone.
    pub async fn power_off(&self) -> BuildResult<()> {
        if self.power_state().await? == PowerState::PoweredOff {
            return Ok(());
        }
        self.driver
            .execute(Operation::PowerOff {
                vm: self.reference.clone(),
            })
            .await?;
        info!(vm = %self.reference.id, "powered off");
        Ok(())
    }

    /// Asks guest tools to shut the OS down. Returns immediately.
    pub async fn start_shutdown(&self) -> BuildResult<()> {
        self.driver
            .execute(Operation::ShutdownGuest {
                vm: self.reference.clone(),
            })
            .await?;
        Ok(())
    }

    /// Polls the power state every `interval` until the VM is off.
    ///
    /// Returns `Ok(true)` once powered off and `Ok(false)` if the run was
    /// cancelled first. Running out of time is a [`BuildError::Timeout`].
    pub async fn wait_for_shutdown(&self, timeout: Duration, interval: Duration) -> BuildResult<bool> {
        let vm = self;
        let outcome = poll_until(self.driver.token(), timeout, interval, move || async move {
            let state = vm.power_state().await?;
            debug!(vm = %vm.reference.id, ?state, "waiting for guest shutdown");
            Ok::<_, BuildError>((state == PowerState::PoweredOff).then_some(()))
        })
        .await?;

        match outcome {
            WaitOutcome::Ready(()) => Ok(true),
            WaitOutcome::Cancelled => Ok(false),
            WaitOutcome::TimedOut => Err(BuildError::timeout("guest shutdown", timeout)),
        }
    }

    /// Applies a configuration delta in one remote task. Empty deltas are skipped.
    pub async fn reconfigure(&self, spec: ConfigSpec) -> BuildResult<()> {
        if spec.is_empty() {
            return Ok(());
        }
        self.driver
            .execute(Operation::Reconfigure {
                vm: self.reference.clone(),
                spec,
            })
            .await?;
        Ok(())
    }

    /// Builds, without applying, the change growing the primary disk to `size_mb`.
    ///
    /// The VM must have exactly one disk and the new size may not be smaller
    /// than the current one.
    pub async fn resize_disk(&self, size_mb: i64) -> BuildResult<DeviceChange> {
        let devices = self.devices().await?;
        let mut disks = devices.disks();
        let disk = match (disks.next(), disks.next()) {
            (Some(disk), None) => disk.clone(),
            (None, _) => {
                return Err(BuildError::Validation("VM has no virtual disk to resize".into()))
            }
            (Some(_), Some(_)) => {
                return Err(BuildError::Validation(
                    "VM has more than one virtual disk; cannot pick the one to resize".into(),
                ))
            }
        };

        let VirtualDevice::Disk {
            key,
            controller_key,
            capacity_kb,
            file_name,
            thin_provisioned,
        } = disk
        else {
            return Err(BuildError::Validation("primary device is not a disk".into()));
        };

        let new_kb = size_mb * 1024;
        if new_kb < capacity_kb {
            return Err(BuildError::Validation(format!(
                "cannot shrink disk from {} MB to {size_mb} MB",
                capacity_kb / 1024
            )));
        }

        Ok(DeviceChange::edit(VirtualDevice::Disk {
            key,
            controller_key,
            capacity_kb: new_kb,
            file_name,
            thin_provisioned,
        }))
    }

    /// Adds a CD-ROM drive on the first controller of `controller_type`,
    /// optionally with an ISO mounted.
    pub async fn add_cdrom(&self, controller_type: &str, iso_path: Option<&str>) -> BuildResult<()> {
        let devices = self.devices().await?;
        let controller_key = devices
            .controller(controller_type)
            .map(VirtualDevice::key)
            .ok_or_else(|| {
                BuildError::Validation(format!("VM has no {controller_type} controller for a CD-ROM"))
            })?;

        let cdrom = VirtualDevice::Cdrom {
            key: devices.next_new_key(),
            controller_key,
            iso_path: iso_path.map(str::to_string),
            connected: iso_path.is_some(),
        };
        debug!(vm = %self.reference.id, iso = ?iso_path, "adding CD-ROM");
        self.reconfigure(ConfigSpec::new().with_device_change(DeviceChange::add(cdrom)))
            .await
    }

    /// Disconnects the media of every CD-ROM. Drives without media are untouched.
    pub async fn eject_cdroms(&self) -> BuildResult<()> {
        let devices = self.devices().await?;
        let mut spec = ConfigSpec::new();
        for device in devices.cdroms() {
            if let VirtualDevice::Cdrom {
                key,
                controller_key,
                iso_path,
                connected,
            } = device
            {
                if iso_path.is_some() || *connected {
                    spec.device_changes.push(DeviceChange::edit(VirtualDevice::Cdrom {
                        key: *key,
                        controller_key: *controller_key,
                        iso_path: None,
                        connected: false,
                    }));
                }
            }
        }
        self.reconfigure(spec).await
    }

    /// Removes every CD-ROM drive. A VM without drives is left alone.
    pub async fn remove_cdroms(&self) -> BuildResult<()> {
        let devices = self.devices().await?;
        let spec = devices.cdroms().cloned().fold(ConfigSpec::new(), |spec, cdrom| {
            spec.with_device_change(DeviceChange::remove(cdrom))
        });
        self.reconfigure(spec).await
    }

    /// Adds a floppy drive with `image_path` mounted.
    pub async fn add_floppy(&self, image_path: Option<&str>) -> BuildResult<()> {
        let devices = self.devices().await?;
        let floppy = VirtualDevice::Floppy {
            key: devices.next_new_key(),
            image_path: image_path.map(str::to_string),
        };
        self.reconfigure(ConfigSpec::new().with_device_change(DeviceChange::add(floppy)))
            .await
    }

    /// Removes every floppy drive.
    pub async fn remove_floppy(&self) -> BuildResult<()> {
        let devices = self.devices().await?;
        let spec = devices.floppies().cloned().fold(ConfigSpec::new(), |spec, floppy| {
            spec.with_device_change(DeviceChange::remove(floppy))
        });
        self.reconfigure(spec).await
    }

    /// Sets the boot order. An empty list restores the default order.
    pub async fn set_boot_order(&self, order: Vec<BootDevice>) -> BuildResult<()> {
        self.driver
            .execute(Operation::Reconfigure {
                vm: self.reference.clone(),
                spec: ConfigSpec {
                    boot_order: Some(order),
                    ..ConfigSpec::default()
                },
            })
            .await?;
        Ok(())
    }

    /// Types key events into the console.
    pub async fn put_usb_scan_codes(&self, codes: Vec<UsbScanCode>) -> BuildResult<()> {
        if codes.is_empty() {
            return Ok(());
        }
        self.driver
            .execute(Operation::PutUsbScanCodes {
                vm: self.reference.clone(),
                codes,
            })
            .await?;
        Ok(())
    }

    /// Takes a snapshot.
    pub async fn create_snapshot(&self, name: &str, description: &str) -> BuildResult<()> {
        self.driver
            .execute(Operation::CreateSnapshot {
                vm: self.reference.clone(),
                name: name.to_string(),
                description: description.to_string(),
            })
            .await?;
        info!(vm = %self.reference.id, snapshot = name, "snapshot created");
        Ok(())
    }

    /// Removes the snapshot called `name`.
    pub async fn remove_snapshot(&self, name: &str) -> BuildResult<()> {
        self.driver
            .execute(Operation::RemoveSnapshot {
                vm: self.reference.clone(),
                name: name.to_string(),
            })
            .await?;
        info!(vm = %self.reference.id, snapshot = name, "snapshot removed");
        Ok(())
    }

    /// Marks the VM as template.
    pub async fn convert_to_template(&self) -> BuildResult<()> {
        self.driver
            .execute(Operation::MarkAsTemplate {
                vm: self.reference.clone(),
            })
            .await?;
        info!(vm = %self.reference.id, "converted to template");
        Ok(())
    }

    /// Turns a template back into a virtual machine in `pool`.
    pub async fn mark_as_virtual_machine(&self, pool: &ResourcePool) -> BuildResult<()> {
        self.driver
            .execute(Operation::MarkAsVirtualMachine {
                vm: self.reference.clone(),
                resource_pool: pool.reference().clone(),
            })
            .await?;
        info!(vm = %self.reference.id, "marked as virtual machine");
        Ok(())
    }

    /// Unregisters the VM and deletes its files.
    pub async fn destroy(&self) -> BuildResult<()> {
        self.driver
            .execute(Operation::Destroy {
                vm: self.reference.clone(),
            })
            .await?;
        info!(vm = %self.reference.id, "destroyed");
        Ok(())
    }

    /// Clones this VM (or template).
    pub async fn clone_to(&self, spec: CloneSpec) -> BuildResult<VirtualMachine> {
        let name = spec.name.clone();
        let result = self
            .driver
            .execute(Operation::CloneVm {
                source: self.reference.clone(),
                spec,
            })
            .await?;
        let reference = created_object(result, "clone_vm")?;
        info!(source = %self.reference.id, vm = %name, id = %reference.id, "virtual machine cloned");
        Ok(self.driver.vm(reference))
    }

    /// Sets vApp property values.
    ///
    /// Every key must be declared in the VM's vApp schema and be user
    /// configurable; otherwise nothing is applied.
    pub async fn update_vapp_properties(&self, values: &BTreeMap<String, String>) -> BuildResult<()> {
        if values.is_empty() {
            return Ok(());
        }

        let declared: Vec<VAppPropertyInfo> = self
            .driver
            .property::<Option<Vec<VAppPropertyInfo>>>(&self.reference, "config.vAppConfig.property")
            .await?
            .unwrap_or_default();

        let mut changes = Vec::with_capacity(values.len());
        for (id, value) in values {
            let info = declared.iter().find(|p| &p.id == id).ok_or_else(|| {
                BuildError::Validation(format!("vApp property '{id}' is not declared by the VM"))
            })?;
            if !info.user_configurable {
                return Err(BuildError::Validation(format!(
                    "vApp property '{id}' is not user configurable"
                )));
            }
            changes.push(VAppPropertyChange {
                key: info.key,
                id: id.clone(),
                value: value.clone(),
            });
        }

        self.reconfigure(ConfigSpec {
            vapp_properties: changes,
            ..ConfigSpec::default()
        })
        .await
    }
}
