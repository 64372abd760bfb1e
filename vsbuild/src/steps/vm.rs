//! Creating and cloning the build VM.
//!
//! Both steps destroy the VM again when the run halts or is cancelled,
//! unless `keep_on_error` is set.

use super::{try_step, Step};
use crate::config::{CloneConfig, CreateConfig, HardwareConfig};
use crate::context::{RunContext, StateBag};
use crate::core::StepAction;
use crate::driver::{CloneSpec, CreateSpec, DiskSpec, NicSpec, VirtualMachine};
use crate::errors::BuildResult;
use crate::resolver::{resolve_network, DiskPlacer, PlacementHints};
use async_trait::async_trait;
use tracing::{info, warn};

/// Creates an empty VM, publishing `vm`.
///
/// Disks are placed one by one when the datastore came from a cluster
/// recommendation. On halt or cancellation the VM is powered off and
/// destroyed unless `keep_on_error` is set.
#[derive(Debug)]
pub struct StepCreateVm {
    vm_name: String,
    create: CreateConfig,
    hardware: HardwareConfig,
    keep_on_error: bool,
}

impl StepCreateVm {
    /// Creates the step.
    #[must_use]
    pub fn new(
        vm_name: impl Into<String>,
        create: CreateConfig,
        hardware: HardwareConfig,
        keep_on_error: bool,
    ) -> Self {
        Self {
            vm_name: vm_name.into(),
            create,
            hardware,
            keep_on_error,
        }
    }

    async fn create(&self, state: &StateBag) -> BuildResult<VirtualMachine> {
        let driver = state.require_driver()?;
        let compute = state.require_compute()?;
        let placement = state.require_placement()?;

        let hints = PlacementHints {
            resource_pool: Some(compute.resource_pool.reference().clone()),
            host: compute.host.as_ref().map(|h| h.reference().clone()),
            vm_name: self.vm_name.clone(),
        };
        let sizes_kb: Vec<i64> = self
            .create
            .storage
            .iter()
            .map(|d| d.disk_size_mb * 1024)
            .collect();
        let datastores = DiskPlacer::new(driver, placement, hints).place(&sizes_kb).await?;

        let disks = self
            .create
            .storage
            .iter()
            .zip(datastores)
            .map(|(disk, datastore)| DiskSpec {
                size_mb: disk.disk_size_mb,
                thin_provisioned: disk.disk_thin_provisioned,
                eagerly_scrub: disk.disk_eagerly_scrub,
                controller_index: disk.disk_controller_index,
                datastore: datastore.reference().clone(),
            })
            .collect();

        let mut nics = Vec::with_capacity(self.create.network_adapters.len());
        for nic in &self.create.network_adapters {
            let network = resolve_network(driver, &nic.network, compute.host.as_ref()).await?;
            nics.push(NicSpec {
                network: network.reference().clone(),
                adapter_type: nic.network_card.clone(),
                mac_address: nic.mac_address.clone(),
                passthrough: nic.passthrough,
            });
        }

        let spec = CreateSpec {
            name: self.vm_name.clone(),
            guest_os_type: self.create.guest_os_type.clone(),
            annotation: self.create.notes.clone(),
            num_cpus: self.hardware.cpus.unwrap_or(1),
            memory_mb: self.hardware.ram_mb.unwrap_or(512),
            firmware: self.hardware.firmware.unwrap_or_default(),
            hardware_version: self.create.vm_version,
            datastore: placement.datastore.reference().clone(),
            disk_controllers: self.create.disk_controller_type.clone(),
            disks,
            nics,
            usb_controller: self.create.usb_controller,
        };

        driver
            .create_vm(&compute.folder, &compute.resource_pool, compute.host.as_ref(), spec)
            .await
    }
}

#[async_trait]
impl Step for StepCreateVm {
    fn name(&self) -> &str {
        "create_vm"
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        let vm = try_step!(state, self.name(), self.create(state).await);
        state.set_vm(vm);
        StepAction::Continue
    }

    async fn cleanup(&self, _ctx: &RunContext, state: &mut StateBag) -> BuildResult<()> {
        destroy_on_teardown(state, self.keep_on_error).await
    }
}

/// Clones a VM or template, publishing `vm`.
///
/// Cleanup behaves as for [`StepCreateVm`].
#[derive(Debug)]
pub struct StepCloneVm {
    vm_name: String,
    clone: CloneConfig,
    keep_on_error: bool,
}

impl StepCloneVm {
    /// Creates the step.
    #[must_use]
    pub fn new(vm_name: impl Into<String>, clone: CloneConfig, keep_on_error: bool) -> Self {
        Self {
            vm_name: vm_name.into(),
            clone,
            keep_on_error,
        }
    }

    async fn clone_vm(&self, state: &StateBag) -> BuildResult<VirtualMachine> {
        let driver = state.require_driver()?;
        let compute = state.require_compute()?;
        let source = driver.find_vm(&self.clone.template).await?;

        let network = match self.clone.network.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => Some(
                resolve_network(driver, name, compute.host.as_ref())
                    .await?
                    .reference()
                    .clone(),
            ),
            None => None,
        };

        let spec = CloneSpec {
            name: self.vm_name.clone(),
            folder: compute.folder.reference().clone(),
            resource_pool: compute.resource_pool.reference().clone(),
            host: compute.host.as_ref().map(|h| h.reference().clone()),
            datastore: state.placement().map(|p| p.datastore.reference().clone()),
            linked_clone: self.clone.linked_clone,
            annotation: self.clone.notes.clone(),
            network,
            mac_address: self.clone.mac_address.clone(),
        };
        source.clone_to(spec).await
    }
}

#[async_trait]
impl Step for StepCloneVm {
    fn name(&self) -> &str {
        "clone_vm"
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        let vm = try_step!(state, self.name(), self.clone_vm(state).await);
        state.set_vm(vm);
        StepAction::Continue
    }

    async fn cleanup(&self, _ctx: &RunContext, state: &mut StateBag) -> BuildResult<()> {
        destroy_on_teardown(state, self.keep_on_error).await
    }
}

async fn destroy_on_teardown(state: &StateBag, keep_on_error: bool) -> BuildResult<()> {
    if !state.should_teardown() || state.vm_destroyed() {
        return Ok(());
    }
    let Some(vm) = state.vm() else {
        return Ok(());
    };
    if keep_on_error {
        warn!(vm = %vm.reference(), "build failed; keeping the VM as requested");
        return Ok(());
    }

    info!(vm = %vm.reference(), "destroying VM");
    vm.power_off().await?;
    vm.destroy().await
}
