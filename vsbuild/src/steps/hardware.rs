//! Hardware configuration shared by the ISO and clone builds.

use super::{try_step, Step};
use crate::config::HardwareConfig;
use crate::context::{RunContext, StateBag};
use crate::core::StepAction;
use crate::driver::ConfigSpec;
use crate::errors::BuildResult;
use async_trait::async_trait;
use tracing::debug;

/// Applies CPU, memory, firmware and advanced settings in one reconfigure.
///
/// Shared by the ISO and clone pipelines. For clones it also grows the
/// primary disk and sets vApp properties.
#[derive(Debug)]
pub struct StepConfigureHardware {
    hardware: HardwareConfig,
    is_clone: bool,
}

impl StepConfigureHardware {
    /// Creates the step.
    #[must_use]
    pub fn new(hardware: HardwareConfig, is_clone: bool) -> Self {
        Self { hardware, is_clone }
    }

    /// The delta described by the hardware settings, without disk changes.
    #[must_use]
    pub fn config_spec(&self) -> ConfigSpec {
        let hw = &self.hardware;
        let flag = |set: bool| set.then_some(true);
        ConfigSpec {
            num_cpus: hw.cpus,
            cores_per_socket: hw.cpu_cores,
            memory_mb: hw.ram_mb,
            cpu_reservation: hw.cpu_reservation,
            cpu_limit: hw.cpu_limit,
            memory_reservation: hw.ram_reservation,
            memory_reservation_locked_to_max: flag(hw.ram_reserve_all),
            cpu_hot_add: flag(hw.cpu_hot_plug),
            memory_hot_add: flag(hw.memory_hot_plug),
            nested_hv: flag(hw.nested_hv),
            video_ram_kb: hw.video_ram,
            firmware: if self.is_clone { hw.firmware } else { None },
            extra_config: hw.configuration_parameters.clone(),
            ..ConfigSpec::default()
        }
    }

    async fn apply(&self, state: &StateBag) -> BuildResult<()> {
        let vm = state.require_vm()?;
        let mut spec = self.config_spec();

        if self.is_clone {
            if let Some(size_mb) = self.hardware.disk_size_mb {
                spec = spec.with_device_change(vm.resize_disk(size_mb).await?);
            }
        }

        debug!(vm = %vm.reference(), empty = spec.is_empty(), "applying hardware settings");
        vm.reconfigure(spec).await?;

        if self.is_clone {
            vm.update_vapp_properties(&self.hardware.vapp_properties).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Step for StepConfigureHardware {
    fn name(&self) -> &str {
        "configure_hardware"
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        try_step!(state, self.name(), self.apply(state).await);
        StepAction::Continue
    }
}
