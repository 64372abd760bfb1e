//! Power on.

use super::{try_step, Step};
use crate::context::{RunContext, StateBag};
use crate::core::StepAction;
use crate::errors::BuildResult;
use async_trait::async_trait;
use tracing::info;

/// Powers the VM on. On halt or cancellation the VM is powered off again.
#[derive(Debug, Default)]
pub struct StepPowerOn;

impl StepPowerOn {
    /// Creates the step.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Step for StepPowerOn {
    fn name(&self) -> &str {
        "power_on"
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        let vm = try_step!(state, self.name(), state.require_vm()).clone();
        try_step!(state, self.name(), vm.power_on().await);
        StepAction::Continue
    }

    async fn cleanup(&self, _ctx: &RunContext, state: &mut StateBag) -> BuildResult<()> {
        if !state.should_teardown() || state.vm_destroyed() {
            return Ok(());
        }
        let Some(vm) = state.vm() else {
            return Ok(());
        };
        info!(vm = %vm.reference(), "powering off after failed build");
        vm.power_off().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::PowerState;
    use crate::testing::SimulatedApi;

    #[tokio::test]
    async fn test_power_on_then_off_on_halt() {
        let sim = SimulatedApi::new();
        let vm_ref = sim.add_vm("ubuntu", false);
        let driver = sim.connect().await;
        let mut state = StateBag::new();
        state.set_vm(driver.vm(vm_ref));
        let ctx = RunContext::new("ubuntu");

        assert_eq!(StepPowerOn::new().run(&ctx, &mut state).await, StepAction::Continue);
        let vm = state.vm().unwrap().clone();
        assert_eq!(vm.power_state().await.unwrap(), PowerState::PoweredOn);

        StepPowerOn::new().cleanup(&ctx, &mut state).await.unwrap();
        assert_eq!(vm.power_state().await.unwrap(), PowerState::PoweredOn);

        state.mark_halted();
        StepPowerOn::new().cleanup(&ctx, &mut state).await.unwrap();
        assert_eq!(vm.power_state().await.unwrap(), PowerState::PoweredOff);
    }

    #[tokio::test]
    async fn test_without_vm_halts() {
        let mut state = StateBag::new();
        let action = StepPowerOn::new().run(&RunContext::new("t"), &mut state).await;
        assert_eq!(action, StepAction::Halt);
        assert!(state.error().unwrap().is_fatal());
    }
}
