//! Final steps: snapshot, template conversion and metadata.

use super::{try_step, Step};
use crate::context::{RunContext, StateBag};
use crate::core::StepAction;
use crate::driver::PowerState;
use crate::errors::{BuildError, BuildResult};
use crate::metadata::LabelWriter;
use async_trait::async_trait;
use tracing::info;

/// Takes the final snapshot and publishes `snapshot`.
#[derive(Debug)]
pub struct StepCreateSnapshot {
    enabled: bool,
    name: String,
}

impl StepCreateSnapshot {
    /// Creates the step. Disabled steps do nothing.
    #[must_use]
    pub fn new(enabled: bool, name: impl Into<String>) -> Self {
        Self {
            enabled,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Step for StepCreateSnapshot {
    fn name(&self) -> &str {
        "create_snapshot"
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        if !self.enabled {
            return StepAction::Continue;
        }
        let vm = try_step!(state, self.name(), state.require_vm()).clone();
        try_step!(state, self.name(), vm.create_snapshot(&self.name, "").await);
        state.set_snapshot(self.name.clone());
        StepAction::Continue
    }
}

/// Marks the powered-off VM as template and publishes `template`.
#[derive(Debug)]
pub struct StepConvertToTemplate {
    enabled: bool,
}

impl StepConvertToTemplate {
    /// Creates the step. Disabled steps do nothing.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    async fn convert(state: &StateBag) -> BuildResult<()> {
        let vm = state.require_vm()?;
        if vm.power_state().await? != PowerState::PoweredOff {
            return Err(BuildError::Validation(
                "the VM must be powered off to become a template".into(),
            ));
        }
        vm.convert_to_template().await
    }
}

#[async_trait]
impl Step for StepConvertToTemplate {
    fn name(&self) -> &str {
        "convert_to_template"
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        if !self.enabled {
            return StepAction::Continue;
        }
        try_step!(state, self.name(), Self::convert(state).await);
        state.set_template();
        StepAction::Continue
    }
}

/// Reads the VM's structural metadata into the run's labels.
///
/// Unreadable items are skipped, so this step never halts once a VM exists.
#[derive(Debug, Default)]
pub struct StepCollectMetadata;

impl StepCollectMetadata {
    /// Creates the step.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Step for StepCollectMetadata {
    fn name(&self) -> &str {
        "collect_metadata"
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        let vm = try_step!(state, self.name(), state.require_vm()).clone();
        LabelWriter::new(state.labels_mut()).write_vm_info(&vm).await;
        info!(labels = state.labels().len(), "VM metadata collected");
        StepAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Operation;
    use crate::testing::SimulatedApi;

    async fn vm_state(sim: &SimulatedApi) -> StateBag {
        let vm_ref = sim.add_vm("ubuntu", false);
        let driver = sim.connect().await;
        let mut state = StateBag::new();
        state.set_vm(driver.vm(vm_ref));
        state
    }

    #[tokio::test]
    async fn test_snapshot_publishes_name() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim).await;

        let action = StepCreateSnapshot::new(true, "Created by vsbuild")
            .run(&RunContext::new("t"), &mut state)
            .await;

        assert_eq!(action, StepAction::Continue);
        assert_eq!(state.snapshot().unwrap(), "Created by vsbuild");
        assert!(matches!(sim.submitted()[0], Operation::CreateSnapshot { .. }));
    }

    #[tokio::test]
    async fn test_disabled_steps_do_nothing() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim).await;
        let ctx = RunContext::new("t");

        StepCreateSnapshot::new(false, "x").run(&ctx, &mut state).await;
        StepConvertToTemplate::new(false).run(&ctx, &mut state).await;

        assert!(sim.submitted().is_empty());
        assert!(!state.template());
    }

    #[tokio::test]
    async fn test_template_requires_powered_off_vm() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim).await;
        state.vm().unwrap().power_on().await.unwrap();

        let action = StepConvertToTemplate::new(true)
            .run(&RunContext::new("t"), &mut state)
            .await;

        assert_eq!(action, StepAction::Halt);
        assert!(!state.template());
    }

    #[tokio::test]
    async fn test_template_conversion_and_metadata() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim).await;
        let ctx = RunContext::new("t");

        assert_eq!(StepConvertToTemplate::new(true).run(&ctx, &mut state).await, StepAction::Continue);
        assert_eq!(StepCollectMetadata::new().run(&ctx, &mut state).await, StepAction::Continue);

        assert!(state.template());
        assert_eq!(state.labels()["template"], "true");
    }
}
