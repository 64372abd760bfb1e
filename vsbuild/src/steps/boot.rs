//! Boot order and boot command steps.

use super::{try_step, Step};
use crate::bootcommand::{self, BootBatch, BootVars, MAX_KEYS_PER_BATCH};
use crate::cancellation::sleep_or_cancel;
use crate::config::BootConfig;
use crate::context::{RunContext, StateBag};
use crate::core::StepAction;
use crate::driver::spec::parse_boot_order;
use crate::errors::{BuildError, BuildResult};
use async_trait::async_trait;
use tracing::{debug, info};

/// Sets the boot order before power on.
///
/// A configured order is restored to the default by cleanup once the build
/// succeeded, so the finished VM boots normally. After a failure the VM is
/// about to be destroyed and a template can no longer be reconfigured, so
/// nothing is restored in those cases.
#[derive(Debug)]
pub struct StepBootOrder {
    boot_order: Option<String>,
}

impl StepBootOrder {
    /// Creates the step. `None` leaves the order alone.
    #[must_use]
    pub fn new(boot_order: Option<String>) -> Self {
        Self { boot_order }
    }
}

#[async_trait]
impl Step for StepBootOrder {
    fn name(&self) -> &str {
        "boot_order"
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        let Some(order) = self.boot_order.as_deref() else {
            return StepAction::Continue;
        };
        let devices = try_step!(state, self.name(), parse_boot_order(order));
        let vm = try_step!(state, self.name(), state.require_vm()).clone();
        try_step!(state, self.name(), vm.set_boot_order(devices).await);
        debug!(order, "boot order set");
        StepAction::Continue
    }

    async fn cleanup(&self, _ctx: &RunContext, state: &mut StateBag) -> BuildResult<()> {
        if self.boot_order.is_none()
            || state.should_teardown()
            || state.template()
            || state.vm_destroyed()
        {
            return Ok(());
        }
        let Some(vm) = state.vm() else {
            return Ok(());
        };
        vm.set_boot_order(Vec::new()).await
    }
}

/// Types the boot command into the console after `boot_wait`.
///
/// Keys are sent in batches; `boot_keygroup_interval` separates batches.
/// Cancellation during a pause halts without recording an error.
#[derive(Debug)]
pub struct StepBootCommand {
    vm_name: String,
    boot: BootConfig,
}

impl StepBootCommand {
    /// Creates the step.
    #[must_use]
    pub fn new(vm_name: impl Into<String>, boot: BootConfig) -> Self {
        Self {
            vm_name: vm_name.into(),
            boot,
        }
    }

    fn plan(&self) -> BuildResult<Vec<BootBatch>> {
        let vars = BootVars {
            http_ip: self.boot.http_ip.clone(),
            http_port: self.boot.http_port,
            name: self.vm_name.clone(),
        };
        let command = bootcommand::render(&self.boot.boot_command.concat(), &vars)
            .map_err(|e| BuildError::Validation(format!("boot command: {e}")))?;
        let actions = bootcommand::parse(&command)
            .map_err(|e| BuildError::Validation(format!("boot command: {e}")))?;
        Ok(bootcommand::batches(&actions, MAX_KEYS_PER_BATCH))
    }
}

#[async_trait]
impl Step for StepBootCommand {
    fn name(&self) -> &str {
        "boot_command"
    }

    async fn run(&self, ctx: &RunContext, state: &mut StateBag) -> StepAction {
        if self.boot.boot_command.is_empty() {
            return StepAction::Continue;
        }
        let batches = try_step!(state, self.name(), self.plan());
        let vm = try_step!(state, self.name(), state.require_vm()).clone();

        info!(wait = ?self.boot.boot_wait, "waiting before typing boot command");
        if !sleep_or_cancel(ctx.token(), self.boot.boot_wait).await {
            return StepAction::Halt;
        }

        let mut first = true;
        for batch in batches {
            match batch {
                BootBatch::Wait(pause) => {
                    if !sleep_or_cancel(ctx.token(), pause).await {
                        return StepAction::Halt;
                    }
                }
                BootBatch::Keys(codes) => {
                    if !first && !sleep_or_cancel(ctx.token(), self.boot.boot_keygroup_interval).await {
                        return StepAction::Halt;
                    }
                    first = false;
                    debug!(keys = codes.len(), "sending key batch");
                    try_step!(state, self.name(), vm.put_usb_scan_codes(codes).await);
                }
            }
        }
        info!("boot command sent");
        StepAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{BootDevice, Operation};
    use crate::testing::SimulatedApi;
    use std::time::Duration;

    async fn vm_state(sim: &SimulatedApi) -> StateBag {
        let vm_ref = sim.add_vm("ubuntu", false);
        let driver = sim.connect().await;
        let mut state = StateBag::new();
        state.set_vm(driver.vm(vm_ref));
        state
    }

    fn boot_orders(sim: &SimulatedApi) -> Vec<Vec<BootDevice>> {
        sim.submitted()
            .into_iter()
            .filter_map(|op| match op {
                Operation::Reconfigure { spec, .. } => spec.boot_order,
                _ => None,
            })
            .collect()
    }

    fn key_calls(sim: &SimulatedApi) -> Vec<usize> {
        sim.submitted()
            .into_iter()
            .filter_map(|op| match op {
                Operation::PutUsbScanCodes { codes, .. } => Some(codes.len()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_boot_order_restored_after_success() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim).await;
        let ctx = RunContext::new("ubuntu");
        let step = StepBootOrder::new(Some("disk,cdrom".into()));

        assert_eq!(step.run(&ctx, &mut state).await, StepAction::Continue);
        step.cleanup(&ctx, &mut state).await.unwrap();

        assert_eq!(
            boot_orders(&sim),
            vec![vec![BootDevice::Disk, BootDevice::Cdrom], Vec::new()]
        );
    }

    #[tokio::test]
    async fn test_boot_order_left_alone_for_templates() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim).await;
        let ctx = RunContext::new("ubuntu");
        let step = StepBootOrder::new(Some("cdrom".into()));

        step.run(&ctx, &mut state).await;
        state.set_template();
        step.cleanup(&ctx, &mut state).await.unwrap();

        assert_eq!(boot_orders(&sim).len(), 1);
    }

    #[tokio::test]
    async fn test_boot_order_left_alone_for_destroyed_vm() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim).await;
        let ctx = RunContext::new("ubuntu");
        let step = StepBootOrder::new(Some("disk,cdrom".into()));

        step.run(&ctx, &mut state).await;
        state.set_vm_destroyed();
        step.cleanup(&ctx, &mut state).await.unwrap();

        assert_eq!(boot_orders(&sim).len(), 1);
    }

    #[tokio::test]
    async fn test_unset_boot_order_is_noop() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim).await;
        let ctx = RunContext::new("ubuntu");
        let step = StepBootOrder::new(None);

        step.run(&ctx, &mut state).await;
        step.cleanup(&ctx, &mut state).await.unwrap();

        assert!(sim.submitted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_command_is_sent_in_groups() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim).await;
        let boot = BootConfig {
            boot_wait: Duration::from_secs(5),
            boot_command: vec!["linux ks=http://{{ .HTTPIP }}:{{ .HTTPPort }}/ks.cfg".into(), "<enter><wait>".into(), "ok<enter>".into()],
            http_ip: Some("10.0.0.1".into()),
            http_port: Some(8080),
            ..BootConfig::default()
        };
        let step = StepBootCommand::new("ubuntu", boot);

        let start = tokio::time::Instant::now();
        assert_eq!(step.run(&RunContext::new("ubuntu"), &mut state).await, StepAction::Continue);

        let calls = key_calls(&sim);
        let total: usize = calls.iter().sum();
        assert_eq!(total, "linux ks=http://10.0.0.1:8080/ks.cfg".len() + 1 + 3);
        assert!(calls.iter().all(|n| *n <= MAX_KEYS_PER_BATCH));
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_missing_http_ip_halts() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim).await;
        let boot = BootConfig {
            boot_command: vec!["{{ .HTTPIP }}".into()],
            ..BootConfig::default()
        };

        let action = StepBootCommand::new("ubuntu", boot)
            .run(&RunContext::new("ubuntu"), &mut state)
            .await;

        assert_eq!(action, StepAction::Halt);
        assert!(state.error().unwrap().to_string().contains("HTTPIP"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_boot_wait_is_quiet() {
        let sim = SimulatedApi::new();
        let mut state = vm_state(&sim).await;
        let ctx = RunContext::new("ubuntu");
        ctx.cancel("interrupt");
        let boot = BootConfig {
            boot_command: vec!["root<enter>".into()],
            ..BootConfig::default()
        };

        let action = StepBootCommand::new("ubuntu", boot).run(&ctx, &mut state).await;

        assert_eq!(action, StepAction::Halt);
        assert!(state.error().is_none());
        assert!(key_calls(&sim).is_empty());
    }
}
