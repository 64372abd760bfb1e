//! Guest-facing steps: wait for an address, provision, shut down.

use super::{try_step, Step};
use crate::cancellation::poll_until;
use crate::config::{ShutdownConfig, WaitIpConfig};
use crate::context::{RunContext, StateBag};
use crate::core::StepAction;
use crate::driver::PowerState;
use crate::errors::{BuildError, BuildResult};
use crate::provision::{Communicator, ProvisionTarget, Provisioner};
use crate::utils::Cidr;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Waits for the guest to report an address and publishes `ip`.
///
/// An address counts once it has been reported unchanged for
/// `ip_settle_timeout`. With `ip_wait_address` set, addresses outside that
/// prefix are ignored.
#[derive(Debug)]
pub struct StepWaitForIp {
    wait: WaitIpConfig,
}

impl StepWaitForIp {
    /// Creates the step.
    #[must_use]
    pub fn new(wait: WaitIpConfig) -> Self {
        Self { wait }
    }

    fn filter(&self) -> BuildResult<Option<Cidr>> {
        self.wait
            .ip_wait_address
            .as_deref()
            .map(|s| s.parse().map_err(BuildError::Validation))
            .transpose()
    }

    async fn wait_for_ip(&self, ctx: &RunContext, state: &StateBag) -> BuildResult<Option<String>> {
        let vm = state.require_vm()?;
        let filter = self.filter()?;
        let settle = self.wait.ip_settle_timeout;
        let seen: Mutex<Option<(String, Instant)>> = Mutex::new(None);

        let (filter, seen) = (&filter, &seen);
        let outcome = poll_until(
            ctx.token(),
            self.wait.ip_wait_timeout,
            self.wait.poll_interval,
            move || async move {
                let ip = vm.guest_ip().await?.filter(|ip| accepts(filter.as_ref(), ip));
                let mut seen = seen.lock();
                let Some(ip) = ip else {
                    *seen = None;
                    return Ok::<_, BuildError>(None);
                };
                if let Some((last, since)) = seen.as_ref() {
                    if *last == ip {
                        return Ok((since.elapsed() >= settle).then_some(ip));
                    }
                }
                debug!(ip = %ip, "guest reported address, waiting for it to settle");
                *seen = Some((ip.clone(), Instant::now()));
                Ok(settle.is_zero().then_some(ip))
            },
        )
        .await?;

        outcome.into_result("guest IP address", self.wait.ip_wait_timeout)
    }
}

fn accepts(filter: Option<&Cidr>, ip: &str) -> bool {
    match filter {
        None => true,
        Some(cidr) => ip.parse::<IpAddr>().is_ok_and(|addr| cidr.contains(addr)),
    }
}

#[async_trait]
impl Step for StepWaitForIp {
    fn name(&self) -> &str {
        "wait_ip"
    }

    async fn run(&self, ctx: &RunContext, state: &mut StateBag) -> StepAction {
        if self.wait.disable {
            return StepAction::Continue;
        }
        info!(timeout = ?self.wait.ip_wait_timeout, "waiting for guest IP address");
        match try_step!(state, self.name(), self.wait_for_ip(ctx, state).await) {
            Some(ip) => {
                info!(ip = %ip, "guest IP address found");
                state.set_ip(ip);
                StepAction::Continue
            }
            None => StepAction::Halt,
        }
    }
}

/// Runs the caller's provisioners against the guest in order.
#[derive(Debug, Default)]
pub struct StepProvision {
    vm_name: String,
    provisioners: Vec<Arc<dyn Provisioner>>,
    communicator: Option<Arc<dyn Communicator>>,
}

impl StepProvision {
    /// Creates the step.
    #[must_use]
    pub fn new(
        vm_name: impl Into<String>,
        provisioners: Vec<Arc<dyn Provisioner>>,
        communicator: Option<Arc<dyn Communicator>>,
    ) -> Self {
        Self {
            vm_name: vm_name.into(),
            provisioners,
            communicator,
        }
    }
}

#[async_trait]
impl Step for StepProvision {
    fn name(&self) -> &str {
        "provision"
    }

    async fn run(&self, ctx: &RunContext, state: &mut StateBag) -> StepAction {
        if self.provisioners.is_empty() {
            return StepAction::Continue;
        }
        let ip = try_step!(state, self.name(), state.require_ip()).clone();
        let target = ProvisionTarget::new(&self.vm_name, ip)
            .with_communicator(self.communicator.clone());

        for provisioner in &self.provisioners {
            if ctx.is_cancelled() {
                return StepAction::Halt;
            }
            info!(provisioner = provisioner.name(), "running provisioner");
            try_step!(
                state,
                self.name(),
                provisioner
                    .provision(&target)
                    .await
                    .map_err(|e| BuildError::Provision(format!("{}: {e:#}", provisioner.name())))
            );
        }
        StepAction::Continue
    }
}

/// Shuts the guest down and waits for it to power off.
///
/// With a `shutdown_command` the command is sent through the communicator,
/// otherwise guest tools are asked to shut down. A VM that is already off is
/// left alone. With `disable_shutdown` nothing is sent and the step only
/// waits for the guest to power itself off.
#[derive(Debug)]
pub struct StepShutdown {
    shutdown: ShutdownConfig,
    communicator: Option<Arc<dyn Communicator>>,
}

impl StepShutdown {
    /// Creates the step.
    #[must_use]
    pub fn new(shutdown: ShutdownConfig, communicator: Option<Arc<dyn Communicator>>) -> Self {
        Self {
            shutdown,
            communicator,
        }
    }

    async fn request_shutdown(&self, state: &StateBag) -> BuildResult<bool> {
        let vm = state.require_vm()?;
        if vm.power_state().await? == PowerState::PoweredOff {
            debug!(vm = %vm.reference(), "VM already powered off");
            return Ok(false);
        }

        match &self.shutdown.shutdown_command {
            Some(command) => {
                let ip = state.require_ip()?;
                let target = ProvisionTarget::new(vm.reference().id.clone(), ip.clone())
                    .with_communicator(self.communicator.clone());
                info!(command = %command, "running shutdown command");
                target
                    .run(command)
                    .await
                    .map_err(|e| BuildError::Provision(format!("shutdown command: {e:#}")))?;
            }
            None => {
                info!(vm = %vm.reference(), "asking guest tools to shut down");
                vm.start_shutdown().await?;
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl Step for StepShutdown {
    fn name(&self) -> &str {
        "shutdown"
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        if self.shutdown.disable_shutdown {
            info!(
                timeout = ?self.shutdown.shutdown_timeout,
                "automatic shutdown disabled; waiting for the guest to power off"
            );
        } else if !try_step!(state, self.name(), self.request_shutdown(state).await) {
            return StepAction::Continue;
        }

        let vm = try_step!(state, self.name(), state.require_vm()).clone();
        let stopped = try_step!(
            state,
            self.name(),
            vm.wait_for_shutdown(self.shutdown.shutdown_timeout, self.shutdown.poll_interval)
                .await
        );
        if stopped {
            info!(vm = %vm.reference(), "guest powered off");
            StepAction::Continue
        } else {
            StepAction::Halt
        }
    }
}
