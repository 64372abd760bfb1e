//! Guest customization hooks.
//!
//! Provisioners and the guest command channel are supplied by the caller.
//! Both report failures as `anyhow::Error`; the provision step turns them
//! into [`crate::errors::BuildError::Provision`].

mod shell;

pub use shell::ShellProvisioner;

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Result of one guest command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status. Zero means success.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful result with no output.
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    /// True if the command exited with zero.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A command channel into the guest (SSH, WinRM, ...).
#[async_trait]
pub trait Communicator: Send + Sync + Debug {
    /// Runs `command` on the guest at `host`.
    async fn execute(&self, host: &str, command: &str) -> anyhow::Result<CommandOutput>;
}

/// What a provisioner works on.
#[derive(Debug, Clone)]
pub struct ProvisionTarget {
    /// VM name.
    pub vm_name: String,
    /// Guest address.
    pub ip: String,
    /// Command channel, when one is configured.
    pub communicator: Option<Arc<dyn Communicator>>,
}

impl ProvisionTarget {
    /// Creates a target without a command channel.
    #[must_use]
    pub fn new(vm_name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            vm_name: vm_name.into(),
            ip: ip.into(),
            communicator: None,
        }
    }

    /// Sets the command channel.
    #[must_use]
    pub fn with_communicator(mut self, communicator: Option<Arc<dyn Communicator>>) -> Self {
        self.communicator = communicator;
        self
    }

    /// Runs a command, failing on a missing channel or a non-zero exit.
    pub async fn run(&self, command: &str) -> anyhow::Result<CommandOutput> {
        let communicator = self
            .communicator
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no communicator configured for {}", self.vm_name))?;
        let output = communicator.execute(&self.ip, command).await?;
        if !output.is_success() {
            anyhow::bail!(
                "command '{command}' exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(output)
    }
}

/// A customization step run against the booted guest.
#[async_trait]
pub trait Provisioner: Send + Sync + Debug {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Customizes the guest.
    async fn provision(&self, target: &ProvisionTarget) -> anyhow::Result<()>;
}
