//! Shell command provisioner.

use super::{ProvisionTarget, Provisioner};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::info;

/// Runs inline shell commands through the communicator, in order.
///
/// Environment variables are exported in front of every command. The first
/// failing command stops the provisioner.
#[derive(Debug, Clone, Default)]
pub struct ShellProvisioner {
    inline: Vec<String>,
    env: BTreeMap<String, String>,
}

impl ShellProvisioner {
    /// Creates a provisioner for `inline` commands.
    #[must_use]
    pub fn new(inline: Vec<String>) -> Self {
        Self {
            inline,
            env: BTreeMap::new(),
        }
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn command_line(&self, command: &str) -> String {
        if self.env.is_empty() {
            return command.to_string();
        }
        let exports: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{k}='{}'", v.replace('\'', r"'\''")))
            .collect();
        format!("{} {command}", exports.join(" "))
    }
}

#[async_trait]
impl Provisioner for ShellProvisioner {
    fn name(&self) -> &str {
        "shell"
    }

    async fn provision(&self, target: &ProvisionTarget) -> anyhow::Result<()> {
        for (index, command) in self.inline.iter().enumerate() {
            info!(vm = %target.vm_name, index, "running inline command");
            target
                .run(&self.command_line(command))
                .await
                .with_context(|| format!("inline command {} failed", index + 1))?;
        }
        Ok(())
    }
}
