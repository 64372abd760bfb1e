//! Mock steps and a recording guest channel.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::sleep_or_cancel;
use crate::context::{RunContext, StateBag};
use crate::core::StepAction;
use crate::errors::{BuildError, BuildResult};
use crate::provision::{CommandOutput, Communicator};
use crate::steps::{halt, Step};

/// A shared, ordered log of step calls such as `run:connect` and
/// `cleanup:connect`.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// Returns every entry in call order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Returns the entries starting with `prefix`.
    #[must_use]
    pub fn entries_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// A step that continues and records its run and cleanup calls.
#[derive(Debug)]
pub struct RecordingStep {
    name: String,
    log: CallLog,
    cleanup_error: Option<String>,
}

impl RecordingStep {
    /// Creates a new recording step writing to `log`.
    #[must_use]
    pub fn new(name: impl Into<String>, log: &CallLog) -> Self {
        Self {
            name: name.into(),
            log: log.clone(),
            cleanup_error: None,
        }
    }

    /// Makes the cleanup fail with `message`.
    #[must_use]
    pub fn with_cleanup_error(mut self, message: impl Into<String>) -> Self {
        self.cleanup_error = Some(message.into());
        self
    }
}

#[async_trait]
impl Step for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &RunContext, _state: &mut StateBag) -> StepAction {
        self.log.push(format!("run:{}", self.name));
        StepAction::Continue
    }

    async fn cleanup(&self, _ctx: &RunContext, state: &mut StateBag) -> BuildResult<()> {
        let suffix = if state.should_teardown() { ":teardown" } else { "" };
        self.log.push(format!("cleanup:{}{suffix}", self.name));
        match &self.cleanup_error {
            Some(message) => Err(BuildError::Validation(message.clone())),
            None => Ok(()),
        }
    }
}

/// A step that halts, optionally recording an error first.
#[derive(Debug)]
pub struct HaltingStep {
    name: String,
    log: CallLog,
    error: Option<String>,
}

impl HaltingStep {
    /// Creates a step that halts without an error.
    #[must_use]
    pub fn new(name: impl Into<String>, log: &CallLog) -> Self {
        Self {
            name: name.into(),
            log: log.clone(),
            error: None,
        }
    }

    /// Records a validation error with `message` before halting.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }
}

#[async_trait]
impl Step for HaltingStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        self.log.push(format!("run:{}", self.name));
        match &self.error {
            Some(message) => halt(state, &self.name, BuildError::Validation(message.clone())),
            None => StepAction::Halt,
        }
    }

    async fn cleanup(&self, _ctx: &RunContext, _state: &mut StateBag) -> BuildResult<()> {
        self.log.push(format!("cleanup:{}", self.name));
        Ok(())
    }
}

/// A step that waits for `delay`, halting quietly if the run is cancelled
/// first.
#[derive(Debug)]
pub struct WaitingStep {
    name: String,
    log: CallLog,
    delay: Duration,
}

impl WaitingStep {
    /// Creates a new waiting step.
    #[must_use]
    pub fn new(name: impl Into<String>, log: &CallLog, delay: Duration) -> Self {
        Self {
            name: name.into(),
            log: log.clone(),
            delay,
        }
    }
}

#[async_trait]
impl Step for WaitingStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &RunContext, _state: &mut StateBag) -> StepAction {
        self.log.push(format!("run:{}", self.name));
        if sleep_or_cancel(ctx.token(), self.delay).await {
            StepAction::Continue
        } else {
            StepAction::Halt
        }
    }

    async fn cleanup(&self, _ctx: &RunContext, _state: &mut StateBag) -> BuildResult<()> {
        self.log.push(format!("cleanup:{}", self.name));
        Ok(())
    }
}

type CommandHook = Box<dyn Fn(&str) + Send + Sync>;

/// A [`Communicator`] that records commands instead of running them.
///
/// Every command succeeds unless registered with [`fail_on`].
///
/// [`fail_on`]: RecordingCommunicator::fail_on
#[derive(Default)]
pub struct RecordingCommunicator {
    commands: Mutex<Vec<(String, String)>>,
    failures: Vec<(String, i32)>,
    hook: Option<CommandHook>,
}

impl fmt::Debug for RecordingCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingCommunicator")
            .field("commands", &self.commands.lock().len())
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

impl RecordingCommunicator {
    /// Creates a communicator where every command succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes commands ending with `command` exit with `exit_code`.
    #[must_use]
    pub fn fail_on(mut self, command: impl Into<String>, exit_code: i32) -> Self {
        self.failures.push((command.into(), exit_code));
        self
    }

    /// Calls `hook` with every command before it is answered.
    #[must_use]
    pub fn on_command(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Recorded `(host, command)` pairs, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl Communicator for RecordingCommunicator {
    async fn execute(&self, host: &str, command: &str) -> anyhow::Result<CommandOutput> {
        self.commands
            .lock()
            .push((host.to_string(), command.to_string()));
        if let Some(hook) = &self.hook {
            hook(command);
        }
        let exit_code = self
            .failures
            .iter()
            .find(|(failing, _)| command.ends_with(failing.as_str()))
            .map_or(0, |(_, code)| *code);
        Ok(CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("{command}: failed")
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_step() {
        let log = CallLog::new();
        let step = RecordingStep::new("record", &log);
        let ctx = RunContext::new("t");
        let mut state = StateBag::new();

        assert_eq!(step.run(&ctx, &mut state).await, StepAction::Continue);
        state.mark_halted();
        step.cleanup(&ctx, &mut state).await.unwrap();

        assert_eq!(log.entries(), vec!["run:record", "cleanup:record:teardown"]);
    }

    #[tokio::test]
    async fn test_halting_step_records_error() {
        let log = CallLog::new();
        let mut state = StateBag::new();

        let action = HaltingStep::new("boom", &log)
            .with_error("no")
            .run(&RunContext::new("t"), &mut state)
            .await;

        assert_eq!(action, StepAction::Halt);
        assert!(state.error().is_some());
    }

    #[tokio::test]
    async fn test_recording_communicator() {
        let comm = RecordingCommunicator::new().fail_on("false", 1);

        let ok = comm.execute("10.0.0.5", "true").await.unwrap();
        let failed = comm.execute("10.0.0.5", "false").await.unwrap();

        assert!(ok.is_success());
        assert_eq!(failed.exit_code, 1);
        assert_eq!(comm.commands().len(), 2);
    }
}
