//! Sequential step execution with reverse-order cleanup.

use crate::context::{RunContext, StateBag};
use crate::core::{RunStatus, StepAction};
use crate::errors::BuildError;
use crate::events::{
    PIPELINE_COMPLETED, STEP_CLEANUP_FAILED, STEP_COMPLETED, STEP_HALTED, STEP_STARTED,
};
use crate::observability::StepTimer;
use crate::steps::Step;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A cleanup that returned an error.
#[derive(Debug)]
pub struct CleanupFailure {
    /// The step whose cleanup failed.
    pub step: String,
    /// What went wrong.
    pub error: BuildError,
}

/// Result of one pipeline run.
///
/// The run's error, if any, stays in the [`StateBag`].
#[derive(Debug)]
pub struct RunSummary {
    /// How the run ended.
    pub status: RunStatus,
    /// Names of the steps whose `run` was called, in order.
    pub steps_run: Vec<String>,
    /// Cleanup errors, in cleanup order.
    pub cleanup_failures: Vec<CleanupFailure>,
    /// Wall time including cleanup.
    pub elapsed: Duration,
}

impl RunSummary {
    /// Returns true if every step continued.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// An ordered list of steps sharing one [`StateBag`].
///
/// Steps run strictly in order until one halts or the run is cancelled.
/// Afterwards every started step is cleaned up in reverse order, whatever
/// the outcome. Build one with [`super::PipelineBuilder`].
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    steps: Vec<Arc<dyn Step>>,
}

impl Pipeline {
    pub(crate) fn new(name: String, steps: Vec<Arc<dyn Step>>) -> Self {
        Self { name, steps }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the step names in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the pipeline has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs the steps, then their cleanups.
    pub async fn run(&self, ctx: &RunContext, state: &mut StateBag) -> RunSummary {
        let start = Instant::now();
        let mut started = 0;
        let mut steps_run = Vec::new();
        info!(pipeline = %self.name, steps = self.steps.len(), "pipeline started");

        for step in &self.steps {
            if ctx.is_cancelled() {
                info!(pipeline = %self.name, next = step.name(), "cancelled between steps");
                state.mark_cancelled();
                break;
            }

            let timer = StepTimer::start(step.name());
            ctx.emit(STEP_STARTED, serde_json::json!({ "step": step.name() }));
            debug!(step = step.name(), "step started");
            started += 1;
            steps_run.push(step.name().to_string());

            match step.run(ctx, state).await {
                StepAction::Continue => {
                    ctx.emit(
                        STEP_COMPLETED,
                        serde_json::json!({ "step": step.name(), "duration_ms": timer.elapsed_ms() }),
                    );
                    info!(step = step.name(), elapsed = ?timer.elapsed(), "step completed");
                }
                StepAction::Halt => {
                    if ctx.is_cancelled() {
                        state.mark_cancelled();
                    } else {
                        state.mark_halted();
                    }
                    ctx.emit(
                        STEP_HALTED,
                        serde_json::json!({
                            "step": step.name(),
                            "duration_ms": timer.elapsed_ms(),
                            "cancelled": state.cancelled(),
                            "error": state.error().map(ToString::to_string),
                        }),
                    );
                    info!(step = step.name(), cancelled = state.cancelled(), "step halted the run");
                    break;
                }
            }
        }

        state.begin_teardown();
        let mut cleanup_failures = Vec::new();
        for step in self.steps[..started].iter().rev() {
            if let Err(error) = step.cleanup(ctx, state).await {
                warn!(step = step.name(), error = %error, "cleanup failed");
                ctx.emit(
                    STEP_CLEANUP_FAILED,
                    serde_json::json!({ "step": step.name(), "error": error.to_string() }),
                );
                cleanup_failures.push(CleanupFailure {
                    step: step.name().to_string(),
                    error,
                });
            }
        }

        let status = if state.cancelled() {
            RunStatus::Cancelled
        } else if state.halted() {
            RunStatus::Halted
        } else {
            RunStatus::Completed
        };
        let elapsed = start.elapsed();
        ctx.emit(
            PIPELINE_COMPLETED,
            serde_json::json!({
                "pipeline": self.name,
                "status": status,
                "steps_run": steps_run.len(),
                "cleanup_failures": cleanup_failures.len(),
                "duration_ms": elapsed.as_secs_f64() * 1000.0,
            }),
        );
        info!(pipeline = %self.name, %status, ?elapsed, "pipeline finished");

        RunSummary {
            status,
            steps_run,
            cleanup_failures,
            elapsed,
        }
    }
}
