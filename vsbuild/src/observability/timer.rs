//! Wall-clock timing of steps.

use std::time::Duration;
use tokio::time::Instant;

/// Measures how long a step took.
///
/// Uses tokio's clock so paused-time tests report virtual durations.
#[derive(Debug)]
pub struct StepTimer {
    start: Instant,
    step: String,
}

impl StepTimer {
    /// Starts timing `step`.
    #[must_use]
    pub fn start(step: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            step: step.into(),
        }
    }

    /// The step being timed.
    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Time since start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time since start in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}
