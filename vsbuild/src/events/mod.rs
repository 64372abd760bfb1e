//! Structured build events.
//!
//! Each run carries its own sink on [`crate::context::RunContext`]; there is
//! no process-wide sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A step's `run` is about to be called.
pub const STEP_STARTED: &str = "step.started";
/// A step returned `Continue`.
pub const STEP_COMPLETED: &str = "step.completed";
/// A step returned `Halt`.
pub const STEP_HALTED: &str = "step.halted";
/// A step's cleanup returned an error.
pub const STEP_CLEANUP_FAILED: &str = "step.cleanup_failed";
/// The runner finished, including cleanup.
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
