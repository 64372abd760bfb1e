//! Pipeline building and execution.
//!
//! This module provides:
//! - [`PipelineBuilder`], which validates step lists
//! - [`Pipeline`], the sequential runner with reverse-order cleanup
//! - [`RunSummary`], the outcome of one run

mod builder;
mod runner;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use runner::{CleanupFailure, Pipeline, RunSummary};
