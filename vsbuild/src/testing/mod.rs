//! Testing utilities for vsbuild pipelines.
//!
//! This module provides:
//! - An in-memory management API with a small seeded inventory
//! - Mock steps that record their calls
//! - A recording guest command channel
//! - Ready-made configurations matching the seeded inventory

mod fixtures;
mod mocks;
mod simulator;

pub use fixtures::{clone_config, iso_config};
pub use mocks::{CallLog, HaltingStep, RecordingCommunicator, RecordingStep, WaitingStep};
pub use simulator::SimulatedApi;
