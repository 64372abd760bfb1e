//! Core result types: step actions, run status and the artifact.

mod artifact;
mod status;

pub use artifact::{Artifact, LibraryDestination, Location, BUILDER_ID};
pub use status::{RunStatus, StepAction};
