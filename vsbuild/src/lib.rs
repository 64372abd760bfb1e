//! # vsbuild
//!
//! Builds virtual machine images on a vSphere-style management plane.
//!
//! A build is a pipeline of steps sharing a typed state bag:
//!
//! - **Steps**: connect, resolve placement, cache and upload media, create or
//!   clone the VM, configure it, boot and provision it, then snapshot,
//!   template or capture it into a content library
//! - **Cleanup**: every started step is cleaned up in reverse order, and
//!   halted or cancelled builds tear their resources down
//! - **Driver**: typed operations over a [`driver::ManagementApi`] with
//!   submit-then-wait task handling
//! - **Artifact**: the result record with labels collected from the VM
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vsbuild::prelude::*;
//!
//! init_tracing(LogFormat::Pretty);
//! let config = BuildConfig::from_file(Path::new("ubuntu.json"))?;
//!
//! match Builder::new(config, api).run().await? {
//!     BuildOutcome::Completed(artifact) => println!("{artifact}"),
//!     BuildOutcome::Cancelled => println!("cancelled"),
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod bootcommand;
pub mod builder;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod driver;
pub mod errors;
pub mod events;
pub mod metadata;
pub mod observability;
pub mod pipeline;
pub mod provision;
pub mod resolver;
pub mod steps;
pub mod testing;
pub mod upload;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::builder::{BuildOutcome, Builder};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{BuildConfig, SourceConfig};
    pub use crate::context::{RunContext, StateBag};
    pub use crate::core::{Artifact, Location, RunStatus, StepAction};
    pub use crate::driver::{Driver, ManagementApi, VirtualMachine};
    pub use crate::errors::{BuildError, BuildResult, ConfigError, RemoteError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{Pipeline, PipelineBuilder, RunSummary};
    pub use crate::provision::{Communicator, Provisioner, ShellProvisioner};
    pub use crate::steps::Step;
    pub use crate::upload::{DefaultDownloader, Downloader};
}
