//! Logging setup and step timing.

mod logging;
mod timer;

pub use logging::{init_tracing, LogFormat, LOG_ENV};
pub use timer::StepTimer;
