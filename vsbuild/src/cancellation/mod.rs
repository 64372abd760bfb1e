//! Cooperative cancellation and bounded waiting.
//!
//! This module provides:
//! - CancellationToken shared by every remote call and poll loop of a run
//! - `poll_until`, the single polling primitive that separates a timeout
//!   (an error for the caller) from a cancellation (a quiet early return)

mod token;
mod wait;

pub use token::CancellationToken;
pub use wait::{poll_until, sleep_or_cancel, WaitOutcome};
