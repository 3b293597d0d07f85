//! The `utils` module provides a collection of utility functions and common
//! definitions used across the crate.
//!
//! It centralizes the crate-wide error type, logging initialization and the
//! wall-clock abstraction used by time-sensitive bookkeeping.

pub mod clock;
pub mod error;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
