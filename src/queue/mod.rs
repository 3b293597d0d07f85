//! Polling fallback and the shared message intake path.
//!
//! Both the realtime stream and the polling client hand full server lists
//! to [`MessageIntake`], which applies broadcast eligibility before the
//! queue reaches the store.

pub mod http;
pub mod intake;

pub use http::{HttpMessageQueue, run_polling};
pub use intake::MessageIntake;

#[cfg(test)]
mod tests;
