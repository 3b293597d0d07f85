//! Frequency caps, cooldowns and dismissal bookkeeping for broadcast and
//! anonymous messages.
//!
//! Identified users track broadcasts under [`Namespace::Broadcast`];
//! anonymous visitors use [`Namespace::Anonymous`]. Each namespace is an
//! independent [`EligibilityCache`] over the same [`KeyValueStore`].
//!
//! [`KeyValueStore`]: crate::persistence::KeyValueStore

pub mod cache;

pub use cache::{EligibilityCache, EligibilityRecord, Namespace};
