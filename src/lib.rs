//! # In-app messaging
//!
//! `inapp_messaging` is the client-side core of an in-app messaging SDK. It
//! receives messages over a server-sent events stream (falling back to
//! polling), decides which of them may be shown, and keeps the display state
//! in a single redux-like store.
//!
//! ## Core Modules
//!
//! - `config`: Loads settings from defaults, an optional file and the environment.
//! - `eligibility`: Frequency caps and cooldowns for broadcast and anonymous messages.
//! - `inbox`: Host-facing access to inbox entries delivered on the stream.
//! - `model`: The `Message` and `InboxMessage` types.
//! - `persistence`: Namespaced key-value storage backed by sled or memory.
//! - `queue`: The polling client and the intake path shared with the stream.
//! - `sse`: Stream transport, heartbeat watchdog, retry policy and connection lifecycle.
//! - `store`: Actions, middleware, the reducer and the state store.
//! - `utils`: Shared utilities such as error handling, logging and clocks.

pub mod config;
pub mod eligibility;
pub mod inbox;
pub mod model;
pub mod persistence;
pub mod queue;
pub mod sse;
pub mod store;
pub mod utils;
