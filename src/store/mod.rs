//! The central state store.
//!
//! Actions flow through an ordered chain of pure middleware, are reduced
//! into a fresh [`AppState`] snapshot, and the side effects the middleware
//! asked for run afterwards. See [`InAppMessagingStore`] for the dispatch
//! and listener guarantees.

pub mod action;
mod listeners;
pub mod manager;
pub mod middleware;
pub mod reducer;
pub mod state;

pub use action::{Action, EngineAction, InboxAction};
pub use listeners::Subscription;
pub use manager::{InAppEventListener, InAppMessagingStore, MessageQueue, MessageRenderer};
pub use middleware::{Effect, ListenerEvent};
pub use state::{AppState, InlineMessageState, ModalMessageState, QueuedInlineMessagesState};

#[cfg(test)]
mod tests;
