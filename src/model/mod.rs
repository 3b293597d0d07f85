//! Message value types delivered by the stream and the polling queue.

pub mod inbox;
pub mod message;

pub use inbox::{InboxMessage, InboxMessageResponse, parse_timestamp};
pub use message::{BroadcastFrequency, GistProperties, Message, MessagePosition};
