use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::model::{InboxMessage, Message};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 600_000;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ModalMessageState {
    #[default]
    Initial,
    Loading(Message),
    Displayed(Message),
    Dismissed(Message),
}

impl ModalMessageState {
    /// The message being loaded or shown, if any.
    pub fn active_message(&self) -> Option<&Message> {
        match self {
            ModalMessageState::Loading(message) | ModalMessageState::Displayed(message) => {
                Some(message)
            }
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_message().is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InlineMessageState {
    ReadyToEmbed(Message),
    Embedded(Message),
    Dismissed(Message),
}

impl InlineMessageState {
    pub fn message(&self) -> &Message {
        match self {
            InlineMessageState::ReadyToEmbed(message)
            | InlineMessageState::Embedded(message)
            | InlineMessageState::Dismissed(message) => message,
        }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, InlineMessageState::Embedded(_))
    }
}

/// Inline messages keyed by the element they are bound to.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueuedInlineMessagesState {
    messages: BTreeMap<String, InlineMessageState>,
}

impl QueuedInlineMessagesState {
    /// Queues `message` for `element_id`, replacing whatever was there.
    pub fn add_message(&self, message: Message, element_id: &str) -> Self {
        let mut messages = self.messages.clone();
        messages.insert(
            element_id.to_string(),
            InlineMessageState::ReadyToEmbed(message),
        );
        Self { messages }
    }

    /// Moves the entry holding `queue_id` to `new_state`. Unknown ids leave
    /// the state unchanged.
    pub fn update_message_state(&self, queue_id: &str, new_state: InlineMessageState) -> Self {
        let Some(element_id) = self
            .messages
            .iter()
            .find(|(_, state)| state.message().queue_id.as_deref() == Some(queue_id))
            .map(|(element_id, _)| element_id.clone())
        else {
            return self.clone();
        };

        let mut messages = self.messages.clone();
        messages.insert(element_id, new_state);
        Self { messages }
    }

    pub fn message(&self, element_id: &str) -> Option<&InlineMessageState> {
        self.messages.get(element_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &InlineMessageState)> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// The single root of the store. Replaced wholesale on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct AppState {
    pub site_id: String,
    pub data_center: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub anonymous_id: Option<String>,
    pub current_route: Option<String>,
    pub poll_interval_ms: u64,
    pub sse_enabled: bool,
    /// Ordered, free of duplicates.
    pub messages_in_queue: Vec<Message>,
    pub shown_message_queue_ids: BTreeSet<String>,
    pub modal_message_state: ModalMessageState,
    pub queued_inline_messages_state: QueuedInlineMessagesState,
    /// Free of duplicate deliveries, in server order.
    pub inbox_messages: Vec<InboxMessage>,
    /// Bumped by the store on every change.
    pub version: u64,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            site_id: String::new(),
            data_center: String::new(),
            session_id: new_session_id(),
            user_id: None,
            anonymous_id: None,
            current_route: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            sse_enabled: false,
            messages_in_queue: Vec::new(),
            shown_message_queue_ids: BTreeSet::new(),
            modal_message_state: ModalMessageState::Initial,
            queued_inline_messages_state: QueuedInlineMessagesState::default(),
            inbox_messages: Vec::new(),
            version: 0,
        }
    }
}

impl AppState {
    pub fn is_user_identified(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn should_use_sse(&self) -> bool {
        self.sse_enabled && self.is_user_identified()
    }

    /// The identified user, falling back to the anonymous id.
    pub fn user_token(&self) -> Option<&str> {
        self.user_id.as_deref().or(self.anonymous_id.as_deref())
    }
}

pub(crate) fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}
