//! Read and update the user's inbox.
//!
//! Inbox entries arrive on the realtime stream and live in the store. This
//! module is the host-facing handle: it lists entries newest first,
//! optionally narrowed to a topic, reports changes, and turns user actions
//! into store dispatches that are synced to the server.

use std::sync::{Arc, Weak};

use tracing::debug;

use crate::model::InboxMessage;
use crate::store::{Action, InAppMessagingStore, InboxAction, Subscription};

pub struct MessageInbox {
    store: Weak<InAppMessagingStore>,
}

impl MessageInbox {
    pub fn new(store: &Arc<InAppMessagingStore>) -> Self {
        Self {
            store: Arc::downgrade(store),
        }
    }

    /// Current entries, newest first. A topic matches case-insensitively.
    pub fn messages(&self, topic: Option<&str>) -> Vec<InboxMessage> {
        match self.store.upgrade() {
            Some(store) => filter_by_topic(&store.state().inbox_messages, topic),
            None => Vec::new(),
        }
    }

    /// Calls `listener` with the filtered entries now and whenever the inbox
    /// changes. Dropping the returned [`Subscription`] stops the calls.
    pub fn subscribe<F>(&self, topic: Option<&str>, listener: F) -> Option<Subscription>
    where
        F: Fn(&[InboxMessage]) + Send + Sync + 'static,
    {
        let store = self.store.upgrade()?;
        let topic = topic.map(str::to_owned);
        Some(store.subscribe_to_attribute(
            |state| state.inbox_messages.clone(),
            move |messages| listener(&filter_by_topic(messages, topic.as_deref())),
        ))
    }

    pub fn mark_opened(&self, message: &InboxMessage) {
        self.update_opened(message, true);
    }

    pub fn mark_unopened(&self, message: &InboxMessage) {
        self.update_opened(message, false);
    }

    pub fn mark_deleted(&self, message: &InboxMessage) {
        self.dispatch(InboxAction::DeleteMessage(message.clone()));
    }

    fn update_opened(&self, message: &InboxMessage, opened: bool) {
        self.dispatch(InboxAction::UpdateOpened {
            message: message.clone(),
            opened,
        });
    }

    fn dispatch(&self, action: InboxAction) {
        match self.store.upgrade() {
            Some(store) => store.dispatch(Action::Inbox(action)),
            None => debug!("store dropped, ignoring inbox action"),
        }
    }
}

fn filter_by_topic(messages: &[InboxMessage], topic: Option<&str>) -> Vec<InboxMessage> {
    let mut filtered: Vec<InboxMessage> = messages
        .iter()
        .filter(|m| topic.is_none_or(|topic| m.has_topic(topic)))
        .cloned()
        .collect();
    filtered.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
    filtered
}

impl std::fmt::Debug for MessageInbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageInbox").finish_non_exhaustive()
    }
}
