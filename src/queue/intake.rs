use std::sync::{Arc, Weak};

use tracing::debug;

use crate::eligibility::EligibilityCache;
use crate::model::Message;
use crate::store::{Action, InAppMessagingStore};

/// Turns a full server list into a `ProcessMessageQueue` dispatch.
///
/// Broadcast messages are not queued as delivered: the server list
/// refreshes the eligibility cache of the current user kind, and only the
/// cached messages that are currently eligible join the regular ones.
pub struct MessageIntake {
    store: Weak<InAppMessagingStore>,
    broadcast: Arc<EligibilityCache>,
    anonymous: Arc<EligibilityCache>,
}

impl MessageIntake {
    pub fn new(
        store: &Arc<InAppMessagingStore>,
        broadcast: Arc<EligibilityCache>,
        anonymous: Arc<EligibilityCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::downgrade(store),
            broadcast,
            anonymous,
        })
    }

    pub fn handle_messages(&self, messages: Vec<Message>) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let state = store.state();

        let cache = if state.user_id.is_some() {
            Some(&self.broadcast)
        } else if state.anonymous_id.is_some() {
            Some(&self.anonymous)
        } else {
            debug!("no user token, skipping broadcast messages");
            None
        };

        let eligible = cache.map(|cache| {
            cache.update_from_server(&messages);
            cache.eligible_messages()
        });

        let mut queue: Vec<Message> = messages.into_iter().filter(|m| !m.is_broadcast()).collect();
        let regular = queue.len();
        if let Some(eligible) = &eligible {
            queue.extend(eligible.iter().cloned());
        }
        debug!(
            regular,
            broadcast = queue.len() - regular,
            "processing regular and eligible broadcast messages"
        );

        store.dispatch(Action::ProcessMessageQueue(queue));
    }

    pub fn clear(&self) {
        if let Some(store) = self.store.upgrade() {
            store.dispatch(Action::ClearMessageQueue);
        }
    }

    pub fn store(&self) -> Option<Arc<InAppMessagingStore>> {
        self.store.upgrade()
    }
}

impl std::fmt::Debug for MessageIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageIntake").finish_non_exhaustive()
    }
}
