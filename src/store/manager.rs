use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard};

use tracing::{debug, warn};

use super::action::Action;
use super::listeners::{ListenerRegistry, Subscription};
use super::middleware::{self, Effect, ListenerEvent, Middleware};
use super::reducer::reduce;
use super::state::AppState;
use crate::eligibility::EligibilityCache;
use crate::model::{InboxMessage, Message, MessagePosition};

/// Renders message content. Results come back as `DisplayMessage` or
/// [`EngineAction`](super::EngineAction) dispatches.
pub trait MessageRenderer: Send + Sync {
    fn render_modal(&self, message: &Message, position: MessagePosition);
}

/// Host-app callbacks for display events. Every method defaults to a no-op.
pub trait InAppEventListener: Send + Sync {
    fn message_shown(&self, _message: &Message) {}

    fn message_dismissed(&self, _message: &Message) {}

    fn message_error(&self, _message: &Message) {}

    fn message_action_taken(&self, _message: &Message, _route: &str, _action: &str, _name: &str) {}

    fn embed_message(&self, _message: &Message, _element_id: &str) {}

    fn message_size_changed(&self, _message: &Message, _width: f64, _height: f64) {}
}

/// Fetches the user's queue and reports views and inbox changes. Every call
/// returns at once; results flow back into the store as actions.
pub trait MessageQueue: Send + Sync {
    fn fetch_user_messages(&self);

    fn log_view(&self, message: &Message);

    fn log_inbox_opened(&self, _message: &InboxMessage, _opened: bool) {}

    fn log_inbox_deleted(&self, _message: &InboxMessage) {}
}

#[derive(Default, Clone)]
struct Collaborators {
    renderer: Option<Arc<dyn MessageRenderer>>,
    event_listener: Option<Arc<dyn InAppEventListener>>,
    message_queue: Option<Arc<dyn MessageQueue>>,
    broadcast: Option<Arc<EligibilityCache>>,
    anonymous: Option<Arc<EligibilityCache>>,
}

#[derive(Default)]
struct DispatchQueue {
    pending: VecDeque<Action>,
    draining: bool,
}

/// The central store.
///
/// Actions are applied one at a time by whichever thread claims the drain
/// loop; a `dispatch` issued while a drain is running, including one from a
/// listener or collaborator, is queued behind it and returns immediately.
/// Readers get immutable [`AppState`] snapshots.
pub struct InAppMessagingStore {
    state: RwLock<Arc<AppState>>,
    queue: Mutex<DispatchQueue>,
    middleware: Vec<Middleware>,
    listeners: Arc<ListenerRegistry>,
    collaborators: RwLock<Collaborators>,
}

impl InAppMessagingStore {
    pub fn new() -> Arc<Self> {
        Self::with_state(AppState::default())
    }

    pub fn with_state(state: AppState) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(Arc::new(state)),
            queue: Mutex::new(DispatchQueue::default()),
            middleware: middleware::default_chain(),
            listeners: Arc::new(ListenerRegistry::default()),
            collaborators: RwLock::new(Collaborators::default()),
        })
    }

    pub fn set_renderer(&self, renderer: Arc<dyn MessageRenderer>) {
        self.collaborators_mut().renderer = Some(renderer);
    }

    pub fn set_event_listener(&self, listener: Arc<dyn InAppEventListener>) {
        self.collaborators_mut().event_listener = Some(listener);
    }

    pub fn set_message_queue(&self, queue: Arc<dyn MessageQueue>) {
        self.collaborators_mut().message_queue = Some(queue);
    }

    /// Caches consulted when broadcast messages are shown or dismissed.
    pub fn set_eligibility(&self, broadcast: Arc<EligibilityCache>, anonymous: Arc<EligibilityCache>) {
        let mut collaborators = self.collaborators_mut();
        collaborators.broadcast = Some(broadcast);
        collaborators.anonymous = Some(anonymous);
    }

    fn collaborators_mut(&self) -> RwLockWriteGuard<'_, Collaborators> {
        self.collaborators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn collaborators(&self) -> Collaborators {
        self.collaborators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current snapshot.
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn lock_queue(&self) -> MutexGuard<'_, DispatchQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dispatch(&self, action: Action) {
        {
            let mut queue = self.lock_queue();
            queue.pending.push_back(action);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        self.drain();
    }

    /// Registers `listener` and hands it the current snapshot.
    ///
    /// A listener never observes an older snapshot after a newer one.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AppState) + Send + Sync + 'static,
    {
        let entry = self.listeners.add(Box::new(listener));
        let subscription = Subscription::new(&entry, &self.listeners);

        let claimed = {
            let mut queue = self.lock_queue();
            !std::mem::replace(&mut queue.draining, true)
        };
        entry.deliver(&self.state());
        if claimed {
            self.drain();
        }
        subscription
    }

    /// Calls `listener` with the selected value whenever it changes,
    /// starting with the current one.
    pub fn subscribe_to_attribute<T, S, F>(&self, selector: S, listener: F) -> Subscription
    where
        T: PartialEq + Send + 'static,
        S: Fn(&AppState) -> T + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let last: Mutex<Option<T>> = Mutex::new(None);
        self.subscribe(move |state| {
            let value = selector(state);
            let mut last = last.lock().unwrap_or_else(PoisonError::into_inner);
            if last.as_ref() == Some(&value) {
                return;
            }
            listener(last.insert(value));
        })
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn drain(&self) {
        let mut guard = DrainGuard {
            store: self,
            finished: false,
        };
        loop {
            let next = {
                let mut queue = self.lock_queue();
                match queue.pending.pop_front() {
                    Some(action) => action,
                    None => {
                        queue.draining = false;
                        guard.finished = true;
                        return;
                    }
                }
            };
            self.apply(next);
        }
    }

    fn apply(&self, action: Action) {
        let current = self.state();
        let mut effects = Vec::new();

        let mut pending = Some(action);
        for middleware in &self.middleware {
            let Some(action) = pending.take() else {
                break;
            };
            pending = middleware(&current, action, &mut effects);
        }

        let state = match pending {
            Some(action) => {
                let next = reduce(&current, &action);
                if next == *current {
                    current
                } else {
                    let next = Arc::new(AppState {
                        version: current.version + 1,
                        ..next
                    });
                    *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);
                    self.listeners.notify(&next);
                    next
                }
            }
            None => current,
        };

        if !effects.is_empty() {
            let collaborators = self.collaborators();
            for effect in effects {
                self.run_effect(&state, &collaborators, effect);
            }
        }
    }

    fn run_effect(&self, state: &AppState, collaborators: &Collaborators, effect: Effect) {
        match effect {
            Effect::Dispatch(action) => self.dispatch(action),
            Effect::ReprocessQueue => {
                self.dispatch(Action::ProcessMessageQueue(state.messages_in_queue.clone()));
            }
            Effect::RenderModal(message, position) => match &collaborators.renderer {
                Some(renderer) => {
                    isolate("renderer", || renderer.render_modal(&message, position));
                }
                None => debug!(queue_id = ?message.queue_id, "no renderer registered"),
            },
            Effect::LogView(message) => {
                if let Some(queue) = &collaborators.message_queue {
                    queue.log_view(&message);
                }
            }
            Effect::FetchMessages => {
                if let Some(queue) = &collaborators.message_queue {
                    queue.fetch_user_messages();
                }
            }
            Effect::MarkSeen(message) => {
                if let (Some(cache), Some(queue_id)) =
                    (eligibility_for(state, collaborators), &message.queue_id)
                {
                    cache.mark_seen(queue_id);
                }
            }
            Effect::MarkDismissed(message) => {
                if let (Some(cache), Some(queue_id)) =
                    (eligibility_for(state, collaborators), &message.queue_id)
                {
                    cache.mark_dismissed(queue_id);
                }
            }
            Effect::LogInboxOpened(message, opened) => {
                if let Some(queue) = &collaborators.message_queue {
                    queue.log_inbox_opened(&message, opened);
                }
            }
            Effect::LogInboxDeleted(message) => {
                if let Some(queue) = &collaborators.message_queue {
                    queue.log_inbox_deleted(&message);
                }
            }
            Effect::Notify(event) => {
                if let Some(listener) = &collaborators.event_listener {
                    isolate("event listener", || forward(listener.as_ref(), &event));
                }
            }
        }
    }
}

/// Identified users track broadcasts; anonymous visitors their own set.
fn eligibility_for<'a>(
    state: &AppState,
    collaborators: &'a Collaborators,
) -> Option<&'a Arc<EligibilityCache>> {
    if state.user_id.is_some() {
        collaborators.broadcast.as_ref()
    } else if state.anonymous_id.is_some() {
        collaborators.anonymous.as_ref()
    } else {
        None
    }
}

fn forward(listener: &dyn InAppEventListener, event: &ListenerEvent) {
    match event {
        ListenerEvent::EmbedMessage {
            message,
            element_id,
        } => listener.embed_message(message, element_id),
        ListenerEvent::MessageShown(message) => listener.message_shown(message),
        ListenerEvent::MessageDismissed(message) => listener.message_dismissed(message),
        ListenerEvent::MessageError(message) => listener.message_error(message),
        ListenerEvent::ActionTaken {
            message,
            route,
            action,
            name,
        } => listener.message_action_taken(message, route, action, name),
        ListenerEvent::SizeChanged {
            message,
            width,
            height,
        } => listener.message_size_changed(message, *width, *height),
    }
}

fn isolate(what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(collaborator = what, "collaborator panicked");
    }
}

/// Releases the drain claim if an action panics mid-drain.
struct DrainGuard<'a> {
    store: &'a InAppMessagingStore,
    finished: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.store.lock_queue().draining = false;
        }
    }
}

impl std::fmt::Debug for InAppMessagingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InAppMessagingStore")
            .field("version", &self.state().version)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
