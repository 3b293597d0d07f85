//! Middleware are pure functions run in order before the reducer.
//!
//! Each one sees the pre-reduction state and the action handed down by its
//! predecessor. It may pass the action on, replace it, or swallow it by
//! returning `None`, and it records side effects instead of performing
//! them. The store runs the collected [`Effect`]s after reduction.

use tracing::{debug, error};

use super::action::{Action, EngineAction, InboxAction};
use super::state::AppState;
use crate::model::{InboxMessage, Message, MessagePosition};

pub type Middleware = fn(&AppState, Action, &mut Vec<Effect>) -> Option<Action>;

/// A side effect requested by middleware.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Enqueue a follow-up action.
    Dispatch(Action),
    /// Enqueue `ProcessMessageQueue` with the queue as it is after reduction.
    ReprocessQueue,
    RenderModal(Message, MessagePosition),
    LogView(Message),
    FetchMessages,
    MarkSeen(Message),
    MarkDismissed(Message),
    LogInboxOpened(InboxMessage, bool),
    LogInboxDeleted(InboxMessage),
    Notify(ListenerEvent),
}

/// Calls forwarded to the registered [`InAppEventListener`](super::InAppEventListener).
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    EmbedMessage {
        message: Message,
        element_id: String,
    },
    MessageShown(Message),
    MessageDismissed(Message),
    MessageError(Message),
    ActionTaken {
        message: Message,
        route: String,
        action: String,
        name: String,
    },
    SizeChanged {
        message: Message,
        width: f64,
        height: f64,
    },
}

/// The default chain, in application order.
pub fn default_chain() -> Vec<Middleware> {
    vec![
        log_action,
        route_change,
        display_modal,
        display_tracking,
        process_messages,
        process_inbox,
        log_errors,
        notify_listener,
    ]
}

pub fn log_action(state: &AppState, action: Action, _: &mut Vec<Effect>) -> Option<Action> {
    debug!(
        action = action.name(),
        version = state.version,
        "store: dispatching action"
    );
    Some(action)
}

/// Drops the active modal when the new route no longer allows it, then
/// re-runs the queue so a different message may qualify.
pub fn route_change(state: &AppState, action: Action, effects: &mut Vec<Effect>) -> Option<Action> {
    let Action::SetPageRoute(route) = &action else {
        return Some(action);
    };

    if let Some(message) = state.modal_message_state.active_message() {
        if !message.route_allows(Some(route)) {
            debug!(
                queue_id = ?message.queue_id,
                route,
                "dismissing message, route no longer matches"
            );
            effects.push(Effect::Dispatch(Action::DismissMessage {
                message: message.clone(),
                should_log: false,
                via_close_action: false,
            }));
        }
    }
    effects.push(Effect::ReprocessQueue);
    Some(action)
}

/// Rejects loading a modal while another one is loading or on screen.
///
/// Queued reprocessing passes can each pick the same modal from a stale
/// snapshot; only the first `LoadMessage` gets through.
pub fn display_modal(state: &AppState, action: Action, effects: &mut Vec<Effect>) -> Option<Action> {
    let Action::LoadMessage(message) = &action else {
        return Some(action);
    };

    if let Some(active) = state.modal_message_state.active_message() {
        debug!(
            queue_id = ?message.queue_id,
            active = ?active.queue_id,
            "modal already active, rejecting load"
        );
        return Some(Action::ReportError(
            "a message is already being shown".to_string(),
        ));
    }

    debug!(queue_id = ?message.queue_id, "showing modal message");
    effects.push(Effect::RenderModal(message.clone(), message.gist().position));
    Some(action)
}

/// View logging and eligibility bookkeeping around display and dismissal.
pub fn display_tracking(
    state: &AppState,
    action: Action,
    effects: &mut Vec<Effect>,
) -> Option<Action> {
    match &action {
        Action::DisplayMessage(message) => {
            if message.is_broadcast() && message.queue_id.is_some() {
                effects.push(Effect::MarkSeen(message.clone()));
            }
            if action.marks_message_shown() {
                effects.push(Effect::LogView(message.clone()));
            } else {
                debug!(queue_id = ?message.queue_id, "persistent message shown, not logging view");
            }
        }
        Action::DismissMessage { message, .. } => {
            if message.is_broadcast() && message.queue_id.is_some() {
                effects.push(Effect::MarkDismissed(message.clone()));
            }
            if action.marks_message_shown() {
                debug!(queue_id = ?message.queue_id, "persistent message closed, logging view");
                effects.push(Effect::LogView(message.clone()));
                effects.push(Effect::FetchMessages);
            }
            if state.should_use_sse() {
                effects.push(Effect::ReprocessQueue);
            }
        }
        _ => {}
    }
    Some(action)
}

/// Filters, orders and routes an incoming queue, then embeds inline
/// messages and loads at most one modal.
pub fn process_messages(
    state: &AppState,
    action: Action,
    effects: &mut Vec<Effect>,
) -> Option<Action> {
    let Action::ProcessMessageQueue(messages) = &action else {
        return Some(action);
    };
    if messages.is_empty() {
        return Some(action);
    }

    let mut pending: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        let Some(queue_id) = message.queue_id.as_deref() else {
            continue;
        };
        if state.shown_message_queue_ids.contains(queue_id) {
            continue;
        }
        if pending.iter().any(|m| m.queue_id.as_deref() == Some(queue_id)) {
            continue;
        }
        pending.push(message.clone());
    }
    // stable; unset priority sorts last
    pending.sort_by_key(|m| (m.priority.is_none(), m.priority));

    let route = state.current_route.as_deref();
    let inline: Vec<Message> = pending
        .iter()
        .filter(|m| m.is_embedded() && m.matches_route(route))
        .filter(|m| {
            m.element_id()
                .and_then(|element_id| state.queued_inline_messages_state.message(element_id))
                .is_none_or(|existing| !existing.is_embedded())
        })
        .cloned()
        .collect();
    if !inline.is_empty() {
        effects.push(Effect::Dispatch(Action::EmbedMessages(inline)));
    }

    let modal = pending
        .iter()
        .find(|m| !m.is_embedded() && m.matches_route(route));
    match modal {
        Some(message) if !state.modal_message_state.is_active() => {
            effects.push(Effect::Dispatch(Action::LoadMessage(message.clone())));
        }
        _ => debug!("no modal message matched the criteria"),
    }

    Some(Action::ProcessMessageQueue(pending))
}

/// Syncs local inbox changes to the server.
pub fn process_inbox(_: &AppState, action: Action, effects: &mut Vec<Effect>) -> Option<Action> {
    match &action {
        Action::Inbox(InboxAction::UpdateOpened { message, opened }) => {
            debug!(queue_id = %message.queue_id, opened, "updating inbox message");
            effects.push(Effect::LogInboxOpened(message.clone(), *opened));
        }
        Action::Inbox(InboxAction::DeleteMessage(message)) => {
            debug!(queue_id = %message.queue_id, "deleting inbox message");
            effects.push(Effect::LogInboxDeleted(message.clone()));
        }
        Action::ProcessInboxMessages(messages) => {
            debug!(count = messages.len(), "processing inbox messages");
        }
        _ => {}
    }
    Some(action)
}

pub fn log_errors(_: &AppState, action: Action, _: &mut Vec<Effect>) -> Option<Action> {
    if let Action::ReportError(message) = &action {
        error!(error = %message, "in-app messaging error");
    }
    Some(action)
}

pub fn notify_listener(_: &AppState, action: Action, effects: &mut Vec<Effect>) -> Option<Action> {
    match &action {
        Action::EmbedMessages(messages) => {
            for message in messages {
                if let Some(element_id) = message.element_id() {
                    effects.push(Effect::Notify(ListenerEvent::EmbedMessage {
                        message: message.clone(),
                        element_id: element_id.to_string(),
                    }));
                }
            }
        }
        Action::DisplayMessage(message) => {
            effects.push(Effect::Notify(ListenerEvent::MessageShown(message.clone())));
        }
        Action::DismissMessage { message, .. } => {
            effects.push(Effect::Notify(ListenerEvent::MessageDismissed(message.clone())));
        }
        Action::Engine(EngineAction::MessageLoadingFailed(message)) => {
            effects.push(Effect::Notify(ListenerEvent::MessageError(message.clone())));
        }
        Action::Engine(EngineAction::Tap {
            message,
            route,
            name,
            action: tapped,
        }) => {
            effects.push(Effect::Notify(ListenerEvent::ActionTaken {
                message: message.clone(),
                route: route.clone(),
                action: tapped.clone(),
                name: name.clone(),
            }));
        }
        Action::Engine(EngineAction::SizeChanged {
            message,
            width,
            height,
        }) => {
            effects.push(Effect::Notify(ListenerEvent::SizeChanged {
                message: message.clone(),
                width: *width,
                height: *height,
            }));
        }
        _ => {}
    }
    Some(action)
}
