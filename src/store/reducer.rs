use tracing::debug;

use super::action::{Action, EngineAction, InboxAction};
use super::state::{AppState, InlineMessageState, ModalMessageState, new_session_id};
use crate::model::{InboxMessage, Message};

/// Computes the next state for `action`. Never touches `version`.
pub fn reduce(state: &AppState, action: &Action) -> AppState {
    match action {
        Action::Initialize {
            site_id,
            data_center,
        } => AppState {
            site_id: site_id.clone(),
            data_center: data_center.clone(),
            session_id: new_session_id(),
            ..state.clone()
        },
        Action::SetPollingInterval(interval_ms) => AppState {
            poll_interval_ms: *interval_ms,
            ..state.clone()
        },
        Action::SetSseEnabled(enabled) => AppState {
            sse_enabled: *enabled,
            ..state.clone()
        },
        Action::SetUserIdentifier(user_id) => AppState {
            user_id: Some(user_id.clone()),
            ..state.clone()
        },
        Action::SetAnonymousIdentifier(anonymous_id) => AppState {
            anonymous_id: Some(anonymous_id.clone()),
            ..state.clone()
        },
        Action::SetPageRoute(route) => AppState {
            current_route: Some(route.clone()),
            ..state.clone()
        },
        Action::ProcessMessageQueue(messages) => AppState {
            messages_in_queue: distinct(messages),
            ..state.clone()
        },
        Action::ProcessInboxMessages(messages) => AppState {
            inbox_messages: distinct_deliveries(messages),
            ..state.clone()
        },
        Action::Inbox(InboxAction::UpdateOpened { message, opened }) => AppState {
            inbox_messages: state
                .inbox_messages
                .iter()
                .map(|m| {
                    if m.queue_id == message.queue_id {
                        InboxMessage {
                            opened: *opened,
                            ..m.clone()
                        }
                    } else {
                        m.clone()
                    }
                })
                .collect(),
            ..state.clone()
        },
        Action::Inbox(InboxAction::DeleteMessage(message)) => AppState {
            inbox_messages: state
                .inbox_messages
                .iter()
                .filter(|m| m.queue_id != message.queue_id)
                .cloned()
                .collect(),
            ..state.clone()
        },
        Action::ClearMessageQueue => AppState {
            messages_in_queue: Vec::new(),
            ..state.clone()
        },
        Action::EmbedMessages(messages) => {
            let inline = messages.iter().fold(
                state.queued_inline_messages_state.clone(),
                |acc, message| match message.element_id() {
                    Some(element_id) => acc.add_message(message.clone(), element_id),
                    None => acc,
                },
            );
            AppState {
                queued_inline_messages_state: inline,
                ..state.clone()
            }
        }
        Action::LoadMessage(message) => AppState {
            modal_message_state: ModalMessageState::Loading(message.clone()),
            ..state.clone()
        },
        Action::DisplayMessage(message) => {
            with_message_displayed(state, message, action.marks_message_shown())
        }
        Action::DismissMessage { message, .. } => {
            with_message_dismissed(state, message, action.marks_message_shown())
        }
        Action::Engine(EngineAction::MessageLoadingFailed(message)) => {
            with_message_dismissed(state, message, false)
        }
        Action::Engine(EngineAction::Tap { .. })
        | Action::Engine(EngineAction::SizeChanged { .. })
        | Action::ReportError(_) => state.clone(),
        Action::Reset => AppState {
            site_id: state.site_id.clone(),
            data_center: state.data_center.clone(),
            poll_interval_ms: state.poll_interval_ms,
            version: state.version,
            ..AppState::default()
        },
    }
}

/// Keeps the first occurrence of every structurally equal message.
fn distinct(messages: &[Message]) -> Vec<Message> {
    let mut result: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        if !result.contains(message) {
            result.push(message.clone());
        }
    }
    result
}

/// Keeps the first entry of every delivery.
fn distinct_deliveries(messages: &[InboxMessage]) -> Vec<InboxMessage> {
    let mut result: Vec<InboxMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        if !result.iter().any(|m| m.dedup_key() == message.dedup_key()) {
            result.push(message.clone());
        }
    }
    result
}

fn with_message_displayed(state: &AppState, message: &Message, mark_shown: bool) -> AppState {
    let Some(queue_id) = message.queue_id.as_deref() else {
        debug!(message_id = %message.message_id, "displayed message has no queue id");
        return state.clone();
    };

    let mut shown = state.shown_message_queue_ids.clone();
    if mark_shown {
        shown.insert(queue_id.to_string());
    }
    let queue = state
        .messages_in_queue
        .iter()
        .filter(|m| m.queue_id.as_deref() != Some(queue_id))
        .cloned()
        .collect();

    if message.is_embedded() {
        AppState {
            queued_inline_messages_state: state
                .queued_inline_messages_state
                .update_message_state(queue_id, InlineMessageState::Embedded(message.clone())),
            shown_message_queue_ids: shown,
            messages_in_queue: queue,
            ..state.clone()
        }
    } else {
        AppState {
            modal_message_state: ModalMessageState::Displayed(message.clone()),
            shown_message_queue_ids: shown,
            messages_in_queue: queue,
            ..state.clone()
        }
    }
}

fn with_message_dismissed(state: &AppState, message: &Message, mark_shown: bool) -> AppState {
    let mut shown = state.shown_message_queue_ids.clone();
    if mark_shown {
        if let Some(queue_id) = &message.queue_id {
            shown.insert(queue_id.clone());
        }
    }

    if message.is_embedded() {
        let Some(queue_id) = message.queue_id.as_deref() else {
            return state.clone();
        };
        AppState {
            queued_inline_messages_state: state
                .queued_inline_messages_state
                .update_message_state(queue_id, InlineMessageState::Dismissed(message.clone())),
            shown_message_queue_ids: shown,
            ..state.clone()
        }
    } else {
        AppState {
            modal_message_state: ModalMessageState::Dismissed(message.clone()),
            shown_message_queue_ids: shown,
            ..state.clone()
        }
    }
}
