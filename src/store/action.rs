use crate::model::{InboxMessage, Message};

/// Everything that can change [`AppState`](super::AppState).
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Initialize {
        site_id: String,
        data_center: String,
    },
    SetPollingInterval(u64),
    SetSseEnabled(bool),
    SetUserIdentifier(String),
    SetAnonymousIdentifier(String),
    SetPageRoute(String),
    ProcessMessageQueue(Vec<Message>),
    /// Replaces the inbox with a full server list.
    ProcessInboxMessages(Vec<InboxMessage>),
    ClearMessageQueue,
    EmbedMessages(Vec<Message>),
    LoadMessage(Message),
    DisplayMessage(Message),
    DismissMessage {
        message: Message,
        should_log: bool,
        via_close_action: bool,
    },
    Engine(EngineAction),
    Inbox(InboxAction),
    ReportError(String),
    Reset,
}

/// Events reported back by the renderer.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    Tap {
        message: Message,
        route: String,
        name: String,
        action: String,
    },
    MessageLoadingFailed(Message),
    SizeChanged {
        message: Message,
        width: f64,
        height: f64,
    },
}

/// User changes to inbox entries. Applied locally and synced to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboxAction {
    UpdateOpened { message: InboxMessage, opened: bool },
    DeleteMessage(InboxMessage),
}

impl Action {
    /// A user-initiated close with view logging.
    pub fn dismiss(message: Message) -> Self {
        Action::DismissMessage {
            message,
            should_log: true,
            via_close_action: true,
        }
    }

    /// Whether applying this action records the message's queue id as shown.
    ///
    /// Regular messages count as shown once displayed. Persistent ones only
    /// when the user closes them with logging enabled.
    pub fn marks_message_shown(&self) -> bool {
        match self {
            Action::DisplayMessage(message) => !message.is_persistent(),
            Action::DismissMessage {
                message,
                should_log,
                via_close_action,
            } => message.is_persistent() && *should_log && *via_close_action,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Initialize { .. } => "Initialize",
            Action::SetPollingInterval(_) => "SetPollingInterval",
            Action::SetSseEnabled(_) => "SetSseEnabled",
            Action::SetUserIdentifier(_) => "SetUserIdentifier",
            Action::SetAnonymousIdentifier(_) => "SetAnonymousIdentifier",
            Action::SetPageRoute(_) => "SetPageRoute",
            Action::ProcessMessageQueue(_) => "ProcessMessageQueue",
            Action::ProcessInboxMessages(_) => "ProcessInboxMessages",
            Action::ClearMessageQueue => "ClearMessageQueue",
            Action::EmbedMessages(_) => "EmbedMessages",
            Action::LoadMessage(_) => "LoadMessage",
            Action::DisplayMessage(_) => "DisplayMessage",
            Action::DismissMessage { .. } => "DismissMessage",
            Action::Engine(EngineAction::Tap { .. }) => "Engine::Tap",
            Action::Engine(EngineAction::MessageLoadingFailed(_)) => "Engine::MessageLoadingFailed",
            Action::Engine(EngineAction::SizeChanged { .. }) => "Engine::SizeChanged",
            Action::Inbox(InboxAction::UpdateOpened { .. }) => "Inbox::UpdateOpened",
            Action::Inbox(InboxAction::DeleteMessage(_)) => "Inbox::DeleteMessage",
            Action::ReportError(_) => "ReportError",
            Action::Reset => "Reset",
        }
    }
}
