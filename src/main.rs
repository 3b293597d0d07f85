//! CLI for the in-app messaging client
//!
//! Subcommands:
//! - `listen`: connect as a user, log every message that would be shown and
//!   every inbox update, and keep going until Ctrl-C

use std::sync::Arc;

use clap::Parser;
use inapp_messaging::config::{Settings, load_config};
use inapp_messaging::eligibility::{EligibilityCache, Namespace};
use inapp_messaging::inbox::MessageInbox;
use inapp_messaging::model::{Message, MessagePosition};
use inapp_messaging::persistence::{KeyValueStore, SledStore};
use inapp_messaging::queue::{HttpMessageQueue, MessageIntake, run_polling};
use inapp_messaging::sse::{
    ConnectionOptions, HttpSseTransport, SseConnectionManager, SseLifecycleController,
};
use inapp_messaging::store::{Action, InAppEventListener, InAppMessagingStore, MessageRenderer};
use inapp_messaging::utils::{Result, SystemClock, logging};
use tokio::runtime::Handle;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "inapp-messaging")]
enum Command {
    /// Receive messages for a user and log them
    Listen {
        /// Site id, overriding the configured one
        #[arg(long)]
        site_id: Option<String>,
        /// Identified user id
        #[arg(long, conflicts_with = "anonymous_id")]
        user_id: Option<String>,
        /// Anonymous visitor id
        #[arg(long)]
        anonymous_id: Option<String>,
        /// Current page route
        #[arg(long)]
        route: Option<String>,
        /// Poll only, never open the realtime stream
        #[arg(long)]
        no_sse: bool,
    },
}

/// Stands in for a UI: every modal is logged and immediately shown.
struct LoggingRenderer {
    store: std::sync::Weak<InAppMessagingStore>,
}

impl MessageRenderer for LoggingRenderer {
    fn render_modal(&self, message: &Message, position: MessagePosition) {
        info!(
            message_id = %message.message_id,
            queue_id = ?message.queue_id,
            ?position,
            "rendering modal message"
        );
        if let Some(store) = self.store.upgrade() {
            store.dispatch(Action::DisplayMessage(message.clone()));
        }
    }
}

struct LoggingListener;

impl InAppEventListener for LoggingListener {
    fn message_shown(&self, message: &Message) {
        info!(message_id = %message.message_id, "message shown");
    }

    fn message_dismissed(&self, message: &Message) {
        info!(message_id = %message.message_id, "message dismissed");
    }

    fn embed_message(&self, message: &Message, element_id: &str) {
        info!(message_id = %message.message_id, element_id, "inline message ready");
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return;
        }
    };
    logging::init(&settings.logging.level);

    match Command::parse() {
        Command::Listen {
            site_id,
            user_id,
            anonymous_id,
            route,
            no_sse,
        } => {
            let identity = Identity {
                site_id,
                user_id,
                anonymous_id,
                route,
                sse: settings.sse.enabled && !no_sse,
            };
            if let Err(e) = run_listen(settings, identity).await {
                error!("Listener failed: {}", e);
            }
        }
    }
}

struct Identity {
    site_id: Option<String>,
    user_id: Option<String>,
    anonymous_id: Option<String>,
    route: Option<String>,
    sse: bool,
}

async fn run_listen(mut settings: Settings, identity: Identity) -> Result<()> {
    if let Some(site_id) = identity.site_id {
        settings.site.site_id = site_id;
    }
    let runtime = Handle::try_current()?;

    let sled_store = Arc::new(SledStore::open(&settings.persistence.path)?);
    let kv: Arc<dyn KeyValueStore> = sled_store.clone();
    let clock = Arc::new(SystemClock);
    let ttl = settings.persistence.message_list_ttl_minutes;
    let broadcast = Arc::new(
        EligibilityCache::new(Namespace::Broadcast, kv.clone(), clock.clone())
            .with_list_ttl_minutes(ttl),
    );
    let anonymous = Arc::new(
        EligibilityCache::new(Namespace::Anonymous, kv.clone(), clock).with_list_ttl_minutes(ttl),
    );

    let store = InAppMessagingStore::new();
    store.set_renderer(Arc::new(LoggingRenderer {
        store: Arc::downgrade(&store),
    }));
    store.set_event_listener(Arc::new(LoggingListener));
    store.set_eligibility(broadcast.clone(), anonymous.clone());

    let intake = MessageIntake::new(&store, broadcast, anonymous);
    let queue = HttpMessageQueue::new(runtime.clone(), &settings.queue, intake.clone(), kv)?;
    store.set_message_queue(queue.clone());

    store.dispatch(Action::Initialize {
        site_id: settings.site.site_id.clone(),
        data_center: settings.site.data_center.clone(),
    });
    store.dispatch(Action::SetPollingInterval(settings.queue.poll_interval_ms));
    if let Some(user_id) = identity.user_id {
        store.dispatch(Action::SetUserIdentifier(user_id));
    }
    if let Some(anonymous_id) = identity.anonymous_id {
        store.dispatch(Action::SetAnonymousIdentifier(anonymous_id));
    }
    if let Some(route) = identity.route {
        store.dispatch(Action::SetPageRoute(route));
    }

    let transport = Arc::new(HttpSseTransport::new(&settings.sse, &settings.site)?);
    let manager = SseConnectionManager::new(
        runtime,
        store.clone(),
        intake,
        transport,
        ConnectionOptions::from(&settings.sse),
    );
    let inbox = MessageInbox::new(&store);
    let _inbox_updates = inbox.subscribe(None, |messages| {
        info!(
            count = messages.len(),
            unopened = messages.iter().filter(|m| !m.opened).count(),
            "inbox updated"
        );
    });

    let lifecycle = SseLifecycleController::new(store.clone(), manager);
    store.dispatch(Action::SetSseEnabled(identity.sse));
    lifecycle.on_foreground();

    info!(site_id = %settings.site.site_id, "listening for in-app messages");
    tokio::select! {
        _ = run_polling(store.clone(), queue) => {
            error!("Polling loop exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    lifecycle.on_background();
    sled_store.flush()?;
    Ok(())
}
