use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::{debug, info};

use super::manager::SseConnectionManager;
use crate::store::{InAppMessagingStore, Subscription};

/// Connects the realtime stream while the app is in the foreground and the
/// store says the stream should be used, and disconnects otherwise.
pub struct SseLifecycleController {
    store: Arc<InAppMessagingStore>,
    manager: Arc<SseConnectionManager>,
    foreground: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SseLifecycleController {
    pub fn new(store: Arc<InAppMessagingStore>, manager: Arc<SseConnectionManager>) -> Arc<Self> {
        let controller = Arc::new(Self {
            store: Arc::clone(&store),
            manager,
            foreground: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&controller);
        let sse_flag = store.subscribe_to_attribute(
            |state| state.sse_enabled,
            move |enabled| {
                with_controller(&weak, |controller| controller.on_sse_flag_changed(*enabled))
            },
        );

        let weak = Arc::downgrade(&controller);
        let identity = store.subscribe_to_attribute(
            |state| state.is_user_identified(),
            move |identified| {
                with_controller(&weak, |controller| controller.on_identity_changed(*identified))
            },
        );

        controller
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([sse_flag, identity]);
        controller
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::Acquire)
    }

    pub fn on_foreground(&self) {
        if self
            .foreground
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("already in foreground");
            return;
        }
        info!("app foregrounded");
        self.connect_if_needed();
    }

    pub fn on_background(&self) {
        if self
            .foreground
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("already in background");
            return;
        }
        info!("app backgrounded, stopping sse");
        self.manager.stop_connection();
    }

    /// Drops the connection and, when the app is in the foreground and the
    /// store still wants the stream, opens a fresh one.
    pub fn reset(&self) {
        info!("resetting sse lifecycle");
        self.manager.stop_connection();
        if self.is_foreground() && self.store.state().should_use_sse() {
            info!("restarting sse after reset");
            self.manager.start_connection();
        }
    }

    fn on_sse_flag_changed(&self, enabled: bool) {
        debug!(enabled, "sse flag changed");
        if enabled {
            self.connect_if_needed();
        } else {
            self.manager.stop_connection();
        }
    }

    fn on_identity_changed(&self, identified: bool) {
        debug!(identified, "user identification changed");
        if identified {
            self.connect_if_needed();
        } else {
            self.manager.stop_connection();
        }
    }

    fn connect_if_needed(&self) {
        if !self.is_foreground() {
            return;
        }
        if self.store.state().should_use_sse() {
            self.manager.start_connection();
        }
    }
}

fn with_controller(controller: &Weak<SseLifecycleController>, f: impl FnOnce(&SseLifecycleController)) {
    if let Some(controller) = controller.upgrade() {
        f(&controller);
    }
}

impl std::fmt::Debug for SseLifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseLifecycleController")
            .field("foreground", &self.is_foreground())
            .field("connection", &self.manager.connection_state())
            .finish()
    }
}
