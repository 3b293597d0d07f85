use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::SseError;
use super::heartbeat::{HeartbeatTimeout, HeartbeatWatchdog};
use super::parser::{
    DEFAULT_HEARTBEAT_TIMEOUT_MS, parse_heartbeat_timeout_ms, parse_inbox_messages, parse_messages,
};
use super::retry::{RetryDecision, RetryPolicy};
use super::service::{StreamEvent, StreamTransport};
use crate::config::SseSettings;
use crate::queue::MessageIntake;
use crate::store::{Action, InAppMessagingStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Why the manager gave up on the realtime stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    MaxRetriesReached,
    RetryNotPossible,
}

/// Timing knobs, usually taken from [`SseSettings`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub default_heartbeat_timeout_ms: i64,
    pub heartbeat_buffer_ms: i64,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            default_heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            heartbeat_buffer_ms: 5_000,
            max_retries: super::retry::DEFAULT_MAX_RETRIES,
            retry_delay: super::retry::DEFAULT_RETRY_DELAY,
        }
    }
}

impl From<&SseSettings> for ConnectionOptions {
    fn from(settings: &SseSettings) -> Self {
        Self {
            default_heartbeat_timeout_ms: settings.default_heartbeat_timeout_ms as i64,
            heartbeat_buffer_ms: settings.heartbeat_buffer_ms as i64,
            max_retries: settings.max_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    /// Bumped for every attempt and on stop; stale work compares against it.
    epoch: u64,
    /// Whether the owner asked for a connection and has not stopped it.
    wanted: bool,
    task: Option<JoinHandle<()>>,
}

/// Owns the realtime connection: connect, interpret frames, watch
/// heartbeats, retry, and fall back to polling.
///
/// All state transitions happen under one mutex that is never held across
/// an await.
pub struct SseConnectionManager {
    runtime: Handle,
    store: Arc<InAppMessagingStore>,
    intake: Arc<MessageIntake>,
    transport: Arc<dyn StreamTransport>,
    watchdog: Arc<HeartbeatWatchdog>,
    retry: Arc<RetryPolicy>,
    options: ConnectionOptions,
    fallback: watch::Sender<Option<FallbackReason>>,
    inner: Mutex<Inner>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl SseConnectionManager {
    pub fn new(
        runtime: Handle,
        store: Arc<InAppMessagingStore>,
        intake: Arc<MessageIntake>,
        transport: Arc<dyn StreamTransport>,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        let watchdog = HeartbeatWatchdog::new(runtime.clone());
        let (retry, decisions) =
            RetryPolicy::new(runtime.clone(), options.max_retries, options.retry_delay);
        let (fallback, _) = watch::channel(None);

        let manager = Arc::new(Self {
            runtime: runtime.clone(),
            store,
            intake,
            transport,
            watchdog: Arc::clone(&watchdog),
            retry,
            options,
            fallback,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                epoch: 0,
                wanted: false,
                task: None,
            }),
            supervisors: Mutex::new(Vec::new()),
        });

        let retry_loop = runtime.spawn(Self::consume_decisions(Arc::downgrade(&manager), decisions));
        let timeout_loop =
            runtime.spawn(Self::consume_timeouts(Arc::downgrade(&manager), watchdog.subscribe()));
        manager
            .supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([retry_loop, timeout_loop]);

        manager
    }

    async fn consume_decisions(
        manager: Weak<Self>,
        mut decisions: mpsc::UnboundedReceiver<RetryDecision>,
    ) {
        while let Some(decision) = decisions.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            manager.on_retry_decision(decision);
        }
    }

    async fn consume_timeouts(
        manager: Weak<Self>,
        mut timeouts: watch::Receiver<Option<HeartbeatTimeout>>,
    ) {
        while timeouts.changed().await.is_ok() {
            let latest = *timeouts.borrow_and_update();
            let Some(timeout) = latest else {
                continue;
            };
            let Some(manager) = manager.upgrade() else {
                break;
            };
            manager.on_heartbeat_timeout(timeout);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Fires once retries are exhausted or the error was not retryable.
    pub fn subscribe_fallback(&self) -> watch::Receiver<Option<FallbackReason>> {
        self.fallback.subscribe()
    }

    pub fn heartbeat_watchdog(&self) -> &Arc<HeartbeatWatchdog> {
        &self.watchdog
    }

    pub fn retry_policy(&self) -> &Arc<RetryPolicy> {
        &self.retry
    }

    /// Starts a connection attempt unless one is already in progress.
    pub fn start_connection(self: &Arc<Self>) {
        let mut inner = self.lock();
        inner.wanted = true;
        if inner.state != ConnectionState::Disconnected {
            debug!(state = ?inner.state, "sse connection already active");
            return;
        }

        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.epoch = inner.epoch.wrapping_add(1);
        inner.state = ConnectionState::Connecting;
        let epoch = inner.epoch;

        info!(epoch, "starting sse connection");
        let manager = Arc::clone(self);
        inner.task = Some(self.runtime.spawn(async move {
            manager.run_connection(epoch).await;
        }));
    }

    /// Tears everything down. Safe to call repeatedly.
    pub fn stop_connection(&self) {
        {
            let mut inner = self.lock();
            inner.wanted = false;
            inner.epoch = inner.epoch.wrapping_add(1);
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            if inner.state != ConnectionState::Disconnected {
                info!("stopping sse connection");
            }
            inner.state = ConnectionState::Disconnected;
        }
        self.retry.cancel_pending();
        self.watchdog.reset();
        self.transport.disconnect();
    }

    async fn run_connection(self: Arc<Self>, epoch: u64) {
        let state = self.store.state();
        let Some(user_token) = state.user_token().map(str::to_owned) else {
            warn!("no user token available, cannot open sse connection");
            let mut inner = self.lock();
            if inner.epoch == epoch {
                inner.state = ConnectionState::Disconnected;
                inner.task = None;
            }
            return;
        };

        let mut events = self
            .transport
            .connect(&state.session_id, &user_token, &state.site_id);

        while let Some(event) = events.next().await {
            if !self.is_current(epoch) {
                return;
            }
            match event {
                StreamEvent::Opened => self.on_opened(epoch),
                StreamEvent::Server { event_type, data } => {
                    if let Some(error) = self.on_server_event(&event_type, &data) {
                        self.teardown_and_retry(epoch, error, false);
                        return;
                    }
                }
                StreamEvent::Failed(error) => {
                    warn!(%error, "sse connection failed");
                    self.teardown_and_retry(epoch, error, false);
                    return;
                }
                StreamEvent::Closed => {
                    self.teardown_and_retry(
                        epoch,
                        SseError::UnknownError("connection closed by server".to_string()),
                        false,
                    );
                    return;
                }
            }
        }

        self.teardown_and_retry(
            epoch,
            SseError::UnknownError("stream ended".to_string()),
            false,
        );
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock().epoch == epoch
    }

    fn on_opened(&self, epoch: u64) {
        {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.state = ConnectionState::Connected;
        }
        info!("sse connection established");
        self.retry.reset_retry_state();
    }

    /// Returns the error to retry with when the frame ends the connection.
    fn on_server_event(self: &Arc<Self>, event_type: &str, data: &str) -> Option<SseError> {
        match event_type {
            "connected" => {
                info!("sse server confirmed connection");
                self.watchdog
                    .start(self.options.default_heartbeat_timeout_ms + self.options.heartbeat_buffer_ms);
            }
            "heartbeat" => {
                let timeout_ms = parse_heartbeat_timeout_ms(data);
                debug!(timeout_ms, "sse heartbeat");
                self.watchdog
                    .start(timeout_ms.saturating_add(self.options.heartbeat_buffer_ms));
            }
            "messages" => {
                let messages = parse_messages(data);
                if messages.is_empty() {
                    debug!("sse messages event without messages");
                } else {
                    debug!(count = messages.len(), "sse messages received");
                    self.intake.handle_messages(messages);
                }
            }
            "inbox_messages" => {
                let messages = parse_inbox_messages(data);
                if messages.is_empty() {
                    debug!("sse inbox event without messages");
                } else {
                    debug!(count = messages.len(), "sse inbox messages received");
                    self.store.dispatch(Action::ProcessInboxMessages(messages));
                }
            }
            "ttl_exceeded" => {
                info!("sse connection ttl exceeded");
                return Some(SseError::UnknownError("ttl exceeded".to_string()));
            }
            other => debug!(event_type = other, "ignoring unknown sse event"),
        }
        None
    }

    fn on_heartbeat_timeout(&self, timeout: HeartbeatTimeout) {
        let epoch = {
            let inner = self.lock();
            if inner.state == ConnectionState::Disconnected {
                return;
            }
            inner.epoch
        };
        warn!(timeout_ms = timeout.timeout_ms, "sse heartbeat timed out");
        self.teardown_and_retry(epoch, SseError::TimeoutError, true);
    }

    /// Closes the attempt identified by `epoch` and asks the retry policy
    /// what to do next.
    fn teardown_and_retry(&self, epoch: u64, error: SseError, abort_task: bool) {
        {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            if let Some(task) = inner.task.take() {
                if abort_task {
                    task.abort();
                }
            }
        }
        self.watchdog.reset();
        self.transport.disconnect();
        self.retry.schedule_retry(&error);
    }

    fn on_retry_decision(self: &Arc<Self>, decision: RetryDecision) {
        match decision {
            RetryDecision::RetryNow(attempt) => {
                if !self.lock().wanted {
                    debug!(attempt, "ignoring retry, connection no longer wanted");
                    return;
                }
                info!(attempt, "retrying sse connection");
                self.start_connection();
            }
            RetryDecision::MaxRetriesReached | RetryDecision::RetryNotPossible => {
                let reason = if decision == RetryDecision::MaxRetriesReached {
                    FallbackReason::MaxRetriesReached
                } else {
                    FallbackReason::RetryNotPossible
                };
                warn!(?reason, "giving up on sse, falling back to polling");
                self.stop_connection();
                self.store.dispatch(Action::SetSseEnabled(false));
                self.fallback.send_replace(Some(reason));
            }
        }
    }
}

impl Drop for SseConnectionManager {
    fn drop(&mut self) {
        let supervisors = self
            .supervisors
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for task in supervisors.drain(..) {
            task.abort();
        }
        if let Some(task) = self
            .inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .task
            .take()
        {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SseConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseConnectionManager")
            .field("state", &self.connection_state())
            .finish()
    }
}
