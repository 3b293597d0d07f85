use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::SseError;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryNow(u32),
    MaxRetriesReached,
    RetryNotPossible,
}

#[derive(Debug, Default)]
struct RetryState {
    attempts: u32,
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

/// Turns classified stream errors into ordered retry decisions.
///
/// The first retry after a reset is emitted at once; later ones wait for
/// the fixed delay. Decisions are delivered on the channel returned by
/// [`RetryPolicy::new`].
#[derive(Debug)]
pub struct RetryPolicy {
    runtime: Handle,
    max_retries: u32,
    retry_delay: Duration,
    decisions: mpsc::UnboundedSender<RetryDecision>,
    state: Mutex<RetryState>,
}

impl RetryPolicy {
    pub fn new(
        runtime: Handle,
        max_retries: u32,
        retry_delay: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RetryDecision>) {
        let (decisions, rx) = mpsc::unbounded_channel();
        let policy = Arc::new(Self {
            runtime,
            max_retries,
            retry_delay,
            decisions,
            state: Mutex::new(RetryState::default()),
        });
        (policy, rx)
    }

    fn lock(&self) -> MutexGuard<'_, RetryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    pub fn schedule_retry(self: &Arc<Self>, error: &SseError) {
        let mut state = self.lock();
        Self::cancel_locked(&mut state);

        if !error.is_retryable() {
            debug!(%error, "error is not retryable");
            self.emit(RetryDecision::RetryNotPossible);
            return;
        }

        if state.attempts >= self.max_retries {
            warn!(attempts = state.attempts, %error, "max retries reached");
            self.emit(RetryDecision::MaxRetriesReached);
            return;
        }

        state.attempts += 1;
        let attempt = state.attempts;

        if attempt == 1 {
            debug!(%error, "retrying immediately");
            self.emit(RetryDecision::RetryNow(attempt));
            return;
        }

        debug!(attempt, delay_ms = self.retry_delay.as_millis() as u64, %error, "retry scheduled");
        let generation = state.generation;
        let policy = Arc::clone(self);
        state.pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep(policy.retry_delay).await;
            let mut state = policy.lock();
            if state.generation != generation {
                return;
            }
            state.pending = None;
            policy.emit(RetryDecision::RetryNow(attempt));
        }));
    }

    /// Zeroes the attempt counter and cancels any delayed retry.
    pub fn reset_retry_state(&self) {
        let mut state = self.lock();
        Self::cancel_locked(&mut state);
        state.attempts = 0;
    }

    /// Cancels a delayed retry but keeps the attempt counter.
    pub fn cancel_pending(&self) {
        let mut state = self.lock();
        Self::cancel_locked(&mut state);
    }

    fn cancel_locked(state: &mut RetryState) {
        state.generation = state.generation.wrapping_add(1);
        if let Some(task) = state.pending.take() {
            task.abort();
        }
    }

    fn emit(&self, decision: RetryDecision) {
        if self.decisions.send(decision).is_err() {
            debug!(?decision, "retry decision dropped, no receiver");
        }
    }
}
