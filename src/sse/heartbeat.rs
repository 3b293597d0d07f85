use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Emitted when no heartbeat arrived within the armed deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTimeout {
    /// Identifies the `start` call that armed the timer.
    pub generation: u64,
    pub timeout_ms: i64,
}

#[derive(Debug, Default)]
struct TimerState {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

/// Single-shot deadline that is re-armed on every heartbeat.
///
/// The latest timeout is published in a single slot that is overwritten,
/// never queued. A timer that was superseded by `start` or cancelled by
/// `reset` never publishes.
#[derive(Debug)]
pub struct HeartbeatWatchdog {
    runtime: Handle,
    signal: watch::Sender<Option<HeartbeatTimeout>>,
    state: Mutex<TimerState>,
}

impl HeartbeatWatchdog {
    pub fn new(runtime: Handle) -> Arc<Self> {
        let (signal, _) = watch::channel(None);
        Arc::new(Self {
            runtime,
            signal,
            state: Mutex::new(TimerState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<HeartbeatTimeout>> {
        self.signal.subscribe()
    }

    pub fn latest(&self) -> Option<HeartbeatTimeout> {
        *self.signal.borrow()
    }

    /// Arms the deadline, cancelling any timer already running.
    pub fn start(self: &Arc<Self>, timeout_ms: i64) {
        let mut state = self.lock();
        Self::cancel_locked(&mut state);
        self.signal.send_replace(None);

        let generation = state.generation;
        let timeout = HeartbeatTimeout {
            generation,
            timeout_ms,
        };

        if timeout_ms <= 0 {
            debug!(timeout_ms, "heartbeat deadline already expired");
            self.signal.send_replace(Some(timeout));
            return;
        }

        debug!(timeout_ms, generation, "heartbeat timer armed");
        let watchdog = Arc::clone(self);
        state.task = Some(self.runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms as u64)).await;
            let mut state = watchdog.lock();
            if state.generation != generation {
                return;
            }
            state.task = None;
            debug!(timeout_ms, "heartbeat timeout");
            watchdog.signal.send_replace(Some(timeout));
        }));
    }

    /// Cancels the timer and clears the slot without publishing.
    pub fn reset(&self) {
        let mut state = self.lock();
        Self::cancel_locked(&mut state);
        self.signal.send_replace(None);
    }

    fn cancel_locked(state: &mut TimerState) {
        state.generation = state.generation.wrapping_add(1);
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }
}
