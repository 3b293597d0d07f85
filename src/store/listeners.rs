use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tracing::warn;

use super::state::AppState;

type StateCallback = Box<dyn Fn(&AppState) + Send + Sync>;

pub(crate) struct ListenerEntry {
    id: u64,
    /// Version of the last snapshot handed to `callback`.
    delivered: Mutex<Option<u64>>,
    callback: StateCallback,
}

impl ListenerEntry {
    /// Delivers `state` unless a snapshot at least as new was already
    /// delivered. A panicking callback is logged and otherwise ignored.
    pub(crate) fn deliver(&self, state: &AppState) {
        let mut delivered = self
            .delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if delivered.is_some_and(|version| version >= state.version) {
            return;
        }
        *delivered = Some(state.version);

        if catch_unwind(AssertUnwindSafe(|| (self.callback)(state))).is_err() {
            warn!(listener = self.id, version = state.version, "state listener panicked");
        }
    }
}

/// Copy-on-write listener list. Notification iterates a snapshot, so
/// listeners may subscribe or unsubscribe from inside a callback.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    entries: RwLock<Arc<Vec<Arc<ListenerEntry>>>>,
}

impl ListenerRegistry {
    pub(crate) fn add(&self, callback: StateCallback) -> Arc<ListenerEntry> {
        let entry = Arc::new(ListenerEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            delivered: Mutex::new(None),
            callback,
        });

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push(Arc::clone(&entry));
        *entries = Arc::new(next);
        entry
    }

    pub(crate) fn remove(&self, id: u64) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|entry| entry.id == id) {
            let next: Vec<_> = entries
                .iter()
                .filter(|entry| entry.id != id)
                .cloned()
                .collect();
            *entries = Arc::new(next);
        }
    }

    fn snapshot(&self) -> Arc<Vec<Arc<ListenerEntry>>> {
        Arc::clone(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn notify(&self, state: &AppState) {
        for entry in self.snapshot().iter() {
            entry.deliver(state);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.snapshot().len()
    }
}

/// Keeps a listener registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    pub(crate) fn new(entry: &ListenerEntry, registry: &Arc<ListenerRegistry>) -> Self {
        Self {
            id: entry.id,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
