use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{BroadcastFrequency, Message};
use crate::persistence::KeyValueStore;
use crate::utils::{Clock, Result};

const MESSAGE_LIST_KEY: &str = "messages";
const DEFAULT_LIST_TTL_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Broadcast,
    Anonymous,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Broadcast => "broadcast",
            Namespace::Anonymous => "anonymous",
        }
    }
}

/// Per-message display bookkeeping, persisted as JSON under the queue id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityRecord {
    pub times_shown: u32,
    pub dismissed: bool,
    pub ignore_dismiss: bool,
    pub next_eligible_at_ms: i64,
}

impl EligibilityRecord {
    fn in_cooldown(&self, now_ms: i64) -> bool {
        now_ms < self.next_eligible_at_ms
    }

    fn allows(&self, frequency: &BroadcastFrequency, now_ms: i64) -> bool {
        if !frequency.is_valid() {
            return false;
        }
        if self.dismissed && !(self.ignore_dismiss || frequency.ignore_dismiss) {
            return false;
        }
        if self.in_cooldown(now_ms) {
            return false;
        }
        frequency.count == 0 || i64::from(self.times_shown) < frequency.count
    }
}

#[derive(Debug)]
struct CachedList {
    messages: Arc<Vec<Message>>,
    /// The list must be recomputed once the clock reaches this instant.
    valid_until_ms: Option<i64>,
}

#[derive(Debug, Default)]
struct CacheState {
    eligible: Option<CachedList>,
}

/// Eligibility bookkeeping for one namespace.
///
/// Every read-modify-write runs under the internal mutex, so concurrent
/// `mark_seen` and `mark_dismissed` calls never lose updates.
pub struct EligibilityCache {
    namespace: Namespace,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    list_ttl_ms: i64,
    state: Mutex<CacheState>,
}

impl EligibilityCache {
    pub fn new(namespace: Namespace, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            namespace,
            store,
            clock,
            list_ttl_ms: DEFAULT_LIST_TTL_MS,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// How long a server list stays usable without a refresh.
    pub fn with_list_ttl_minutes(mut self, minutes: i64) -> Self {
        self.list_ttl_ms = minutes.max(0) * 60 * 1000;
        self
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    fn ns(&self) -> &'static str {
        self.namespace.as_str()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Full-list refresh from a server payload.
    ///
    /// Non-broadcast messages are ignored. A payload without broadcast
    /// messages clears the namespace.
    pub fn update_from_server(&self, messages: &[Message]) {
        let mut state = self.lock();
        state.eligible = None;

        if let Err(e) = self.update_locked(messages) {
            warn!(namespace = self.ns(), error = %e, "failed to update eligibility cache");
        }
    }

    fn update_locked(&self, messages: &[Message]) -> Result<()> {
        let tracked: Vec<Message> = messages
            .iter()
            .filter(|m| m.is_broadcast())
            .cloned()
            .collect();

        if tracked.is_empty() {
            debug!(
                namespace = self.ns(),
                "no broadcast messages in server response, clearing local data"
            );
            return self.clear_locked();
        }

        let expires_at_ms = self.clock.now_ms().saturating_add(self.list_ttl_ms);
        let serialized = serde_json::to_string(&tracked)?;
        self.store
            .save_blob(self.ns(), MESSAGE_LIST_KEY, &serialized, expires_at_ms)?;

        let mut valid_ids = HashSet::new();
        for message in &tracked {
            let (Some(queue_id), Some(frequency)) = (&message.queue_id, message.broadcast()) else {
                continue;
            };
            if !frequency.is_valid() {
                debug!(
                    queue_id,
                    count = frequency.count,
                    delay = frequency.delay,
                    "skipping broadcast with invalid frequency"
                );
                continue;
            }

            let mut record = self.load_record(queue_id)?.unwrap_or_default();
            record.ignore_dismiss = frequency.ignore_dismiss;
            self.save_record(queue_id, &record)?;
            valid_ids.insert(queue_id.clone());
        }

        self.prune_locked(&valid_ids)?;
        debug!(
            namespace = self.ns(),
            count = tracked.len(),
            "saved broadcast messages to local store"
        );
        Ok(())
    }

    /// Whether the tracked message with `queue_id` may be shown now.
    pub fn is_eligible(&self, queue_id: &str) -> bool {
        let _state = self.lock();
        self.is_eligible_locked(queue_id, self.clock.now_ms())
            .unwrap_or_else(|e| {
                warn!(namespace = self.ns(), queue_id, error = %e, "eligibility check failed");
                false
            })
    }

    fn is_eligible_locked(&self, queue_id: &str, now_ms: i64) -> Result<bool> {
        let Some(frequency) = self.frequency_for(queue_id, now_ms)? else {
            return Ok(false);
        };
        let record = self.load_record(queue_id)?.unwrap_or_default();
        Ok(record.allows(&frequency, now_ms))
    }

    /// The tracked messages that may be shown now.
    ///
    /// Repeated calls return the same `Arc` until something mutates the
    /// cache or a cooldown elapses.
    pub fn eligible_messages(&self) -> Arc<Vec<Message>> {
        let mut state = self.lock();
        let now_ms = self.clock.now_ms();

        if let Some(cached) = &state.eligible {
            let fresh = cached.valid_until_ms.is_none_or(|until| now_ms < until);
            if fresh {
                return Arc::clone(&cached.messages);
            }
        }

        let computed = match self.compute_eligible(now_ms) {
            Ok(computed) => computed,
            Err(e) => {
                warn!(namespace = self.ns(), error = %e, "failed to compute eligible messages");
                return Arc::new(Vec::new());
            }
        };
        let messages = Arc::clone(&computed.messages);
        state.eligible = Some(computed);
        messages
    }

    fn compute_eligible(&self, now_ms: i64) -> Result<CachedList> {
        let Some(blob) = self.store.load_blob(self.ns(), MESSAGE_LIST_KEY, now_ms)? else {
            return Ok(CachedList {
                messages: Arc::new(Vec::new()),
                valid_until_ms: None,
            });
        };
        let messages = parse_list(&blob.value);

        let mut valid_until_ms = Some(blob.expires_at_ms);
        let mut eligible = Vec::new();
        for message in messages {
            let (Some(queue_id), Some(frequency)) = (&message.queue_id, message.broadcast()) else {
                continue;
            };
            let record = self.load_record(queue_id)?.unwrap_or_default();
            if record.in_cooldown(now_ms) {
                valid_until_ms = Some(
                    valid_until_ms.map_or(record.next_eligible_at_ms, |until| {
                        until.min(record.next_eligible_at_ms)
                    }),
                );
            }
            if record.allows(frequency, now_ms) {
                eligible.push(message);
            }
        }

        Ok(CachedList {
            messages: Arc::new(eligible),
            valid_until_ms,
        })
    }

    /// Records one display of `queue_id`.
    pub fn mark_seen(&self, queue_id: &str) {
        let mut state = self.lock();
        state.eligible = None;
        if let Err(e) = self.mark_seen_locked(queue_id, self.clock.now_ms()) {
            warn!(namespace = self.ns(), queue_id, error = %e, "failed to mark message seen");
        }
    }

    fn mark_seen_locked(&self, queue_id: &str, now_ms: i64) -> Result<()> {
        let Some(frequency) = self.frequency_for(queue_id, now_ms)? else {
            debug!(namespace = self.ns(), queue_id, "no tracked message to mark seen");
            return Ok(());
        };

        let mut record = self.load_record(queue_id)?.unwrap_or_default();
        record.times_shown = record.times_shown.saturating_add(1);

        if frequency.count > 0 && i64::from(record.times_shown) >= frequency.count {
            record.dismissed = true;
            debug!(queue_id, times_shown = record.times_shown, "display limit reached");
        } else if frequency.delay > 0 {
            record.next_eligible_at_ms = now_ms.saturating_add(frequency.delay * 1000);
            debug!(
                queue_id,
                times_shown = record.times_shown,
                next_eligible_at_ms = record.next_eligible_at_ms,
                "message in cooldown"
            );
        }
        self.save_record(queue_id, &record)
    }

    /// Marks `queue_id` dismissed unless it ignores dismissal.
    pub fn mark_dismissed(&self, queue_id: &str) {
        let mut state = self.lock();
        state.eligible = None;
        if let Err(e) = self.mark_dismissed_locked(queue_id) {
            warn!(namespace = self.ns(), queue_id, error = %e, "failed to mark message dismissed");
        }
    }

    fn mark_dismissed_locked(&self, queue_id: &str) -> Result<()> {
        let Some(mut record) = self.load_record(queue_id)? else {
            debug!(namespace = self.ns(), queue_id, "no tracked message to dismiss");
            return Ok(());
        };
        if record.ignore_dismiss {
            debug!(queue_id, "message ignores dismissal");
            return Ok(());
        }
        record.dismissed = true;
        self.save_record(queue_id, &record)
    }

    /// Drops records whose id is not in `queue_ids`. Retained records keep
    /// their counters.
    pub fn replace_tracked_set(&self, queue_ids: &HashSet<String>) {
        let mut state = self.lock();
        state.eligible = None;
        if let Err(e) = self.prune_locked(queue_ids) {
            warn!(namespace = self.ns(), error = %e, "failed to prune tracked messages");
        }
    }

    fn prune_locked(&self, keep: &HashSet<String>) -> Result<()> {
        for key in self.store.keys(self.ns())? {
            if !keep.contains(&key) {
                self.store.remove(self.ns(), &key)?;
                debug!(namespace = self.ns(), queue_id = %key, "removed tracking data");
            }
        }
        Ok(())
    }

    /// Removes every record and the cached server list.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.eligible = None;
        if let Err(e) = self.clear_locked() {
            warn!(namespace = self.ns(), error = %e, "failed to clear eligibility cache");
        }
    }

    fn clear_locked(&self) -> Result<()> {
        self.store.clear_namespace(self.ns())
    }

    /// The persisted record for `queue_id`, if tracked.
    pub fn record(&self, queue_id: &str) -> Option<EligibilityRecord> {
        let _state = self.lock();
        self.load_record(queue_id).ok().flatten()
    }

    fn frequency_for(&self, queue_id: &str, now_ms: i64) -> Result<Option<BroadcastFrequency>> {
        let Some(blob) = self.store.load_blob(self.ns(), MESSAGE_LIST_KEY, now_ms)? else {
            return Ok(None);
        };
        Ok(parse_list(&blob.value)
            .iter()
            .find(|m| m.queue_id.as_deref() == Some(queue_id))
            .and_then(|m| m.broadcast().copied()))
    }

    fn load_record(&self, queue_id: &str) -> Result<Option<EligibilityRecord>> {
        match self.store.get(self.ns(), queue_id)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn save_record(&self, queue_id: &str, record: &EligibilityRecord) -> Result<()> {
        let serialized = serde_json::to_string(record)?;
        self.store.set(self.ns(), queue_id, &serialized)
    }
}

fn parse_list(raw: &str) -> Vec<Message> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        debug!(error = %e, "error parsing stored message list");
        Vec::new()
    })
}

impl std::fmt::Debug for EligibilityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EligibilityCache")
            .field("namespace", &self.namespace)
            .field("list_ttl_ms", &self.list_ttl_ms)
            .finish()
    }
}
