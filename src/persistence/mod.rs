//! The `persistence` module provides the key-value contract used for
//! eligibility bookkeeping and the cached server message list.
//!
//! Values are plain strings (JSON in practice) addressed by a feature
//! namespace and an id. Each namespace also has an expiry-aware blob slot.
//! Two engines are provided: [`SledStore`] for durable storage on disk and
//! [`MemoryStore`] for tests and ephemeral sessions.

pub mod memory_store;
pub mod sled_store;

pub use memory_store::MemoryStore;
pub use sled_store::SledStore;

use serde::{Deserialize, Serialize};

use crate::utils::Result;

/// A blob with an absolute expiry in epoch milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredBlob {
    pub value: String,
    pub expires_at_ms: i64,
}

impl StoredBlob {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Namespaced string storage.
///
/// Implementations must be safe to share across threads. Callers that need
/// read-modify-write atomicity hold their own lock around the sequence.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()>;

    fn remove(&self, namespace: &str, key: &str) -> Result<()>;

    /// Every key in `namespace`, excluding blobs.
    fn keys(&self, namespace: &str) -> Result<Vec<String>>;

    fn save_blob(&self, namespace: &str, key: &str, value: &str, expires_at_ms: i64)
    -> Result<()>;

    /// Returns the blob unless it has expired at `now_ms`. Expired blobs are
    /// removed on read.
    fn load_blob(&self, namespace: &str, key: &str, now_ms: i64) -> Result<Option<StoredBlob>>;

    /// Removes every key and blob in `namespace`.
    fn clear_namespace(&self, namespace: &str) -> Result<()>;
}
