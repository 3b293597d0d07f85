use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{KeyValueStore, StoredBlob};
use crate::utils::Result;

#[derive(Debug, Default)]
struct Namespace {
    entries: BTreeMap<String, String>,
    blobs: HashMap<String, StoredBlob>,
}

/// In-memory store, lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespaces: Mutex<HashMap<String, Namespace>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_namespace<T>(&self, namespace: &str, f: impl FnOnce(&mut Namespace) -> T) -> T {
        let mut namespaces = self
            .namespaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(namespaces.entry(namespace.to_string()).or_default())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        Ok(self.with_namespace(namespace, |ns| ns.entries.get(key).cloned()))
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.with_namespace(namespace, |ns| {
            ns.entries.insert(key.to_string(), value.to_string());
        });
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        self.with_namespace(namespace, |ns| {
            ns.entries.remove(key);
        });
        Ok(())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self.with_namespace(namespace, |ns| ns.entries.keys().cloned().collect()))
    }

    fn save_blob(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        expires_at_ms: i64,
    ) -> Result<()> {
        self.with_namespace(namespace, |ns| {
            ns.blobs.insert(
                key.to_string(),
                StoredBlob {
                    value: value.to_string(),
                    expires_at_ms,
                },
            );
        });
        Ok(())
    }

    fn load_blob(&self, namespace: &str, key: &str, now_ms: i64) -> Result<Option<StoredBlob>> {
        Ok(self.with_namespace(namespace, |ns| match ns.blobs.get(key) {
            Some(blob) if blob.is_expired(now_ms) => {
                ns.blobs.remove(key);
                None
            }
            Some(blob) => Some(blob.clone()),
            None => None,
        }))
    }

    fn clear_namespace(&self, namespace: &str) -> Result<()> {
        self.with_namespace(namespace, |ns| {
            ns.entries.clear();
            ns.blobs.clear();
        });
        Ok(())
    }
}
