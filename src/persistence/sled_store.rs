use sled::{Db, Tree};
use tracing::debug;

use super::{KeyValueStore, StoredBlob};
use crate::utils::Result;

/// Sled-backed store with one tree per namespace.
///
/// Blobs live in a sibling tree named `<namespace>.blobs` so that
/// [`KeyValueStore::keys`] only ever lists plain entries.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
}

impl SledStore {
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        debug!(path, "opened sled store");
        Ok(Self { db })
    }

    fn tree(&self, namespace: &str) -> Result<Tree> {
        Ok(self.db.open_tree(namespace)?)
    }

    fn blob_tree(&self, namespace: &str) -> Result<Tree> {
        Ok(self.db.open_tree(format!("{namespace}.blobs"))?)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let value = self.tree(namespace)?.get(key)?;
        Ok(value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.tree(namespace)?.insert(key, value.as_bytes())?;
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        self.tree(namespace)?.remove(key)?;
        Ok(())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        self.tree(namespace)?
            .iter()
            .keys()
            .map(|key| Ok(String::from_utf8_lossy(&key?).into_owned()))
            .collect()
    }

    fn save_blob(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        expires_at_ms: i64,
    ) -> Result<()> {
        let blob = StoredBlob {
            value: value.to_string(),
            expires_at_ms,
        };
        let serialized = serde_json::to_vec(&blob)?;
        self.blob_tree(namespace)?.insert(key, serialized)?;
        Ok(())
    }

    fn load_blob(&self, namespace: &str, key: &str, now_ms: i64) -> Result<Option<StoredBlob>> {
        let tree = self.blob_tree(namespace)?;
        let Some(bytes) = tree.get(key)? else {
            return Ok(None);
        };

        let blob: StoredBlob = serde_json::from_slice(&bytes)?;
        if blob.is_expired(now_ms) {
            debug!(namespace, key, "dropping expired blob");
            tree.remove(key)?;
            return Ok(None);
        }
        Ok(Some(blob))
    }

    fn clear_namespace(&self, namespace: &str) -> Result<()> {
        self.tree(namespace)?.clear()?;
        self.blob_tree(namespace)?.clear()?;
        Ok(())
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").field("db", &"sled::Db").finish()
    }
}
