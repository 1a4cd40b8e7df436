//! Sled-backed mesh store
//! Persistent key-value storage shared by the registry and the mailbox

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use sled::Db;
use std::path::Path;
use std::sync::Arc;

/// Key-value store with one sled tree per keyspace and JSON values
pub struct KvStore {
    db: Arc<Db>,
}

impl KvStore {
    /// Open a store at a specific path, creating parent directories
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let db = sled::open(path).with_context(|| format!("opening store {}", path.display()))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Get a typed value by key
    pub fn get<T: DeserializeOwned>(&self, tree: &str, key: &str) -> Result<Option<T>> {
        let tree = self.db.open_tree(tree)?;
        match tree.get(key.as_bytes())? {
            Some(bytes) => {
                let value: T = serde_json::from_slice(&bytes)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a typed value by key. Not flushed; see [`KvStore::flush`].
    pub fn set<T: Serialize>(&self, tree: &str, key: &str, value: &T) -> Result<()> {
        let tree = self.db.open_tree(tree)?;
        let bytes = serde_json::to_vec(value)?;
        tree.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    /// Insert only if the key is absent. Returns true if the value was written.
    pub fn set_if_absent<T: Serialize>(&self, tree: &str, key: &str, value: &T) -> Result<bool> {
        let tree = self.db.open_tree(tree)?;
        let bytes = serde_json::to_vec(value)?;
        let swapped = tree.compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(bytes))?;
        Ok(swapped.is_ok())
    }

    pub fn contains(&self, tree: &str, key: &str) -> Result<bool> {
        let tree = self.db.open_tree(tree)?;
        Ok(tree.contains_key(key.as_bytes())?)
    }

    /// Delete a key. Returns true if it existed.
    pub fn delete(&self, tree: &str, key: &str) -> Result<bool> {
        let tree = self.db.open_tree(tree)?;
        Ok(tree.remove(key.as_bytes())?.is_some())
    }

    /// All entries whose key starts with `prefix`, in key order
    pub fn scan_prefix<T: DeserializeOwned>(
        &self,
        tree: &str,
        prefix: &str,
    ) -> Result<Vec<(String, T)>> {
        let tree = self.db.open_tree(tree)?;
        let mut entries = Vec::new();
        for item in tree.scan_prefix(prefix.as_bytes()) {
            let (key, bytes) = item?;
            let key = String::from_utf8(key.to_vec())?;
            match serde_json::from_slice(&bytes) {
                Ok(value) => entries.push((key, value)),
                Err(e) => tracing::warn!("Skipping unreadable entry {}: {}", key, e),
            }
        }
        Ok(entries)
    }

    /// Get all values in a tree
    pub fn get_all<T: DeserializeOwned>(&self, tree: &str) -> Result<Vec<T>> {
        Ok(self
            .scan_prefix::<T>(tree, "")?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    /// Count items in a tree (O(1))
    pub fn count(&self, tree: &str) -> Result<usize> {
        let tree = self.db.open_tree(tree)?;
        Ok(tree.len())
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Clone for KvStore {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
        }
    }
}
