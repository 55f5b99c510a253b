// ============================================
// File: crates/fleet-server/src/store/memory.rs
// ============================================
//! # In-Memory Record Store
//!
//! Backed by a `BTreeMap` so prefix listing comes out sorted. Used for
//! tests and `backend = "memory"`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{validate_key, RecordStore};
use crate::error::Result;

/// Process-local record store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns `true` if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;
        Ok(self.records.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        validate_key(key)?;
        self.records.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let records = self.records.read();
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.records.write().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_crud_and_prefix() {
        let store = MemoryStore::new();
        store.put("nodes/a", json!({"n": 1})).await.unwrap();
        store.put("nodes/b", json!({"n": 2})).await.unwrap();
        store.put("jobs/x", json!({"n": 3})).await.unwrap();

        assert_eq!(store.get("nodes/a").await.unwrap(), Some(json!({"n": 1})));
        let nodes = store.list("nodes/").await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].0, "nodes/a");

        assert!(store.delete("nodes/a").await.unwrap());
        assert!(!store.delete("nodes/a").await.unwrap());
        assert_eq!(store.len(), 2);
    }
}
