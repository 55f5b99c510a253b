// ============================================
// File: crates/fleet-server/src/store/mod.rs
// ============================================
//! # Record Store
//!
//! ## Creation Reason
//! Nodes, jobs and audit events are persisted through one small key-value
//! interface so the storage engine can be swapped without touching the
//! services.
//!
//! ## Main Functionality
//! - `RecordStore`: `get` / `put` / `list(prefix)` / `delete` over JSON values
//! - [`memory`]: In-process map
//! - [`file`]: One JSON file per key with atomic rename
//! - `get_record` / `put_record` / `list_records`: Typed helpers
//!
//! ## Key Layout
//! ```text
//! nodes/{node_id}
//! jobs/{job_id}            (job ids sort chronologically)
//! audit/{millis}-{rand}
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Keys are `/`-separated segments of `[A-Za-z0-9._-]`; `..` is rejected
//! - `list` returns entries sorted by key ascending
//! - Read-your-writes holds within one process for both backends
//!
//! ## Last Modified
//! v0.1.0 - Initial record store

pub mod file;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Result, ServerError};

pub use file::FileStore;
pub use memory::MemoryStore;

// ============================================
// RecordStore Trait
// ============================================

/// Key-value store of JSON records.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Reads a record.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Writes a record, replacing any previous value.
    async fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Lists records whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>>;

    /// Deletes a record; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Opens the configured backend.
///
/// # Errors
/// Returns `Store` if the file backend's directory cannot be created.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn RecordStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::File => Ok(Arc::new(FileStore::open(&config.path).await?)),
    }
}

/// Checks that a key is safe to map onto a path.
///
/// # Errors
/// Returns `Store` for empty, absolute or traversing keys.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        });
    if valid {
        Ok(())
    } else {
        Err(ServerError::store("key", format!("invalid record key '{key}'")))
    }
}

// ============================================
// Typed Helpers
// ============================================

/// Reads and decodes a record.
///
/// # Errors
/// Returns `Store` if the stored value doesn't decode as `T`.
pub async fn get_record<T: DeserializeOwned>(store: &dyn RecordStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ServerError::store(key, e)),
        None => Ok(None),
    }
}

/// Encodes and writes a record.
///
/// # Errors
/// Returns `Store` if encoding or the write fails.
pub async fn put_record<T: Serialize + Sync>(store: &dyn RecordStore, key: &str, record: &T) -> Result<()> {
    let value = serde_json::to_value(record).map_err(|e| ServerError::store(key, e))?;
    store.put(key, value).await
}

/// Lists and decodes records under `prefix`, skipping undecodable ones.
///
/// # Errors
/// Propagates backend errors.
pub async fn list_records<T: DeserializeOwned>(store: &dyn RecordStore, prefix: &str) -> Result<Vec<(String, T)>> {
    let mut out = Vec::new();
    for (key, value) in store.list(prefix).await? {
        match serde_json::from_value(value) {
            Ok(record) => out.push((key, record)),
            Err(e) => warn!(key = %key, error = %e, "Skipping undecodable record"),
        }
    }
    Ok(out)
}

// ============================================
// Tests
// ============================================
