// ============================================
// File: crates/fleet-server/src/store/file.rs
// ============================================
//! # File Record Store
//!
//! ## Main Functionality
//! - One pretty-printed JSON file per key: `{root}/{key}.json`
//! - Writes go to a temp file in the same directory, then `rename`
//!
//! ## ⚠️ Important Note for Next Developer
//! - Writes and deletes are serialized through one async mutex
//! - Files that fail to parse are skipped by `list` with a warning
//!
//! ## Last Modified
//! v0.1.0 - Initial file store

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use fleet_common::random_token;

use super::{validate_key, RecordStore};
use crate::error::{Result, ServerError};

const EXTENSION: &str = "json";

/// Directory-backed record store.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens (and creates) the data directory.
    ///
    /// # Errors
    /// Returns `Store` if the directory cannot be created.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| ServerError::store(root.display().to_string(), e))?;
        debug!(root = %root.display(), "File store opened");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{EXTENSION}"))
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ServerError::store(key, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServerError::store(key, e)),
        }
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        validate_key(key)?;
        let path = self.path_for(key);
        let bytes = serde_json::to_vec_pretty(&value).map_err(|e| ServerError::store(key, e))?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServerError::store(key, e))?;
        }
        let tmp = path.with_extension(format!("{EXTENSION}.tmp-{}", random_token(4)));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ServerError::store(key, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ServerError::store(key, e));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let (dir_part, name_prefix) = match prefix.rfind('/') {
            Some(i) => (&prefix[..i], &prefix[i + 1..]),
            None => ("", prefix),
        };
        let dir = if dir_part.is_empty() {
            self.root.clone()
        } else {
            validate_key(dir_part)?;
            self.root.join(dir_part)
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ServerError::store(prefix, e)),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ServerError::store(prefix, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !stem.starts_with(name_prefix) {
                continue;
            }
            let key = if dir_part.is_empty() {
                stem.to_string()
            } else {
                format!("{dir_part}/{stem}")
            };
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(value) => out.push((key, value)),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping corrupt record"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ServerError::store(prefix, e)),
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ServerError::store(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        store.put("nodes/a", json!({"name": "A"})).await.unwrap();
        store.put("nodes/b", json!({"name": "B"})).await.unwrap();
        store.put("jobs/0001", json!({"id": 1})).await.unwrap();

        assert_eq!(store.get("nodes/a").await.unwrap(), Some(json!({"name": "A"})));
        assert_eq!(store.get("nodes/zzz").await.unwrap(), None);

        let nodes = store.list("nodes/").await.unwrap();
        let keys: Vec<_> = nodes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["nodes/a", "nodes/b"]);

        assert!(store.delete("nodes/a").await.unwrap());
        assert!(!store.delete("nodes/a").await.unwrap());
        assert_eq!(store.list("nodes/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.put("jobs/x", json!([1, 2, 3])).await.unwrap();
        }
        let store = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("jobs/x").await.unwrap(), Some(json!([1, 2, 3])));
    }

    #[tokio::test]
    async fn test_corrupt_file_skipped_in_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.put("jobs/good", json!(1)).await.unwrap();
        tokio::fs::write(dir.path().join("jobs/bad.json"), b"{not json").await.unwrap();

        let jobs = store.list("jobs/").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0, "jobs/good");
    }

    #[tokio::test]
    async fn test_missing_prefix_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.list("audit/").await.unwrap().is_empty());
    }
}
