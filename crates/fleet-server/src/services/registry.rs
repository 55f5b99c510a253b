// ============================================
// File: crates/fleet-server/src/services/registry.rs
// ============================================
//! # Node Registry
//!
//! ## Creation Reason
//! Owns the persisted node records and is the only component that touches
//! sealed panel secrets.
//!
//! ## Main Functionality
//! - `NodeRegistry`: Node CRUD over the record store
//! - `credentials`: Unseals a node's secret for login, re-sealing it under
//!   the current key when it was written under an older one
//! - `record_probe`: Health and credential status updates from probes
//! - `reencrypt_all`: Bulk re-seal after a key rotation
//!
//! ## ⚠️ Important Note for Next Developer
//! - Read-modify-write of node records goes through `write_lock`
//! - Probes never overwrite `Maintenance`; only `set_health` leaves it
//! - Plaintext passwords never leave this module except inside
//!   `PanelCredentials`, whose `Debug` is redacted
//!
//! ## Last Modified
//! v0.1.0 - Initial node registry

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fleet_common::{CommonError, NodeId, Timestamp};
use fleet_core::crypto::CredentialVault;
use fleet_core::model::{CredentialStatus, Node, NodeDraft, NodeHealth, NodeUpdate};
use fleet_core::SealedSecret;
use fleet_transport::PanelCredentials;

use crate::error::{Result, ServerError};
use crate::store::{get_record, list_records, put_record, RecordStore};

const NODE_PREFIX: &str = "nodes/";

fn node_key(id: &NodeId) -> String {
    format!("{NODE_PREFIX}{id}")
}

/// Counts from a bulk re-seal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReencryptReport {
    /// Secrets moved to the current key.
    pub resealed: usize,
    /// Secrets already under the current key.
    pub current: usize,
    /// Nodes without a secret.
    pub missing: usize,
    /// Secrets no loaded key could open.
    pub unreadable: usize,
}

// ============================================
// NodeRegistry
// ============================================

/// Persisted node inventory.
pub struct NodeRegistry {
    store: Arc<dyn RecordStore>,
    vault: Arc<CredentialVault>,
    write_lock: Mutex<()>,
}

impl NodeRegistry {
    /// Creates a registry over a store and vault.
    pub fn new(store: Arc<dyn RecordStore>, vault: Arc<CredentialVault>) -> Self {
        Self {
            store,
            vault,
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the vault.
    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    // ========================================
    // Queries
    // ========================================

    /// Looks up a node.
    ///
    /// # Errors
    /// `Store` on backend failure.
    pub async fn find(&self, id: &NodeId) -> Result<Option<Node>> {
        get_record(self.store.as_ref(), &node_key(id)).await
    }

    /// Returns a node.
    ///
    /// # Errors
    /// `NodeNotFound` if no such node exists.
    pub async fn get(&self, id: &NodeId) -> Result<Node> {
        self.find(id)
            .await?
            .ok_or_else(|| ServerError::NodeNotFound(id.clone()))
    }

    /// Returns every node, ordered by id.
    ///
    /// # Errors
    /// `Store` on backend failure.
    pub async fn list(&self) -> Result<Vec<Node>> {
        Ok(list_records::<Node>(self.store.as_ref(), NODE_PREFIX)
            .await?
            .into_iter()
            .map(|(_, node)| node)
            .collect())
    }

    // ========================================
    // Mutations
    // ========================================

    /// Registers a node, sealing its password.
    ///
    /// A missing `id` is generated.
    ///
    /// # Errors
    /// - `Common(InvalidInput)` for bad drafts
    /// - `NodeExists` if the id is taken
    pub async fn add(&self, id: Option<NodeId>, draft: &NodeDraft) -> Result<Node> {
        draft.validate()?;
        let id = id.unwrap_or_else(NodeId::generate);

        let _guard = self.write_lock.lock().await;
        if self.find(&id).await?.is_some() {
            return Err(ServerError::NodeExists(id));
        }

        let secret = draft
            .password
            .as_deref()
            .map(|pw| self.vault.encrypt(pw))
            .transpose()?;
        let node = Node::from_draft(id, draft, secret);
        put_record(self.store.as_ref(), &node_key(&node.id), &node).await?;

        info!(
            node_id = %node.id,
            base_url = %node.base_url,
            credential = ?node.credential_status,
            "Node registered"
        );
        Ok(node)
    }

    /// Applies a partial update, re-sealing a new password.
    ///
    /// # Errors
    /// `NodeNotFound`, or `Common(InvalidInput)` if the result is invalid.
    pub async fn update(&self, id: &NodeId, update: &NodeUpdate) -> Result<Node> {
        if update.password.as_deref().is_some_and(str::is_empty) {
            return Err(CommonError::invalid_input("password", "must not be empty").into());
        }

        let _guard = self.write_lock.lock().await;
        let mut node = self.get(id).await?;
        node.apply(update);
        node.validate()?;

        if let Some(password) = update.password.as_deref() {
            node.secret = Some(self.vault.encrypt(password)?);
            node.credential_status = CredentialStatus::Configured;
        }
        if update.touches_session() && !node.in_maintenance() {
            node.health = NodeHealth::Unknown;
        }
        put_record(self.store.as_ref(), &node_key(id), &node).await?;

        info!(node_id = %id, "Node updated");
        Ok(node)
    }

    /// Removes a node, returning the removed record.
    ///
    /// # Errors
    /// `NodeNotFound` if no such node exists.
    pub async fn remove(&self, id: &NodeId) -> Result<Node> {
        let _guard = self.write_lock.lock().await;
        let node = self.get(id).await?;
        self.store.delete(&node_key(id)).await?;
        info!(node_id = %id, "Node removed");
        Ok(node)
    }

    /// Sets health by operator decision, including entering or leaving
    /// maintenance.
    ///
    /// # Errors
    /// `NodeNotFound` if no such node exists.
    pub async fn set_health(&self, id: &NodeId, health: NodeHealth) -> Result<Node> {
        let _guard = self.write_lock.lock().await;
        let mut node = self.get(id).await?;
        if node.health != health {
            info!(node_id = %id, from = %node.health, to = %health, "Node health set");
            node.health = health;
            node.updated_at = Timestamp::now();
            put_record(self.store.as_ref(), &node_key(id), &node).await?;
        }
        Ok(node)
    }

    /// Records what a probe observed. Fields left `None` are untouched and
    /// a node in maintenance keeps its health.
    ///
    /// Writes only when something changed.
    ///
    /// # Errors
    /// `NodeNotFound` if no such node exists.
    pub async fn record_probe(
        &self,
        id: &NodeId,
        health: Option<NodeHealth>,
        credential_status: Option<CredentialStatus>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut node = self.get(id).await?;
        let mut changed = false;

        if let Some(health) = health {
            if !node.in_maintenance() && node.health != health {
                debug!(node_id = %id, from = %node.health, to = %health, "Node health changed");
                node.health = health;
                changed = true;
            }
        }
        if let Some(status) = credential_status {
            if node.credential_status != status {
                node.credential_status = status;
                changed = true;
            }
        }
        if changed {
            node.updated_at = Timestamp::now();
            put_record(self.store.as_ref(), &node_key(id), &node).await?;
        }
        Ok(())
    }

    // ========================================
    // Credentials
    // ========================================

    /// Unseals a node's panel credentials.
    ///
    /// A secret sealed under a non-current key is re-sealed and persisted
    /// after the read; failure to persist is logged and does not fail the
    /// read.
    ///
    /// # Errors
    /// - `NodeNotFound`
    /// - `CredentialMissing` if no secret is stored
    /// - `CredentialUnreadable` if no loaded key opens it
    pub async fn credentials(&self, id: &NodeId) -> Result<(Node, PanelCredentials)> {
        let node = self.get(id).await?;
        let Some(sealed) = node.secret.clone() else {
            self.record_probe(id, None, Some(CredentialStatus::Missing)).await?;
            return Err(ServerError::CredentialMissing(id.clone()));
        };

        let decrypted = match self.vault.decrypt(&sealed) {
            Ok(d) => d,
            Err(e) if e.is_unreadable_credential() => {
                warn!(node_id = %id, error = %e, "Stored credential unreadable");
                self.record_probe(id, None, Some(CredentialStatus::Unreadable)).await?;
                return Err(ServerError::CredentialUnreadable(id.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        if decrypted.stale {
            if let Err(e) = self.reseal(id, &sealed).await {
                warn!(node_id = %id, error = %e, "Failed to re-seal stale credential");
            }
        }

        let credentials = PanelCredentials::new(node.username.clone(), decrypted.plaintext.as_str());
        Ok((node, credentials))
    }

    /// Replaces the stored login for a node.
    ///
    /// # Errors
    /// `NodeNotFound` if no such node exists.
    pub async fn set_credentials(&self, id: &NodeId, credentials: &PanelCredentials) -> Result<Node> {
        let sealed = self.vault.encrypt(&credentials.password)?;

        let _guard = self.write_lock.lock().await;
        let mut node = self.get(id).await?;
        node.username.clone_from(&credentials.username);
        node.secret = Some(sealed);
        node.credential_status = CredentialStatus::Configured;
        node.updated_at = Timestamp::now();
        put_record(self.store.as_ref(), &node_key(id), &node).await?;

        info!(node_id = %id, "Node credentials replaced");
        Ok(node)
    }

    /// Re-seals every stored secret under the current key.
    ///
    /// # Errors
    /// `Store` on backend failure.
    pub async fn reencrypt_all(&self) -> Result<ReencryptReport> {
        let current = self.vault.current_version();
        let mut report = ReencryptReport::default();

        let _guard = self.write_lock.lock().await;
        for mut node in self.list().await? {
            let Some(sealed) = node.secret.clone() else {
                report.missing += 1;
                continue;
            };
            if sealed.key_version() == Some(current) {
                report.current += 1;
                continue;
            }
            match self.vault.reencrypt(&sealed) {
                Ok(resealed) => {
                    node.secret = Some(resealed);
                    node.credential_status = CredentialStatus::Configured;
                    put_record(self.store.as_ref(), &node_key(&node.id), &node).await?;
                    report.resealed += 1;
                }
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "Cannot re-seal credential");
                    if node.credential_status != CredentialStatus::Unreadable {
                        node.credential_status = CredentialStatus::Unreadable;
                        put_record(self.store.as_ref(), &node_key(&node.id), &node).await?;
                    }
                    report.unreadable += 1;
                }
            }
        }

        info!(
            key_version = current,
            resealed = report.resealed,
            unreadable = report.unreadable,
            "Credential re-seal complete"
        );
        Ok(report)
    }

    async fn reseal(&self, id: &NodeId, read: &SealedSecret) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut node = self.get(id).await?;
        // Skip if the secret was replaced since it was read.
        if node.secret.as_ref() != Some(read) {
            return Ok(());
        }
        node.secret = Some(self.vault.reencrypt(read)?);
        put_record(self.store.as_ref(), &node_key(id), &node).await?;
        debug!(node_id = %id, key_version = self.vault.current_version(), "Credential re-sealed");
        Ok(())
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("key_version", &self.vault.current_version())
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const KEY_V1: &[u8] = b"first operator key material";
    const KEY_V2: &[u8] = b"second operator key material";

    fn draft(password: Option<&str>) -> NodeDraft {
        NodeDraft {
            name: "Edge 1".into(),
            base_url: "https://edge-1.example:2053/".into(),
            username: "admin".into(),
            password: password.map(Into::into),
            ..NodeDraft::default()
        }
    }

    fn registry() -> (Arc<dyn RecordStore>, NodeRegistry) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let vault = Arc::new(CredentialVault::from_material(KEY_V1, 1).unwrap());
        (Arc::clone(&store), NodeRegistry::new(store, vault))
    }

    fn id(raw: &str) -> NodeId {
        raw.parse().unwrap()
    }

    #[tokio::test]
    async fn test_add_seals_password() {
        let (store, registry) = registry();
        let node = registry.add(Some(id("edge-1")), &draft(Some("hunter2"))).await.unwrap();
        assert_eq!(node.base_url, "https://edge-1.example:2053");
        assert_eq!(node.credential_status, CredentialStatus::Configured);

        let raw = store.get("nodes/edge-1").await.unwrap().unwrap();
        assert!(!raw.to_string().contains("hunter2"));

        let (_, creds) = registry.credentials(&id("edge-1")).await.unwrap();
        assert_eq!(creds.password, "hunter2");
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (_, registry) = registry();
        registry.add(Some(id("edge-1")), &draft(None)).await.unwrap();
        let err = registry.add(Some(id("edge-1")), &draft(None)).await.unwrap_err();
        assert!(matches!(err, ServerError::NodeExists(_)));
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let (_, registry) = registry();
        registry.add(Some(id("edge-1")), &draft(None)).await.unwrap();
        let err = registry.credentials(&id("edge-1")).await.unwrap_err();
        assert!(matches!(err, ServerError::CredentialMissing(_)));
    }

    #[tokio::test]
    async fn test_unreadable_credential_is_flagged() {
        let (store, registry) = registry();
        registry.add(Some(id("edge-1")), &draft(Some("pw"))).await.unwrap();

        let other = NodeRegistry::new(
            Arc::clone(&store),
            Arc::new(CredentialVault::from_material(KEY_V2, 2).unwrap()),
        );
        let err = other.credentials(&id("edge-1")).await.unwrap_err();
        assert!(matches!(err, ServerError::CredentialUnreadable(_)));
        assert_eq!(
            other.get(&id("edge-1")).await.unwrap().credential_status,
            CredentialStatus::Unreadable
        );
    }

    #[tokio::test]
    async fn test_stale_secret_resealed_on_read() {
        let (_, registry) = registry();
        registry.add(Some(id("edge-1")), &draft(Some("pw"))).await.unwrap();

        registry.vault().rotate(2, KEY_V2).unwrap();
        let (_, creds) = registry.credentials(&id("edge-1")).await.unwrap();
        assert_eq!(creds.password, "pw");

        let node = registry.get(&id("edge-1")).await.unwrap();
        assert_eq!(node.secret.unwrap().key_version(), Some(2));
    }

    #[tokio::test]
    async fn test_reencrypt_all() {
        let (_, registry) = registry();
        registry.add(Some(id("a")), &draft(Some("pw-a"))).await.unwrap();
        registry.add(Some(id("b")), &draft(None)).await.unwrap();
        registry.vault().rotate(2, KEY_V2).unwrap();

        let report = registry.reencrypt_all().await.unwrap();
        assert_eq!(report.resealed, 1);
        assert_eq!(report.missing, 1);

        registry.vault().retire(1).unwrap();
        let (_, creds) = registry.credentials(&id("a")).await.unwrap();
        assert_eq!(creds.password, "pw-a");
    }

    #[tokio::test]
    async fn test_probe_keeps_maintenance() {
        let (_, registry) = registry();
        registry.add(Some(id("edge-1")), &draft(Some("pw"))).await.unwrap();
        registry.set_health(&id("edge-1"), NodeHealth::Maintenance).await.unwrap();

        registry
            .record_probe(&id("edge-1"), Some(NodeHealth::Healthy), None)
            .await
            .unwrap();
        assert_eq!(registry.get(&id("edge-1")).await.unwrap().health, NodeHealth::Maintenance);
    }

    #[tokio::test]
    async fn test_update_password_and_clear_group() {
        let (_, registry) = registry();
        let mut d = draft(Some("old"));
        d.group = Some("eu".into());
        registry.add(Some(id("edge-1")), &d).await.unwrap();

        let update = NodeUpdate {
            password: Some("new".into()),
            group: Some(String::new()),
            ..NodeUpdate::default()
        };
        let node = registry.update(&id("edge-1"), &update).await.unwrap();
        assert_eq!(node.group, None);
        let (_, creds) = registry.credentials(&id("edge-1")).await.unwrap();
        assert_eq!(creds.password, "new");
    }
}
