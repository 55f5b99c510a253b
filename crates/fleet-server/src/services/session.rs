// ============================================
// File: crates/fleet-server/src/services/session.rs
// ============================================
//! # Node Session Manager
//!
//! ## Creation Reason
//! Keeps one authenticated panel session per node so batch steps and
//! status polls share a login instead of authenticating per call.
//!
//! ## Main Functionality
//! - `NodeSessionManager`: Per-node session cache with single-flight login
//! - `invoke`: Authenticated call with one transparent re-login on
//!   `AuthRejected`
//! - `test_connection`: Fresh login plus status read, optionally with
//!   operator-supplied credentials that are stored only if they work
//!
//! ## Session Lifecycle
//! ```text
//! invoke ──► slot lock ──► cached & fresh? ──yes──► call
//!                 │                no
//!                 ▼
//!         registry.credentials ──► transport.login ──► cache ──► call
//!
//! call ──► AuthRejected ──► drop token (if unchanged) ──► login ──► call once more
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The slot mutex is held only while logging in, never across calls
//! - Callers that queued behind a failed login get that attempt's error;
//!   only a caller arriving after it logs in again (`logins_done` counter)
//! - A rejected token is dropped only if it is still the cached one, so a
//!   concurrent re-login is reused rather than repeated
//! - Health writes happen on transitions only (`last_health` cache)
//!
//! ## Last Modified
//! v0.1.0 - Initial session manager

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fleet_common::NodeId;
use fleet_core::model::{CredentialStatus, Node, NodeHealth};
use fleet_transport::{PanelCredentials, PanelTransport, RemoteRequest, RemoteResponse, SessionToken, TransportError};

use crate::error::{Result, ServerError};
use crate::services::registry::NodeRegistry;

/// Panel status endpoint used by connection tests and the aggregator.
pub const STATUS_PATH: &str = "/panel/api/server/status";

// ============================================
// Session Slot
// ============================================

struct Session {
    token: SessionToken,
    base_url: String,
    expires_at: Instant,
}

impl Session {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Default)]
struct NodeSlot {
    session: Mutex<Option<Session>>,
    /// Login attempts finished; bumped under the `session` lock.
    logins_done: AtomicU64,
    /// Error of the latest attempt, if it failed.
    last_failure: parking_lot::Mutex<Option<TransportError>>,
}

/// Outcome of a connection test.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// Node probed.
    pub node_id: NodeId,
    /// Health recorded for the node.
    pub health: NodeHealth,
    /// Credential status recorded for the node.
    pub credential_status: CredentialStatus,
    /// Panel status object when the probe succeeded.
    pub status: Option<Value>,
    /// Failure text when it did not.
    pub error: Option<String>,
}

impl ProbeReport {
    /// Returns `true` if login and status read succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

// ============================================
// NodeSessionManager
// ============================================

/// Per-node authenticated session cache.
pub struct NodeSessionManager {
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn PanelTransport>,
    slots: DashMap<NodeId, Arc<NodeSlot>>,
    last_health: DashMap<NodeId, (NodeHealth, CredentialStatus)>,
    ttl: Duration,
}

impl NodeSessionManager {
    /// Creates a manager. Sessions are re-created after `ttl`.
    pub fn new(registry: Arc<NodeRegistry>, transport: Arc<dyn PanelTransport>, ttl: Duration) -> Self {
        Self {
            registry,
            transport,
            slots: DashMap::new(),
            last_health: DashMap::new(),
            ttl,
        }
    }

    fn slot(&self, id: &NodeId) -> Arc<NodeSlot> {
        Arc::clone(self.slots.entry(id.clone()).or_default().value())
    }

    // ========================================
    // Authenticated Calls
    // ========================================

    /// Performs an authenticated call against a node.
    ///
    /// A panel refusal (`success: false`) is returned as `Ok`. An
    /// `AuthRejected` answer triggers exactly one re-login and retry; a
    /// second rejection is returned.
    ///
    /// # Errors
    /// - `NodeNotFound`, `CredentialMissing`, `CredentialUnreadable`
    /// - `Transport` on login failure or network failure
    pub async fn invoke(&self, id: &NodeId, request: &RemoteRequest) -> Result<RemoteResponse> {
        let slot = self.slot(id);
        let (base_url, token) = self.session(id, &slot).await?;

        match self.transport.call(&base_url, &token, request).await {
            Ok(response) => {
                self.note(id, NodeHealth::Healthy, CredentialStatus::Configured).await;
                Ok(response)
            }
            Err(e) if e.is_auth_rejected() => {
                debug!(node_id = %id, "Session rejected, logging in again");
                Self::discard_if_current(&slot, &token).await;

                let (base_url, token) = self.session(id, &slot).await?;
                let result = self.transport.call(&base_url, &token, request).await;
                self.observe(id, result.as_ref().err()).await;
                result.map_err(ServerError::from)
            }
            Err(e) => {
                self.observe(id, Some(&e)).await;
                Err(e.into())
            }
        }
    }

    /// Returns a fresh cached session or logs in, one login per node at a
    /// time.
    async fn session(&self, id: &NodeId, slot: &NodeSlot) -> Result<(String, SessionToken)> {
        let seen = slot.logins_done.load(Ordering::Acquire);
        let mut guard = slot.session.lock().await;
        if let Some(session) = guard.as_ref().filter(|s| s.is_fresh()) {
            return Ok((session.base_url.clone(), session.token.clone()));
        }
        if slot.logins_done.load(Ordering::Acquire) != seen {
            if let Some(e) = slot.last_failure.lock().clone() {
                debug!(node_id = %id, "Sharing failed login attempt");
                return Err(e.into());
            }
        }

        let (node, credentials) = match self.registry.credentials(id).await {
            Ok(found) => found,
            Err(e) => {
                self.forget_health(id);
                return Err(e);
            }
        };
        let attempt = self.login(&node, &credentials).await;
        *slot.last_failure.lock() = attempt.as_ref().err().cloned();
        slot.logins_done.fetch_add(1, Ordering::AcqRel);
        let token = attempt?;

        *guard = Some(Session {
            token: token.clone(),
            base_url: node.base_url.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        Ok((node.base_url, token))
    }

    async fn login(
        &self,
        node: &Node,
        credentials: &PanelCredentials,
    ) -> std::result::Result<SessionToken, TransportError> {
        match self.transport.login(&node.base_url, credentials).await {
            Ok(token) => {
                info!(node_id = %node.id, "Panel session established");
                Ok(token)
            }
            Err(e) => {
                warn!(node_id = %node.id, error = %e, "Panel login failed");
                self.observe(&node.id, Some(&e)).await;
                Err(e)
            }
        }
    }

    async fn discard_if_current(slot: &NodeSlot, rejected: &SessionToken) {
        let mut guard = slot.session.lock().await;
        if guard.as_ref().is_some_and(|s| &s.token == rejected) {
            *guard = None;
        }
    }

    // ========================================
    // Connection Test
    // ========================================

    /// Logs in from scratch and reads the panel status.
    ///
    /// With `override_credentials`, those are tried instead of the stored
    /// ones and, if they work, sealed and stored for the node.
    ///
    /// # Errors
    /// `NodeNotFound` or `Store`; probe failures are reported in the
    /// returned `ProbeReport`.
    pub async fn test_connection(
        &self,
        id: &NodeId,
        override_credentials: Option<PanelCredentials>,
    ) -> Result<ProbeReport> {
        let slot = self.slot(id);
        let mut guard = slot.session.lock().await;
        *guard = None;

        let attempt = match override_credentials {
            Some(credentials) => {
                let node = self.registry.get(id).await?;
                self.transport
                    .login(&node.base_url, &credentials)
                    .await
                    .map(|token| (node, token, Some(credentials)))
                    .map_err(ServerError::from)
            }
            None => match self.registry.credentials(id).await {
                Ok((node, credentials)) => self
                    .transport
                    .login(&node.base_url, &credentials)
                    .await
                    .map(|token| (node, token, None))
                    .map_err(ServerError::from),
                Err(e) if e.is_not_found() => return Err(e),
                Err(e) => Err(e),
            },
        };

        let outcome = match attempt {
            Ok((node, token, new_credentials)) => {
                let status = self
                    .transport
                    .call(&node.base_url, &token, &RemoteRequest::get(STATUS_PATH))
                    .await;
                match status {
                    Ok(resp) if resp.success => {
                        if let Some(credentials) = new_credentials {
                            self.registry.set_credentials(id, &credentials).await?;
                        }
                        *guard = Some(Session {
                            token,
                            base_url: node.base_url.clone(),
                            expires_at: Instant::now() + self.ttl,
                        });
                        Ok(resp.obj)
                    }
                    Ok(resp) => Err(ServerError::Transport(TransportError::protocol(format!(
                        "status refused: {}",
                        resp.msg
                    )))),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e),
        };
        drop(guard);

        let (health, credential_status, status, error) = match outcome {
            Ok(status) => (NodeHealth::Healthy, CredentialStatus::Configured, Some(status), None),
            Err(e) => {
                let (health, credential) = classify(&e);
                (health, credential, None, Some(e.to_string()))
            }
        };

        self.last_health.remove(id);
        self.registry.record_probe(id, Some(health), Some(credential_status)).await?;
        let node = self.registry.get(id).await?;

        info!(node_id = %id, health = %node.health, ok = error.is_none(), "Connection test finished");
        Ok(ProbeReport {
            node_id: id.clone(),
            health: node.health,
            credential_status: node.credential_status,
            status,
            error,
        })
    }

    // ========================================
    // Cache Control
    // ========================================

    /// Drops a node's cached session; the next call logs in again.
    pub async fn invalidate(&self, id: &NodeId) {
        if let Some(slot) = self.slots.get(id).map(|s| Arc::clone(s.value())) {
            *slot.session.lock().await = None;
            debug!(node_id = %id, "Session invalidated");
        }
        self.last_health.remove(id);
    }

    /// Forgets a removed node entirely.
    pub fn forget(&self, id: &NodeId) {
        self.slots.remove(id);
        self.last_health.remove(id);
    }

    /// Number of nodes holding a fresh session.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .session
                    .try_lock()
                    .map_or(false, |s| s.as_ref().is_some_and(Session::is_fresh))
            })
            .count()
    }

    // ========================================
    // Health Tracking
    // ========================================

    async fn observe(&self, id: &NodeId, error: Option<&TransportError>) {
        match error {
            None => self.note(id, NodeHealth::Healthy, CredentialStatus::Configured).await,
            Some(e) if e.is_unreachable() => {
                self.note(id, NodeHealth::Unreachable, CredentialStatus::Configured).await;
            }
            Some(e) if e.is_login_failed() => {
                self.note(id, NodeHealth::Degraded, CredentialStatus::Configured).await;
            }
            Some(_) => {}
        }
    }

    async fn note(&self, id: &NodeId, health: NodeHealth, credential: CredentialStatus) {
        let unchanged = self
            .last_health
            .get(id)
            .is_some_and(|seen| *seen.value() == (health, credential));
        if unchanged {
            return;
        }
        match self.registry.record_probe(id, Some(health), Some(credential)).await {
            Ok(()) => {
                self.last_health.insert(id.clone(), (health, credential));
            }
            Err(e) => debug!(node_id = %id, error = %e, "Health not recorded"),
        }
    }

    fn forget_health(&self, id: &NodeId) {
        self.last_health.remove(id);
    }
}

/// Maps a probe failure to the health and credential status it implies.
fn classify(error: &ServerError) -> (NodeHealth, CredentialStatus) {
    match error {
        ServerError::CredentialMissing(_) => (NodeHealth::Unknown, CredentialStatus::Missing),
        ServerError::CredentialUnreadable(_) => (NodeHealth::Unknown, CredentialStatus::Unreadable),
        ServerError::Transport(e) if e.is_unreachable() => {
            (NodeHealth::Unreachable, CredentialStatus::Configured)
        }
        _ => (NodeHealth::Degraded, CredentialStatus::Configured),
    }
}

impl std::fmt::Debug for NodeSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSessionManager")
            .field("nodes", &self.slots.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================
