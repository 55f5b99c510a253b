// ============================================
// File: crates/fleet-server/src/server.rs
// ============================================
//! # Control Plane Orchestrator
//!
//! ## Creation Reason
//! Wires the record store, vault, panel transport and every service into
//! one control plane, exposes the operator operations with auditing, and
//! manages the background task lifecycle.
//!
//! ## Main Functionality
//! - `ControlPlane`: Service wiring and operator entry points
//! - Node administration, connection tests, batches, retries, history
//! - Vault rotation with eager re-seal
//! - Background aggregator and cleanup tasks with graceful shutdown
//!
//! ## Control Plane Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ControlPlane                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Operator ops ──► Registry / Sessions / Engine / Jobs       │
//! │        │                                                    │
//! │        └──────► AuditSink (one event per operation)         │
//! │                                                             │
//! │  ┌──────────────────┐   ┌──────────────────┐                │
//! │  │ Aggregator Task  │   │  Cleanup Task    │                │
//! │  │ poll → publish   │   │ purge tokens and │                │
//! │  │ to RealtimeHub   │   │ realtime tickets │                │
//! │  └──────────────────┘   └──────────────────┘                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Batches audit themselves inside the engine; the operations here
//!   audit everything else
//! - New batches are refused once shutdown has started
//! - `with_parts` is the seam tests use to inject a mock fleet
//!
//! ## Last Modified
//! v0.1.0 - Initial control plane

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fleet_common::{JobId, NodeId};
use fleet_core::crypto::CredentialVault;
use fleet_core::model::{AuditEvent, AuditOutcome, BatchRequest, Job, Node, NodeDraft, NodeHealth, NodeUpdate};
use fleet_transport::{HttpPanelTransport, PanelCredentials, PanelTransport};

use crate::config::{ServerConfig, VaultConfig};
use crate::error::{Result, ServerError};
use crate::services::{
    AuditFilter, AuditSink, ClusterAggregator, ClusterSnapshot, ExecutionEngine, IssuedTicket,
    IssuedToken, JobFilter, JobPage, JobStore, NodeRegistry, NodeSessionManager, ProbeReport,
    RealtimeHub, ReencryptReport, RetryOptions, RiskGate, StoreAuditSink, Subscription,
};
use crate::store::{self, RecordStore};

/// Period of the token and ticket cleanup task.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period for each background task at shutdown.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the vault from configured key material.
///
/// # Errors
/// `ConfigMissing` / `ConfigInvalid` for unresolvable material, `Core` if
/// a key cannot be derived.
pub fn build_vault(config: &VaultConfig) -> Result<CredentialVault> {
    let material = config.current_material()?;
    let vault = CredentialVault::from_material(&material, config.key_version)?;
    for (version, previous) in config.previous_materials()? {
        vault.add_previous(version, &previous)?;
    }
    Ok(vault)
}

// ============================================
// ControlPlane
// ============================================

/// The fleet control plane.
///
/// # Lifecycle
/// 1. Create with `ControlPlane::new(config).await`
/// 2. Serve with `control_plane.run().await`
/// 3. Stop via Ctrl+C or `shutdown()`
pub struct ControlPlane {
    config: ServerConfig,
    registry: Arc<NodeRegistry>,
    sessions: Arc<NodeSessionManager>,
    risk: Arc<RiskGate>,
    jobs: Arc<JobStore>,
    audit: Arc<StoreAuditSink>,
    engine: Arc<ExecutionEngine>,
    hub: Arc<RealtimeHub>,
    aggregator: Arc<ClusterAggregator>,
    /// Shutdown flag.
    shutdown: Arc<AtomicBool>,
    /// Shutdown signal sender.
    shutdown_tx: broadcast::Sender<()>,
}

impl ControlPlane {
    /// Opens the configured store, vault and HTTP transport.
    ///
    /// # Errors
    /// Store, vault or transport initialization failures.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let store = store::open(&config.store).await?;
        let vault = Arc::new(build_vault(&config.vault)?);
        let transport: Arc<dyn PanelTransport> = Arc::new(
            HttpPanelTransport::new(&config.sessions.http())
                .map_err(|e| ServerError::startup_failed(format!("HTTP client: {e}")))?,
        );
        Ok(Self::with_parts(config, store, vault, transport))
    }

    /// Wires the services over explicit parts.
    pub fn with_parts(
        config: ServerConfig,
        store: Arc<dyn RecordStore>,
        vault: Arc<CredentialVault>,
        transport: Arc<dyn PanelTransport>,
    ) -> Self {
        let registry = Arc::new(NodeRegistry::new(Arc::clone(&store), vault));
        let sessions = Arc::new(NodeSessionManager::new(
            Arc::clone(&registry),
            transport,
            config.sessions.ttl(),
        ));
        let risk = Arc::new(RiskGate::new(&config.risk));
        let jobs = Arc::new(JobStore::new(Arc::clone(&store), config.jobs.clone()));
        let audit = Arc::new(StoreAuditSink::new(store));
        let audit_sink: Arc<dyn AuditSink> = audit.clone();
        let engine = Arc::new(ExecutionEngine::new(
            &config.engine,
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&risk),
            Arc::clone(&jobs),
            audit_sink,
        ));
        let hub = Arc::new(RealtimeHub::new(&config.realtime));
        let aggregator = Arc::new(ClusterAggregator::new(
            &config.aggregator,
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&hub),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            sessions,
            risk,
            jobs,
            audit,
            engine,
            hub,
            aggregator,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    // ========================================
    // Accessors
    // ========================================

    /// Configuration in effect.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Node registry.
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Session manager.
    pub fn sessions(&self) -> &Arc<NodeSessionManager> {
        &self.sessions
    }

    /// Realtime hub.
    pub fn hub(&self) -> &Arc<RealtimeHub> {
        &self.hub
    }

    async fn record(&self, event: AuditEvent) {
        self.audit.record(event).await;
    }

    // ========================================
    // Nodes
    // ========================================

    /// Registers a node.
    ///
    /// # Errors
    /// `NodeExists`, `Common` for invalid input, `Store`.
    pub async fn add_node(&self, actor: &str, id: Option<NodeId>, draft: &NodeDraft) -> Result<Node> {
        match self.registry.add(id, draft).await {
            Ok(node) => {
                self.record(
                    AuditEvent::new(actor, "node.add", AuditOutcome::Success)
                        .with_server(node.id.clone())
                        .with_detail(json!({
                            "name": node.name,
                            "baseUrl": node.base_url,
                            "group": node.group,
                            "credential": node.credential_status,
                        })),
                )
                .await;
                Ok(node)
            }
            Err(e) => {
                self.record(
                    AuditEvent::new(actor, "node.add", AuditOutcome::Failed)
                        .with_detail(json!({ "name": draft.name, "error": e.to_string() })),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Updates a node; connection changes drop its session.
    ///
    /// # Errors
    /// `NodeNotFound`, `Common` for invalid input, `Store`.
    pub async fn update_node(&self, actor: &str, id: &NodeId, update: &NodeUpdate) -> Result<Node> {
        let node = self.registry.update(id, update).await?;
        if update.touches_session() {
            self.sessions.invalidate(id).await;
        }
        let fields: Vec<&str> = [
            ("name", update.name.is_some()),
            ("baseUrl", update.base_url.is_some()),
            ("username", update.username.is_some()),
            ("password", update.password.is_some()),
            ("group", update.group.is_some()),
            ("tags", update.tags.is_some()),
            ("environment", update.environment.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect();
        self.record(
            AuditEvent::new(actor, "node.update", AuditOutcome::Success)
                .with_server(id.clone())
                .with_detail(json!({ "fields": fields })),
        )
        .await;
        Ok(node)
    }

    /// Deletes a node and forgets its session.
    ///
    /// # Errors
    /// `NodeNotFound`, `Store`.
    pub async fn remove_node(&self, actor: &str, id: &NodeId) -> Result<Node> {
        let node = self.registry.remove(id).await?;
        self.sessions.forget(id);
        self.record(
            AuditEvent::new(actor, "node.remove", AuditOutcome::Success)
                .with_server(id.clone())
                .with_detail(json!({ "name": node.name })),
        )
        .await;
        Ok(node)
    }

    /// Sets operator health, e.g. entering or leaving maintenance.
    ///
    /// # Errors
    /// `NodeNotFound`, `Store`.
    pub async fn set_node_health(&self, actor: &str, id: &NodeId, health: NodeHealth) -> Result<Node> {
        let node = self.registry.set_health(id, health).await?;
        self.record(
            AuditEvent::new(actor, "node.health", AuditOutcome::Success)
                .with_server(id.clone())
                .with_detail(json!({ "health": health })),
        )
        .await;
        Ok(node)
    }

    /// Tests a node's connection, optionally repairing its credentials.
    ///
    /// # Errors
    /// `NodeNotFound`, `Store`; probe failures are in the report.
    pub async fn test_node(
        &self,
        actor: &str,
        id: &NodeId,
        credentials: Option<PanelCredentials>,
    ) -> Result<ProbeReport> {
        let repairing = credentials.is_some();
        let report = self.sessions.test_connection(id, credentials).await?;
        let outcome = if report.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failed
        };
        self.record(
            AuditEvent::new(actor, "node.test", outcome)
                .with_server(id.clone())
                .with_detail(json!({
                    "health": report.health,
                    "credentialStatus": report.credential_status,
                    "credentialsUpdated": repairing && report.is_ok(),
                    "error": report.error,
                })),
        )
        .await;
        Ok(report)
    }

    // ========================================
    // Batches
    // ========================================

    /// Issues a confirmation token for a high-risk batch.
    ///
    /// # Errors
    /// `InvalidRequest` for an unusable target scope.
    pub async fn issue_risk_token(&self, actor: &str, request: &BatchRequest) -> Result<IssuedToken> {
        let issued = self.risk.issue_token(request, actor)?;
        self.record(
            AuditEvent::new(actor, "risk.token_issued", AuditOutcome::Info).with_detail(json!({
                "action": issued.action,
                "scope": issued.scope,
                "expiresAt": issued.expires_at,
            })),
        )
        .await;
        Ok(issued)
    }

    /// Executes a batch.
    ///
    /// # Errors
    /// `ShuttingDown` once shutdown started; otherwise as
    /// [`ExecutionEngine::execute`].
    pub async fn execute(&self, request: BatchRequest) -> Result<Job> {
        self.ensure_running()?;
        self.engine.execute(request).await
    }

    /// Retries a job's failures as a child batch.
    ///
    /// # Errors
    /// As [`ExecutionEngine::retry`].
    pub async fn retry(&self, job_id: &JobId, options: &RetryOptions) -> Result<Job> {
        self.ensure_running()?;
        self.engine.retry(job_id, options).await
    }

    /// Cancels an in-flight batch by request id.
    pub async fn cancel(&self, actor: &str, request_id: &str) -> bool {
        let found = self.engine.cancel(request_id);
        let outcome = if found { AuditOutcome::Success } else { AuditOutcome::Failed };
        self.record(
            AuditEvent::new(actor, "batch.cancel", outcome).with_detail(json!({ "requestId": request_id })),
        )
        .await;
        found
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            Err(ServerError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    // ========================================
    // History
    // ========================================

    /// Returns a job.
    ///
    /// # Errors
    /// `JobNotFound`, `Store`.
    pub async fn job(&self, id: &JobId) -> Result<Job> {
        self.jobs.get(id).await
    }

    /// Lists jobs, newest first.
    ///
    /// # Errors
    /// `Store`.
    pub async fn list_jobs(&self, filter: &JobFilter, page: usize, per_page: usize) -> Result<JobPage> {
        self.jobs.list(filter, page, per_page).await
    }

    /// Deletes one job.
    ///
    /// # Errors
    /// `JobNotFound`, `Store`.
    pub async fn delete_job(&self, actor: &str, id: &JobId) -> Result<()> {
        self.jobs.delete(id).await?;
        self.record(
            AuditEvent::new(actor, "jobs.delete", AuditOutcome::Success).with_detail(json!({ "jobId": id })),
        )
        .await;
        Ok(())
    }

    /// Deletes all job history.
    ///
    /// # Errors
    /// `Store`.
    pub async fn clear_jobs(&self, actor: &str) -> Result<usize> {
        let removed = self.jobs.delete_all().await?;
        self.record(
            AuditEvent::new(actor, "jobs.clear", AuditOutcome::Success).with_detail(json!({ "removed": removed })),
        )
        .await;
        Ok(removed)
    }

    /// Lists audit events, newest first.
    ///
    /// # Errors
    /// `Store`.
    pub async fn list_audit(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditEvent>> {
        self.audit.list(filter, limit).await
    }

    /// Clears the audit log; the clear itself is the first new entry.
    ///
    /// # Errors
    /// `Store`.
    pub async fn clear_audit(&self, actor: &str) -> Result<usize> {
        let removed = self.audit.clear().await?;
        self.record(
            AuditEvent::new(actor, "audit.clear", AuditOutcome::Success).with_detail(json!({ "removed": removed })),
        )
        .await;
        Ok(removed)
    }

    // ========================================
    // Vault
    // ========================================

    /// Installs a new current key and re-seals every stored secret.
    ///
    /// # Errors
    /// `Core` if the key is rejected, `Store` if re-sealing fails.
    pub async fn rotate_vault(&self, actor: &str, new_version: u32, material: &[u8]) -> Result<ReencryptReport> {
        if let Err(e) = self.registry.vault().rotate(new_version, material) {
            self.record(
                AuditEvent::new(actor, "vault.rotate", AuditOutcome::Failed)
                    .with_detail(json!({ "version": new_version, "error": e.to_string() })),
            )
            .await;
            return Err(e.into());
        }
        let report = self.registry.reencrypt_all().await?;
        let outcome = if report.unreadable > 0 {
            AuditOutcome::Failed
        } else {
            AuditOutcome::Success
        };
        self.record(
            AuditEvent::new(actor, "vault.rotate", outcome)
                .with_detail(json!({
                    "version": new_version,
                    "loadedVersions": self.registry.vault().versions(),
                    "report": report,
                })),
        )
        .await;
        Ok(report)
    }

    /// Drops a decrypt-only vault key once nothing is sealed under it.
    ///
    /// # Errors
    /// `InvalidRequest` while secrets still need the key, `Core` for the
    /// current or an unknown version.
    pub async fn retire_vault_key(&self, actor: &str, version: u32) -> Result<()> {
        let result = self.retire_checked(version).await;
        let event = match &result {
            Ok(()) => AuditEvent::new(actor, "vault.retire", AuditOutcome::Success)
                .with_detail(json!({ "version": version })),
            Err(e) => AuditEvent::new(actor, "vault.retire", AuditOutcome::Failed)
                .with_detail(json!({ "version": version, "error": e.to_string() })),
        };
        self.record(event).await;
        result
    }

    async fn retire_checked(&self, version: u32) -> Result<()> {
        let still_sealed = self
            .registry
            .list()
            .await?
            .iter()
            .filter(|node| node.secret.as_ref().and_then(|s| s.key_version()) == Some(version))
            .count();
        if still_sealed > 0 {
            return Err(ServerError::invalid_request(format!(
                "{still_sealed} secret(s) still sealed under key v{version}"
            )));
        }
        self.registry.vault().retire(version)?;
        Ok(())
    }

    // ========================================
    // Cluster Status
    // ========================================

    /// Polls the fleet once, publishes and returns the snapshot.
    pub async fn cluster_status(&self) -> ClusterSnapshot {
        let snapshot = self.aggregator.collect().await;
        self.hub.publish(snapshot.clone());
        snapshot
    }

    /// Issues a realtime subscriber ticket.
    pub async fn issue_ticket(&self, actor: &str) -> IssuedTicket {
        let issued = self.hub.issue_ticket(actor);
        self.record(AuditEvent::new(actor, "realtime.ticket_issued", AuditOutcome::Info)).await;
        issued
    }

    /// Redeems a ticket into a subscription.
    ///
    /// # Errors
    /// `TicketInvalid`.
    pub fn subscribe(&self, ticket: &str) -> Result<Subscription> {
        self.hub.redeem(ticket)
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Runs background tasks until shutdown.
    ///
    /// # Errors
    /// Currently infallible once constructed; kept for startup checks.
    pub async fn run(&self) -> Result<()> {
        info!("Starting fleet control plane v{}", env!("CARGO_PKG_VERSION"));

        let nodes = self.registry.list().await?;
        info!(
            nodes = nodes.len(),
            concurrency = self.config.engine.concurrency,
            "Services initialized"
        );

        let mut tasks = Vec::new();
        if self.config.aggregator.enabled {
            tasks.push(("aggregator", self.spawn_aggregator_task()));
        } else {
            info!("Cluster aggregator disabled");
        }
        tasks.push(("cleanup", self.spawn_cleanup_task()));

        info!("Control plane started");

        self.wait_for_shutdown().await;

        info!("Shutting down control plane...");
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        for (name, task) in tasks {
            match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!("Task '{}' completed", name),
                Ok(Err(e)) => warn!("Task '{}' failed: {}", name, e),
                Err(_) => warn!("Task '{}' timed out during shutdown", name),
            }
        }

        info!("Control plane shutdown complete");
        Ok(())
    }

    /// Spawns the aggregation loop.
    fn spawn_aggregator_task(&self) -> JoinHandle<()> {
        let aggregator = Arc::clone(&self.aggregator);
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(aggregator.run(shutdown_rx))
    }

    /// Spawns the token and ticket cleanup task.
    fn spawn_cleanup_task(&self) -> JoinHandle<()> {
        let shutdown = Arc::clone(&self.shutdown);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let risk = Arc::clone(&self.risk);
        let hub = Arc::clone(&self.hub);
        let sessions = Arc::clone(&self.sessions);

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(CLEANUP_INTERVAL);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Cleanup task received shutdown signal");
                        break;
                    }
                    _ = interval_timer.tick() => {
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        let tokens = risk.purge_expired();
                        let tickets = hub.purge_expired_tickets();
                        debug!(
                            tokens_purged = tokens,
                            tickets_purged = tickets,
                            outstanding_tokens = risk.outstanding(),
                            active_sessions = sessions.active_sessions(),
                            subscribers = hub.subscriber_count(),
                            "Cleanup cycle complete"
                        );
                    }
                }
            }

            debug!("Cleanup task exiting");
        })
    }

    /// Waits for Ctrl+C or a programmatic shutdown.
    async fn wait_for_shutdown(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            },
            _ = shutdown_rx.recv() => info!("Shutdown requested"),
        }
    }

    /// Triggers shutdown programmatically.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    /// Returns `true` once shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("store", &self.config.store.backend)
            .field("concurrency", &self.config.engine.concurrency)
            .field("in_flight", &self.engine.in_flight())
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================
