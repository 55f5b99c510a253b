// ============================================
// File: crates/fleet-server/src/services/engine.rs
// ============================================
//! # Fleet Execution Engine
//!
//! ## Creation Reason
//! Fans one logical batch out to many nodes with bounded parallelism,
//! isolates per-node failures, and records the outcome as a job.
//!
//! ## Main Functionality
//! - `ExecutionEngine::execute`: Resolve targets, pass the risk gate,
//!   dispatch node tasks, persist and audit the job
//! - `ExecutionEngine::retry`: Re-drive a finished job through the same path
//! - `ExecutionEngine::cancel`: Stop dispatching new node tasks for a
//!   request id
//!
//! ## Execution Flow
//! ```text
//! request ──► assign client ids ──► resolve targets ──► risk gate
//!                                                         │
//!              ┌──────────────── semaphore(concurrency) ◄─┘
//!              ▼
//!   node task: step 1 ─► step 2 ─► ...   (sequential, one deadline)
//!              │
//!              ▼
//!   results (completion order) ──► Job ──► JobStore ──► AuditSink
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Every planned (node, step) yields exactly one result, including
//!   cancelled, timed-out and aborted ones, so the summary always adds up
//! - Cancellation is checked before each dispatch; running node tasks
//!   finish their steps
//! - A node-level failure (credential, login, network) fails the node's
//!   remaining steps without contacting it again
//! - The batch is audited even when the job cannot be stored; the store
//!   error is then returned, since the job could never be fetched or retried
//!
//! ## Last Modified
//! v0.1.0 - Initial execution engine

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use fleet_common::{JobId, NodeId};
use fleet_core::model::{
    AuditEvent, AuditOutcome, BatchRequest, Job, ResultStatus, RetryInfo, TargetResult, TargetSelector,
};
use fleet_core::{BatchAction, StepScope};

use crate::config::EngineConfig;
use crate::error::{Result, ServerError};
use crate::services::actions::{run_step, StepOutcome};
use crate::services::audit::AuditSink;
use crate::services::jobs::JobStore;
use crate::services::registry::NodeRegistry;
use crate::services::retry::{plan_retry, RetryOptions};
use crate::services::risk::{RiskGate, RiskLevel};
use crate::services::session::NodeSessionManager;

/// Error text for steps never dispatched because the batch was cancelled.
pub const CANCELLED_BEFORE_DISPATCH: &str = "cancelled before dispatch";

/// Error text for steps of a node task that ended without reporting.
const NODE_TASK_ABORTED: &str = "node task aborted";

// ============================================
// Planning Types
// ============================================

/// One node's share of a batch.
#[derive(Debug, Clone)]
struct NodePlan {
    id: NodeId,
    name: String,
    steps: Vec<StepScope>,
}

impl NodePlan {
    fn fail_all(&self, steps: &[StepScope], error: &str) -> Vec<TargetResult> {
        steps
            .iter()
            .map(|s| TargetResult::failed(self.id.clone(), self.name.clone(), s.clone(), error))
            .collect()
    }
}

// ============================================
// ExecutionEngine
// ============================================

/// Batch dispatcher.
pub struct ExecutionEngine {
    registry: Arc<NodeRegistry>,
    sessions: Arc<NodeSessionManager>,
    risk: Arc<RiskGate>,
    jobs: Arc<JobStore>,
    audit: Arc<dyn AuditSink>,
    concurrency: usize,
    node_timeout: Duration,
    cancels: DashMap<String, Arc<AtomicBool>>,
}

impl ExecutionEngine {
    /// Creates an engine.
    pub fn new(
        config: &EngineConfig,
        registry: Arc<NodeRegistry>,
        sessions: Arc<NodeSessionManager>,
        risk: Arc<RiskGate>,
        jobs: Arc<JobStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            registry,
            sessions,
            risk,
            jobs,
            audit,
            concurrency: config.concurrency.max(1),
            node_timeout: config.node_timeout(),
            cancels: DashMap::new(),
        }
    }

    /// Executes a batch and returns its job.
    ///
    /// # Errors
    /// - `InvalidRequest` if no target resolves or a request id is in use
    /// - `ConfirmationRequired` / `RiskTokenInvalid` from the risk gate
    /// - `Core` for an invalid action payload
    /// - `Store` if the finished job cannot be persisted
    ///
    /// Per-node failures never surface here; they are results in the job.
    pub async fn execute(&self, request: BatchRequest) -> Result<Job> {
        self.run(request, None).await
    }

    /// Re-drives a finished job as a child batch.
    ///
    /// # Errors
    /// `JobNotFound`, `InvalidRequest` if nothing qualifies for retry, and
    /// everything `execute` returns.
    pub async fn retry(&self, job_id: &JobId, options: &RetryOptions) -> Result<Job> {
        let parent = self.jobs.get(job_id).await?;
        let plan = plan_retry(&parent, options)?;
        info!(
            parent = %job_id,
            groups = plan.info.groups.len(),
            group_by = %plan.info.group_by,
            "Retrying job"
        );
        self.run(plan.request, Some((parent.id, plan.info))).await
    }

    /// Requests cancellation of an in-flight batch. Returns `false` if no
    /// batch with this id is running.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.cancels.get(request_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(request_id, "Batch cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Number of batches currently running under a request id.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.cancels.len()
    }

    // ========================================
    // Pipeline
    // ========================================

    async fn run(&self, mut request: BatchRequest, parent: Option<(JobId, RetryInfo)>) -> Result<Job> {
        request.action.validate()?;
        request.action.assign_client_ids();

        let plans = self.resolve(&request).await?;
        self.gate(&request, plans.len()).await?;
        // Spent tokens are not kept on the job record.
        request.confirm_token = None;

        let flag = match &request.request_id {
            Some(id) => Some(self.register_cancel(id)?),
            None => None,
        };
        let started = Instant::now();
        let (results, cancelled) = self.dispatch(&request.action, plans, flag.as_deref()).await;
        if let Some(id) = &request.request_id {
            self.cancels.remove(id);
        }

        let mut job = Job::new(request, results);
        job.cancelled = cancelled;
        if let Some((parent_id, info)) = parent {
            job.parent_job_id = Some(parent_id);
            job.retry = Some(info);
        }

        info!(
            job_id = %job.id,
            action = %job.request.action,
            total = job.summary.total,
            success = job.summary.success,
            skipped = job.summary.skipped,
            failed = job.summary.failed,
            cancelled,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Batch finished"
        );

        let persisted = self.jobs.create(&job).await;
        self.audit.record(batch_event(&job)).await;
        if let Err(e) = persisted {
            error!(job_id = %job.id, error = %e, "Failed to persist job");
            return Err(e);
        }
        Ok(job)
    }

    /// Resolves the selector to nodes and their steps.
    async fn resolve(&self, request: &BatchRequest) -> Result<Vec<NodePlan>> {
        let nodes = match &request.targets {
            TargetSelector::All => self
                .registry
                .list()
                .await?
                .into_iter()
                .filter(|n| !n.in_maintenance())
                .collect::<Vec<_>>(),
            TargetSelector::Nodes(ids) => {
                let mut seen = HashSet::new();
                let mut nodes = Vec::with_capacity(ids.len());
                for id in ids {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    match self.registry.find(id).await? {
                        Some(node) => nodes.push(node),
                        None => warn!(node_id = %id, "Unknown target dropped"),
                    }
                }
                nodes
            }
        };

        let plans: Vec<NodePlan> = nodes
            .into_iter()
            .filter_map(|node| {
                let steps = request.steps_for(&node.id);
                (!steps.is_empty()).then(|| NodePlan {
                    id: node.id,
                    name: node.name,
                    steps,
                })
            })
            .collect();

        if plans.is_empty() {
            return Err(ServerError::invalid_request("no target nodes resolved"));
        }
        Ok(plans)
    }

    /// Applies the risk gate, auditing a refusal.
    async fn gate(&self, request: &BatchRequest, resolved: usize) -> Result<()> {
        if self.risk.classify(request, resolved) == RiskLevel::Low {
            return Ok(());
        }
        match self.risk.check(request, resolved) {
            Ok(()) => {
                debug!(action = %request.action, resolved, "High-risk batch confirmed");
                Ok(())
            }
            Err(e) => {
                warn!(action = %request.action, resolved, error = %e, "High-risk batch refused");
                self.audit
                    .record(
                        AuditEvent::new(request.actor.clone(), "batch.rejected", AuditOutcome::Failed)
                            .with_target_email(request.action.target_email())
                            .with_detail(json!({
                                "type": request.action.domain(),
                                "action": request.action.verb(),
                                "targets": resolved,
                                "reason": e.to_string(),
                            })),
                    )
                    .await;
                Err(e)
            }
        }
    }

    fn register_cancel(&self, request_id: &str) -> Result<Arc<AtomicBool>> {
        let flag = Arc::new(AtomicBool::new(false));
        match self.cancels.entry(request_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ServerError::invalid_request(format!(
                "request id '{request_id}' is already running"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&flag));
                Ok(flag)
            }
        }
    }

    /// Runs node tasks under the concurrency bound. Returns results in
    /// completion order and whether dispatch stopped early.
    async fn dispatch(
        &self,
        action: &BatchAction,
        plans: Vec<NodePlan>,
        cancel: Option<&AtomicBool>,
    ) -> (Vec<TargetResult>, bool) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let action = Arc::new(action.clone());
        let (tx, mut rx) = mpsc::unbounded_channel::<(NodeId, Vec<TargetResult>)>();
        let mut tasks = JoinSet::new();
        let mut dispatched: Vec<NodePlan> = Vec::new();
        let mut undispatched: Vec<NodePlan> = Vec::new();

        let mut queue = plans.into_iter();
        while let Some(plan) = queue.next() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                undispatched.push(plan);
                undispatched.extend(queue.by_ref());
                break;
            };
            if cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
                drop(permit);
                undispatched.push(plan);
                undispatched.extend(queue.by_ref());
                break;
            }

            let sessions = Arc::clone(&self.sessions);
            let action = Arc::clone(&action);
            let tx = tx.clone();
            let node_timeout = self.node_timeout;
            let task_plan = plan.clone();
            dispatched.push(plan);

            tasks.spawn(async move {
                let _permit = permit;
                let results = run_node(&sessions, &action, &task_plan, node_timeout).await;
                // The receiver outlives every task.
                let _ = tx.send((task_plan.id, results));
            });
        }
        drop(tx);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Node task aborted");
            }
        }

        let mut reports = Vec::new();
        while let Ok(report) = rx.try_recv() {
            reports.push(report);
        }
        settle(reports, &dispatched, &undispatched)
    }
}

/// Folds node reports into the batch results. Dispatched nodes that never
/// reported fail as aborted; undispatched nodes fail as cancelled.
fn settle(
    reports: Vec<(NodeId, Vec<TargetResult>)>,
    dispatched: &[NodePlan],
    undispatched: &[NodePlan],
) -> (Vec<TargetResult>, bool) {
    let mut results = Vec::new();
    let mut reported = HashSet::new();
    for (id, node_results) in reports {
        reported.insert(id);
        results.extend(node_results);
    }
    for plan in dispatched.iter().filter(|p| !reported.contains(&p.id)) {
        results.extend(plan.fail_all(&plan.steps, NODE_TASK_ABORTED));
    }

    let cancelled = !undispatched.is_empty();
    if cancelled {
        info!(skipped_nodes = undispatched.len(), "Batch cancelled before all nodes were dispatched");
    }
    for plan in undispatched {
        results.extend(plan.fail_all(&plan.steps, CANCELLED_BEFORE_DISPATCH));
    }
    (results, cancelled)
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("concurrency", &self.concurrency)
            .field("node_timeout", &self.node_timeout)
            .field("in_flight", &self.cancels.len())
            .finish_non_exhaustive()
    }
}

// ============================================
// Node Task
// ============================================

/// Runs one node's steps in order under a single deadline.
async fn run_node(
    sessions: &NodeSessionManager,
    action: &BatchAction,
    plan: &NodePlan,
    node_timeout: Duration,
) -> Vec<TargetResult> {
    let deadline = Instant::now() + node_timeout;
    let mut results = Vec::with_capacity(plan.steps.len());

    for (index, scope) in plan.steps.iter().enumerate() {
        let outcome = tokio::time::timeout_at(deadline, run_step(sessions, &plan.id, action, scope)).await;
        let remaining = &plan.steps[index..];

        match outcome {
            Err(_) => {
                let error = format!("node timed out after {}s", node_timeout.as_secs());
                warn!(node_id = %plan.id, steps = remaining.len(), "Node task timed out");
                results.extend(plan.fail_all(remaining, &error));
                break;
            }
            Ok(StepOutcome::Success(detail)) => {
                let result = TargetResult::new(plan.id.clone(), plan.name.clone(), scope.clone(), ResultStatus::Success);
                results.push(match detail {
                    Some(d) => result.with_detail(d),
                    None => result,
                });
            }
            Ok(StepOutcome::Skipped(reason)) => {
                results.push(
                    TargetResult::new(plan.id.clone(), plan.name.clone(), scope.clone(), ResultStatus::Skipped)
                        .with_detail(json!({ "reason": reason })),
                );
            }
            Ok(StepOutcome::Failed { message, node_level }) => {
                debug!(node_id = %plan.id, scope = %scope, error = %message, "Step failed");
                if node_level {
                    results.extend(plan.fail_all(remaining, &message));
                    break;
                }
                results.push(TargetResult::failed(plan.id.clone(), plan.name.clone(), scope.clone(), message));
            }
        }
    }
    results
}

fn batch_event(job: &Job) -> AuditEvent {
    let outcome = if job.has_failures() || job.cancelled {
        AuditOutcome::Failed
    } else {
        AuditOutcome::Success
    };
    let nodes = job.result_nodes();
    let mut event = AuditEvent::new(job.actor.clone(), "batch.execute", outcome)
        .with_target_email(job.request.action.target_email())
        .with_detail(json!({
            "jobId": job.id,
            "type": job.domain,
            "action": job.action,
            "summary": job.summary,
            "nodes": nodes.len(),
            "cancelled": job.cancelled,
            "parentJobId": job.parent_job_id,
            "payload": job.request.action.payload(),
        }));
    if let [only] = nodes.as_slice() {
        event = event.with_server(only.clone());
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleet_core::action::InboundRefPayload;
    use fleet_core::crypto::CredentialVault;
    use fleet_core::model::NodeDraft;
    use fleet_transport::{MockPanelFleet, PanelTransport};
    use serde_json::Value;

    use crate::config::{JobsConfig, RiskConfig};
    use crate::services::audit::{AuditFilter, StoreAuditSink};
    use crate::store::{MemoryStore, RecordStore};

    /// Memory store that refuses job writes.
    struct NoJobWrites(MemoryStore);

    #[async_trait]
    impl RecordStore for NoJobWrites {
        async fn get(&self, key: &str) -> Result<Option<Value>> {
            self.0.get(key).await
        }

        async fn put(&self, key: &str, value: Value) -> Result<()> {
            if key.starts_with("jobs/") {
                return Err(ServerError::store(key, "quota exceeded"));
            }
            self.0.put(key, value).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
            self.0.list(prefix).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.0.delete(key).await
        }
    }

    struct Harness {
        fleet: Arc<MockPanelFleet>,
        engine: ExecutionEngine,
        audit: Arc<StoreAuditSink>,
        ids: Vec<NodeId>,
    }

    fn url(index: usize) -> String {
        format!("https://edge-{index}.example")
    }

    async fn harness(store: Arc<dyn RecordStore>, nodes: usize) -> Harness {
        let vault = Arc::new(CredentialVault::from_material(b"engine test key material", 1).unwrap());
        let registry = Arc::new(NodeRegistry::new(Arc::clone(&store), vault));
        let fleet = Arc::new(MockPanelFleet::new());

        let mut ids = Vec::with_capacity(nodes);
        for i in 0..nodes {
            let panel = fleet.add_panel(&url(i), "admin", "pw");
            panel.add_inbound(1, 443, "vless");
            let id: NodeId = format!("edge-{i}").parse().unwrap();
            let draft = NodeDraft {
                name: format!("Edge {i}"),
                base_url: url(i),
                username: "admin".into(),
                password: Some("pw".into()),
                ..NodeDraft::default()
            };
            registry.add(Some(id.clone()), &draft).await.unwrap();
            ids.push(id);
        }

        let transport: Arc<dyn PanelTransport> = fleet.clone();
        let sessions = Arc::new(NodeSessionManager::new(
            Arc::clone(&registry),
            transport,
            Duration::from_secs(600),
        ));
        let audit = Arc::new(StoreAuditSink::new(Arc::clone(&store)));
        let engine = ExecutionEngine::new(
            &EngineConfig::default(),
            registry,
            sessions,
            Arc::new(RiskGate::new(&RiskConfig::default())),
            Arc::new(JobStore::new(store, JobsConfig::default())),
            audit.clone(),
        );
        Harness { fleet, engine, audit, ids }
    }

    fn enable(inbound_ids: Vec<u32>, targets: Vec<NodeId>) -> BatchRequest {
        BatchRequest::new(
            BatchAction::InboundsEnable(InboundRefPayload { inbound_ids }),
            TargetSelector::Nodes(targets),
        )
    }

    fn plan(id: &str, inbounds: &[u32]) -> NodePlan {
        NodePlan {
            id: id.parse().unwrap(),
            name: id.to_string(),
            steps: inbounds.iter().map(|&id| StepScope::Inbound { id }).collect(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_targets_run_once() {
        let h = harness(Arc::new(MemoryStore::new()), 2).await;
        let targets = vec![h.ids[0].clone(), h.ids[1].clone(), h.ids[0].clone()];

        let job = h.engine.execute(enable(vec![1], targets)).await.unwrap();

        assert_eq!(job.summary.total, 2);
        assert_eq!(job.summary.skipped, 2);
        assert_eq!(h.fleet.panel(&url(0)).unwrap().login_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_targets_are_dropped() {
        let h = harness(Arc::new(MemoryStore::new()), 1).await;
        let ghost: NodeId = "ghost".parse().unwrap();

        let job = h
            .engine
            .execute(enable(vec![1], vec![ghost.clone(), h.ids[0].clone()]))
            .await
            .unwrap();
        assert_eq!(job.summary.total, 1);
        assert!(job.results.iter().all(|r| r.server_id == h.ids[0]));

        let err = h.engine.execute(enable(vec![1], vec![ghost])).await.unwrap_err();
        assert!(
            matches!(err, ServerError::InvalidRequest { ref reason } if reason == "no target nodes resolved"),
            "unexpected error: {err}"
        );
        assert_eq!(h.engine.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_node_failure_fails_remaining_steps_without_contact() {
        let h = harness(Arc::new(MemoryStore::new()), 1).await;
        let panel = h.fleet.panel(&url(0)).unwrap();
        panel.set_unreachable(true);

        let job = h.engine.execute(enable(vec![1, 2, 3], h.ids.clone())).await.unwrap();

        assert_eq!(job.summary.total, 3);
        assert_eq!(job.summary.failed, 3);
        let first = job.results[0].error.clone();
        assert!(first.is_some());
        assert!(job.results.iter().all(|r| r.error == first));
        assert_eq!(panel.login_count(), 1);
        assert_eq!(panel.call_count(), 0);
    }

    #[test]
    fn test_unreported_node_fails_as_aborted() {
        let dispatched = vec![plan("edge-a", &[1, 2]), plan("edge-b", &[1])];
        let undispatched = vec![plan("edge-c", &[1])];
        let b = &dispatched[1];
        let reports = vec![(
            b.id.clone(),
            vec![TargetResult::new(b.id.clone(), b.name.clone(), b.steps[0].clone(), ResultStatus::Success)],
        )];

        let (results, cancelled) = settle(reports, &dispatched, &undispatched);

        assert!(cancelled);
        assert_eq!(results.len(), 4);
        let errors_for = |node: &str| -> Vec<Option<String>> {
            results
                .iter()
                .filter(|r| r.server_id.as_str() == node)
                .map(|r| r.error.clone())
                .collect()
        };
        assert_eq!(errors_for("edge-a"), vec![Some(NODE_TASK_ABORTED.to_string()); 2]);
        assert_eq!(errors_for("edge-b"), vec![None]);
        assert_eq!(errors_for("edge-c"), vec![Some(CANCELLED_BEFORE_DISPATCH.to_string())]);
    }

    #[tokio::test]
    async fn test_job_store_failure_is_returned_after_audit() {
        let h = harness(Arc::new(NoJobWrites(MemoryStore::new())), 1).await;

        let err = h.engine.execute(enable(vec![1], h.ids.clone())).await.unwrap_err();

        assert!(matches!(err, ServerError::Store { .. }), "unexpected error: {err}");
        let filter = AuditFilter {
            event_type: Some("batch.execute".into()),
            ..AuditFilter::default()
        };
        assert_eq!(h.audit.list(&filter, 10).await.unwrap().len(), 1);
    }
}
