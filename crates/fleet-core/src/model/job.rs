// ============================================
// File: crates/fleet-core/src/model/job.rs
// ============================================
//! # Batch Requests and Jobs
//!
//! ## Main Functionality
//! - `BatchRequest`: One logical action aimed at a target selector
//! - `Job`: The persisted record of an execution with per-step results
//! - `RetryInfo`: How a retry job was derived from its parent
//!
//! ## Result Granularity
//! ```text
//! Job
//!  ├─ results[]: one per (node, step scope)
//!  └─ summary:   total == success + skipped + failed == results.len()
//! ```
//!
//! ## Wire Shape
//! ```json
//! {"type": "inbounds", "action": "disable", "payload": {"inboundIds": [3]},
//!  "targets": "all", "confirmToken": "…", "requestId": "…"}
//! ```
//!
//! ## Last Modified
//! v0.1.0 - Initial job model

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fleet_common::{CommonError, JobId, NodeId, Timestamp};

use crate::action::{ActionDomain, ActionVerb, BatchAction, StepScope};
use crate::error::CoreError;

/// Actor recorded when a request doesn't name one.
pub const DEFAULT_ACTOR: &str = "admin";

// ============================================
// TargetSelector
// ============================================

/// Which nodes a batch is aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTargets", into = "RawTargets")]
pub enum TargetSelector {
    /// Every registered node not in maintenance.
    All,
    /// Explicit node ids.
    Nodes(Vec<NodeId>),
}

impl TargetSelector {
    /// Returns `true` for the `"all"` selector.
    #[must_use]
    pub const fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawTargets {
    Keyword(String),
    Ids(Vec<NodeId>),
}

impl TryFrom<RawTargets> for TargetSelector {
    type Error = CommonError;

    fn try_from(raw: RawTargets) -> Result<Self, Self::Error> {
        match raw {
            RawTargets::Keyword(k) if k == "all" => Ok(Self::All),
            RawTargets::Keyword(other) => Err(CommonError::invalid_input(
                "targets",
                format!("expected \"all\" or a list of node ids, got '{other}'"),
            )),
            RawTargets::Ids(ids) => Ok(Self::Nodes(ids)),
        }
    }
}

impl From<TargetSelector> for RawTargets {
    fn from(selector: TargetSelector) -> Self {
        match selector {
            TargetSelector::All => Self::Keyword("all".into()),
            TargetSelector::Nodes(ids) => Self::Ids(ids),
        }
    }
}

// ============================================
// BatchRequest
// ============================================

/// A logical action aimed at a set of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBatchRequest", into = "RawBatchRequest")]
pub struct BatchRequest {
    /// Typed action.
    pub action: BatchAction,
    /// Target selector.
    pub targets: TargetSelector,
    /// Confirmation token for high-risk batches.
    pub confirm_token: Option<String>,
    /// Caller-chosen handle used to cancel the batch.
    pub request_id: Option<String>,
    /// Who submitted the batch.
    pub actor: String,
    /// Per-node restriction of steps; set on retries.
    pub step_filter: Option<BTreeMap<NodeId, Vec<StepScope>>>,
}

impl BatchRequest {
    /// Creates a request with no token, handle or step restriction.
    #[must_use]
    pub fn new(action: BatchAction, targets: TargetSelector) -> Self {
        Self {
            action,
            targets,
            confirm_token: None,
            request_id: None,
            actor: DEFAULT_ACTOR.to_string(),
            step_filter: None,
        }
    }

    /// Sets the confirmation token.
    #[must_use]
    pub fn with_confirm_token(mut self, token: impl Into<String>) -> Self {
        self.confirm_token = Some(token.into());
        self
    }

    /// Sets the cancellation handle.
    #[must_use]
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Sets the submitting actor.
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Returns the steps to run on `node`, honoring the step filter.
    #[must_use]
    pub fn steps_for(&self, node: &NodeId) -> Vec<StepScope> {
        let all = self.action.scopes();
        match self.step_filter.as_ref().and_then(|f| f.get(node)) {
            Some(only) => all.into_iter().filter(|s| only.contains(s)).collect(),
            None => all,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBatchRequest {
    #[serde(rename = "type")]
    domain: String,
    action: String,
    #[serde(default)]
    payload: Value,
    targets: TargetSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confirm_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(default = "default_actor")]
    actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    step_filter: Option<BTreeMap<NodeId, Vec<StepScope>>>,
}

fn default_actor() -> String {
    DEFAULT_ACTOR.to_string()
}

impl TryFrom<RawBatchRequest> for BatchRequest {
    type Error = CoreError;

    fn try_from(raw: RawBatchRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            action: BatchAction::from_parts(&raw.domain, &raw.action, raw.payload)?,
            targets: raw.targets,
            confirm_token: raw.confirm_token,
            request_id: raw.request_id,
            actor: raw.actor,
            step_filter: raw.step_filter,
        })
    }
}

impl From<BatchRequest> for RawBatchRequest {
    fn from(req: BatchRequest) -> Self {
        Self {
            domain: req.action.domain().as_str().to_string(),
            action: req.action.verb().as_str().to_string(),
            payload: req.action.payload(),
            targets: req.targets,
            confirm_token: req.confirm_token,
            request_id: req.request_id,
            actor: req.actor,
            step_filter: req.step_filter,
        }
    }
}

// ============================================
// Results
// ============================================

/// Outcome of one step on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// The remote state changed as asked.
    Success,
    /// The remote state already satisfied the action.
    Skipped,
    /// The step did not complete.
    Failed,
}

/// Result of one step on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResult {
    /// Node the step ran on.
    pub server_id: NodeId,
    /// Node display name at execution time.
    pub server_name: String,
    /// Outcome.
    pub status: ResultStatus,
    /// Sanitized error text for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Sanitized remote detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    /// Sub-resource the step touched.
    pub scope: StepScope,
}

impl TargetResult {
    /// Creates a result with no error or detail.
    #[must_use]
    pub fn new(server_id: NodeId, server_name: impl Into<String>, scope: StepScope, status: ResultStatus) -> Self {
        Self {
            server_id,
            server_name: server_name.into(),
            status,
            error: None,
            detail: None,
            scope,
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failed(
        server_id: NodeId,
        server_name: impl Into<String>,
        scope: StepScope,
        error: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(server_id, server_name, scope, ResultStatus::Failed);
        result.error = Some(error.into());
        result
    }

    /// Attaches remote detail.
    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Counts over a job's results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Number of results.
    pub total: usize,
    /// Successful steps.
    pub success: usize,
    /// Already-satisfied steps.
    pub skipped: usize,
    /// Failed steps.
    pub failed: usize,
}

impl JobSummary {
    /// Tallies a result list.
    #[must_use]
    pub fn from_results(results: &[TargetResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for r in results {
            match r.status {
                ResultStatus::Success => summary.success += 1,
                ResultStatus::Skipped => summary.skipped += 1,
                ResultStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// Returns `true` if the counts add up.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.total == self.success + self.skipped + self.failed
    }
}

// ============================================
// Retry Description
// ============================================

/// How retry units are grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// One group with every unit.
    #[default]
    None,
    /// One group per node.
    Server,
    /// One group per normalized error.
    Error,
    /// One group per (node, error) pair.
    ServerError,
}

impl FromStr for GroupBy {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "server" => Ok(Self::Server),
            "error" => Ok(Self::Error),
            "server_error" => Ok(Self::ServerError),
            other => Err(CommonError::invalid_input(
                "groupBy",
                format!("unknown grouping '{other}'"),
            )),
        }
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Server => "server",
            Self::Error => "error",
            Self::ServerError => "server_error",
        })
    }
}

/// One node's failed sub-resources sharing an error signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryUnit {
    /// Node to re-drive.
    pub server_id: NodeId,
    /// Normalized error text.
    pub signature: String,
    /// Steps to re-run.
    pub scopes: Vec<StepScope>,
}

/// Retry units sharing a grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryGroup {
    /// Grouping key.
    pub key: String,
    /// Units in the group.
    pub units: Vec<RetryUnit>,
}

/// How a retry job was derived from its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryInfo {
    /// Grouping applied.
    pub group_by: GroupBy,
    /// Whether only failed results were re-driven.
    pub failed_only: bool,
    /// Groups built.
    pub groups: Vec<RetryGroup>,
}

// ============================================
// Job
// ============================================

/// The persisted record of one batch execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Identifier, chronologically sortable.
    pub id: JobId,
    /// Creation time.
    pub created_at: Timestamp,
    /// Submitting actor.
    pub actor: String,
    /// Resource family.
    #[serde(rename = "type")]
    pub domain: ActionDomain,
    /// Verb.
    pub action: ActionVerb,
    /// Request as executed, used to rebuild retries.
    pub request: BatchRequest,
    /// Result counts.
    pub summary: JobSummary,
    /// Per-step results in completion order.
    pub results: Vec<TargetResult>,
    /// Job this one retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<JobId>,
    /// Retry derivation, for retry jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryInfo>,
    /// Whether the batch was cancelled mid-flight.
    #[serde(default)]
    pub cancelled: bool,
}

impl Job {
    /// Builds a job from an executed request and its results.
    #[must_use]
    pub fn new(request: BatchRequest, results: Vec<TargetResult>) -> Self {
        Self {
            id: JobId::generate(),
            created_at: Timestamp::now(),
            actor: request.actor.clone(),
            domain: request.action.domain(),
            action: request.action.verb(),
            summary: JobSummary::from_results(&results),
            request,
            results,
            parent_job_id: None,
            retry: None,
            cancelled: false,
        }
    }

    /// Returns `true` if any step failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0
    }

    /// Returns `true` if any result belongs to `node`.
    #[must_use]
    pub fn touches(&self, node: &NodeId) -> bool {
        self.results.iter().any(|r| &r.server_id == node)
    }

    /// Iterates failed results.
    pub fn failed_results(&self) -> impl Iterator<Item = &TargetResult> {
        self.results.iter().filter(|r| r.status == ResultStatus::Failed)
    }

    /// Returns the distinct nodes that have results, in first-seen order.
    #[must_use]
    pub fn result_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = Vec::new();
        for r in &self.results {
            if !nodes.contains(&r.server_id) {
                nodes.push(r.server_id.clone());
            }
        }
        nodes
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str) -> NodeId {
        id.parse().unwrap()
    }

    #[test]
    fn test_batch_request_parse() {
        let req: BatchRequest = serde_json::from_value(json!({
            "type": "inbounds",
            "action": "disable",
            "payload": {"inboundIds": [3]},
            "targets": "all",
            "requestId": "r-1"
        }))
        .unwrap();

        assert!(req.targets.is_all());
        assert_eq!(req.action.signature(), "inbounds.disable");
        assert_eq!(req.request_id.as_deref(), Some("r-1"));
        assert_eq!(req.actor, DEFAULT_ACTOR);
    }

    #[test]
    fn test_batch_request_rejects_bad_input() {
        let bad_targets = serde_json::from_value::<BatchRequest>(json!({
            "type": "inbounds", "action": "disable",
            "payload": {"inboundIds": [3]}, "targets": "some"
        }));
        assert!(bad_targets.is_err());

        let unsupported = serde_json::from_value::<BatchRequest>(json!({
            "type": "inbounds", "action": "update",
            "payload": {}, "targets": ["a"]
        }));
        assert!(unsupported.is_err());
    }

    #[test]
    fn test_batch_request_serializes_wire_shape() {
        let action = BatchAction::from_parts("users", "delete", json!({"inboundIds": [1], "emails": ["a"]})).unwrap();
        let req = BatchRequest::new(action, TargetSelector::Nodes(vec![node("n1"), node("n2")]));
        let json = serde_json::to_value(&req).unwrap();

        assert_eq!(json["type"], "users");
        assert_eq!(json["action"], "delete");
        assert_eq!(json["targets"], json!(["n1", "n2"]));
        assert!(json.get("confirmToken").is_none());

        let back: BatchRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_steps_for_honors_filter() {
        let action = BatchAction::from_parts("inbounds", "delete", json!({"inboundIds": [1, 2]})).unwrap();
        let mut req = BatchRequest::new(action, TargetSelector::All);
        assert_eq!(req.steps_for(&node("a")).len(), 2);

        let mut filter = BTreeMap::new();
        filter.insert(node("a"), vec![StepScope::Inbound { id: 2 }]);
        req.step_filter = Some(filter);

        assert_eq!(req.steps_for(&node("a")), vec![StepScope::Inbound { id: 2 }]);
        assert_eq!(req.steps_for(&node("b")).len(), 2);
    }

    #[test]
    fn test_summary_invariant() {
        let scope = StepScope::Inbound { id: 1 };
        let results = vec![
            TargetResult::new(node("a"), "A", scope.clone(), ResultStatus::Success),
            TargetResult::new(node("b"), "B", scope.clone(), ResultStatus::Skipped),
            TargetResult::failed(node("c"), "C", scope, "timeout"),
        ];
        let summary = JobSummary::from_results(&results);
        assert_eq!(summary, JobSummary { total: 3, success: 1, skipped: 1, failed: 1 });
        assert!(summary.is_consistent());
    }

    #[test]
    fn test_job_json_roundtrip() {
        let action = BatchAction::from_parts("inbounds", "disable", json!({"inboundIds": [3]})).unwrap();
        let req = BatchRequest::new(action, TargetSelector::All).with_actor("ops");
        let results = vec![TargetResult::failed(node("a"), "A", StepScope::Inbound { id: 3 }, "timeout")];
        let job = Job::new(req, results);

        assert!(job.has_failures());
        assert!(job.touches(&node("a")));
        assert_eq!(job.actor, "ops");

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["type"], "inbounds");
        assert_eq!(json["summary"]["failed"], 1);
        assert_eq!(json["results"][0]["serverId"], "a");

        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_group_by_parse() {
        assert_eq!("server_error".parse::<GroupBy>().unwrap(), GroupBy::ServerError);
        assert!("host".parse::<GroupBy>().is_err());
    }
}
