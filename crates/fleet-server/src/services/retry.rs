// ============================================
// File: crates/fleet-server/src/services/retry.rs
// ============================================
//! # Retry Planner
//!
//! ## Creation Reason
//! Turns a finished job into a child batch that re-drives only what needs
//! it, grouped so operators can see which failures share a cause.
//!
//! ## Main Functionality
//! - `normalize_error`: Reduces error text to a comparable signature
//! - `plan_retry`: Builds retry units, groups them, and derives the child
//!   `BatchRequest` with a per-node step filter
//!
//! ## Regrouping
//! ```text
//! failed results ──► units (node × signature, scopes) ──► groups by key
//!                                   │
//!                                   ▼
//!        child request: targets = unit nodes, stepFilter = unit scopes
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The child re-runs the parent's action unchanged; only targets and the
//!   step filter differ, so client ids assigned at first execution stay
//! - With `failed_only = false` every parent result is re-driven
//!
//! ## Last Modified
//! v0.1.0 - Initial retry planner

use std::collections::BTreeMap;

use fleet_common::NodeId;
use fleet_core::model::{
    BatchRequest, GroupBy, Job, ResultStatus, RetryGroup, RetryInfo, RetryUnit, TargetSelector,
};
use fleet_core::StepScope;

use crate::error::{Result, ServerError};

/// Longest signature kept.
const MAX_SIGNATURE_LEN: usize = 120;

/// Caller choices for a retry.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Re-drive failed results only.
    pub failed_only: bool,
    /// Grouping of retry units.
    pub group_by: GroupBy,
    /// Who asked.
    pub actor: String,
    /// Confirmation token if the child batch is high risk.
    pub confirm_token: Option<String>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            failed_only: true,
            group_by: GroupBy::default(),
            actor: fleet_core::model::job::DEFAULT_ACTOR.to_string(),
            confirm_token: None,
        }
    }
}

/// A derived child batch.
#[derive(Debug, Clone)]
pub struct RetryPlan {
    /// Request to execute.
    pub request: BatchRequest,
    /// Derivation recorded on the child job.
    pub info: RetryInfo,
}

// ============================================
// Signatures
// ============================================

/// Normalizes error text so equivalent failures compare equal.
///
/// Lowercases, replaces URLs with `<url>` and digit runs with `#`, and
/// collapses whitespace.
#[must_use]
pub fn normalize_error(message: &str) -> String {
    let mut words = Vec::new();
    for word in message.split_whitespace() {
        let lowered = word.to_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            words.push("<url>".to_string());
            continue;
        }
        let mut out = String::with_capacity(lowered.len());
        let mut in_digits = false;
        for c in lowered.chars() {
            if c.is_ascii_digit() {
                if !in_digits {
                    out.push('#');
                }
                in_digits = true;
            } else {
                out.push(c);
                in_digits = false;
            }
        }
        words.push(out);
    }
    let mut signature = words.join(" ");
    if signature.len() > MAX_SIGNATURE_LEN {
        let mut cut = MAX_SIGNATURE_LEN;
        while !signature.is_char_boundary(cut) {
            cut -= 1;
        }
        signature.truncate(cut);
    }
    signature
}

fn signature_of(status: ResultStatus, error: Option<&str>) -> String {
    match (status, error) {
        (ResultStatus::Failed, Some(e)) => normalize_error(e),
        (ResultStatus::Failed, None) => "failed".to_string(),
        (ResultStatus::Skipped, _) => "skipped".to_string(),
        (ResultStatus::Success, _) => "success".to_string(),
    }
}

// ============================================
// Planning
// ============================================

/// Builds retry units in first-seen order.
#[must_use]
pub fn build_units(job: &Job, failed_only: bool) -> Vec<RetryUnit> {
    let mut units: Vec<RetryUnit> = Vec::new();
    for result in &job.results {
        if failed_only && result.status != ResultStatus::Failed {
            continue;
        }
        let signature = signature_of(result.status, result.error.as_deref());
        match units
            .iter_mut()
            .find(|u| u.server_id == result.server_id && u.signature == signature)
        {
            Some(unit) => {
                if !unit.scopes.contains(&result.scope) {
                    unit.scopes.push(result.scope.clone());
                }
            }
            None => units.push(RetryUnit {
                server_id: result.server_id.clone(),
                signature,
                scopes: vec![result.scope.clone()],
            }),
        }
    }
    units
}

/// Groups units by the chosen key, preserving first-seen order.
#[must_use]
pub fn group_units(units: Vec<RetryUnit>, group_by: GroupBy) -> Vec<RetryGroup> {
    let mut groups: Vec<RetryGroup> = Vec::new();
    for unit in units {
        let key = match group_by {
            GroupBy::None => "all".to_string(),
            GroupBy::Server => unit.server_id.to_string(),
            GroupBy::Error => unit.signature.clone(),
            GroupBy::ServerError => format!("{}|{}", unit.server_id, unit.signature),
        };
        match groups.iter_mut().find(|g| g.key == key) {
            Some(group) => group.units.push(unit),
            None => groups.push(RetryGroup {
                key,
                units: vec![unit],
            }),
        }
    }
    groups
}

/// Derives the child batch for a retry of `parent`.
///
/// # Errors
/// `InvalidRequest` if there is nothing to re-drive.
pub fn plan_retry(parent: &Job, options: &RetryOptions) -> Result<RetryPlan> {
    let units = build_units(parent, options.failed_only);
    if units.is_empty() {
        return Err(ServerError::invalid_request(if options.failed_only {
            format!("job {} has no failed results to retry", parent.id)
        } else {
            format!("job {} has no results to retry", parent.id)
        }));
    }

    let mut filter: BTreeMap<NodeId, Vec<StepScope>> = BTreeMap::new();
    let mut targets: Vec<NodeId> = Vec::new();
    for unit in &units {
        if !targets.contains(&unit.server_id) {
            targets.push(unit.server_id.clone());
        }
        let scopes = filter.entry(unit.server_id.clone()).or_default();
        for scope in &unit.scopes {
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }
    }

    let mut request = BatchRequest::new(parent.request.action.clone(), TargetSelector::Nodes(targets))
        .with_actor(options.actor.clone());
    request.confirm_token.clone_from(&options.confirm_token);
    request.step_filter = Some(filter);

    Ok(RetryPlan {
        request,
        info: RetryInfo {
            group_by: options.group_by,
            failed_only: options.failed_only,
            groups: group_units(units, options.group_by),
        },
    })
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::action::ClientRefPayload;
    use fleet_core::model::TargetResult;
    use fleet_core::BatchAction;

    fn node(id: &str) -> NodeId {
        id.parse().unwrap()
    }

    fn scope(email: &str) -> StepScope {
        StepScope::Client {
            inbound_id: 1,
            email: email.into(),
        }
    }

    fn parent() -> Job {
        let request = BatchRequest::new(
            BatchAction::UsersDisable(ClientRefPayload {
                inbound_ids: vec![1],
                emails: vec!["a".into(), "b".into()],
            }),
            TargetSelector::Nodes(vec![node("n1"), node("n2"), node("n3")]),
        );
        let results = vec![
            TargetResult::new(node("n1"), "n1", scope("a"), ResultStatus::Success),
            TargetResult::new(node("n1"), "n1", scope("b"), ResultStatus::Success),
            TargetResult::failed(node("n2"), "n2", scope("a"), "Request to https://n2.example timed out after 5000ms"),
            TargetResult::failed(node("n2"), "n2", scope("b"), "Request to https://n2.example timed out after 5000ms"),
            TargetResult::new(node("n3"), "n3", scope("a"), ResultStatus::Skipped),
            TargetResult::failed(node("n3"), "n3", scope("b"), "client b not found in inbound 1"),
        ];
        Job::new(request, results)
    }

    #[test]
    fn test_normalize_error() {
        assert_eq!(
            normalize_error("Request to https://n2.example:2053 timed out after 5000ms"),
            "request to <url> timed out after #ms"
        );
        assert_eq!(normalize_error("  Port   already exists: 443 "), "port already exists: #");
    }

    #[test]
    fn test_failed_only_plan_scopes_to_failures() {
        let plan = plan_retry(&parent(), &RetryOptions::default()).unwrap();
        assert_eq!(
            plan.request.targets,
            TargetSelector::Nodes(vec![node("n2"), node("n3")])
        );
        assert_eq!(plan.request.steps_for(&node("n2")), vec![scope("a"), scope("b")]);
        assert_eq!(plan.request.steps_for(&node("n3")), vec![scope("b")]);
    }

    #[test]
    fn test_group_by_error() {
        let options = RetryOptions {
            group_by: GroupBy::Error,
            ..RetryOptions::default()
        };
        let plan = plan_retry(&parent(), &options).unwrap();
        assert_eq!(plan.info.groups.len(), 2);
        assert_eq!(plan.info.groups[0].units[0].scopes.len(), 2);
    }

    #[test]
    fn test_group_by_server_error() {
        let units = build_units(&parent(), true);
        let groups = group_units(units, GroupBy::ServerError);
        assert_eq!(groups.len(), 2);
        assert!(groups[0].key.starts_with("n2|"));
    }

    #[test]
    fn test_all_results_redriven() {
        let options = RetryOptions {
            failed_only: false,
            ..RetryOptions::default()
        };
        let plan = plan_retry(&parent(), &options).unwrap();
        assert_eq!(
            plan.request.targets,
            TargetSelector::Nodes(vec![node("n1"), node("n2"), node("n3")])
        );
        assert_eq!(plan.request.steps_for(&node("n3")).len(), 2);
    }

    #[test]
    fn test_nothing_to_retry() {
        let mut job = parent();
        job.results.retain(|r| r.status != ResultStatus::Failed);
        assert!(plan_retry(&job, &RetryOptions::default()).is_err());
    }
}
