// ============================================
// File: crates/fleet-server/src/services/risk.rs
// ============================================
//! # Risk Gate
//!
//! ## Creation Reason
//! Destructive batches aimed at the whole fleet, or at more nodes than the
//! configured threshold, must carry a short-lived confirmation token issued
//! for exactly that action and target set.
//!
//! ## Main Functionality
//! - `RiskGate::classify`: Low / high risk for a resolved batch
//! - `RiskGate::issue_token`: Mints a scoped, single-use token
//! - `RiskGate::check`: Validates and consumes a token for a batch
//!
//! ## Token Binding
//! ```text
//! token ─┬─ type.action     (users.delete)
//!        ├─ scope           all | {node ids}
//!        ├─ issued_to       actor that may spend it
//!        └─ expires_at      issue time + ttl
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - A token is removed only on successful validation; a mismatched
//!   request leaves it usable for the right one until it expires
//! - Concurrent spends race on `DashMap::remove`; exactly one wins
//!
//! ## Last Modified
//! v0.1.0 - Initial risk gate

use std::collections::BTreeSet;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use fleet_common::{random_token, NodeId, Timestamp};
use fleet_core::model::{BatchRequest, TargetSelector};
use fleet_core::{ActionDomain, ActionVerb};

use crate::config::RiskConfig;
use crate::error::{Result, ServerError};

/// Random bytes in a confirmation token.
const TOKEN_BYTES: usize = 24;

// ============================================
// Types
// ============================================

/// Risk classification of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Runs without confirmation.
    Low,
    /// Needs a confirmation token.
    High,
}

/// Target set a token is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    /// The `"all"` selector.
    All,
    /// An explicit id set.
    Nodes(BTreeSet<NodeId>),
}

impl TokenScope {
    fn of(targets: &TargetSelector) -> Self {
        match targets {
            TargetSelector::All => Self::All,
            TargetSelector::Nodes(ids) => Self::Nodes(ids.iter().cloned().collect()),
        }
    }
}

struct RiskToken {
    domain: ActionDomain,
    verb: ActionVerb,
    scope: TokenScope,
    issued_to: String,
    expires_at: Instant,
}

/// A freshly issued token as handed to the operator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    /// Token value to place in `confirmToken`.
    pub token: String,
    /// `type.action` it confirms.
    pub action: String,
    /// Targets it confirms.
    pub scope: TokenScope,
    /// Wall-clock expiry.
    pub expires_at: Timestamp,
}

// ============================================
// RiskGate
// ============================================

/// Confirmation gate for high-risk batches.
pub struct RiskGate {
    tokens: DashMap<String, RiskToken>,
    threshold: usize,
    ttl: Duration,
    max_scope_targets: usize,
}

impl RiskGate {
    /// Creates a gate from config.
    pub fn new(config: &RiskConfig) -> Self {
        Self {
            tokens: DashMap::new(),
            threshold: config.cardinality_threshold,
            ttl: Duration::from_secs(config.token_ttl_secs),
            max_scope_targets: config.max_scope_targets,
        }
    }

    /// Classifies a batch resolved to `resolved_targets` nodes.
    #[must_use]
    pub fn classify(&self, request: &BatchRequest, resolved_targets: usize) -> RiskLevel {
        if !request.action.is_destructive() {
            return RiskLevel::Low;
        }
        if request.targets.is_all() || resolved_targets > self.threshold {
            RiskLevel::High
        } else {
            RiskLevel::Low
        }
    }

    /// Issues a token confirming `request`'s action on its targets.
    ///
    /// # Errors
    /// `InvalidRequest` if an explicit target list is empty or larger than
    /// the configured maximum.
    pub fn issue_token(&self, request: &BatchRequest, issued_to: &str) -> Result<IssuedToken> {
        let scope = TokenScope::of(&request.targets);
        if let TokenScope::Nodes(ids) = &scope {
            if ids.is_empty() {
                return Err(ServerError::invalid_request("token scope has no targets"));
            }
            if ids.len() > self.max_scope_targets {
                return Err(ServerError::invalid_request(format!(
                    "token scope lists {} nodes, limit is {}",
                    ids.len(),
                    self.max_scope_targets
                )));
            }
        }

        let token = random_token(TOKEN_BYTES);
        self.tokens.insert(
            token.clone(),
            RiskToken {
                domain: request.action.domain(),
                verb: request.action.verb(),
                scope: scope.clone(),
                issued_to: issued_to.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );

        info!(action = %request.action, issued_to, ttl_secs = self.ttl.as_secs(), "Risk token issued");
        Ok(IssuedToken {
            token,
            action: request.action.signature(),
            scope,
            expires_at: Timestamp::now().plus_secs(self.ttl.as_secs()),
        })
    }

    /// Validates the request's token and consumes it.
    ///
    /// # Errors
    /// - `ConfirmationRequired` if the request carries no token
    /// - `RiskTokenInvalid` if the token is unknown, expired, or bound to a
    ///   different action, target set or actor
    pub fn check(&self, request: &BatchRequest, resolved_targets: usize) -> Result<()> {
        let Some(token) = request.confirm_token.as_deref() else {
            return Err(ServerError::ConfirmationRequired {
                action: request.action.signature(),
                targets: resolved_targets,
            });
        };

        {
            let Some(entry) = self.tokens.get(token) else {
                return Err(ServerError::risk_token("unknown or already used"));
            };
            let bound = entry.value();
            if Instant::now() >= bound.expires_at {
                drop(entry);
                self.tokens.remove(token);
                return Err(ServerError::risk_token("expired"));
            }
            if bound.domain != request.action.domain() || bound.verb != request.action.verb() {
                return Err(ServerError::risk_token("issued for a different action"));
            }
            if bound.scope != TokenScope::of(&request.targets) {
                return Err(ServerError::risk_token("issued for a different target set"));
            }
            if bound.issued_to != request.actor {
                return Err(ServerError::risk_token("issued to a different actor"));
            }
        }

        if self.tokens.remove(token).is_none() {
            return Err(ServerError::risk_token("unknown or already used"));
        }
        debug!(action = %request.action, actor = %request.actor, "Risk token consumed");
        Ok(())
    }

    /// Drops expired tokens, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.tokens.len();
        self.tokens.retain(|_, t| t.expires_at > now);
        let removed = before.saturating_sub(self.tokens.len());
        if removed > 0 {
            debug!(removed, "Expired risk tokens purged");
        }
        removed
    }

    /// Number of outstanding tokens.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.tokens.len()
    }
}

impl std::fmt::Debug for RiskGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGate")
            .field("threshold", &self.threshold)
            .field("outstanding", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::action::{ClientRefPayload, InboundRefPayload};
    use fleet_core::BatchAction;

    fn gate() -> RiskGate {
        RiskGate::new(&RiskConfig {
            cardinality_threshold: 3,
            token_ttl_secs: 60,
            max_scope_targets: 4,
        })
    }

    fn ids(raw: &[&str]) -> Vec<NodeId> {
        raw.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn delete_users(targets: TargetSelector) -> BatchRequest {
        BatchRequest::new(
            BatchAction::UsersDelete(ClientRefPayload {
                inbound_ids: vec![1],
                emails: vec!["a".into()],
            }),
            targets,
        )
    }

    #[test]
    fn test_classification() {
        let gate = gate();
        assert_eq!(gate.classify(&delete_users(TargetSelector::All), 1), RiskLevel::High);
        assert_eq!(
            gate.classify(&delete_users(TargetSelector::Nodes(ids(&["a", "b"]))), 2),
            RiskLevel::Low
        );
        assert_eq!(
            gate.classify(&delete_users(TargetSelector::Nodes(ids(&["a", "b", "c", "d"]))), 4),
            RiskLevel::High
        );

        let enable = BatchRequest::new(
            BatchAction::InboundsEnable(InboundRefPayload { inbound_ids: vec![1] }),
            TargetSelector::All,
        );
        assert_eq!(gate.classify(&enable, 50), RiskLevel::Low);
    }

    #[test]
    fn test_missing_token_requires_confirmation() {
        let err = gate().check(&delete_users(TargetSelector::All), 5).unwrap_err();
        assert!(matches!(err, ServerError::ConfirmationRequired { targets: 5, .. }));
    }

    #[test]
    fn test_token_is_single_use() {
        let gate = gate();
        let request = delete_users(TargetSelector::All);
        let issued = gate.issue_token(&request, "admin").unwrap();
        let request = request.with_confirm_token(issued.token);

        gate.check(&request, 5).unwrap();
        assert!(matches!(gate.check(&request, 5), Err(ServerError::RiskTokenInvalid { .. })));
    }

    #[test]
    fn test_token_scope_mismatch_keeps_token() {
        let gate = gate();
        let scoped = delete_users(TargetSelector::Nodes(ids(&["a", "b"])));
        let issued = gate.issue_token(&scoped, "admin").unwrap();

        let wider = delete_users(TargetSelector::All).with_confirm_token(issued.token.clone());
        assert!(gate.check(&wider, 9).is_err());

        let same_set_reordered =
            delete_users(TargetSelector::Nodes(ids(&["b", "a"]))).with_confirm_token(issued.token);
        gate.check(&same_set_reordered, 2).unwrap();
    }

    #[test]
    fn test_token_bound_to_actor() {
        let gate = gate();
        let request = delete_users(TargetSelector::All);
        let issued = gate.issue_token(&request, "alice").unwrap();
        let request = request.with_confirm_token(issued.token).with_actor("mallory");
        assert!(matches!(gate.check(&request, 3), Err(ServerError::RiskTokenInvalid { .. })));
    }

    #[test]
    fn test_scope_limit() {
        let gate = gate();
        let request = delete_users(TargetSelector::Nodes(ids(&["a", "b", "c", "d", "e"])));
        assert!(gate.issue_token(&request, "admin").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_expiry() {
        let gate = gate();
        let request = delete_users(TargetSelector::All);
        let issued = gate.issue_token(&request, "admin").unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let request = request.with_confirm_token(issued.token);
        assert!(matches!(gate.check(&request, 3), Err(ServerError::RiskTokenInvalid { .. })));
        assert_eq!(gate.outstanding(), 0);
    }
}
