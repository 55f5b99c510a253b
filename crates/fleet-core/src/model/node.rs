// ============================================
// File: crates/fleet-core/src/model/node.rs
// ============================================
//! # Node Records
//!
//! ## Main Functionality
//! - `Node`: Persisted record of one managed panel instance
//! - `NodeHealth` / `CredentialStatus`: Probe-maintained status fields
//! - `NodeDraft` / `NodeUpdate`: Operator input for create and update
//!
//! ## ⚠️ Important Note for Next Developer
//! - `secret` is only ever a `SealedSecret`; plaintext passwords exist only
//!   in drafts/updates and are sealed by the registry before persisting
//! - `Maintenance` is operator-owned; probes must not overwrite it
//!
//! ## Last Modified
//! v0.1.0 - Initial node model

use std::fmt;

use serde::{Deserialize, Serialize};

use fleet_common::{CommonError, NodeId, Timestamp};

use crate::crypto::SealedSecret;

// ============================================
// Status Enums
// ============================================

/// Reachability of a node as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    /// Never probed.
    #[default]
    Unknown,
    /// Last call succeeded.
    Healthy,
    /// Reachable but login was rejected.
    Degraded,
    /// Network failure or timeout.
    Unreachable,
    /// Operator-set; excluded from "all" dispatch.
    Maintenance,
}

impl NodeHealth {
    /// Returns the lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeHealth {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "unreachable" => Ok(Self::Unreachable),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(CommonError::invalid_input(
                "health",
                format!("unknown health '{other}'"),
            )),
        }
    }
}

/// Whether the stored login secret is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    /// A secret is stored and last decrypted fine.
    Configured,
    /// No secret stored.
    #[default]
    Missing,
    /// Stored secret could not be decrypted.
    Unreadable,
}

// ============================================
// Node
// ============================================

/// A managed remote panel instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Stable identifier.
    pub id: NodeId,
    /// Display name.
    pub name: String,
    /// Panel base URL, including any web base path.
    pub base_url: String,
    /// Panel login user.
    pub username: String,
    /// Sealed panel password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SealedSecret>,
    /// Optional grouping label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Deployment environment label (`prod`, `staging`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Last observed reachability.
    #[serde(default)]
    pub health: NodeHealth,
    /// Usability of the stored secret.
    #[serde(default)]
    pub credential_status: CredentialStatus,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last modification time.
    pub updated_at: Timestamp,
}

impl Node {
    /// Builds a node from a validated draft and an already sealed secret.
    #[must_use]
    pub fn from_draft(id: NodeId, draft: &NodeDraft, secret: Option<SealedSecret>) -> Self {
        let now = Timestamp::now();
        let credential_status = if secret.is_some() {
            CredentialStatus::Configured
        } else {
            CredentialStatus::Missing
        };
        Self {
            id,
            name: draft.name.trim().to_string(),
            base_url: normalize_base_url(&draft.base_url),
            username: draft.username.clone(),
            secret,
            group: draft.group.clone(),
            tags: draft.tags.clone(),
            environment: draft.environment.clone(),
            health: NodeHealth::Unknown,
            credential_status,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` if the node is operator-parked.
    #[must_use]
    pub fn in_maintenance(&self) -> bool {
        self.health == NodeHealth::Maintenance
    }

    /// Applies non-credential fields of an update.
    pub fn apply(&mut self, update: &NodeUpdate) {
        if let Some(name) = &update.name {
            self.name = name.trim().to_string();
        }
        if let Some(url) = &update.base_url {
            self.base_url = normalize_base_url(url);
        }
        if let Some(username) = &update.username {
            self.username.clone_from(username);
        }
        if let Some(group) = &update.group {
            self.group = if group.is_empty() { None } else { Some(group.clone()) };
        }
        if let Some(tags) = &update.tags {
            self.tags.clone_from(tags);
        }
        if let Some(env) = &update.environment {
            self.environment = if env.is_empty() { None } else { Some(env.clone()) };
        }
        self.updated_at = Timestamp::now();
    }

    /// Checks the persisted invariants.
    ///
    /// # Errors
    /// Returns `InvalidInput` naming the offending field.
    pub fn validate(&self) -> Result<(), CommonError> {
        validate_name(&self.name)?;
        validate_base_url(&self.base_url)?;
        validate_username(&self.username)
    }
}

// ============================================
// Operator Input
// ============================================

/// Input for registering a node.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDraft {
    /// Display name.
    pub name: String,
    /// Panel base URL.
    pub base_url: String,
    /// Panel login user.
    pub username: String,
    /// Plaintext password; sealed before it is stored.
    #[serde(default)]
    pub password: Option<String>,
    /// Grouping label.
    #[serde(default)]
    pub group: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Environment label.
    #[serde(default)]
    pub environment: Option<String>,
}

impl NodeDraft {
    /// Validates operator input.
    ///
    /// # Errors
    /// Returns `InvalidInput` naming the offending field.
    pub fn validate(&self) -> Result<(), CommonError> {
        validate_name(&self.name)?;
        validate_base_url(&self.base_url)?;
        validate_username(&self.username)?;
        if self.password.as_deref().is_some_and(str::is_empty) {
            return Err(CommonError::invalid_input("password", "must not be empty"));
        }
        Ok(())
    }
}

impl fmt::Debug for NodeDraft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDraft")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

/// Partial update of a node. `None` leaves a field unchanged.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdate {
    /// New display name.
    pub name: Option<String>,
    /// New base URL.
    pub base_url: Option<String>,
    /// New login user.
    pub username: Option<String>,
    /// New plaintext password.
    pub password: Option<String>,
    /// New group; empty string clears it.
    pub group: Option<String>,
    /// Replacement tag list.
    pub tags: Option<Vec<String>>,
    /// New environment; empty string clears it.
    pub environment: Option<String>,
}

impl NodeUpdate {
    /// Returns `true` if the update changes how the node is reached.
    #[must_use]
    pub fn touches_session(&self) -> bool {
        self.base_url.is_some() || self.username.is_some() || self.password.is_some()
    }
}

impl fmt::Debug for NodeUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeUpdate")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

// ============================================
// Validation Helpers
// ============================================

fn validate_name(name: &str) -> Result<(), CommonError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.len() > 128 {
        return Err(CommonError::invalid_input("name", "must be 1-128 characters"));
    }
    Ok(())
}

fn validate_username(username: &str) -> Result<(), CommonError> {
    if username.is_empty() {
        return Err(CommonError::invalid_input("username", "must not be empty"));
    }
    Ok(())
}

fn validate_base_url(url: &str) -> Result<(), CommonError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| CommonError::invalid_input("baseUrl", "must start with http:// or https://"))?;
    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(CommonError::invalid_input("baseUrl", "missing host"));
    }
    Ok(())
}

/// Strips whitespace and trailing slashes so paths can be appended.
#[must_use]
pub fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> NodeDraft {
        NodeDraft {
            name: "Tokyo 1".into(),
            base_url: "https://tokyo-1.example.net:2053/panel-x/".into(),
            username: "admin".into(),
            password: Some("pw".into()),
            ..NodeDraft::default()
        }
    }

    #[test]
    fn test_draft_validation() {
        assert!(draft().validate().is_ok());

        let mut bad = draft();
        bad.base_url = "ftp://host".into();
        assert!(bad.validate().is_err());

        let mut bad = draft();
        bad.base_url = "https:///path".into();
        assert!(bad.validate().is_err());

        let mut bad = draft();
        bad.name = "   ".into();
        assert!(bad.validate().is_err());

        let mut bad = draft();
        bad.password = Some(String::new());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_from_draft_normalizes() {
        let node = Node::from_draft("tokyo-1".parse().unwrap(), &draft(), None);
        assert_eq!(node.base_url, "https://tokyo-1.example.net:2053/panel-x");
        assert_eq!(node.credential_status, CredentialStatus::Missing);
        assert_eq!(node.health, NodeHealth::Unknown);
        assert!(node.validate().is_ok());
    }

    #[test]
    fn test_apply_update() {
        let mut node = Node::from_draft("tokyo-1".parse().unwrap(), &draft(), None);
        node.group = Some("asia".into());
        let update = NodeUpdate {
            name: Some("Tokyo One".into()),
            group: Some(String::new()),
            tags: Some(vec!["edge".into()]),
            ..NodeUpdate::default()
        };
        assert!(!update.touches_session());
        node.apply(&update);
        assert_eq!(node.name, "Tokyo One");
        assert_eq!(node.group, None);
        assert_eq!(node.tags, vec!["edge".to_string()]);
    }

    #[test]
    fn test_node_json_shape() {
        let node = Node::from_draft("tokyo-1".parse().unwrap(), &draft(), None);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["baseUrl"], "https://tokyo-1.example.net:2053/panel-x");
        assert_eq!(json["credentialStatus"], "missing");
        assert_eq!(json["health"], "unknown");
        assert!(json.get("secret").is_none());
    }

    #[test]
    fn test_debug_redacts_password() {
        assert!(!format!("{:?}", draft()).contains("\"pw\""));
    }

    #[test]
    fn test_health_parse() {
        assert_eq!("maintenance".parse::<NodeHealth>().unwrap(), NodeHealth::Maintenance);
        assert!("sleepy".parse::<NodeHealth>().is_err());
    }
}
