// ============================================
// File: crates/fleet-common/src/types.rs
// ============================================
//! # Core Type Definitions
//!
//! ## Creation Reason
//! Centralizes identifier types used throughout the fleet control plane so
//! node ids and job ids cannot be mixed up at call sites.
//!
//! ## Main Functionality
//! - `NodeId`: Operator-visible identifier of a managed panel node
//! - `JobId`: Time-sortable identifier of an executed batch
//! - `random_token`: Hex-encoded random strings for tokens and tickets
//!
//! ## ⚠️ Important Note for Next Developer
//! - Both ids are used inside record-store keys; the allowed alphabet
//!   (`[A-Za-z0-9._-]`) keeps file-backed stores safe
//! - `JobId` ordering is chronological: 13 hex digits of milliseconds
//!   followed by 8 random hex digits
//!
//! ## Last Modified
//! v0.1.0 - Initial identifier types

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::CommonError;
use crate::time::unix_timestamp_millis;

// ============================================
// Constants
// ============================================

/// Maximum length of a node identifier.
pub const MAX_NODE_ID_LEN: usize = 64;

/// Length of a generated node identifier (hex characters).
const GENERATED_NODE_ID_BYTES: usize = 6;

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Returns `count` random bytes hex-encoded (`2 * count` characters).
#[must_use]
pub fn random_token(count: usize) -> String {
    let mut bytes = vec![0u8; count];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ============================================
// NodeId
// ============================================

/// Identifier of a managed node.
///
/// # Example
/// ```
/// use fleet_common::types::NodeId;
///
/// let id: NodeId = "hk-edge-1".parse().unwrap();
/// assert_eq!(id.as_str(), "hk-edge-1");
/// assert!("bad/id".parse::<NodeId>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Generates a fresh random node id (`n-` followed by 12 hex digits).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("n-{}", random_token(GENERATED_NODE_ID_BYTES)))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for NodeId {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > MAX_NODE_ID_LEN {
            return Err(CommonError::invalid_input(
                "node_id",
                format!("length must be 1..={MAX_NODE_ID_LEN}"),
            ));
        }
        if !s.chars().all(is_id_char) {
            return Err(CommonError::invalid_input(
                "node_id",
                "only letters, digits, '-', '_' and '.' are allowed",
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for NodeId {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================
// JobId
// ============================================

/// Identifier of a persisted job; sorts chronologically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Generates a new id stamped with the current time.
    #[must_use]
    pub fn generate() -> Self {
        Self::with_millis(unix_timestamp_millis())
    }

    /// Generates an id for a specific millisecond timestamp.
    #[must_use]
    pub fn with_millis(millis: u64) -> Self {
        Self(format!("{millis:013x}{}", random_token(4)))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > MAX_NODE_ID_LEN || !s.chars().all(is_id_char) {
            return Err(CommonError::invalid_input("job_id", "malformed job id"));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for JobId {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_validation() {
        assert!("node-1".parse::<NodeId>().is_ok());
        assert!("eu.fra_02".parse::<NodeId>().is_ok());
        assert!("".parse::<NodeId>().is_err());
        assert!("../etc".parse::<NodeId>().is_err());
        assert!("a b".parse::<NodeId>().is_err());
        assert!("x".repeat(MAX_NODE_ID_LEN + 1).parse::<NodeId>().is_err());
    }

    #[test]
    fn test_generated_node_ids_are_unique() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("n-"));
        assert!(a.as_str().parse::<NodeId>().is_ok());
    }

    #[test]
    fn test_job_ids_sort_chronologically() {
        let older = JobId::with_millis(1_000);
        let newer = JobId::with_millis(2_000);
        assert!(older < newer);
        assert_eq!(older.as_str().len(), 21);
    }

    #[test]
    fn test_random_token_length() {
        assert_eq!(random_token(16).len(), 32);
        assert_ne!(random_token(16), random_token(16));
    }
}
