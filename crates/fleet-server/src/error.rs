// ============================================
// File: crates/fleet-server/src/error.rs
// ============================================
//! # Server Error Types
//!
//! ## Creation Reason
//! One error type for the control plane services. Per-node failures during
//! a batch are data (job results), not `ServerError`s; only request-level
//! rejections and infrastructure failures surface here.
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use thiserror::Error;

use fleet_common::error::CommonError;
use fleet_common::{JobId, NodeId};
use fleet_core::error::CoreError;
use fleet_transport::error::TransportError;

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Server error types.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to load configuration from '{path}': {reason}")]
    ConfigLoad { path: String, reason: String },

    #[error("Invalid configuration: {field} - {reason}")]
    ConfigInvalid { field: String, reason: String },

    #[error("Missing required configuration: {field}")]
    ConfigMissing { field: String },

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node already exists: {0}")]
    NodeExists(NodeId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("No credential stored for node {0}")]
    CredentialMissing(NodeId),

    #[error("Stored credential for node {0} is unreadable")]
    CredentialUnreadable(NodeId),

    #[error("Invalid batch request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Confirmation required: {action} on {targets} node(s) is high risk")]
    ConfirmationRequired { action: String, targets: usize },

    #[error("Risk token rejected: {reason}")]
    RiskTokenInvalid { reason: String },

    #[error("Realtime ticket rejected")]
    TicketInvalid,

    #[error("Record store error ({context}): {reason}")]
    Store { context: String, reason: String },

    #[error("Server failed to start: {reason}")]
    StartupFailed { reason: String },

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ServerError {
    pub fn config_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn risk_token(reason: impl Into<String>) -> Self {
        Self::RiskTokenInvalid {
            reason: reason.into(),
        }
    }

    pub fn store(context: impl Into<String>, reason: impl ToString) -> Self {
        Self::Store {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub fn startup_failed(reason: impl Into<String>) -> Self {
        Self::StartupFailed {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigLoad { .. } | Self::ConfigInvalid { .. } | Self::ConfigMissing { .. }
        )
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NodeNotFound(_) | Self::JobNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServerError::config_load("/etc/fleet/config.toml", "file not found");
        assert!(err.to_string().contains("/etc/fleet/config.toml"));
    }

    #[test]
    fn test_error_classification() {
        let config_err = ServerError::config_invalid("engine.concurrency", "must be > 0");
        assert!(config_err.is_config_error());
        assert!(ServerError::JobNotFound(JobId::generate()).is_not_found());
        assert!(!ServerError::TicketInvalid.is_not_found());
    }
}
