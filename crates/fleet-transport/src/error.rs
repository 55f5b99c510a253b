// ============================================
// File: crates/fleet-transport/src/error.rs
// ============================================
//! # Transport Error Types
//!
//! ## Creation Reason
//! Defines error types for talking to remote panels, separating the cases
//! the session manager must react to differently.
//!
//! ## Error Categories
//! 1. **Auth Errors**: Session rejected by the panel, login refused
//! 2. **Network Errors**: Unreachable host, request timeout
//! 3. **Protocol Errors**: Unexpected status or body
//!
//! ## ⚠️ Important Note for Next Developer
//! - `AuthRejected` triggers exactly one re-login in the session manager;
//!   don't map other failures to it
//! - Error text may end up in job results; never include cookies or
//!   passwords in it
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use thiserror::Error;

// ============================================
// Result Type Alias
// ============================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

// ============================================
// TransportError
// ============================================

/// Remote panel transport errors.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    // ========================================
    // Auth Errors
    // ========================================

    /// The panel refused the session token.
    #[error("Session rejected by panel: {reason}")]
    AuthRejected {
        /// Status or message returned
        reason: String,
    },

    /// The panel refused the login credentials.
    #[error("Login failed: {reason}")]
    LoginFailed {
        /// Message returned by the panel
        reason: String,
    },

    // ========================================
    // Network Errors
    // ========================================

    /// The panel could not be reached.
    #[error("Panel unreachable at {url}: {reason}")]
    Unreachable {
        /// Base URL contacted
        url: String,
        /// Why the connection failed
        reason: String,
    },

    /// The request did not complete in time.
    #[error("Request to {url} timed out after {duration_ms}ms")]
    Timeout {
        /// Base URL contacted
        url: String,
        /// Timeout that elapsed
        duration_ms: u64,
    },

    // ========================================
    // Protocol Errors
    // ========================================

    /// The panel answered with something unexpected.
    #[error("Protocol error: {reason}")]
    Protocol {
        /// What was unexpected
        reason: String,
    },

    /// The HTTP client could not be built.
    #[error("Transport configuration error: {reason}")]
    Config {
        /// What's wrong
        reason: String,
    },
}

impl TransportError {
    // ========================================
    // Convenience Constructors
    // ========================================

    /// Creates an `AuthRejected` error.
    pub fn auth_rejected(reason: impl Into<String>) -> Self {
        Self::AuthRejected {
            reason: reason.into(),
        }
    }

    /// Creates a `LoginFailed` error.
    pub fn login_failed(reason: impl Into<String>) -> Self {
        Self::LoginFailed {
            reason: reason.into(),
        }
    }

    /// Creates an `Unreachable` error.
    pub fn unreachable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unreachable {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `Timeout` error.
    pub fn timeout(url: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            url: url.into(),
            duration_ms,
        }
    }

    /// Creates a `Protocol` error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    // ========================================
    // Error Classification
    // ========================================

    /// Returns `true` if the session must be re-established.
    #[must_use]
    pub const fn is_auth_rejected(&self) -> bool {
        matches!(self, Self::AuthRejected { .. })
    }

    /// Returns `true` if the credentials were refused at login.
    #[must_use]
    pub const fn is_login_failed(&self) -> bool {
        matches!(self, Self::LoginFailed { .. })
    }

    /// Returns `true` if the node could not be reached at all.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(TransportError::auth_rejected("401").is_auth_rejected());
        assert!(TransportError::login_failed("wrong password").is_login_failed());
        assert!(TransportError::timeout("https://a", 5000).is_unreachable());
        assert!(TransportError::unreachable("https://a", "refused").is_unreachable());
        assert!(!TransportError::protocol("bad json").is_unreachable());
        assert!(!TransportError::login_failed("nope").is_auth_rejected());
    }

    #[test]
    fn test_display() {
        let err = TransportError::timeout("https://a.example", 2500);
        assert_eq!(err.to_string(), "Request to https://a.example timed out after 2500ms");
    }
}
