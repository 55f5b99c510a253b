// ============================================
// File: crates/fleet-core/src/error.rs
// ============================================
//! # Core Error Types
//!
//! ## Creation Reason
//! Defines error types for credential cryptography and for constructing
//! batch actions from their wire form.
//!
//! ## Error Categories
//! 1. **Crypto Errors**: Key derivation, encryption, decryption, rotation
//! 2. **Action Errors**: Unsupported type/action pairs, invalid payloads
//!
//! ## ⚠️ Important Note for Next Developer
//! - NEVER include key material or plaintext secrets in error messages
//! - `Decryption` carries no detail: wrong key and tampering look the same
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use thiserror::Error;

use fleet_common::error::CommonError;

// ============================================
// Result Type Alias
// ============================================

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

// ============================================
// CoreError
// ============================================

/// Core error types for vault cryptography and the action catalog.
#[derive(Error, Debug)]
pub enum CoreError {
    // ========================================
    // Cryptographic Errors
    // ========================================

    /// Key material is unusable.
    #[error("Invalid vault key: {reason}")]
    InvalidKey {
        /// Why the key was rejected
        reason: String,
    },

    /// Key derivation failed.
    #[error("Key derivation failed: {reason}")]
    KeyDerivation {
        /// Why derivation failed
        reason: String,
    },

    /// Encryption operation failed.
    #[error("Encryption failed: {context}")]
    Encryption {
        /// What was being encrypted
        context: String,
    },

    /// No configured key could authenticate the ciphertext.
    #[error("Decryption failed: credential unreadable")]
    Decryption,

    /// Ciphertext blob is not in the expected format.
    #[error("Malformed credential blob: {reason}")]
    MalformedCiphertext {
        /// What's wrong with the blob
        reason: String,
    },

    /// Rotation request conflicts with the key table.
    #[error("Key rotation rejected: {reason}")]
    Rotation {
        /// Why the rotation was refused
        reason: String,
    },

    // ========================================
    // Action Errors
    // ========================================

    /// The type/action pair is not part of the catalog.
    #[error("Unsupported action '{action}' for type '{domain}'")]
    UnsupportedAction {
        /// Requested domain (`users`, `inbounds`)
        domain: String,
        /// Requested verb
        action: String,
    },

    /// Payload does not match the action's schema.
    #[error("Invalid payload for {action}: {reason}")]
    InvalidPayload {
        /// Action signature (`type.action`)
        action: String,
        /// What's wrong with the payload
        reason: String,
    },

    // ========================================
    // Wrapped Errors
    // ========================================

    /// Error from common crate.
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl CoreError {
    // ========================================
    // Convenience Constructors
    // ========================================

    /// Creates an `InvalidKey` error.
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    /// Creates a `MalformedCiphertext` error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedCiphertext {
            reason: reason.into(),
        }
    }

    /// Creates a `Rotation` error.
    pub fn rotation(reason: impl Into<String>) -> Self {
        Self::Rotation {
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidPayload` error.
    pub fn invalid_payload(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `UnsupportedAction` error.
    pub fn unsupported(domain: impl Into<String>, action: impl Into<String>) -> Self {
        Self::UnsupportedAction {
            domain: domain.into(),
            action: action.into(),
        }
    }

    // ========================================
    // Error Classification
    // ========================================

    /// Returns `true` if the stored credential cannot be read back.
    ///
    /// Callers surface this as `credential_status = unreadable`.
    #[must_use]
    pub const fn is_unreadable_credential(&self) -> bool {
        matches!(self, Self::Decryption | Self::MalformedCiphertext { .. })
    }

    /// Returns `true` if this error was caused by a malformed request.
    #[must_use]
    pub const fn is_request_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedAction { .. } | Self::InvalidPayload { .. }
        )
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::unsupported("inbounds", "update");
        assert!(err.to_string().contains("inbounds"));
        assert!(err.to_string().contains("update"));
    }

    #[test]
    fn test_error_classification() {
        assert!(CoreError::Decryption.is_unreadable_credential());
        assert!(CoreError::malformed("no version tag").is_unreadable_credential());
        assert!(!CoreError::invalid_key("short").is_unreadable_credential());
        assert!(CoreError::invalid_payload("users.add", "no clients").is_request_error());
    }

    #[test]
    fn test_common_error_conversion() {
        let common = CommonError::invalid_input("field", "bad value");
        let core: CoreError = common.into();
        assert!(matches!(core, CoreError::Common(_)));
    }
}
