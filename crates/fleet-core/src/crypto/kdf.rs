// ============================================
// File: crates/fleet-core/src/crypto/kdf.rs
// ============================================
//! # Vault Key Derivation
//!
//! ## Main Functionality
//! - `VaultKey`: 32-byte symmetric key, zeroed on drop
//! - `derive_vault_key`: HKDF-SHA256 over operator key material, bound to
//!   the key version so two versions never share a key
//!
//! ## Last Modified
//! v0.1.0 - Initial vault key derivation

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{CHACHA20_KEY_SIZE, HKDF_INFO_PREFIX, HKDF_SALT};
use crate::error::{CoreError, Result};

/// Minimum accepted length of raw key material.
pub const MIN_KEY_MATERIAL_LEN: usize = 16;

// ============================================
// VaultKey
// ============================================

/// Symmetric key used by the credential vault.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey([u8; CHACHA20_KEY_SIZE]);

impl VaultKey {
    /// Creates a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; CHACHA20_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; CHACHA20_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey([REDACTED])")
    }
}

// ============================================
// Key Derivation
// ============================================

/// Derives the vault key for `version` from operator-supplied key material.
///
/// # Errors
/// Returns `InvalidKey` if the material is shorter than
/// [`MIN_KEY_MATERIAL_LEN`] bytes.
pub fn derive_vault_key(material: &[u8], version: u32) -> Result<VaultKey> {
    if material.len() < MIN_KEY_MATERIAL_LEN {
        return Err(CoreError::invalid_key(format!(
            "key material must be at least {MIN_KEY_MATERIAL_LEN} bytes"
        )));
    }

    let mut info = Vec::with_capacity(HKDF_INFO_PREFIX.len() + 4);
    info.extend_from_slice(HKDF_INFO_PREFIX);
    info.extend_from_slice(&version.to_be_bytes());

    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), material);
    let mut key_bytes = [0u8; CHACHA20_KEY_SIZE];
    hk.expand(&info, &mut key_bytes)
        .map_err(|_| CoreError::KeyDerivation {
            reason: "HKDF expansion failed".into(),
        })?;

    let key = VaultKey::from_bytes(key_bytes);
    key_bytes.zeroize();
    Ok(key)
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let a = derive_vault_key(b"correct horse battery staple", 1).unwrap();
        let b = derive_vault_key(b"correct horse battery staple", 1).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), &[0u8; CHACHA20_KEY_SIZE]);
    }

    #[test]
    fn test_version_changes_key() {
        let v1 = derive_vault_key(b"correct horse battery staple", 1).unwrap();
        let v2 = derive_vault_key(b"correct horse battery staple", 2).unwrap();
        assert_ne!(v1.as_bytes(), v2.as_bytes());
    }

    #[test]
    fn test_short_material_rejected() {
        let result = derive_vault_key(b"short", 1);
        assert!(matches!(result, Err(CoreError::InvalidKey { .. })));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = VaultKey::from_bytes([0x42; CHACHA20_KEY_SIZE]);
        assert_eq!(format!("{key:?}"), "VaultKey([REDACTED])");
    }
}
