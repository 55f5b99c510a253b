// ============================================
// File: crates/fleet-core/src/crypto/vault.rs
// ============================================
//! # Credential Vault
//!
//! ## Creation Reason
//! Node login secrets are persisted alongside node records; they must be
//! unreadable without the operator key and must survive key rotation.
//!
//! ## Main Functionality
//! - `SealedSecret`: Versioned ciphertext blob as stored on a node record
//! - `CredentialVault`: Encrypt/decrypt against a versioned key ring
//! - `Decrypted`: Plaintext plus the key version that opened it
//!
//! ## Blob Format
//! ```text
//! v{version}:{base64(nonce[12] || ciphertext || tag[16])}
//! ```
//!
//! ## Key Ring
//! ```text
//! current ──► v3  (encrypts everything new)
//!             v2  (decrypt only)
//!             v1  (decrypt only, until retired)
//! ```
//! Decrypt tries the version tagged in the blob first, then every other key
//! newest to oldest. Opening a blob with anything but the current key
//! reports `stale = true`; re-sealing is the caller's decision.
//!
//! ## ⚠️ Important Note for Next Developer
//! - `decrypt` never writes anything; it is safe to call from any read path
//! - The ring lock is held only for the AEAD call, never across `.await`
//! - Plaintext is returned in `Zeroizing<String>`; don't clone it into
//!   long-lived structures
//!
//! ## Last Modified
//! v0.1.0 - Initial vault with rotation

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::kdf::{derive_vault_key, VaultKey};
use super::{CHACHA20_NONCE_SIZE, CREDENTIAL_AAD, POLY1305_TAG_SIZE};
use crate::error::{CoreError, Result};

// ============================================
// SealedSecret
// ============================================

/// An encrypted credential as stored on a node record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedSecret(String);

impl SealedSecret {
    /// Wraps a stored blob without checking it.
    #[must_use]
    pub fn from_stored(blob: impl Into<String>) -> Self {
        Self(blob.into())
    }

    /// Returns the stored blob.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the key version tagged in the blob, if the tag parses.
    #[must_use]
    pub fn key_version(&self) -> Option<u32> {
        self.split().ok().map(|(version, _)| version)
    }

    fn split(&self) -> Result<(u32, &str)> {
        let rest = self
            .0
            .strip_prefix('v')
            .ok_or_else(|| CoreError::malformed("missing version tag"))?;
        let (version, body) = rest
            .split_once(':')
            .ok_or_else(|| CoreError::malformed("missing ':' separator"))?;
        let version = version
            .parse::<u32>()
            .map_err(|_| CoreError::malformed("version tag is not a number"))?;
        Ok((version, body))
    }
}

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key_version() {
            Some(v) => write!(f, "SealedSecret(v{v})"),
            None => f.write_str("SealedSecret(?)"),
        }
    }
}

// ============================================
// Decrypted
// ============================================

/// Result of a successful decryption.
pub struct Decrypted {
    /// The recovered secret.
    pub plaintext: Zeroizing<String>,
    /// Version of the key that authenticated the blob.
    pub key_version: u32,
    /// `true` if the blob was not sealed under the current key.
    pub stale: bool,
}

impl fmt::Debug for Decrypted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decrypted")
            .field("plaintext", &"[REDACTED]")
            .field("key_version", &self.key_version)
            .field("stale", &self.stale)
            .finish()
    }
}

// ============================================
// CredentialVault
// ============================================

struct KeyRing {
    current: u32,
    keys: BTreeMap<u32, VaultKey>,
}

/// Versioned authenticated-encryption vault for node credentials.
///
/// # Example
/// ```
/// use fleet_core::crypto::CredentialVault;
///
/// let vault = CredentialVault::from_material(b"an operator supplied key", 1).unwrap();
/// let sealed = vault.encrypt("s3cret").unwrap();
/// let opened = vault.decrypt(&sealed).unwrap();
/// assert_eq!(opened.plaintext.as_str(), "s3cret");
/// assert!(!opened.stale);
/// ```
pub struct CredentialVault {
    ring: RwLock<KeyRing>,
}

impl CredentialVault {
    /// Creates a vault whose current key is `key` at `version`.
    #[must_use]
    pub fn new(version: u32, key: VaultKey) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(version, key);
        Self {
            ring: RwLock::new(KeyRing {
                current: version,
                keys,
            }),
        }
    }

    /// Derives the current key from operator key material.
    ///
    /// # Errors
    /// Returns `InvalidKey` if the material is too short.
    pub fn from_material(material: &[u8], version: u32) -> Result<Self> {
        Ok(Self::new(version, derive_vault_key(material, version)?))
    }

    /// Adds a decrypt-only key for blobs sealed under an older version.
    ///
    /// # Errors
    /// Returns `Rotation` if the version is already present.
    pub fn add_previous(&self, version: u32, material: &[u8]) -> Result<()> {
        let key = derive_vault_key(material, version)?;
        let mut ring = self.ring.write();
        if ring.keys.contains_key(&version) {
            return Err(CoreError::rotation(format!("key v{version} already loaded")));
        }
        ring.keys.insert(version, key);
        Ok(())
    }

    /// Returns the version new blobs are sealed under.
    #[must_use]
    pub fn current_version(&self) -> u32 {
        self.ring.read().current
    }

    /// Returns every loaded key version, oldest first.
    #[must_use]
    pub fn versions(&self) -> Vec<u32> {
        self.ring.read().keys.keys().copied().collect()
    }

    /// Seals `plaintext` under the current key.
    ///
    /// # Errors
    /// Returns `Encryption` if the AEAD operation fails.
    pub fn encrypt(&self, plaintext: &str) -> Result<SealedSecret> {
        let ring = self.ring.read();
        let key = ring
            .keys
            .get(&ring.current)
            .ok_or_else(|| CoreError::Encryption {
                context: "current key missing from ring".into(),
            })?;
        let blob = seal(key, plaintext.as_bytes())?;
        Ok(SealedSecret(format!("v{}:{}", ring.current, BASE64.encode(blob))))
    }

    /// Opens a sealed secret.
    ///
    /// # Errors
    /// - `MalformedCiphertext` if the blob cannot be parsed
    /// - `Decryption` if no loaded key authenticates it
    pub fn decrypt(&self, sealed: &SealedSecret) -> Result<Decrypted> {
        let (tagged, body) = sealed.split()?;
        let raw = BASE64
            .decode(body)
            .map_err(|_| CoreError::malformed("body is not base64"))?;
        if raw.len() < CHACHA20_NONCE_SIZE + POLY1305_TAG_SIZE {
            return Err(CoreError::malformed("blob too short"));
        }

        let ring = self.ring.read();
        let mut order: Vec<u32> = Vec::with_capacity(ring.keys.len());
        if ring.keys.contains_key(&tagged) {
            order.push(tagged);
        }
        order.extend(ring.keys.keys().rev().copied().filter(|v| *v != tagged));

        for version in order {
            let Some(key) = ring.keys.get(&version) else {
                continue;
            };
            if let Ok(bytes) = open(key, &raw) {
                let plaintext = String::from_utf8(bytes).map_err(|_| CoreError::Decryption)?;
                return Ok(Decrypted {
                    plaintext: Zeroizing::new(plaintext),
                    key_version: version,
                    stale: version != ring.current,
                });
            }
        }
        Err(CoreError::Decryption)
    }

    /// Re-seals a secret under the current key.
    ///
    /// # Errors
    /// Propagates decryption and encryption errors.
    pub fn reencrypt(&self, sealed: &SealedSecret) -> Result<SealedSecret> {
        let opened = self.decrypt(sealed)?;
        self.encrypt(&opened.plaintext)
    }

    /// Installs a new current key derived from `material`.
    ///
    /// The previous current key stays loaded for decryption.
    ///
    /// # Errors
    /// Returns `Rotation` unless `new_version` is newer than every loaded key.
    pub fn rotate(&self, new_version: u32, material: &[u8]) -> Result<()> {
        let key = derive_vault_key(material, new_version)?;
        let mut ring = self.ring.write();
        if ring.keys.keys().next_back().is_some_and(|v| *v >= new_version) {
            return Err(CoreError::rotation(format!(
                "v{new_version} is not newer than the loaded keys"
            )));
        }
        ring.keys.insert(new_version, key);
        let previous = std::mem::replace(&mut ring.current, new_version);
        drop(ring);

        info!(previous, current = new_version, "Vault key rotated");
        Ok(())
    }

    /// Drops a decrypt-only key.
    ///
    /// # Errors
    /// Returns `Rotation` for the current key or an unknown version.
    pub fn retire(&self, version: u32) -> Result<()> {
        let mut ring = self.ring.write();
        if ring.current == version {
            return Err(CoreError::rotation("cannot retire the current key"));
        }
        if ring.keys.remove(&version).is_none() {
            return Err(CoreError::rotation(format!("key v{version} is not loaded")));
        }
        debug!(version, "Vault key retired");
        Ok(())
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.read();
        f.debug_struct("CredentialVault")
            .field("current", &ring.current)
            .field("versions", &ring.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================
// AEAD helpers
// ============================================

fn seal(key: &VaultKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| {
        CoreError::Encryption {
            context: "Failed to create cipher".into(),
        }
    })?;

    let mut nonce = [0u8; CHACHA20_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: CREDENTIAL_AAD,
            },
        )
        .map_err(|_| CoreError::Encryption {
            context: "ChaCha20-Poly1305 encryption failed".into(),
        })?;

    let mut out = Vec::with_capacity(CHACHA20_NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &VaultKey, raw: &[u8]) -> Result<Vec<u8>> {
    let (nonce, ciphertext) = raw.split_at(CHACHA20_NONCE_SIZE);
    let cipher =
        ChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| CoreError::Decryption)?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: CREDENTIAL_AAD,
            },
        )
        .map_err(|_| CoreError::Decryption)
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    const MATERIAL_V1: &[u8] = b"first operator key material";
    const MATERIAL_V2: &[u8] = b"second operator key material";

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let vault = CredentialVault::from_material(MATERIAL_V1, 1).unwrap();
        let sealed = vault.encrypt("hunter2").unwrap();

        assert!(sealed.as_str().starts_with("v1:"));
        assert!(!sealed.as_str().contains("hunter2"));

        let opened = vault.decrypt(&sealed).unwrap();
        assert_eq!(opened.plaintext.as_str(), "hunter2");
        assert_eq!(opened.key_version, 1);
        assert!(!opened.stale);
    }

    #[test]
    fn test_nonce_is_random() {
        let vault = CredentialVault::from_material(MATERIAL_V1, 1).unwrap();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_blob_fails() {
        let vault = CredentialVault::from_material(MATERIAL_V1, 1).unwrap();
        let sealed = vault.encrypt("hunter2").unwrap();

        let (_, body) = sealed.as_str().split_once(':').unwrap();
        let mut raw = BASE64.decode(body).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = SealedSecret::from_stored(format!("v1:{}", BASE64.encode(raw)));

        assert!(matches!(vault.decrypt(&tampered), Err(CoreError::Decryption)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = CredentialVault::from_material(MATERIAL_V1, 1).unwrap();
        let b = CredentialVault::from_material(MATERIAL_V2, 1).unwrap();
        let sealed = a.encrypt("hunter2").unwrap();
        let err = b.decrypt(&sealed).unwrap_err();
        assert!(err.is_unreadable_credential());
    }

    #[test]
    fn test_malformed_blobs() {
        let vault = CredentialVault::from_material(MATERIAL_V1, 1).unwrap();
        for blob in ["", "plain", "vX:abcd", "v1-abcd", "v1:!!!", "v1:AAAA"] {
            let err = vault.decrypt(&SealedSecret::from_stored(blob)).unwrap_err();
            assert!(
                matches!(err, CoreError::MalformedCiphertext { .. }),
                "blob {blob:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_rotation_reports_stale_and_reencrypts() {
        let vault = CredentialVault::from_material(MATERIAL_V1, 1).unwrap();
        let old = vault.encrypt("hunter2").unwrap();

        vault.rotate(2, MATERIAL_V2).unwrap();
        assert_eq!(vault.current_version(), 2);

        let opened = vault.decrypt(&old).unwrap();
        assert_eq!(opened.plaintext.as_str(), "hunter2");
        assert_eq!(opened.key_version, 1);
        assert!(opened.stale);

        let fresh = vault.reencrypt(&old).unwrap();
        assert_eq!(fresh.key_version(), Some(2));
        assert!(!vault.decrypt(&fresh).unwrap().stale);
    }

    #[test]
    fn test_mislabeled_version_still_opens() {
        let vault = CredentialVault::from_material(MATERIAL_V1, 1).unwrap();
        let sealed = vault.encrypt("hunter2").unwrap();
        vault.rotate(2, MATERIAL_V2).unwrap();

        let relabeled =
            SealedSecret::from_stored(sealed.as_str().replacen("v1:", "v2:", 1));
        let opened = vault.decrypt(&relabeled).unwrap();
        assert_eq!(opened.key_version, 1);
        assert!(opened.stale);
    }

    #[test]
    fn test_rotation_must_move_forward() {
        let vault = CredentialVault::from_material(MATERIAL_V1, 3).unwrap();
        assert!(matches!(
            vault.rotate(2, MATERIAL_V2),
            Err(CoreError::Rotation { .. })
        ));
        assert!(vault.rotate(3, MATERIAL_V2).is_err());
        assert_eq!(vault.current_version(), 3);
    }

    #[test]
    fn test_retire() {
        let vault = CredentialVault::from_material(MATERIAL_V1, 1).unwrap();
        let old = vault.encrypt("hunter2").unwrap();
        vault.rotate(2, MATERIAL_V2).unwrap();

        assert!(vault.retire(2).is_err());
        vault.retire(1).unwrap();
        assert_eq!(vault.versions(), vec![2]);
        assert!(matches!(vault.decrypt(&old), Err(CoreError::Decryption)));
    }

    #[test]
    fn test_add_previous() {
        let old_vault = CredentialVault::from_material(MATERIAL_V1, 1).unwrap();
        let sealed = old_vault.encrypt("hunter2").unwrap();

        let vault = CredentialVault::from_material(MATERIAL_V2, 2).unwrap();
        vault.add_previous(1, MATERIAL_V1).unwrap();
        assert!(vault.add_previous(1, MATERIAL_V1).is_err());

        let opened = vault.decrypt(&sealed).unwrap();
        assert!(opened.stale);
    }

    #[test]
    fn test_debug_hides_secret() {
        let vault = CredentialVault::from_material(MATERIAL_V1, 1).unwrap();
        let opened = vault.decrypt(&vault.encrypt("hunter2").unwrap()).unwrap();
        assert!(!format!("{opened:?}").contains("hunter2"));
    }
}
