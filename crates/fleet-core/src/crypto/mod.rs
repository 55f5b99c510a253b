// ============================================
// File: crates/fleet-core/src/crypto/mod.rs
// ============================================
//! # Cryptography Module
//!
//! ## Creation Reason
//! Centralizes the credential cryptography of the control plane: node login
//! secrets are stored only as authenticated ciphertext.
//!
//! ## Main Functionality
//! - [`kdf`]: Vault key type and HKDF-SHA256 derivation from key material
//! - [`vault`]: Versioned ChaCha20-Poly1305 credential vault with rotation
//!
//! ## Cryptographic Design
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  key material (config / env) ──► HKDF-SHA256 ──► VaultKey   │
//! │                                    (per version)            │
//! │                                                             │
//! │  secret ──► ChaCha20-Poly1305(VaultKey, random nonce)       │
//! │         ──► "v{version}:" || base64(nonce || ct || tag)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - ALL implementations use RustCrypto (audited)
//! - Nonces are random per encryption; never derive them from counters here,
//!   blobs outlive any process-local counter
//! - ALL key types implement Zeroize
//!
//! ## Last Modified
//! v0.1.0 - Initial vault crypto

pub mod kdf;
pub mod vault;

pub use kdf::{derive_vault_key, VaultKey};
pub use vault::{CredentialVault, Decrypted, SealedSecret};

// ============================================
// Constants
// ============================================

/// Size of ChaCha20-Poly1305 key in bytes.
pub const CHACHA20_KEY_SIZE: usize = 32;

/// Size of ChaCha20-Poly1305 nonce in bytes.
pub const CHACHA20_NONCE_SIZE: usize = 12;

/// Size of Poly1305 authentication tag in bytes.
pub const POLY1305_TAG_SIZE: usize = 16;

/// HKDF salt for vault key derivation.
pub const HKDF_SALT: &[u8] = b"fleet-vault-v1";

/// HKDF info prefix for vault key derivation.
pub const HKDF_INFO_PREFIX: &[u8] = b"fleet-credential-key";

/// Associated data bound into every credential ciphertext.
pub const CREDENTIAL_AAD: &[u8] = b"fleet-node-credential";
