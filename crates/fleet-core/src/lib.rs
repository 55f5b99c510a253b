// ============================================
// File: crates/fleet-core/src/lib.rs
// ============================================
//! # Fleet Core - Credential Crypto and Domain Model
//!
//! ## Creation Reason
//! Holds everything the control plane reasons about without doing I/O:
//! the credential vault, node/job/audit records and the batch action
//! catalog.
//!
//! ## Main Functionality
//! - [`crypto`]: ChaCha20-Poly1305 credential vault with versioned keys
//! - [`model`]: Node, job, audit records
//! - [`action`]: Closed `type.action` catalog with typed payloads
//! - [`error`]: Core error types
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                fleet-server                         │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                     │
//! │         ▼                     ▼                     │
//! │     fleet-core  ◄──     fleet-transport             │
//! │         │   You are here      │                     │
//! │         └──────────┬──────────┘                     │
//! │                    ▼                                │
//! │              fleet-common                           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - No async, no network, no filesystem in this crate
//! - Key material and plaintext secrets never appear in `Debug` output
//!
//! ## Last Modified
//! v0.1.0 - Initial implementation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod action;
pub mod crypto;
pub mod error;
pub mod model;

pub use action::{ActionDomain, ActionVerb, BatchAction, StepScope};
pub use crypto::{CredentialVault, SealedSecret};
pub use error::{CoreError, Result};
