// ============================================
// File: crates/fleet-common/src/lib.rs
// ============================================
//! # Fleet Common - Shared Utilities Library
//!
//! ## Creation Reason
//! Provides foundational types and utilities shared across all fleet crates,
//! keeping identifiers, timestamps and base errors consistent.
//!
//! ## Main Functionality
//! - [`types`]: Identifier types (`NodeId`, `JobId`) and random tokens
//! - [`time`]: Unix timestamps
//! - [`error`]: Common error types and result aliases
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                fleet-server                         │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                     │
//! │         ▼                     ▼                     │
//! │     fleet-core         fleet-transport              │
//! │         │                     │                     │
//! │         └──────────┬──────────┘                     │
//! │                    ▼                                │
//! │              fleet-common  ◄── You are here         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - This crate is the foundation - changes affect everything
//! - Keep dependencies minimal
//! - Identifiers are plain strings on the wire; keep the formats stable,
//!   persisted job and node records depend on them
//!
//! ## Last Modified
//! v0.1.0 - Initial implementation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod time;
pub mod types;

// Re-export commonly used items at crate root
pub use error::{CommonError, Result};
pub use time::Timestamp;
pub use types::{random_token, JobId, NodeId};
