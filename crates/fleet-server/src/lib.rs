// ============================================
// File: crates/fleet-server/src/lib.rs
// ============================================
//! # Fleet Control Plane Library
//!
//! ## Creation Reason
//! Provides the control plane that administers a fleet of remote proxy
//! panels: node registry, sealed credentials, batch execution with
//! retry-by-regrouping, job history, audit and live cluster status.
//!
//! ## Main Functionality
//!
//! ### Modules
//! - [`config`]: TOML configuration
//! - [`server`]: Service wiring and lifecycle ([`ControlPlane`])
//! - [`services`]: Business logic services
//!   - [`services::registry`]: Node records and credentials
//!   - [`services::session`]: Panel sessions
//!   - [`services::engine`]: Batch execution
//!   - [`services::retry`]: Retry planning
//!   - [`services::risk`]: Confirmation tokens
//!   - [`services::jobs`]: Job history
//!   - [`services::audit`]: Audit log
//!   - [`services::aggregator`]: Cluster status
//!   - [`services::realtime`]: Snapshot fan-out
//! - [`store`]: Record store backends
//! - [`error`]: Server-specific error types
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Fleet Control Plane                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐     ┌──────────────┐     ┌─────────────────┐   │
//! │  │   Config    │────►│ ControlPlane │────►│   Audit Sink    │   │
//! │  └─────────────┘     └──────┬───────┘     └─────────────────┘   │
//! │                             │                                   │
//! │         ┌───────────────────┼────────────────────┐              │
//! │         ▼                   ▼                    ▼              │
//! │  ┌─────────────┐     ┌─────────────┐     ┌──────────────┐       │
//! │  │  Execution  │     │  Job Store  │     │  Aggregator  │       │
//! │  │   Engine    │     │             │     │ + Realtime   │       │
//! │  └──────┬──────┘     └─────────────┘     └──────┬───────┘       │
//! │         └──────────────┬────────────────────────┘               │
//! │                        ▼                                        │
//! │               ┌─────────────────┐     ┌─────────────────┐       │
//! │               │ Session Manager │────►│  Node Registry  │       │
//! │               └────────┬────────┘     │  + Vault        │       │
//! │                        │              └─────────────────┘       │
//! ├────────────────────────┼────────────────────────────────────────┤
//! │                        ▼      Transport Layer                   │
//! │          PanelTransport (HTTP to panels, or mock fleet)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Per-node failures are job results, never errors
//! - Secrets are sealed at rest and redacted from logs and audit
//! - Configuration changes require restart (no hot-reload)
//!
//! ## Last Modified
//! v0.1.0 - Initial control plane library

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod server;
pub mod services;
pub mod store;

// Re-export primary types
pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use server::ControlPlane;
