// ============================================
// File: crates/fleet-server/src/services/mod.rs
// ============================================
//! # Control Plane Services
//!
//! ## Creation Reason
//! Holds the business logic of the control plane, separated from the
//! panel protocol and the record store.
//!
//! ## Main Functionality
//!
//! ### Submodules
//! - [`registry`]: Node records and sealed credentials
//! - [`session`]: Per-node panel sessions with single-flight login
//! - [`actions`]: Maps one batch step to panel calls
//! - [`risk`]: High-risk classification and confirmation tokens
//! - [`engine`]: Bounded fan-out of batches over nodes
//! - [`retry`]: Child batches derived from failed results
//! - [`jobs`]: Persisted batch history
//! - [`audit`]: Redacted audit log
//! - [`aggregator`]: Periodic cluster status polling
//! - [`realtime`]: Ticketed snapshot fan-out
//!
//! ## Service Architecture
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Service Layer                          │
//! ├───────────────────────────────────────────────────────────────┤
//! │  RiskGate ◄── ExecutionEngine ──► JobStore     AuditSink ◄─┐  │
//! │                   │   ▲                                    │  │
//! │                   │   └── retry::plan_retry                │  │
//! │                   ▼                                        │  │
//! │              actions::run_step ──► NodeSessionManager ─────┘  │
//! │                                        │    ▲                 │
//! │                                        ▼    │                 │
//! │                               NodeRegistry  ClusterAggregator │
//! │                                                   │           │
//! │                                                   ▼           │
//! │                                              RealtimeHub      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Every remote call goes through `NodeSessionManager::invoke`
//! - Services are `Send + Sync` and shared behind `Arc`
//!
//! ## Last Modified
//! v0.1.0 - Initial services structure

pub mod actions;
pub mod aggregator;
pub mod audit;
pub mod engine;
pub mod jobs;
pub mod realtime;
pub mod registry;
pub mod retry;
pub mod risk;
pub mod session;

// Re-export primary types
pub use aggregator::{ClusterAggregator, ClusterSnapshot, ClusterTotals, NodeStatus};
pub use audit::{AuditFilter, AuditSink, StoreAuditSink};
pub use engine::ExecutionEngine;
pub use jobs::{JobFilter, JobPage, JobStore};
pub use realtime::{IssuedTicket, RealtimeHub, Subscription};
pub use registry::{NodeRegistry, ReencryptReport};
pub use retry::{RetryOptions, RetryPlan};
pub use risk::{IssuedToken, RiskGate, RiskLevel, TokenScope};
pub use session::{NodeSessionManager, ProbeReport};
