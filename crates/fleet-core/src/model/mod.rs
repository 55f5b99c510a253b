// ============================================
// File: crates/fleet-core/src/model/mod.rs
// ============================================
//! # Domain Model
//!
//! ## Main Functionality
//! - [`node`]: Managed node records and operator input
//! - [`job`]: Batch requests, per-step results, jobs and retry descriptors
//! - [`audit`]: Audit events and redaction
//!
//! ## ⚠️ Important Note for Next Developer
//! - Everything here is persisted as camelCase JSON; renaming a field is a
//!   storage migration

pub mod audit;
pub mod job;
pub mod node;

pub use audit::{redact_text, redact_value, AuditEvent, AuditOutcome};
pub use job::{
    BatchRequest, GroupBy, Job, JobSummary, ResultStatus, RetryGroup, RetryInfo, RetryUnit,
    TargetResult, TargetSelector,
};
pub use node::{CredentialStatus, Node, NodeDraft, NodeHealth, NodeUpdate};
