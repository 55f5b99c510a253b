// ============================================
// File: crates/fleet-server/src/services/audit.rs
// ============================================
//! # Audit Sink
//!
//! ## Creation Reason
//! Security-relevant actions (batches, risk decisions, node and credential
//! changes, connection tests) are appended to a durable, redacted log.
//!
//! ## Main Functionality
//! - `AuditSink`: Append-only sink trait used by every service
//! - `StoreAuditSink`: Record-store backed sink with filtered reads
//!
//! ## ⚠️ Important Note for Next Developer
//! - `record` never fails outward: an audit write failure is logged and
//!   must not turn a completed batch into an error
//! - Events are redacted when built (`AuditEvent::with_detail`)
//! - Keys embed a millisecond stamp and a sequence so listing order is
//!   append order
//!
//! ## Last Modified
//! v0.1.0 - Initial audit sink

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use fleet_common::time::unix_timestamp_millis;
use fleet_common::{random_token, NodeId};
use fleet_core::model::{AuditEvent, AuditOutcome};

use crate::error::Result;
use crate::store::{list_records, put_record, RecordStore};

const AUDIT_PREFIX: &str = "audit/";

// ============================================
// AuditSink Trait
// ============================================

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    /// Appends an event. Failures are logged, not returned.
    async fn record(&self, event: AuditEvent);
}

/// Audit list filter; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Event type prefix, e.g. `batch.` or `node.test`.
    pub event_type: Option<String>,
    /// Actor.
    pub actor: Option<String>,
    /// Node.
    pub server_id: Option<NodeId>,
    /// Outcome.
    pub outcome: Option<AuditOutcome>,
}

impl AuditFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        self.event_type
            .as_deref()
            .map_or(true, |p| event.event_type.starts_with(p))
            && self.actor.as_deref().map_or(true, |a| event.actor == a)
            && self
                .server_id
                .as_ref()
                .map_or(true, |s| event.server_id.as_ref() == Some(s))
            && self.outcome.map_or(true, |o| event.outcome == o)
    }
}

// ============================================
// StoreAuditSink
// ============================================

/// Audit log kept in the record store.
pub struct StoreAuditSink {
    store: Arc<dyn RecordStore>,
    seq: AtomicU64,
    instance: String,
}

impl StoreAuditSink {
    /// Creates a sink.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            seq: AtomicU64::new(0),
            instance: random_token(2),
        }
    }

    fn next_key(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "{AUDIT_PREFIX}{:013x}-{seq:08x}-{}",
            unix_timestamp_millis(),
            self.instance
        )
    }

    /// Returns matching events, newest first, at most `limit`.
    ///
    /// # Errors
    /// `Store` on backend failure.
    pub async fn list(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditEvent>> {
        let mut events: Vec<AuditEvent> = list_records::<AuditEvent>(self.store.as_ref(), AUDIT_PREFIX)
            .await?
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| filter.matches(e))
            .collect();
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    /// Deletes every event, returning how many were removed.
    ///
    /// # Errors
    /// `Store` on backend failure.
    pub async fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for (key, _) in self.store.list(AUDIT_PREFIX).await? {
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl AuditSink for StoreAuditSink {
    async fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            event_type = %event.event_type,
            actor = %event.actor,
            outcome = ?event.outcome,
            server_id = event.server_id.as_ref().map(NodeId::as_str),
            "Audit event"
        );
        let key = self.next_key();
        if let Err(e) = put_record(self.store.as_ref(), &key, &event).await {
            error!(event_type = %event.event_type, error = %e, "Audit write failed");
        }
    }
}

impl std::fmt::Debug for StoreAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreAuditSink")
            .field("written", &self.seq.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::store::MemoryStore;

    fn sink() -> StoreAuditSink {
        StoreAuditSink::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_append_order_and_filter() {
        let sink = sink();
        sink.record(AuditEvent::new("alice", "node.add", AuditOutcome::Success)).await;
        sink.record(AuditEvent::new("bob", "batch.execute", AuditOutcome::Failed)).await;
        sink.record(AuditEvent::new("alice", "batch.rejected", AuditOutcome::Failed)).await;

        let all = sink.list(&AuditFilter::default(), 10).await.unwrap();
        let types: Vec<&str> = all.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["batch.rejected", "batch.execute", "node.add"]);

        let batches = sink
            .list(
                &AuditFilter {
                    event_type: Some("batch.".into()),
                    actor: Some("alice".into()),
                    ..AuditFilter::default()
                },
                10,
            )
            .await
            .unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].event_type, "batch.rejected");
    }

    #[tokio::test]
    async fn test_stored_events_are_redacted() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let sink = StoreAuditSink::new(Arc::clone(&store));
        sink.record(
            AuditEvent::new("ops", "node.update", AuditOutcome::Success)
                .with_detail(json!({"password": "hunter2", "name": "edge"})),
        )
        .await;

        let raw = store.list(AUDIT_PREFIX).await.unwrap();
        assert_eq!(raw.len(), 1);
        assert!(!raw[0].1.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_clear_and_limit() {
        let sink = sink();
        for _ in 0..5 {
            sink.record(AuditEvent::new("ops", "node.test", AuditOutcome::Info)).await;
        }
        assert_eq!(sink.list(&AuditFilter::default(), 2).await.unwrap().len(), 2);
        assert_eq!(sink.clear().await.unwrap(), 5);
        assert!(sink.list(&AuditFilter::default(), 10).await.unwrap().is_empty());
    }
}
