// ============================================
// File: crates/fleet-server/src/services/realtime.rs
// ============================================
//! # Realtime Hub
//!
//! ## Creation Reason
//! Dashboards follow cluster status live. Subscribers authenticate once
//! with a short-lived ticket and then receive every published snapshot.
//!
//! ## Main Functionality
//! - `RealtimeHub::issue_ticket`: Single-use subscriber ticket
//! - `RealtimeHub::redeem`: Exchanges a ticket for a [`Subscription`]
//! - `RealtimeHub::publish`: Fans a snapshot out to every subscriber
//!
//! ## Message Format
//! ```text
//! {"type":"cluster_status","data":{ generatedAt, nodes, totals }}
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - A new subscriber first receives the latest snapshot, if any; a
//!   snapshot published while it attaches may arrive twice, never zero times
//! - Slow subscribers skip lagged messages instead of blocking publish
//!
//! ## Last Modified
//! v0.1.0 - Initial realtime hub

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use fleet_common::{random_token, Timestamp};

use crate::config::RealtimeConfig;
use crate::error::{Result, ServerError};
use crate::services::aggregator::ClusterSnapshot;

const TICKET_BYTES: usize = 16;

/// Message type tag for snapshots.
pub const CLUSTER_STATUS: &str = "cluster_status";

/// A minted subscriber ticket.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedTicket {
    /// Opaque ticket.
    pub ticket: String,
    /// Wall-clock expiry.
    pub expires_at: Timestamp,
}

struct PendingTicket {
    actor: String,
    expires_at: Instant,
}

// ============================================
// RealtimeHub
// ============================================

/// Snapshot fan-out with ticket authentication.
pub struct RealtimeHub {
    tickets: DashMap<String, PendingTicket>,
    ttl: Duration,
    sender: broadcast::Sender<Arc<str>>,
    latest: RwLock<Option<Arc<str>>>,
}

impl RealtimeHub {
    /// Creates a hub.
    pub fn new(config: &RealtimeConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            tickets: DashMap::new(),
            ttl: Duration::from_secs(config.ticket_ttl_secs),
            sender,
            latest: RwLock::new(None),
        }
    }

    /// Mints a single-use ticket for `actor`.
    pub fn issue_ticket(&self, actor: &str) -> IssuedTicket {
        let ticket = random_token(TICKET_BYTES);
        self.tickets.insert(
            ticket.clone(),
            PendingTicket {
                actor: actor.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        debug!(actor, "Realtime ticket issued");
        IssuedTicket {
            ticket,
            expires_at: Timestamp::now().plus_secs(self.ttl.as_secs()),
        }
    }

    /// Consumes a ticket and opens a subscription.
    ///
    /// # Errors
    /// `TicketInvalid` if the ticket is unknown, spent or expired.
    pub fn redeem(&self, ticket: &str) -> Result<Subscription> {
        let (_, pending) = self.tickets.remove(ticket).ok_or(ServerError::TicketInvalid)?;
        if Instant::now() >= pending.expires_at {
            return Err(ServerError::TicketInvalid);
        }
        // Attach before reading the latest snapshot so a concurrent publish
        // lands in the receiver if it misses `initial`.
        let receiver = self.sender.subscribe();
        debug!(actor = %pending.actor, "Realtime subscriber attached");
        Ok(Subscription {
            actor: pending.actor,
            initial: self.latest(),
            receiver,
        })
    }

    /// Publishes a snapshot to every subscriber.
    pub fn publish(&self, snapshot: ClusterSnapshot) {
        let message: Arc<str> = match serde_json::to_string(&json!({
            "type": CLUSTER_STATUS,
            "data": snapshot,
        })) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                warn!(error = %e, "Snapshot not serializable");
                return;
            }
        };
        *self.latest.write() = Some(Arc::clone(&message));
        // No receivers is not an error.
        let _ = self.sender.send(message);
    }

    /// Latest published message.
    pub fn latest(&self) -> Option<Arc<str>> {
        self.latest.read().clone()
    }

    /// Drops expired tickets, returning how many were removed.
    pub fn purge_expired_tickets(&self) -> usize {
        let now = Instant::now();
        let before = self.tickets.len();
        self.tickets.retain(|_, t| t.expires_at > now);
        before.saturating_sub(self.tickets.len())
    }

    /// Attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for RealtimeHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeHub")
            .field("pending_tickets", &self.tickets.len())
            .field("subscribers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

// ============================================
// Subscription
// ============================================

/// An attached realtime subscriber.
pub struct Subscription {
    actor: String,
    initial: Option<Arc<str>>,
    receiver: broadcast::Receiver<Arc<str>>,
}

impl Subscription {
    /// Actor the ticket was issued to.
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Waits for the next message; `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<Arc<str>> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(actor = %self.actor, skipped, "Realtime subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("actor", &self.actor)
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::aggregator::ClusterTotals;

    fn snapshot(nodes_total: usize) -> ClusterSnapshot {
        ClusterSnapshot {
            generated_at: Timestamp::now(),
            nodes: Vec::new(),
            totals: ClusterTotals {
                nodes_total,
                ..ClusterTotals::default()
            },
        }
    }

    fn hub() -> RealtimeHub {
        RealtimeHub::new(&RealtimeConfig {
            ticket_ttl_secs: 30,
            channel_capacity: 2,
        })
    }

    #[tokio::test]
    async fn test_ticket_single_use() {
        let hub = hub();
        let issued = hub.issue_ticket("ops");
        let sub = hub.redeem(&issued.ticket).unwrap();
        assert_eq!(sub.actor(), "ops");
        assert!(matches!(hub.redeem(&issued.ticket), Err(ServerError::TicketInvalid)));
        assert!(matches!(hub.redeem("bogus"), Err(ServerError::TicketInvalid)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticket_expiry() {
        let hub = hub();
        let stale = hub.issue_ticket("ops");
        let other = hub.issue_ticket("ops");
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(hub.redeem(&stale.ticket), Err(ServerError::TicketInvalid)));
        assert_eq!(hub.purge_expired_tickets(), 1);
        assert!(hub.redeem(&other.ticket).is_err());
    }

    #[tokio::test]
    async fn test_initial_then_live() {
        let hub = hub();
        hub.publish(snapshot(1));
        let ticket = hub.issue_ticket("ops").ticket;
        let mut sub = hub.redeem(&ticket).unwrap();

        let first: serde_json::Value = serde_json::from_str(&sub.next().await.unwrap()).unwrap();
        assert_eq!(first["type"], CLUSTER_STATUS);
        assert_eq!(first["data"]["totals"]["nodesTotal"], 1);

        hub.publish(snapshot(2));
        let second: serde_json::Value = serde_json::from_str(&sub.next().await.unwrap()).unwrap();
        assert_eq!(second["data"]["totals"]["nodesTotal"], 2);
    }

    #[test]
    fn test_subscriber_attached_during_publish_sees_final_snapshot() {
        let hub = Arc::new(hub());
        let publisher = {
            let hub = Arc::clone(&hub);
            std::thread::spawn(move || {
                for n in 1..=500 {
                    hub.publish(snapshot(n));
                }
            })
        };
        let mut subs = Vec::new();
        while !publisher.is_finished() {
            let ticket = hub.issue_ticket("ops").ticket;
            subs.push(hub.redeem(&ticket).unwrap());
        }
        publisher.join().unwrap();

        let latest = hub.latest();
        for mut sub in subs {
            let mut seen = sub.initial.take();
            loop {
                match sub.receiver.try_recv() {
                    Ok(message) => seen = Some(message),
                    Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                    Err(_) => break,
                }
            }
            assert_eq!(seen.as_deref(), latest.as_deref());
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_ahead() {
        let hub = hub();
        let ticket = hub.issue_ticket("ops").ticket;
        let mut sub = hub.redeem(&ticket).unwrap();
        for n in 1..=5 {
            hub.publish(snapshot(n));
        }
        let next: serde_json::Value = serde_json::from_str(&sub.next().await.unwrap()).unwrap();
        assert_eq!(next["data"]["totals"]["nodesTotal"], 4);
    }
}
