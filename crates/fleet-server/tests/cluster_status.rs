// ============================================
// File: crates/fleet-server/tests/cluster_status.rs
// ============================================
//! Cluster snapshots reaching realtime subscribers.

mod common;

use fleet_server::{ServerConfig, ServerError};
use serde_json::Value;

use common::{harness, ACTOR};

#[tokio::test]
async fn test_subscriber_receives_cluster_status() {
    let h = harness(2, ServerConfig::default()).await;
    h.panel(0).add_client(1, "alice");
    h.panel(0).set_online(&["alice"]);
    h.panel(1).set_unreachable(true);

    let ticket = h.plane.issue_ticket(ACTOR).await;
    let mut subscription = h.plane.subscribe(&ticket.ticket).unwrap();
    assert!(matches!(h.plane.subscribe(&ticket.ticket), Err(ServerError::TicketInvalid)));

    let snapshot = h.plane.cluster_status().await;
    assert_eq!(snapshot.totals.nodes_total, 2);
    assert_eq!(snapshot.totals.nodes_online, 1);
    assert_eq!(snapshot.totals.online_clients, 1);

    let message: Value = serde_json::from_str(&subscription.next().await.unwrap()).unwrap();
    assert_eq!(message["type"], "cluster_status");
    assert_eq!(message["data"]["totals"]["nodesOnline"], 1);
    assert_eq!(message["data"]["nodes"][1]["online"], false);
}

#[tokio::test]
async fn test_late_subscriber_gets_latest_snapshot() {
    let h = harness(1, ServerConfig::default()).await;
    h.plane.cluster_status().await;

    let ticket = h.plane.issue_ticket(ACTOR).await;
    let mut subscription = h.plane.subscribe(&ticket.ticket).unwrap();
    let message: Value = serde_json::from_str(&subscription.next().await.unwrap()).unwrap();
    assert_eq!(message["data"]["totals"]["nodesTotal"], 1);
}
