// ============================================
// File: crates/fleet-server/src/services/aggregator.rs
// ============================================
//! # Cluster Status Aggregator
//!
//! ## Creation Reason
//! Periodically polls every node's panel and folds the answers into one
//! cluster snapshot for dashboards and the realtime channel.
//!
//! ## Main Functionality
//! - `ClusterAggregator::collect`: One bounded, best-effort polling pass
//! - `ClusterAggregator::run`: Interval loop publishing to the
//!   [`RealtimeHub`] until shutdown
//! - `ClusterSnapshot`: Per-node status plus fleet totals
//!
//! ## Per-Node Poll
//! ```text
//! GET  /panel/api/server/status   cpu, mem, uptime, xray state   (required)
//! POST /panel/api/inbounds/onlines online client emails            (optional)
//! GET  /panel/api/inbounds/list   inbound counts and traffic       (optional)
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - A failed status read marks the node offline in the snapshot; the
//!   optional reads only zero their own figures
//! - Nodes in maintenance are listed but never polled
//! - Polls go through the session manager, so they share batch sessions
//! - Each node poll has its own deadline; shutdown drops an unfinished pass
//!
//! ## Last Modified
//! v0.1.0 - Initial aggregator

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use fleet_common::{NodeId, Timestamp};
use fleet_core::model::{redact_text, Node, NodeHealth};
use fleet_transport::RemoteRequest;

use crate::config::AggregatorConfig;
use crate::services::realtime::RealtimeHub;
use crate::services::registry::NodeRegistry;
use crate::services::session::{NodeSessionManager, STATUS_PATH};

const ONLINES_PATH: &str = "/panel/api/inbounds/onlines";
const LIST_PATH: &str = "/panel/api/inbounds/list";

// ============================================
// Snapshot Types
// ============================================

/// One node's polled status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Node id.
    pub id: NodeId,
    /// Display name.
    pub name: String,
    /// Status read succeeded this pass.
    pub online: bool,
    /// Registry health after the poll.
    pub health: NodeHealth,
    /// CPU percent.
    pub cpu: Option<f64>,
    /// Memory in use, bytes.
    pub mem_used: Option<u64>,
    /// Memory total, bytes.
    pub mem_total: Option<u64>,
    /// Panel host uptime, seconds.
    pub uptime_secs: Option<u64>,
    /// Proxy core state (`running`, `stop`, ...).
    pub xray_state: Option<String>,
    /// Online client sessions.
    pub online_clients: usize,
    /// Inbounds defined.
    pub inbounds_total: usize,
    /// Inbounds enabled.
    pub inbounds_active: usize,
    /// Upload bytes over all inbounds.
    pub traffic_up: u64,
    /// Download bytes over all inbounds.
    pub traffic_down: u64,
    /// Sanitized failure text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeStatus {
    fn unpolled(id: NodeId, name: String, health: NodeHealth) -> Self {
        Self {
            id,
            name,
            online: false,
            health,
            cpu: None,
            mem_used: None,
            mem_total: None,
            uptime_secs: None,
            xray_state: None,
            online_clients: 0,
            inbounds_total: 0,
            inbounds_active: 0,
            traffic_up: 0,
            traffic_down: 0,
            error: None,
        }
    }
}

/// Fleet-wide totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTotals {
    /// Registered nodes.
    pub nodes_total: usize,
    /// Nodes whose status read succeeded.
    pub nodes_online: usize,
    /// Online client sessions.
    pub online_clients: usize,
    /// Inbounds defined.
    pub inbounds_total: usize,
    /// Inbounds enabled.
    pub inbounds_active: usize,
    /// Upload bytes.
    pub traffic_up: u64,
    /// Download bytes.
    pub traffic_down: u64,
}

impl ClusterTotals {
    fn from_nodes(nodes: &[NodeStatus]) -> Self {
        nodes.iter().fold(
            Self {
                nodes_total: nodes.len(),
                ..Self::default()
            },
            |mut acc, n| {
                acc.nodes_online += usize::from(n.online);
                acc.online_clients += n.online_clients;
                acc.inbounds_total += n.inbounds_total;
                acc.inbounds_active += n.inbounds_active;
                acc.traffic_up = acc.traffic_up.saturating_add(n.traffic_up);
                acc.traffic_down = acc.traffic_down.saturating_add(n.traffic_down);
                acc
            },
        )
    }
}

/// One aggregation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    /// When the pass finished.
    pub generated_at: Timestamp,
    /// Per-node status, ordered by id.
    pub nodes: Vec<NodeStatus>,
    /// Totals over `nodes`.
    pub totals: ClusterTotals,
}

// ============================================
// ClusterAggregator
// ============================================

/// Periodic fleet poller.
pub struct ClusterAggregator {
    registry: Arc<NodeRegistry>,
    sessions: Arc<NodeSessionManager>,
    hub: Arc<RealtimeHub>,
    interval: Duration,
    concurrency: usize,
    poll_timeout: Duration,
}

impl ClusterAggregator {
    /// Creates an aggregator.
    pub fn new(
        config: &AggregatorConfig,
        registry: Arc<NodeRegistry>,
        sessions: Arc<NodeSessionManager>,
        hub: Arc<RealtimeHub>,
    ) -> Self {
        Self {
            registry,
            sessions,
            hub,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            concurrency: config.concurrency.max(1),
            poll_timeout: config.poll_timeout(),
        }
    }

    /// Polls every node once and builds a snapshot.
    pub async fn collect(&self) -> ClusterSnapshot {
        let nodes = match self.registry.list().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "Node list unavailable, publishing empty snapshot");
                Vec::new()
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut statuses = Vec::with_capacity(nodes.len());

        for node in nodes {
            if node.in_maintenance() {
                statuses.push(NodeStatus::unpolled(node.id, node.name, NodeHealth::Maintenance));
                continue;
            }
            let sessions = Arc::clone(&self.sessions);
            let semaphore = Arc::clone(&semaphore);
            let budget = self.poll_timeout;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let fallback = NodeStatus::unpolled(node.id.clone(), node.name.clone(), node.health);
                match tokio::time::timeout(budget, poll_node(&sessions, node)).await {
                    Ok(status) => status,
                    Err(_) => {
                        warn!(node_id = %fallback.id, "Status poll timed out");
                        NodeStatus {
                            error: Some(format!("status poll timed out after {}s", budget.as_secs())),
                            ..fallback
                        }
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(status) => statuses.push(status),
                Err(e) => error!(error = %e, "Status poll task aborted"),
            }
        }

        // Health may have changed during the poll.
        for status in &mut statuses {
            if let Ok(Some(node)) = self.registry.find(&status.id).await {
                status.health = node.health;
            }
        }
        statuses.sort_by(|a, b| a.id.cmp(&b.id));

        ClusterSnapshot {
            generated_at: Timestamp::now(),
            totals: ClusterTotals::from_nodes(&statuses),
            nodes: statuses,
        }
    }

    /// Runs the polling loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Cluster aggregator started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Cluster aggregator stopping");
                    break;
                }
                _ = interval.tick() => {
                    let snapshot = tokio::select! {
                        _ = shutdown.recv() => {
                            info!("Cluster aggregator stopping mid-pass");
                            break;
                        }
                        snapshot = self.collect() => snapshot,
                    };
                    debug!(
                        nodes = snapshot.totals.nodes_total,
                        online = snapshot.totals.nodes_online,
                        clients = snapshot.totals.online_clients,
                        "Cluster snapshot collected"
                    );
                    self.hub.publish(snapshot);
                }
            }
        }
    }
}

impl std::fmt::Debug for ClusterAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterAggregator")
            .field("interval", &self.interval)
            .field("concurrency", &self.concurrency)
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

// ============================================
// Polling
// ============================================

async fn poll_node(sessions: &NodeSessionManager, node: Node) -> NodeStatus {
    let mut status = NodeStatus::unpolled(node.id.clone(), node.name, node.health);

    let server = match sessions.invoke(&node.id, &RemoteRequest::get(STATUS_PATH)).await {
        Ok(resp) if resp.success => resp.obj,
        Ok(resp) => {
            status.error = Some(redact_text(&format!("status refused: {}", resp.msg)));
            return status;
        }
        Err(e) => {
            status.error = Some(redact_text(&e.to_string()));
            return status;
        }
    };
    status.online = true;
    status.cpu = server.get("cpu").and_then(Value::as_f64);
    status.mem_used = server.pointer("/mem/current").and_then(Value::as_u64);
    status.mem_total = server.pointer("/mem/total").and_then(Value::as_u64);
    status.uptime_secs = server.get("uptime").and_then(Value::as_u64);
    status.xray_state = server
        .pointer("/xray/state")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    match sessions.invoke(&node.id, &RemoteRequest::post(ONLINES_PATH)).await {
        Ok(resp) if resp.success => {
            status.online_clients = resp.obj.as_array().map_or(0, Vec::len);
        }
        Ok(_) | Err(_) => debug!(node_id = %node.id, "Online list unavailable"),
    }

    match sessions.invoke(&node.id, &RemoteRequest::get(LIST_PATH)).await {
        Ok(resp) if resp.success => {
            let inbounds = resp.obj.as_array().cloned().unwrap_or_default();
            status.inbounds_total = inbounds.len();
            for inbound in &inbounds {
                if inbound.get("enable").and_then(Value::as_bool).unwrap_or(false) {
                    status.inbounds_active += 1;
                }
                let up = inbound.get("up").and_then(Value::as_u64).unwrap_or(0);
                let down = inbound.get("down").and_then(Value::as_u64).unwrap_or(0);
                status.traffic_up = status.traffic_up.saturating_add(up);
                status.traffic_down = status.traffic_down.saturating_add(down);
            }
        }
        Ok(_) | Err(_) => debug!(node_id = %node.id, "Inbound list unavailable"),
    }
    status
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeConfig;
    use crate::store::{MemoryStore, RecordStore};
    use fleet_core::crypto::CredentialVault;
    use fleet_core::model::NodeDraft;
    use fleet_transport::{MockPanelFleet, PanelTransport};

    async fn setup() -> (Arc<MockPanelFleet>, Arc<NodeRegistry>, ClusterAggregator) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let vault = Arc::new(CredentialVault::from_material(b"aggregator test key material", 1).unwrap());
        let registry = Arc::new(NodeRegistry::new(store, vault));
        let fleet = Arc::new(MockPanelFleet::new());

        for (i, url) in ["https://a.example", "https://b.example", "https://c.example"].iter().enumerate() {
            let panel = fleet.add_panel(url, "admin", "pw");
            panel.add_inbound(1, 443, "vless");
            panel.add_inbound(2, 8443, "trojan");
            panel.set_traffic(1, 100, 200);
            panel.set_online(&["alice", "bob"]);
            let draft = NodeDraft {
                name: format!("node {i}"),
                base_url: (*url).into(),
                username: "admin".into(),
                password: Some("pw".into()),
                ..NodeDraft::default()
            };
            let id: NodeId = format!("n{i}").parse().unwrap();
            registry.add(Some(id), &draft).await.unwrap();
        }

        let transport: Arc<dyn PanelTransport> = fleet.clone();
        let sessions = Arc::new(NodeSessionManager::new(
            Arc::clone(&registry),
            transport,
            Duration::from_secs(600),
        ));
        let hub = Arc::new(RealtimeHub::new(&RealtimeConfig::default()));
        let aggregator = ClusterAggregator::new(
            &AggregatorConfig::default(),
            Arc::clone(&registry),
            sessions,
            hub,
        );
        (fleet, registry, aggregator)
    }

    #[tokio::test]
    async fn test_collect_totals() {
        let (fleet, _, aggregator) = setup().await;
        fleet.panel("https://b.example").unwrap().set_unreachable(true);

        let snapshot = aggregator.collect().await;
        assert_eq!(snapshot.totals.nodes_total, 3);
        assert_eq!(snapshot.totals.nodes_online, 2);
        assert_eq!(snapshot.totals.online_clients, 4);
        assert_eq!(snapshot.totals.inbounds_total, 4);
        assert_eq!(snapshot.totals.inbounds_active, 4);
        assert_eq!(snapshot.totals.traffic_up, 200);
        assert_eq!(snapshot.totals.traffic_down, 400);

        let down = snapshot.nodes.iter().find(|n| n.id.as_str() == "n1").unwrap();
        assert!(!down.online);
        assert_eq!(down.health, NodeHealth::Unreachable);
        assert!(down.error.is_some());
    }

    #[tokio::test]
    async fn test_maintenance_not_polled() {
        let (fleet, registry, aggregator) = setup().await;
        registry
            .set_health(&"n0".parse().unwrap(), NodeHealth::Maintenance)
            .await
            .unwrap();

        let snapshot = aggregator.collect().await;
        let parked = &snapshot.nodes[0];
        assert_eq!(parked.health, NodeHealth::Maintenance);
        assert!(!parked.online);
        assert_eq!(fleet.panel("https://a.example").unwrap().login_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_node_reported_offline() {
        let (fleet, _, aggregator) = setup().await;
        fleet.panel("https://c.example").unwrap().set_delay(Duration::from_secs(60));

        let started = tokio::time::Instant::now();
        let snapshot = aggregator.collect().await;

        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(snapshot.totals.nodes_online, 2);
        let slow = snapshot.nodes.iter().find(|n| n.id.as_str() == "n2").unwrap();
        assert!(!slow.online);
        assert!(slow.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_running_pass() {
        let (fleet, _, aggregator) = setup().await;
        for url in ["https://a.example", "https://b.example", "https://c.example"] {
            fleet.panel(url).unwrap().set_delay(Duration::from_secs(60));
        }
        let hub = Arc::clone(&aggregator.hub);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(Arc::new(aggregator).run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("aggregator stops before its poll deadline")
            .unwrap();
        assert!(hub.latest().is_none());
    }
}
