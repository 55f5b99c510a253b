// ============================================
// File: crates/fleet-server/tests/common/mod.rs
// ============================================
//! Shared harness: a control plane over an in-memory store and a mock
//! panel fleet.

#![allow(dead_code)]

use std::sync::Arc;

use fleet_common::NodeId;
use fleet_core::crypto::CredentialVault;
use fleet_core::model::NodeDraft;
use fleet_server::store::MemoryStore;
use fleet_server::{ControlPlane, ServerConfig};
use fleet_transport::{MockPanel, MockPanelFleet, PanelTransport};

pub const ACTOR: &str = "ops";
pub const PASSWORD: &str = "panel-pw";

pub struct Harness {
    pub fleet: Arc<MockPanelFleet>,
    pub plane: ControlPlane,
    pub ids: Vec<NodeId>,
}

impl Harness {
    pub fn panel(&self, index: usize) -> Arc<MockPanel> {
        self.fleet.panel(&url(index)).expect("panel registered")
    }
}

pub fn url(index: usize) -> String {
    format!("https://node-{index}.example")
}

/// Builds `nodes` registered nodes, each with inbound 1 on port 443.
pub async fn harness(nodes: usize, config: ServerConfig) -> Harness {
    let fleet = Arc::new(MockPanelFleet::new());
    let transport: Arc<dyn PanelTransport> = fleet.clone();
    let vault = Arc::new(CredentialVault::from_material(b"integration test key material", 1).unwrap());
    let plane = ControlPlane::with_parts(config, Arc::new(MemoryStore::new()), vault, transport);

    let mut ids = Vec::with_capacity(nodes);
    for i in 0..nodes {
        let panel = fleet.add_panel(&url(i), "admin", PASSWORD);
        panel.add_inbound(1, 443, "vless");
        let id: NodeId = format!("node-{i}").parse().unwrap();
        let draft = NodeDraft {
            name: format!("Node {i}"),
            base_url: url(i),
            username: "admin".into(),
            password: Some(PASSWORD.into()),
            ..NodeDraft::default()
        };
        plane.add_node(ACTOR, Some(id.clone()), &draft).await.unwrap();
        ids.push(id);
    }
    Harness { fleet, plane, ids }
}

pub fn assert_summary_invariant(job: &fleet_core::model::Job) {
    let s = &job.summary;
    assert_eq!(s.total, job.results.len());
    assert_eq!(s.total, s.success + s.skipped + s.failed);
}
