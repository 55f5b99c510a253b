// ============================================
// File: crates/fleet-server/tests/cancellation.rs
// ============================================
//! Cancelling a running batch by request id.

mod common;

use std::time::Duration;

use fleet_core::action::InboundRefPayload;
use fleet_core::model::{BatchRequest, ResultStatus, TargetSelector};
use fleet_core::BatchAction;
use fleet_server::services::engine::CANCELLED_BEFORE_DISPATCH;
use fleet_server::{ServerConfig, ServerError};

use common::{assert_summary_invariant, harness, ACTOR};

fn enable_all(ids: Vec<fleet_common::NodeId>) -> BatchRequest {
    BatchRequest::new(
        BatchAction::InboundsEnable(InboundRefPayload { inbound_ids: vec![1] }),
        TargetSelector::Nodes(ids),
    )
    .with_actor(ACTOR)
    .with_request_id("nightly-enable")
}

#[tokio::test]
async fn test_cancel_stops_dispatch_and_records_the_rest() {
    let mut config = ServerConfig::default();
    config.engine.concurrency = 1;
    let h = harness(3, config).await;
    for i in 0..3 {
        h.panel(i).set_delay(Duration::from_millis(200));
    }

    let (job, (duplicate, cancelled)) = tokio::join!(h.plane.execute(enable_all(h.ids.clone())), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let duplicate = h.plane.execute(enable_all(h.ids.clone())).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let cancelled = h.plane.cancel(ACTOR, "nightly-enable").await;
        (duplicate, cancelled)
    });

    assert!(matches!(duplicate, Err(ServerError::InvalidRequest { .. })));
    assert!(cancelled);

    let job = job.unwrap();
    assert!(job.cancelled);
    assert_summary_invariant(&job);
    assert_eq!(job.summary.total, 3);

    let first = job.results.iter().find(|r| r.server_id == h.ids[0]).unwrap();
    assert_eq!(first.status, ResultStatus::Skipped);
    for id in &h.ids[1..] {
        let result = job.results.iter().find(|r| &r.server_id == id).unwrap();
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error.as_deref(), Some(CANCELLED_BEFORE_DISPATCH));
    }
    assert_eq!(h.panel(1).login_count(), 0);
    assert_eq!(h.panel(2).login_count(), 0);

    // The request id is free again once the batch is over.
    assert!(!h.plane.cancel(ACTOR, "nightly-enable").await);
}
