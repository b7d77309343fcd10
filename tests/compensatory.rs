// tests/compensatory.rs
// Safety net: enrichment work whose dispatch was lost (flag stuck Pending
// past the age threshold) is found and completed by the compensatory sweep.
use std::sync::Arc;

use feedsched::testing::{fast_config, Harness, InMemoryItemStore, RecordingStage};
use feedsched::types::ItemStore;
use feedsched::{BatchOrchestrator, StageKind, StageState};

fn lost_dispatch_harness() -> (Harness, Arc<InMemoryItemStore>) {
    let items = Arc::new(InMemoryItemStore::new());
    let h = Harness::with_stages(
        fast_config(),
        Arc::clone(&items),
        vec![
            Arc::new(RecordingStage::ok(StageKind::Normalize)),
            Arc::new(RecordingStage::ok(StageKind::Embed)),
            Arc::new(RecordingStage::ok(StageKind::CrossRef)),
        ],
    );
    (h, items)
}

#[tokio::test]
async fn lost_first_stage_dispatch_is_recovered() {
    let (h, items) = lost_dispatch_harness();
    // Ingested item whose enrichment dispatch never arrived.
    items.insert_item("it-lost", "raw");
    items.backdate_item("it-lost", chrono::Duration::seconds(60));

    let orchestrator = BatchOrchestrator::new(h.sched.clone());
    let redispatched = orchestrator
        .sweep_compensatory(StageKind::Normalize)
        .await
        .unwrap();

    assert_eq!(redispatched, 1);
    assert_eq!(
        items.stage_state("it-lost", StageKind::Normalize).await.unwrap(),
        StageState::Done
    );
}

#[tokio::test]
async fn downstream_stage_waits_for_upstream_flag() {
    let (h, items) = lost_dispatch_harness();
    items.insert_item("it-1", "raw");
    items.backdate_item("it-1", chrono::Duration::seconds(60));

    let orchestrator = BatchOrchestrator::new(h.sched.clone());

    // Embed's upstream (normalize) is still pending → nothing to redo yet.
    let n = orchestrator.sweep_compensatory(StageKind::Embed).await.unwrap();
    assert_eq!(n, 0);

    // Once normalize completed (long enough ago), embed becomes eligible.
    items
        .mark_stage("it-1", StageKind::Normalize, StageState::Done)
        .await
        .unwrap();
    items.backdate_item("it-1", chrono::Duration::seconds(60));
    let n = orchestrator.sweep_compensatory(StageKind::Embed).await.unwrap();
    assert_eq!(n, 1);
    assert_eq!(
        items.stage_state("it-1", StageKind::Embed).await.unwrap(),
        StageState::Done
    );
}

#[tokio::test]
async fn recently_ingested_items_are_left_alone() {
    let mut cfg = fast_config();
    cfg.compensatory_min_age_secs = 3600;
    let items = Arc::new(InMemoryItemStore::new());
    let h = Harness::with_stages(
        cfg,
        Arc::clone(&items),
        vec![Arc::new(RecordingStage::ok(StageKind::Normalize))],
    );
    items.insert_item("it-new", "raw");

    let orchestrator = BatchOrchestrator::new(h.sched.clone());
    let n = orchestrator
        .sweep_compensatory(StageKind::Normalize)
        .await
        .unwrap();
    assert_eq!(n, 0, "fresh pending work is not redispatched");
    assert_eq!(
        items.stage_state("it-new", StageKind::Normalize).await.unwrap(),
        StageState::Pending
    );
}

#[tokio::test]
async fn failed_flags_are_terminal_not_redispatched() {
    let (h, items) = lost_dispatch_harness();
    items.insert_item("it-bad", "raw");
    items
        .mark_stage("it-bad", StageKind::Normalize, StageState::Failed)
        .await
        .unwrap();
    items.backdate_item("it-bad", chrono::Duration::seconds(60));

    let orchestrator = BatchOrchestrator::new(h.sched.clone());
    let n = orchestrator
        .sweep_compensatory(StageKind::Normalize)
        .await
        .unwrap();
    assert_eq!(n, 0);
}
