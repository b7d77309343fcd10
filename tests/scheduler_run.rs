// tests/scheduler_run.rs
// End-to-end happy path: never-fetched source → immediate run → 5 new items
// → status persisted, handle re-armed, enrichment chain completes.
use std::time::Duration;

use feedsched::testing::{fast_config, source, wait_for_stage, Harness};
use feedsched::{FetchStatus, RunOutcome, StageKind, StageState};

#[tokio::test]
async fn successful_run_persists_status_and_enriches() {
    let h = Harness::new(fast_config());
    h.sources.insert(source("s1", "owner-1", 30));
    for i in 1..=5 {
        h.items.insert_item(&format!("it-{i}"), "raw text");
    }
    h.ingestor
        .push_success(["it-1", "it-2", "it-3", "it-4", "it-5"]);

    let before = chrono::Utc::now();
    let outcome = h.sched.force_run_now("s1").await;
    let RunOutcome::Completed { new_items } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(new_items.len(), 5);

    let snap = h.sources.snapshot("s1").unwrap();
    assert_eq!(snap.last_fetch_status, FetchStatus::Success);
    assert_eq!(snap.last_fetch_error, None);
    assert!(snap.last_fetched_at.unwrap() >= before);

    // Job handle re-armed for the next interval.
    assert!(h.sched.job_handle("s1").await.unwrap().is_some());

    // Inline dispatch: every stage flag transitions pending → done.
    for i in 1..=5 {
        let id = format!("it-{i}");
        for stage in StageKind::CHAIN {
            assert!(
                wait_for_stage(&h.items, &id, stage, StageState::Done, Duration::from_secs(2))
                    .await,
                "stage {stage:?} never completed for {id}"
            );
        }
    }
}

#[tokio::test]
async fn armed_job_fires_and_rearms() {
    let h = Harness::new(fast_config());
    let s = source("s1", "owner-1", 30);
    h.sources.insert(s.clone());
    h.items.insert_item("it-1", "raw");
    h.ingestor.push_success(["it-1"]);

    // Never fetched → due immediately; the spawned job does the whole run.
    h.sched.schedule(&s).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.ingestor.call_count() == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.ingestor.call_count(), 1, "armed job never fired");
    assert_eq!(
        h.sources.snapshot("s1").unwrap().last_fetch_status,
        FetchStatus::Success
    );
    assert!(h.sched.job_handle("s1").await.unwrap().is_some());
}

#[tokio::test]
async fn lock_is_released_after_run() {
    let h = Harness::new(fast_config());
    h.sources.insert(source("s1", "owner-1", 30));

    let first = h.sched.force_run_now("s1").await;
    assert!(matches!(first, RunOutcome::Completed { .. }));

    // A second run is not rejected for lock reasons (it actually runs).
    let second = h.sched.force_run_now("s1").await;
    assert!(matches!(second, RunOutcome::Completed { .. }));
    assert_eq!(h.ingestor.call_count(), 2);
}

#[tokio::test]
async fn no_retry_storm_after_any_run() {
    let h = Harness::new(fast_config());
    h.sources.insert(source("s1", "owner-1", 30));
    h.ingestor.push_permanent("feed gone");

    h.sched.force_run_now("s1").await;

    // Failure still moved last_fetched_at: the source is no longer due.
    use feedsched::SourceStore;
    let briefs = h.sources.list_brief().await.unwrap();
    assert!(!briefs[0].is_due(chrono::Utc::now()));
}
