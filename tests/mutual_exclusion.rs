// tests/mutual_exclusion.rs
use std::time::Duration;

use feedsched::testing::{fast_config, source, Harness};
use feedsched::{DispatchMode, RunOutcome};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn n_concurrent_runs_one_winner() {
    let h = Harness::new(fast_config());
    h.sources.insert(source("s1", "owner-1", 30));
    // Slow fetch keeps the lock held while the losers arrive.
    h.ingestor.set_latency(Duration::from_millis(200));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let sched = h.sched.clone();
        handles.push(tokio::spawn(async move {
            sched.run_source("s1", DispatchMode::Inline).await
        }));
    }

    let mut winners = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            RunOutcome::Completed { .. } => winners += 1,
            RunOutcome::LockBusy => rejected += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(rejected, 7);
    assert_eq!(h.ingestor.call_count(), 1, "only the winner fetched");
}

#[tokio::test]
async fn lease_outlives_retry_backoff() {
    // Backoff (1.5s) longer than hard timeout + margin (1s): the lock TTL
    // must still cover the whole retry sequence, or a second run sneaks in
    // mid-backoff.
    let mut cfg = fast_config();
    cfg.fetch_hard_timeout_secs = 1;
    cfg.lock_margin_secs = 0;
    cfg.retry.max_attempts = 2;
    cfg.retry.base_delay_ms = 1_500;
    cfg.retry.max_delay_ms = 1_500;
    cfg.retry.jitter_ms = 0;
    let h = Harness::new(cfg);
    h.sources.insert(source("s1", "owner-1", 30));
    h.ingestor.push_transient("blip");
    h.ingestor.push_success(["it-1"]);

    let sched = h.sched.clone();
    let first = tokio::spawn(async move { sched.run_source("s1", DispatchMode::Inline).await });

    // Arrive mid-backoff, past the point where a TTL sized only for the
    // fetch attempt would already have expired.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let second = h.sched.run_source("s1", DispatchMode::Inline).await;
    assert_eq!(second, RunOutcome::LockBusy);

    assert!(matches!(first.await.unwrap(), RunOutcome::Completed { .. }));
    assert_eq!(h.ingestor.call_count(), 2, "only the holder's attempts ran");
}
