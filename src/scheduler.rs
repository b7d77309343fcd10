// src/scheduler.rs
// Single-source refresh path. Any worker may execute any source's job; the
// per-source lock is what enforces "at most one run per source", never
// routing. The schedule is always recomputed from the persisted
// last_fetched_at, so it survives process restarts without retry storms.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::config::OrchestratorConfig;
use crate::lock::LockManager;
use crate::pipeline::EnrichmentChain;
use crate::ratelimit::DomainRateLimiter;
use crate::store::KvStore;
use crate::types::{FetchError, FetchStatus, Ingestor, Source, SourceStore};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("refresh_runs_total", "Completed refresh runs (success or failure).");
        describe_counter!("refresh_failures_total", "Refresh runs recorded as failed.");
        describe_counter!(
            "refresh_lock_rejected_total",
            "Runs rejected because another run held the source lock."
        );
        describe_counter!(
            "refresh_skipped_gone_total",
            "Runs skipped because the source vanished before the run fired."
        );
        describe_counter!("refresh_retries_total", "Transient-error retry attempts.");
        describe_gauge!("refresh_last_run_ts", "Unix ts of the most recent refresh run.");
    });
}

fn job_key(source_id: &str) -> String {
    format!("job:{source_id}")
}

fn source_resource(source_id: &str) -> String {
    format!("source:{source_id}")
}

/// Whether a successful run hands its new items to the enrichment chain
/// itself, or leaves them for a batch fan-in step to dispatch once the whole
/// owner group finished refreshing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Inline,
    Deferred,
}

/// Terminal state of one run attempt chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Fetch succeeded; status persisted, schedule re-armed.
    Completed { new_items: Vec<String> },
    /// Fetch failed terminally (permanent error, retries exhausted, or lease
    /// lost mid-retry); status persisted, schedule re-armed at normal cadence.
    Failed,
    /// Another run holds the source lock. Quietly rejected, not requeued.
    LockBusy,
    /// The source was deleted while this run was queued. Clean skip, no
    /// reschedule — this is what terminates the re-arm chain after deletion.
    SourceGone,
}

/// How a single fetch attempt chain ended, before persistence.
enum Completion {
    Success(Vec<String>),
    Failed(String),
}

struct PendingJob {
    job_id: String,
    abort: AbortHandle,
}

struct Inner {
    cfg: OrchestratorConfig,
    store: Arc<dyn KvStore>,
    sources: Arc<dyn SourceStore>,
    ingestor: Arc<dyn Ingestor>,
    locks: LockManager,
    limiter: DomainRateLimiter,
    chain: Arc<EnrichmentChain>,
    /// Cache of locally-spawned pending jobs for in-process cancellation and
    /// supersession. The `job:{id}` key in the shared store is authoritative
    /// across processes; this map never is.
    jobs: Mutex<HashMap<String, PendingJob>>,
}

#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

/// Crash-safe delay computation: relative delay from the persisted
/// `last_fetched_at`, evaluated at schedule time. A source with no history or
/// an overdue source fires immediately; a recently fetched one waits out the
/// remainder of its interval.
pub fn delay_until_due(
    last_fetched_at: Option<DateTime<Utc>>,
    interval_minutes: u32,
    now: DateTime<Utc>,
) -> Duration {
    let Some(last) = last_fetched_at else {
        return Duration::ZERO;
    };
    let due_at = last + chrono::Duration::seconds(i64::from(interval_minutes) * 60);
    (due_at - now).to_std().unwrap_or(Duration::ZERO)
}

impl RefreshScheduler {
    pub fn new(
        cfg: OrchestratorConfig,
        store: Arc<dyn KvStore>,
        sources: Arc<dyn SourceStore>,
        ingestor: Arc<dyn Ingestor>,
        chain: Arc<EnrichmentChain>,
    ) -> Self {
        ensure_metrics_described();
        let locks = LockManager::new(Arc::clone(&store));
        let limiter = DomainRateLimiter::new(Arc::clone(&store), cfg.min_domain_spacing());
        Self {
            inner: Arc::new(Inner {
                cfg,
                store,
                sources,
                ingestor,
                locks,
                limiter,
                chain,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.cfg
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    pub fn sources(&self) -> Arc<dyn SourceStore> {
        Arc::clone(&self.inner.sources)
    }

    pub fn chain(&self) -> Arc<EnrichmentChain> {
        Arc::clone(&self.inner.chain)
    }

    /// (Re)arm the scheduler for a source. Called on creation and on
    /// interval-affecting updates; idempotent — a second call supersedes the
    /// pending job rather than duplicating it.
    pub async fn schedule(&self, source: &Source) {
        let delay = delay_until_due(source.last_fetched_at, source.interval_minutes(), Utc::now());
        self.arm(&source.id, source.interval_minutes(), delay).await;
    }

    /// Bypass the computed delay ("refresh now"). Still goes through the lock
    /// manager, so a concurrent run wins and this returns `LockBusy`.
    pub async fn force_run_now(&self, source_id: &str) -> RunOutcome {
        self.run_source(source_id, DispatchMode::Inline).await
    }

    /// Revoke a pending scheduled job and clear the source's derived state.
    /// Revoke-then-delete ordering: aborting the local task first means it
    /// cannot fire afterwards and recreate a stale handle. A job queued in
    /// another process still self-terminates at its source-existence check.
    pub async fn cancel(&self, source_id: &str) -> Result<()> {
        if let Some(job) = self.inner.jobs.lock().remove(source_id) {
            job.abort.abort();
            tracing::debug!(source_id, job_id = %job.job_id, "pending job revoked");
        }
        self.inner.store.delete(&job_key(source_id)).await?;
        self.inner.locks.force_clear(&source_resource(source_id)).await?;
        Ok(())
    }

    /// The job reference currently registered for a source, if any.
    pub async fn job_handle(&self, source_id: &str) -> Result<Option<String>> {
        self.inner.store.get(&job_key(source_id)).await
    }

    /// Whether this process holds a locally spawned pending job for the
    /// source. Diagnostic only; the shared-store Job Handle is authoritative.
    pub fn has_local_job(&self, source_id: &str) -> bool {
        self.inner.jobs.lock().contains_key(source_id)
    }

    /// Execute one refresh run for a source. This is the state machine
    /// `Idle → Locked → {Success|Failed} → Rescheduled → Idle`; the terminal
    /// branches (`LockBusy`, `SourceGone`) exit without re-arming.
    pub async fn run_source(&self, source_id: &str, mode: DispatchMode) -> RunOutcome {
        let inner = &self.inner;
        let run_id = uuid::Uuid::new_v4().to_string();
        let resource = source_resource(source_id);
        let lock_ttl = inner.cfg.source_lock_ttl();

        // Locked: winner-takes-all; losers reject immediately, no requeue.
        match inner.locks.acquire(&resource, lock_ttl, &run_id).await {
            Ok(true) => {}
            Ok(false) => {
                counter!("refresh_lock_rejected_total").increment(1);
                tracing::debug!(source_id, "refresh already in progress; rejecting run");
                return RunOutcome::LockBusy;
            }
            Err(e) => {
                tracing::warn!(error = ?e, source_id, "lock store unavailable; rejecting run");
                return RunOutcome::LockBusy;
            }
        }

        let outcome = self.run_locked(source_id, &run_id, mode).await;

        if let Err(e) = inner.locks.release(&resource, &run_id).await {
            tracing::warn!(error = ?e, source_id, "lock release failed");
        }
        outcome
    }

    /// Everything that happens while holding the source lock.
    async fn run_locked(&self, source_id: &str, run_id: &str, mode: DispatchMode) -> RunOutcome {
        let inner = &self.inner;

        // The source may have been deleted while this run was queued.
        let source = match inner.sources.get(source_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                counter!("refresh_skipped_gone_total").increment(1);
                tracing::debug!(source_id, "source vanished; skipping without reschedule");
                // Drop the cached job too; a deleted source leaves no residue.
                if let Some(job) = inner.jobs.lock().remove(source_id) {
                    job.abort.abort();
                }
                return RunOutcome::SourceGone;
            }
            Err(e) => {
                tracing::warn!(error = ?e, source_id, "source lookup failed; skipping run");
                return RunOutcome::SourceGone;
            }
        };

        inner
            .limiter
            .wait_for_destination(&source.url, inner.cfg.rate_limit_max_wait())
            .await;

        let completion = self.fetch_with_retries(&source, run_id).await;

        // Persist unconditionally — success or failure, last_fetched_at moves
        // to now. The next due-computation is relative to this timestamp, not
        // to an error state; this is what prevents a retry storm.
        let now = Utc::now();
        let (status, error) = match &completion {
            Completion::Success(_) => (FetchStatus::Success, None),
            Completion::Failed(msg) => (
                FetchStatus::Failed,
                Some(truncate_error(msg, inner.cfg.error_text_max_chars)),
            ),
        };
        if let Err(e) = inner
            .sources
            .record_fetch(source_id, status, error, now)
            .await
        {
            tracing::warn!(error = ?e, source_id, "failed to persist fetch status");
        }

        counter!("refresh_runs_total").increment(1);
        gauge!("refresh_last_run_ts").set(now.timestamp() as f64);

        // Dispatch: inline runs hand new items to the chain themselves; batch
        // runs leave that to the owner-level fan-in step.
        let outcome = match completion {
            Completion::Success(new_items) => {
                if mode == DispatchMode::Inline && !new_items.is_empty() {
                    let chain = Arc::clone(&inner.chain);
                    let items = new_items.clone();
                    tokio::spawn(async move { chain.run_for_items(&items).await });
                }
                tracing::info!(
                    source_id,
                    new_items = new_items.len(),
                    "refresh succeeded"
                );
                RunOutcome::Completed { new_items }
            }
            Completion::Failed(msg) => {
                counter!("refresh_failures_total").increment(1);
                tracing::warn!(source_id, error = %msg, "refresh failed");
                RunOutcome::Failed
            }
        };

        // Rescheduled: last_fetched_at was just set to now, so the next due
        // time is exactly one interval out. A permanently broken source keeps
        // being checked at its normal cadence until fixed or deleted.
        self.arm(
            source_id,
            source.interval_minutes(),
            Duration::from_secs(u64::from(source.interval_minutes()) * 60),
        )
        .await;

        outcome
    }

    /// Fetch with bounded retries for transient errors. The held lease is
    /// renewed (owner-checked) before each backoff sleep; losing the lease
    /// aborts the retry chain instead of racing a second holder.
    async fn fetch_with_retries(&self, source: &Source, run_id: &str) -> Completion {
        let inner = &self.inner;
        let retry = inner.cfg.retry;
        let resource = source_resource(&source.id);
        let mut attempt = 1u32;

        loop {
            let started = tokio::time::Instant::now();
            let result = tokio::time::timeout(
                inner.cfg.fetch_hard_timeout(),
                inner.ingestor.fetch_and_ingest(source),
            )
            .await
            .unwrap_or_else(|_| {
                Err(FetchError::Transient(format!(
                    "fetch exceeded hard timeout ({}s)",
                    inner.cfg.fetch_hard_timeout_secs
                )))
            });

            let elapsed = started.elapsed();
            if elapsed > inner.cfg.fetch_soft_timeout() {
                tracing::warn!(
                    source_id = %source.id,
                    elapsed_secs = elapsed.as_secs(),
                    "fetch exceeded soft timeout"
                );
            }

            match result {
                Ok(report) => return Completion::Success(report.item_ids),
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    counter!("refresh_retries_total").increment(1);
                    let backoff = retry.backoff_delay(attempt);
                    tracing::debug!(
                        source_id = %source.id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient fetch error; retrying"
                    );
                    // Renew the lease so it provably outlives the backoff.
                    let renewed = inner
                        .locks
                        .extend(&resource, run_id, inner.cfg.source_lock_ttl())
                        .await
                        .unwrap_or(false);
                    if !renewed {
                        tracing::warn!(
                            source_id = %source.id,
                            "lease lost mid-retry; aborting retry chain"
                        );
                        return Completion::Failed(format!("{e} (lease lost during retry)"));
                    }
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Completion::Failed(e.to_string()),
            }
        }
    }

    /// Spawn the delayed job task and register its handle. A newer arm for
    /// the same source supersedes the older one, locally (abort) and in the
    /// shared store (key overwrite).
    ///
    /// Boxed return: the armed job awaits `run_source`, which awaits `arm`
    /// again when it re-arms, so an unboxed future type would be infinite.
    fn arm<'a>(
        &'a self,
        source_id: &'a str,
        interval_minutes: u32,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let job_id = uuid::Uuid::new_v4().to_string();
            let sched = self.clone();
            let sid = source_id.to_string();
            let task = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // The run re-checks lock and source existence itself, so a
                // stale job degrades to a no-op.
                let _ = sched.run_source(&sid, DispatchMode::Inline).await;
            });

            let superseded = self.inner.jobs.lock().insert(
                source_id.to_string(),
                PendingJob {
                    job_id: job_id.clone(),
                    abort: task.abort_handle(),
                },
            );
            if let Some(prev) = superseded {
                prev.abort.abort();
                tracing::debug!(source_id, superseded = %prev.job_id, "pending job superseded");
            }

            let ttl = self.inner.cfg.job_handle_ttl(interval_minutes);
            if let Err(e) = self
                .inner
                .store
                .put(&job_key(source_id), &job_id, Some(ttl))
                .await
            {
                tracing::warn!(error = ?e, source_id, "failed to register job handle");
            }
            tracing::debug!(
                source_id,
                job_id = %job_id,
                delay_secs = delay.as_secs(),
                "refresh scheduled"
            );
        })
    }
}

fn truncate_error(msg: &str, max_chars: usize) -> String {
    if msg.chars().count() <= max_chars {
        msg.to_string()
    } else {
        msg.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_fetched_is_immediately_due() {
        assert_eq!(delay_until_due(None, 30, Utc::now()), Duration::ZERO);
    }

    #[test]
    fn overdue_fires_immediately() {
        let now = Utc::now();
        let last = now - chrono::Duration::minutes(45);
        assert_eq!(delay_until_due(Some(last), 30, now), Duration::ZERO);
    }

    #[test]
    fn recent_fetch_waits_out_the_remainder() {
        let now = Utc::now();
        let last = now - chrono::Duration::minutes(10);
        let delay = delay_until_due(Some(last), 30, now);
        assert!(delay <= Duration::from_secs(20 * 60));
        assert!(delay > Duration::from_secs(19 * 60));
    }

    #[test]
    fn restart_recomputes_from_persisted_timestamp() {
        // last = T, interval = I, restart at T + I + Δ → fires immediately;
        // restart at T + I − Δ → delay ≈ Δ.
        let t = Utc::now();
        let i = chrono::Duration::minutes(30);
        let delta = chrono::Duration::minutes(5);
        assert_eq!(delay_until_due(Some(t), 30, t + i + delta), Duration::ZERO);
        let d = delay_until_due(Some(t), 30, t + i - delta);
        assert!(d <= Duration::from_secs(5 * 60));
        assert!(d > Duration::from_secs(4 * 60 + 59));
    }

    #[test]
    fn error_truncation_is_char_safe() {
        assert_eq!(truncate_error("héllo wörld", 5), "héllo");
        assert_eq!(truncate_error("ok", 500), "ok");
    }
}
