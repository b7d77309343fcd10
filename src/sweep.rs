// src/sweep.rs
// Periodic sweeps. `sweep_due` finds everything due, groups it per owner and
// fans out parallel refreshes with a single enrichment dispatch per owner
// once the whole group joined — all of a user's refreshes finish before any
// of their enrichment starts. `sweep_compensatory` is the safety net that
// re-dispatches enrichment work whose original dispatch was lost.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::scheduler::{DispatchMode, RefreshScheduler, RunOutcome};
use crate::types::{SourceBrief, StageKind};

const SWEEP_RESOURCE: &str = "sweep";

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("sweep_runs_total", "Due-source sweeps executed.");
        describe_counter!(
            "sweep_overlap_skips_total",
            "Sweeps skipped because another sweep held the overlap lock."
        );
        describe_counter!("sweep_due_sources_total", "Sources found due by sweeps.");
        describe_counter!(
            "compensatory_redispatch_total",
            "Enrichment stage runs re-dispatched by the compensatory sweep."
        );
        describe_gauge!("sweep_last_run_ts", "Unix ts when the due-sweep last ran.");
    });
}

/// What a sweep did, for logs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// True when another sweep instance held the overlap lock.
    pub skipped_overlap: bool,
    pub due: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub lock_busy: usize,
    pub new_items: usize,
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    sched: RefreshScheduler,
}

impl BatchOrchestrator {
    pub fn new(sched: RefreshScheduler) -> Self {
        ensure_metrics_described();
        Self { sched }
    }

    /// One due-source sweep pass. Invoked by an external periodic trigger;
    /// never returns an error for per-source failures — those are persisted
    /// on the sources themselves.
    pub async fn sweep_due(&self) -> SweepReport {
        let cfg = self.sched.config().clone();
        let locks = self.sched.locks().clone();
        let token = uuid::Uuid::new_v4().to_string();

        // At most one sweep instance, even with several scheduler processes.
        match locks.acquire(SWEEP_RESOURCE, cfg.sweep_lock_ttl(), &token).await {
            Ok(true) => {}
            Ok(false) => {
                counter!("sweep_overlap_skips_total").increment(1);
                tracing::debug!("sweep already running elsewhere; skipping");
                return SweepReport {
                    skipped_overlap: true,
                    ..SweepReport::default()
                };
            }
            Err(e) => {
                tracing::warn!(error = ?e, "sweep lock store unavailable; skipping");
                return SweepReport {
                    skipped_overlap: true,
                    ..SweepReport::default()
                };
            }
        }

        let report = self.sweep_locked(&cfg).await;

        if let Err(e) = locks.release(SWEEP_RESOURCE, &token).await {
            tracing::warn!(error = ?e, "sweep lock release failed");
        }
        report
    }

    async fn sweep_locked(&self, cfg: &crate::config::OrchestratorConfig) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Utc::now();

        let briefs = match self.sched.sources().list_brief().await {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = ?e, "listing sources failed; sweep aborted");
                return report;
            }
        };

        // Group the due set per owner; BTreeMap for deterministic order.
        let mut by_owner: BTreeMap<String, Vec<SourceBrief>> = BTreeMap::new();
        for b in briefs.into_iter().filter(|b| b.is_due(now)) {
            by_owner.entry(b.owner_id.clone()).or_default().push(b);
        }
        report.due = by_owner.values().map(Vec::len).sum();
        counter!("sweep_runs_total").increment(1);
        counter!("sweep_due_sources_total").increment(report.due as u64);
        gauge!("sweep_last_run_ts").set(now.timestamp() as f64);

        for (owner, group) in by_owner {
            let batch_items = self.refresh_owner_group(cfg, &group, &mut report).await;
            report.new_items += batch_items.len();

            // Fan-in: one enrichment dispatch for the whole owner batch, only
            // after every refresh in the group completed.
            if !batch_items.is_empty() {
                tracing::info!(
                    owner = %owner,
                    sources = group.len(),
                    new_items = batch_items.len(),
                    "dispatching batch enrichment"
                );
                let chain = self.sched.chain();
                tokio::spawn(async move { chain.run_for_items(&batch_items).await });
            }
        }

        tracing::info!(
            due = report.due,
            refreshed = report.refreshed,
            failed = report.failed,
            new_items = report.new_items,
            "due sweep finished"
        );
        report
    }

    /// Fan out one owner's due sources as parallel batch-mode refresh jobs
    /// and join them, collecting all newly ingested item ids.
    async fn refresh_owner_group(
        &self,
        cfg: &crate::config::OrchestratorConfig,
        group: &[SourceBrief],
        report: &mut SweepReport,
    ) -> Vec<String> {
        let sem = Arc::new(Semaphore::new(cfg.max_parallel_refreshes.max(1)));
        let mut set = JoinSet::new();
        for brief in group {
            let sched = self.sched.clone();
            let sem = Arc::clone(&sem);
            let source_id = brief.id.clone();
            set.spawn(async move {
                let _permit = sem.acquire_owned().await;
                sched.run_source(&source_id, DispatchMode::Deferred).await
            });
        }

        let mut items = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(RunOutcome::Completed { new_items }) => {
                    report.refreshed += 1;
                    items.extend(new_items);
                }
                Ok(RunOutcome::Failed) => report.failed += 1,
                Ok(RunOutcome::LockBusy) => report.lock_busy += 1,
                Ok(RunOutcome::SourceGone) => {}
                Err(e) => tracing::warn!(error = ?e, "batch refresh task panicked"),
            }
        }
        items
    }

    /// Compensatory pass for one enrichment stage: re-dispatch items whose
    /// upstream precondition holds but whose own flag sat Pending past the
    /// age threshold (a dispatch lost to a crash between enqueue and run).
    /// Runs on its own, longer, externally-triggered period.
    pub async fn sweep_compensatory(&self, stage: StageKind) -> Result<usize> {
        let cfg = self.sched.config().clone();
        let locks = self.sched.locks().clone();
        let token = uuid::Uuid::new_v4().to_string();
        let resource = format!("sweep:{}", stage.as_str());

        match locks.acquire(&resource, cfg.sweep_lock_ttl(), &token).await {
            Ok(true) => {}
            _ => {
                counter!("sweep_overlap_skips_total").increment(1);
                return Ok(0);
            }
        }

        let chain = self.sched.chain();
        let result = async {
            let stalled = chain
                .item_store()
                .find_stalled(stage, cfg.compensatory_min_age())
                .await?;
            if !stalled.is_empty() {
                tracing::info!(
                    stage = stage.as_str(),
                    items = stalled.len(),
                    "compensatory sweep re-dispatching lost enrichment work"
                );
            }
            for item_id in &stalled {
                chain.run_stage_for_item(item_id, stage).await;
                counter!("compensatory_redispatch_total").increment(1);
            }
            Ok(stalled.len())
        }
        .await;

        if let Err(e) = locks.release(&resource, &token).await {
            tracing::warn!(error = ?e, "compensatory sweep lock release failed");
        }
        result
    }
}

/// Spawn both periodic sweeps as background tokio tasks. Wire this from app
/// startup when no external cron-like trigger is available.
pub fn spawn_sweep_loops(orchestrator: BatchOrchestrator) -> tokio::task::JoinHandle<()> {
    let cfg = orchestrator.sched.config().clone();
    tokio::spawn(async move {
        let mut due_tick =
            tokio::time::interval(std::time::Duration::from_secs(cfg.sweep_period_secs));
        let mut comp_tick = tokio::time::interval(std::time::Duration::from_secs(
            cfg.compensatory_min_age_secs.max(60),
        ));
        loop {
            tokio::select! {
                _ = due_tick.tick() => {
                    let _ = orchestrator.sweep_due().await;
                }
                _ = comp_tick.tick() => {
                    for stage in StageKind::CHAIN {
                        if let Err(e) = orchestrator.sweep_compensatory(stage).await {
                            tracing::warn!(error = ?e, stage = stage.as_str(), "compensatory sweep failed");
                        }
                    }
                }
            }
        }
    })
}
