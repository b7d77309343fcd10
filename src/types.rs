// src/types.rs
// Data model + collaborator contracts. The orchestration core only ever
// touches sources and items through these narrow traits; parsing, persistence
// and AI providers live behind them.

use anyhow::Result;
use chrono::{DateTime, Utc};

/// Allowed refresh cadence bounds, in minutes (1 minute .. 7 days).
pub const MIN_REFRESH_INTERVAL_MINUTES: u32 = 1;
pub const MAX_REFRESH_INTERVAL_MINUTES: u32 = 10_080;

/// Outcome of the last completed fetch attempt for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    None,
    Success,
    Failed,
}

/// A feed-like entity with its own refresh cadence. Externally owned; the
/// scheduler reads and writes only these fields.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Source {
    pub id: String,
    pub owner_id: String,
    pub url: String,
    pub refresh_interval_minutes: u32,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_fetch_status: FetchStatus,
    pub last_fetch_error: Option<String>,
}

impl Source {
    /// Clamp the configured interval into the allowed bounds.
    pub fn interval_minutes(&self) -> u32 {
        self.refresh_interval_minutes
            .clamp(MIN_REFRESH_INTERVAL_MINUTES, MAX_REFRESH_INTERVAL_MINUTES)
    }
}

/// Minimal projection used by the due-source sweep.
#[derive(Debug, Clone)]
pub struct SourceBrief {
    pub id: String,
    pub owner_id: String,
    pub refresh_interval_minutes: u32,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

impl SourceBrief {
    /// A source with no history is immediately due; otherwise due once a full
    /// interval has elapsed since the last completed attempt.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_fetched_at {
            None => true,
            Some(last) => {
                let interval = chrono::Duration::seconds(i64::from(
                    self.refresh_interval_minutes
                        .clamp(MIN_REFRESH_INTERVAL_MINUTES, MAX_REFRESH_INTERVAL_MINUTES),
                ) * 60);
                last + interval <= now
            }
        }
    }
}

/// Identifiers of items persisted by a successful fetch/ingest.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub item_ids: Vec<String>,
}

/// Classified fetch/ingest error. Transient errors (network, DNS, timeouts,
/// 5xx-class) are retried with backoff; permanent ones (malformed content,
/// 404-class) are recorded and wait for the next regular interval.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Enrichment pipeline stages, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Normalize,
    Embed,
    CrossRef,
}

impl StageKind {
    /// Chain order: normalize → embed → cross-reference.
    pub const CHAIN: [StageKind; 3] = [StageKind::Normalize, StageKind::Embed, StageKind::CrossRef];

    /// The stage whose completion is the precondition for this one.
    /// `None` for the first stage (its precondition is ingestion itself).
    pub fn upstream(self) -> Option<StageKind> {
        match self {
            StageKind::Normalize => None,
            StageKind::Embed => Some(StageKind::Normalize),
            StageKind::CrossRef => Some(StageKind::Embed),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Normalize => "normalize",
            StageKind::Embed => "embed",
            StageKind::CrossRef => "crossref",
        }
    }
}

/// Tri-state completion flag for one stage of one item. `Pending` is what the
/// compensatory sweep looks for; `Failed` is terminal at item granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Done,
    Failed,
}

/// Narrow persistence accessors for sources. Implementations are external
/// (database-backed in production).
#[async_trait::async_trait]
pub trait SourceStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Source>>;
    async fn list_brief(&self) -> Result<Vec<SourceBrief>>;
    /// Record the outcome of a completed attempt. Called on success AND on
    /// failure — the next due-computation is always relative to `at`.
    async fn record_fetch(
        &self,
        id: &str,
        status: FetchStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// The sole collaborator that talks to the external destination. Must
/// tolerate re-execution for the same source (a crashed run may be repeated).
#[async_trait::async_trait]
pub trait Ingestor: Send + Sync {
    async fn fetch_and_ingest(&self, source: &Source) -> Result<IngestReport, FetchError>;
}

/// One enrichment step. `process` must be idempotent for a given item id.
#[async_trait::async_trait]
pub trait EnrichmentStage: Send + Sync {
    fn kind(&self) -> StageKind;
    async fn process(&self, item_id: &str) -> Result<()>;
}

/// Stage-flag persistence for ingested items.
#[async_trait::async_trait]
pub trait ItemStore: Send + Sync {
    async fn stage_state(&self, item_id: &str, stage: StageKind) -> Result<StageState>;
    async fn mark_stage(&self, item_id: &str, stage: StageKind, state: StageState) -> Result<()>;
    /// Items whose upstream precondition holds but whose flag for `stage` has
    /// been `Pending` for longer than `older_than`. Safety net input for the
    /// compensatory sweep.
    async fn find_stalled(
        &self,
        stage: StageKind,
        older_than: chrono::Duration,
    ) -> Result<Vec<String>>;
}
