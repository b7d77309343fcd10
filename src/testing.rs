// src/testing.rs
// In-memory collaborator fakes. Shipped in src (not tests/) so downstream
// crates can drive the orchestrator in their own tests without a database.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::pipeline::ItemContent;
use crate::types::{
    EnrichmentStage, FetchError, FetchStatus, IngestReport, Ingestor, ItemStore, Source,
    SourceBrief, SourceStore, StageKind, StageState,
};

// ---------- sources ----------

#[derive(Default)]
pub struct InMemorySourceStore {
    sources: Mutex<HashMap<String, Source>>,
}

impl InMemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source: Source) {
        self.sources.lock().insert(source.id.clone(), source);
    }

    /// Simulates external deletion of a source.
    pub fn remove(&self, id: &str) {
        self.sources.lock().remove(id);
    }

    pub fn snapshot(&self, id: &str) -> Option<Source> {
        self.sources.lock().get(id).cloned()
    }
}

#[async_trait::async_trait]
impl SourceStore for InMemorySourceStore {
    async fn get(&self, id: &str) -> Result<Option<Source>> {
        Ok(self.sources.lock().get(id).cloned())
    }

    async fn list_brief(&self) -> Result<Vec<SourceBrief>> {
        Ok(self
            .sources
            .lock()
            .values()
            .map(|s| SourceBrief {
                id: s.id.clone(),
                owner_id: s.owner_id.clone(),
                refresh_interval_minutes: s.refresh_interval_minutes,
                last_fetched_at: s.last_fetched_at,
            })
            .collect())
    }

    async fn record_fetch(
        &self,
        id: &str,
        status: FetchStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut map = self.sources.lock();
        if let Some(s) = map.get_mut(id) {
            s.last_fetched_at = Some(at);
            s.last_fetch_status = status;
            s.last_fetch_error = error;
        }
        Ok(())
    }
}

// ---------- items ----------

#[derive(Clone)]
struct ItemRecord {
    raw: String,
    normalized: Option<String>,
    ingested_at: DateTime<Utc>,
    flags: HashMap<StageKind, (StageState, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct InMemoryItemStore {
    items: Mutex<HashMap<String, ItemRecord>>,
}

impl InMemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_item(&self, id: &str, raw: &str) {
        self.items.lock().insert(
            id.to_string(),
            ItemRecord {
                raw: raw.to_string(),
                normalized: None,
                ingested_at: Utc::now(),
                flags: HashMap::new(),
            },
        );
    }

    /// Backdate an item so `find_stalled` sees it past the age threshold.
    pub fn backdate_item(&self, id: &str, by: chrono::Duration) {
        let mut map = self.items.lock();
        if let Some(rec) = map.get_mut(id) {
            rec.ingested_at -= by;
            for (_, ts) in rec.flags.values_mut() {
                *ts -= by;
            }
        }
    }

    pub fn normalized(&self, id: &str) -> Option<String> {
        self.items.lock().get(id).and_then(|r| r.normalized.clone())
    }

    pub fn item_ids(&self) -> Vec<String> {
        self.items.lock().keys().cloned().collect()
    }
}

#[async_trait::async_trait]
impl ItemStore for InMemoryItemStore {
    async fn stage_state(&self, item_id: &str, stage: StageKind) -> Result<StageState> {
        Ok(self
            .items
            .lock()
            .get(item_id)
            .and_then(|r| r.flags.get(&stage))
            .map(|(state, _)| *state)
            .unwrap_or(StageState::Pending))
    }

    async fn mark_stage(&self, item_id: &str, stage: StageKind, state: StageState) -> Result<()> {
        let mut map = self.items.lock();
        if let Some(rec) = map.get_mut(item_id) {
            rec.flags.insert(stage, (state, Utc::now()));
        }
        Ok(())
    }

    async fn find_stalled(
        &self,
        stage: StageKind,
        older_than: chrono::Duration,
    ) -> Result<Vec<String>> {
        let cutoff = Utc::now() - older_than;
        let map = self.items.lock();
        let mut out = Vec::new();
        for (id, rec) in map.iter() {
            let pending = !rec.flags.contains_key(&stage)
                || rec.flags.get(&stage).is_some_and(|(s, _)| *s == StageState::Pending);
            if !pending {
                continue;
            }
            // Upstream precondition: previous stage done, or (for the first
            // stage) the item having been ingested at all.
            let since = match stage.upstream() {
                None => rec.ingested_at,
                Some(up) => match rec.flags.get(&up) {
                    Some((StageState::Done, at)) => *at,
                    _ => continue,
                },
            };
            if since <= cutoff {
                out.push(id.clone());
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl ItemContent for InMemoryItemStore {
    async fn raw(&self, item_id: &str) -> Result<Option<String>> {
        Ok(self.items.lock().get(item_id).map(|r| r.raw.clone()))
    }

    async fn store_normalized(&self, item_id: &str, text: &str) -> Result<()> {
        let mut map = self.items.lock();
        if let Some(rec) = map.get_mut(item_id) {
            rec.normalized = Some(text.to_string());
        }
        Ok(())
    }
}

// ---------- ingestor ----------

enum Scripted {
    Success(Vec<String>),
    Transient(String),
    Permanent(String),
}

/// Ingestor with a scripted queue of outcomes. An empty queue yields empty
/// successes, so tests only script what they care about.
#[derive(Default)]
pub struct ScriptedIngestor {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<String>>,
    latency: Mutex<Duration>,
}

impl ScriptedIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_success<I: IntoIterator<Item = S>, S: Into<String>>(&self, item_ids: I) {
        self.script.lock().push_back(Scripted::Success(
            item_ids.into_iter().map(Into::into).collect(),
        ));
    }

    pub fn push_transient(&self, msg: &str) {
        self.script.lock().push_back(Scripted::Transient(msg.into()));
    }

    pub fn push_permanent(&self, msg: &str) {
        self.script.lock().push_back(Scripted::Permanent(msg.into()));
    }

    /// Make every fetch take this long (for timeout tests).
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl Ingestor for ScriptedIngestor {
    async fn fetch_and_ingest(&self, source: &Source) -> Result<IngestReport, FetchError> {
        self.calls.lock().push(source.id.clone());
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match self.script.lock().pop_front() {
            None => Ok(IngestReport::default()),
            Some(Scripted::Success(item_ids)) => Ok(IngestReport { item_ids }),
            Some(Scripted::Transient(msg)) => Err(FetchError::Transient(msg)),
            Some(Scripted::Permanent(msg)) => Err(FetchError::Permanent(msg)),
        }
    }
}

// ---------- stages ----------

enum StageBehavior {
    Ok,
    FailFor(String),
    FailAll,
}

pub struct RecordingStage {
    kind: StageKind,
    behavior: StageBehavior,
    calls: Mutex<Vec<String>>,
}

impl RecordingStage {
    pub fn ok(kind: StageKind) -> Self {
        Self {
            kind,
            behavior: StageBehavior::Ok,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_for(kind: StageKind, item_id: &str) -> Self {
        Self {
            kind,
            behavior: StageBehavior::FailFor(item_id.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(kind: StageKind) -> Self {
        Self {
            kind,
            behavior: StageBehavior::FailAll,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl EnrichmentStage for RecordingStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn process(&self, item_id: &str) -> Result<()> {
        self.calls.lock().push(item_id.to_string());
        match &self.behavior {
            StageBehavior::Ok => Ok(()),
            StageBehavior::FailFor(bad) if bad == item_id => {
                Err(anyhow::anyhow!("scripted failure for {item_id}"))
            }
            StageBehavior::FailFor(_) => Ok(()),
            StageBehavior::FailAll => Err(anyhow::anyhow!("scripted failure")),
        }
    }
}

/// Convenience constructor for a ready-to-go source.
pub fn source(id: &str, owner: &str, interval_minutes: u32) -> Source {
    Source {
        id: id.to_string(),
        owner_id: owner.to_string(),
        url: format!("https://feeds.example.com/{id}.xml"),
        refresh_interval_minutes: interval_minutes,
        last_fetched_at: None,
        last_fetch_status: FetchStatus::None,
        last_fetch_error: None,
    }
}

/// Build a chain whose stages all succeed, recording calls.
pub fn all_ok_chain(items: Arc<InMemoryItemStore>) -> crate::pipeline::EnrichmentChain {
    crate::pipeline::EnrichmentChain::new(
        items,
        vec![
            Arc::new(RecordingStage::ok(StageKind::Normalize)),
            Arc::new(RecordingStage::ok(StageKind::Embed)),
            Arc::new(RecordingStage::ok(StageKind::CrossRef)),
        ],
    )
}

/// Fully wired orchestrator over in-memory collaborators.
pub struct Harness {
    pub store: Arc<crate::store::MemoryStore>,
    pub sources: Arc<InMemorySourceStore>,
    pub items: Arc<InMemoryItemStore>,
    pub ingestor: Arc<ScriptedIngestor>,
    pub sched: crate::scheduler::RefreshScheduler,
}

impl Harness {
    pub fn new(cfg: crate::config::OrchestratorConfig) -> Self {
        let items = Arc::new(InMemoryItemStore::new());
        Self::with_stages(
            cfg,
            Arc::clone(&items),
            vec![
                Arc::new(RecordingStage::ok(StageKind::Normalize)),
                Arc::new(RecordingStage::ok(StageKind::Embed)),
                Arc::new(RecordingStage::ok(StageKind::CrossRef)),
            ],
        )
    }

    pub fn with_stages(
        cfg: crate::config::OrchestratorConfig,
        items: Arc<InMemoryItemStore>,
        stages: Vec<Arc<dyn EnrichmentStage>>,
    ) -> Self {
        let store = Arc::new(crate::store::MemoryStore::new());
        let sources = Arc::new(InMemorySourceStore::new());
        let ingestor = Arc::new(ScriptedIngestor::new());
        let chain = Arc::new(crate::pipeline::EnrichmentChain::new(
            Arc::clone(&items) as Arc<dyn ItemStore>,
            stages,
        ));
        let sched = crate::scheduler::RefreshScheduler::new(
            cfg,
            Arc::clone(&store) as Arc<dyn crate::store::KvStore>,
            Arc::clone(&sources) as Arc<dyn SourceStore>,
            Arc::clone(&ingestor) as Arc<dyn Ingestor>,
            chain,
        );
        Self {
            store,
            sources,
            items,
            ingestor,
            sched,
        }
    }
}

/// Config with all timing knobs dialed down for fast tests.
pub fn fast_config() -> crate::config::OrchestratorConfig {
    let mut cfg = crate::config::OrchestratorConfig::default();
    cfg.min_domain_spacing_ms = 1;
    cfg.rate_limit_max_wait_secs = 1;
    cfg.fetch_soft_timeout_secs = 5;
    cfg.fetch_hard_timeout_secs = 10;
    cfg.retry.base_delay_ms = 5;
    cfg.retry.max_delay_ms = 20;
    cfg.retry.jitter_ms = 2;
    cfg.compensatory_min_age_secs = 1;
    cfg
}

/// Poll until an item's stage flag reaches `want`, or time out. Enrichment
/// dispatch is fire-and-forget, so tests wait on the flag itself.
pub async fn wait_for_stage(
    items: &InMemoryItemStore,
    item_id: &str,
    stage: StageKind,
    want: StageState,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if items.stage_state(item_id, stage).await.unwrap_or(StageState::Pending) == want {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
