// src/pipeline.rs
// Enrichment chain: normalize → embed → cross-reference. Every stage is a
// standalone idempotent step keyed by item id, with its own tri-state flag.
// Failure isolation is at item granularity — one item's broken stage never
// blocks the rest of a batch.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;

use crate::types::{EnrichmentStage, ItemStore, StageKind, StageState};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "enrichment_stage_runs_total",
            "Stage executions (excluding idempotent skips)."
        );
        describe_counter!(
            "enrichment_stage_skips_total",
            "Stage executions skipped because the flag was already done."
        );
        describe_counter!(
            "enrichment_stage_failures_total",
            "Stage executions that ended in a terminal failure flag."
        );
    });
}

/// Normalize text: decode HTML entities, strip tags, collapse whitespace,
/// trim stray punctuation, cap length.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out = out.trim().to_string();

    // 5) Length cap: 4000 chars
    if out.chars().count() > 4000 {
        out = out.chars().take(4000).collect();
    }

    out
}

/// Raw/normalized content accessors for the built-in normalize stage.
#[async_trait::async_trait]
pub trait ItemContent: Send + Sync {
    async fn raw(&self, item_id: &str) -> Result<Option<String>>;
    async fn store_normalized(&self, item_id: &str, text: &str) -> Result<()>;
}

/// Built-in first stage. Embedding and cross-reference stages are provider
/// calls and stay behind the `EnrichmentStage` trait.
pub struct NormalizeStage {
    content: Arc<dyn ItemContent>,
}

impl NormalizeStage {
    pub fn new(content: Arc<dyn ItemContent>) -> Self {
        Self { content }
    }
}

#[async_trait::async_trait]
impl EnrichmentStage for NormalizeStage {
    fn kind(&self) -> StageKind {
        StageKind::Normalize
    }

    async fn process(&self, item_id: &str) -> Result<()> {
        let raw = self
            .content
            .raw(item_id)
            .await?
            .ok_or_else(|| anyhow!("item {item_id} has no raw content"))?;
        let normalized = normalize_text(&raw);
        self.content.store_normalized(item_id, &normalized).await
    }
}

/// Chains enrichment stages over a set of items, honoring stage flags.
pub struct EnrichmentChain {
    items: Arc<dyn ItemStore>,
    stages: Vec<Arc<dyn EnrichmentStage>>,
}

impl EnrichmentChain {
    /// Stages may be passed in any order; they are run in chain order. Absent
    /// stages are simply skipped (useful in tests and partial deployments).
    pub fn new(items: Arc<dyn ItemStore>, stages: Vec<Arc<dyn EnrichmentStage>>) -> Self {
        let mut ordered: Vec<Arc<dyn EnrichmentStage>> = Vec::with_capacity(stages.len());
        for kind in StageKind::CHAIN {
            if let Some(s) = stages.iter().find(|s| s.kind() == kind) {
                ordered.push(Arc::clone(s));
            }
        }
        Self {
            items,
            stages: ordered,
        }
    }

    pub fn item_store(&self) -> Arc<dyn ItemStore> {
        Arc::clone(&self.items)
    }

    pub fn stage(&self, kind: StageKind) -> Option<Arc<dyn EnrichmentStage>> {
        self.stages.iter().find(|s| s.kind() == kind).cloned()
    }

    /// Run the full chain for each item. Errors are converted to stage flags
    /// and never propagate — the caller fires this and forgets.
    pub async fn run_for_items(&self, item_ids: &[String]) {
        ensure_metrics_described();
        for id in item_ids {
            self.run_item(id).await;
        }
    }

    async fn run_item(&self, item_id: &str) {
        for stage in &self.stages {
            let kind = stage.kind();
            match self.items.stage_state(item_id, kind).await {
                Ok(StageState::Done) => {
                    counter!("enrichment_stage_skips_total").increment(1);
                    continue;
                }
                Ok(StageState::Failed) => break, // terminal for this item
                Ok(StageState::Pending) => {}
                Err(e) => {
                    tracing::warn!(error = ?e, item_id, stage = kind.as_str(), "stage flag lookup failed");
                    break;
                }
            }
            if !self.run_stage(item_id, stage.as_ref()).await {
                break;
            }
        }
    }

    /// Execute one stage for one item and persist its flag. Returns whether
    /// the chain may continue past this stage.
    async fn run_stage(&self, item_id: &str, stage: &dyn EnrichmentStage) -> bool {
        let kind = stage.kind();
        counter!("enrichment_stage_runs_total").increment(1);
        match stage.process(item_id).await {
            Ok(()) => {
                if let Err(e) = self.items.mark_stage(item_id, kind, StageState::Done).await {
                    tracing::warn!(error = ?e, item_id, stage = kind.as_str(), "failed to persist done flag");
                }
                true
            }
            Err(e) => {
                counter!("enrichment_stage_failures_total").increment(1);
                tracing::warn!(error = ?e, item_id, stage = kind.as_str(), "enrichment stage failed");
                if let Err(e) = self
                    .items
                    .mark_stage(item_id, kind, StageState::Failed)
                    .await
                {
                    tracing::warn!(error = ?e, item_id, stage = kind.as_str(), "failed to persist failed flag");
                }
                false
            }
        }
    }

    /// Re-run a single stage for one item (compensatory path). Idempotent:
    /// no-ops if the flag already settled.
    pub async fn run_stage_for_item(&self, item_id: &str, kind: StageKind) {
        ensure_metrics_described();
        let Some(stage) = self.stage(kind) else {
            tracing::warn!(stage = kind.as_str(), "no stage registered for compensatory run");
            return;
        };
        match self.items.stage_state(item_id, kind).await {
            Ok(StageState::Pending) => {
                self.run_stage(item_id, stage.as_ref()).await;
            }
            Ok(_) => {
                counter!("enrichment_stage_skips_total").increment(1);
            }
            Err(e) => {
                tracing::warn!(error = ?e, item_id, stage = kind.as_str(), "stage flag lookup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryItemStore, RecordingStage};

    #[test]
    fn normalize_text_collapses_ws_and_tags() {
        let s = "  <p>Hello,&nbsp;&nbsp; <b>world</b></p>  ";
        assert_eq!(normalize_text(s), "Hello, world");
    }

    #[test]
    fn normalize_text_replaces_smart_quotes() {
        assert_eq!(normalize_text("\u{201C}hi\u{201D} \u{2018}yo\u{2019}"), "\"hi\" 'yo'");
    }

    #[tokio::test]
    async fn chain_runs_stages_in_order_and_sets_flags() {
        let items = Arc::new(InMemoryItemStore::new());
        items.insert_item("it-1", "raw");
        let normalize = Arc::new(RecordingStage::ok(StageKind::Normalize));
        let embed = Arc::new(RecordingStage::ok(StageKind::Embed));
        // Deliberately registered out of order.
        let chain = EnrichmentChain::new(items.clone(), vec![embed.clone(), normalize.clone()]);

        chain.run_for_items(&["it-1".into()]).await;

        assert_eq!(normalize.calls(), vec!["it-1".to_string()]);
        assert_eq!(embed.calls(), vec!["it-1".to_string()]);
        assert_eq!(
            items.stage_state("it-1", StageKind::Normalize).await.unwrap(),
            StageState::Done
        );
        assert_eq!(
            items.stage_state("it-1", StageKind::Embed).await.unwrap(),
            StageState::Done
        );
    }

    #[tokio::test]
    async fn failed_stage_is_terminal_for_that_item_only() {
        let items = Arc::new(InMemoryItemStore::new());
        items.insert_item("bad", "raw");
        items.insert_item("good", "raw");
        let normalize = Arc::new(RecordingStage::failing_for(StageKind::Normalize, "bad"));
        let embed = Arc::new(RecordingStage::ok(StageKind::Embed));
        let chain = EnrichmentChain::new(items.clone(), vec![normalize, embed.clone()]);

        chain.run_for_items(&["bad".into(), "good".into()]).await;

        assert_eq!(
            items.stage_state("bad", StageKind::Normalize).await.unwrap(),
            StageState::Failed
        );
        // Downstream never ran for the bad item...
        assert_eq!(
            items.stage_state("bad", StageKind::Embed).await.unwrap(),
            StageState::Pending
        );
        // ...but the good item went all the way through.
        assert_eq!(
            items.stage_state("good", StageKind::Embed).await.unwrap(),
            StageState::Done
        );
        assert_eq!(embed.calls(), vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn done_stage_is_skipped_idempotently() {
        let items = Arc::new(InMemoryItemStore::new());
        items.insert_item("it-1", "raw");
        items
            .mark_stage("it-1", StageKind::Normalize, StageState::Done)
            .await
            .unwrap();
        let normalize = Arc::new(RecordingStage::ok(StageKind::Normalize));
        let chain = EnrichmentChain::new(items.clone(), vec![normalize.clone()]);

        chain.run_for_items(&["it-1".into()]).await;
        assert!(normalize.calls().is_empty());
    }

    #[tokio::test]
    async fn normalize_stage_writes_normalized_content() {
        let items = Arc::new(InMemoryItemStore::new());
        items.insert_item("it-1", "<h1>Big&nbsp;News</h1>");
        let stage = NormalizeStage::new(items.clone());
        stage.process("it-1").await.unwrap();
        assert_eq!(items.normalized("it-1").as_deref(), Some("Big News"));
    }
}
