// src/lib.rs
// Public library surface for embedding the orchestrator (and for tests).

pub mod config;
pub mod lock;
pub mod metrics;
pub mod pipeline;
pub mod ratelimit;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod sweep;
pub mod types;

// In-memory collaborator fakes, reusable by downstream crates' tests.
pub mod testing;

// ---- Re-exports for stable public API ----
pub use crate::config::OrchestratorConfig;
pub use crate::lock::LockManager;
pub use crate::metrics::Metrics;
pub use crate::pipeline::{EnrichmentChain, NormalizeStage};
pub use crate::ratelimit::DomainRateLimiter;
pub use crate::retry::RetryPolicy;
pub use crate::scheduler::{delay_until_due, DispatchMode, RefreshScheduler, RunOutcome};
pub use crate::store::{KvStore, MemoryStore};
pub use crate::sweep::{BatchOrchestrator, SweepReport};
pub use crate::types::{
    EnrichmentStage, FetchError, FetchStatus, IngestReport, Ingestor, ItemStore, Source,
    SourceBrief, SourceStore, StageKind, StageState,
};

#[cfg(feature = "redis-store")]
pub use crate::store::redis::RedisStore;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Enable compact tracing logs in development only.
/// Activation requires BOTH:
///   - dev environment (debug build OR FEEDSCHED_ENV in {local, development, dev})
///   - FEEDSCHED_DEV_LOG=1
pub fn enable_dev_tracing() {
    let _ = dotenvy::dotenv();

    let dev_flag = std::env::var("FEEDSCHED_DEV_LOG")
        .ok()
        .is_some_and(|v| v == "1");

    let is_dev_env = cfg!(debug_assertions)
        || matches!(
            std::env::var("FEEDSCHED_ENV")
                .unwrap_or_default()
                .to_ascii_lowercase()
                .as_str(),
            "local" | "development" | "dev"
        );

    if !(dev_flag && is_dev_env) {
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feedsched=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}
