// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::retry::RetryPolicy;

const ENV_PATH: &str = "FEEDSCHED_CONFIG_PATH";

/// Orchestrator tuning knobs. Defaults match production values; tests dial
/// the timing fields way down.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Grace added to a Job Handle's TTL on top of the refresh interval.
    pub job_handle_grace_secs: u64,
    /// Soft timeout for a fetch/ingest call; overruns are logged.
    pub fetch_soft_timeout_secs: u64,
    /// Hard timeout for a fetch/ingest call; overruns abort the attempt.
    pub fetch_hard_timeout_secs: u64,
    /// Margin added to the hard timeout when sizing the per-source lock TTL.
    pub lock_margin_secs: u64,
    /// Minimum spacing between requests to one destination domain.
    pub min_domain_spacing_ms: u64,
    /// Longest a run will wait on the rate limiter before proceeding anyway.
    pub rate_limit_max_wait_secs: u64,
    /// Period of the due-source sweep; the sweep-overlap lock TTL is derived
    /// from it (period − 5s, floored at 1s).
    pub sweep_period_secs: u64,
    /// How long a stage flag may sit Pending before the compensatory sweep
    /// considers the dispatch lost.
    pub compensatory_min_age_secs: u64,
    /// Parallel refresh jobs per owner during a batch sweep.
    pub max_parallel_refreshes: usize,
    /// Persisted fetch-error text is truncated to this many characters.
    pub error_text_max_chars: usize,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            job_handle_grace_secs: 300,
            fetch_soft_timeout_secs: 30,
            fetch_hard_timeout_secs: 120,
            lock_margin_secs: 30,
            min_domain_spacing_ms: 1_000,
            rate_limit_max_wait_secs: 15,
            sweep_period_secs: 60,
            compensatory_min_age_secs: 300,
            max_parallel_refreshes: 4,
            error_text_max_chars: 500,
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Per-source lock TTL: must outlive one hard-timeout attempt plus every
    /// backoff sleep the retry policy can produce, with margin. Renewals
    /// during retries reset it to this same value, so the lease holds even
    /// when a single backoff exceeds the hard timeout.
    pub fn source_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.fetch_hard_timeout_secs + self.lock_margin_secs)
            + self.retry.worst_case_total()
    }

    pub fn sweep_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.sweep_period_secs.saturating_sub(5).max(1))
    }

    pub fn job_handle_ttl(&self, interval_minutes: u32) -> Duration {
        Duration::from_secs(u64::from(interval_minutes) * 60 + self.job_handle_grace_secs)
    }

    pub fn fetch_hard_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_hard_timeout_secs)
    }

    pub fn fetch_soft_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_soft_timeout_secs)
    }

    pub fn min_domain_spacing(&self) -> Duration {
        Duration::from_millis(self.min_domain_spacing_ms)
    }

    pub fn rate_limit_max_wait(&self) -> Duration {
        Duration::from_secs(self.rate_limit_max_wait_secs)
    }

    pub fn compensatory_min_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.compensatory_min_age_secs as i64)
    }

    /// Load from an explicit path. Supports TOML or JSON formats.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        Self::parse(&content, ext.as_str())
    }

    /// Load using env var + fallbacks:
    /// 1) $FEEDSCHED_CONFIG_PATH
    /// 2) config/feedsched.toml
    /// 3) config/feedsched.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            } else {
                return Err(anyhow!("FEEDSCHED_CONFIG_PATH points to non-existent path"));
            }
        }
        let toml_p = PathBuf::from("config/feedsched.toml");
        if toml_p.exists() {
            return Self::load_from(&toml_p);
        }
        let json_p = PathBuf::from("config/feedsched.json");
        if json_p.exists() {
            return Self::load_from(&json_p);
        }
        Ok(Self::default())
    }

    fn parse(s: &str, hint_ext: &str) -> Result<Self> {
        if hint_ext == "json" {
            return serde_json::from_str(s).context("parsing JSON config");
        }
        if let Ok(v) = toml::from_str(s) {
            return Ok(v);
        }
        serde_json::from_str(s).context("unsupported config format")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn defaults_and_derived_ttls() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.job_handle_grace_secs, 300);
        assert_eq!(cfg.retry.max_attempts, 3);
        // 120s hard timeout + 30s margin + worst-case backoff sleeps
        // (2s + 1s jitter) + (4s + 1s jitter) = 158s.
        assert_eq!(cfg.source_lock_ttl(), Duration::from_secs(158));
        assert_eq!(cfg.sweep_lock_ttl(), Duration::from_secs(55));
        assert_eq!(cfg.job_handle_ttl(30), Duration::from_secs(30 * 60 + 300));
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let cfg = OrchestratorConfig::parse(
            "sweep_period_secs = 10\nmax_parallel_refreshes = 2\n",
            "toml",
        )
        .unwrap();
        assert_eq!(cfg.sweep_period_secs, 10);
        assert_eq!(cfg.max_parallel_refreshes, 2);
        assert_eq!(cfg.job_handle_grace_secs, 300); // untouched default
        assert_eq!(cfg.sweep_lock_ttl(), Duration::from_secs(5));
    }

    #[test]
    fn json_round_trips() {
        let cfg = OrchestratorConfig::default();
        let s = serde_json::to_string(&cfg).unwrap();
        let back = OrchestratorConfig::parse(&s, "json").unwrap();
        assert_eq!(back.sweep_period_secs, cfg.sweep_period_secs);
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();

        env::remove_var(ENV_PATH);

        // No files in temp CWD → built-in defaults
        let v = OrchestratorConfig::load_default().unwrap();
        assert_eq!(v.sweep_period_secs, 60);

        // Env var takes precedence
        let p = tmp.path().join("feedsched.toml");
        std::fs::write(&p, "sweep_period_secs = 7\n").unwrap();
        env::set_var(ENV_PATH, p.display().to_string());
        let v2 = OrchestratorConfig::load_default().unwrap();
        assert_eq!(v2.sweep_period_secs, 7);
        env::remove_var(ENV_PATH);

        env::set_current_dir(&old).unwrap();
    }
}
