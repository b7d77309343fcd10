// src/ratelimit.rs
// Per-destination-domain spacing, enforced across all workers through the
// shared store. A short-lived key per domain acts as the "a request went out
// recently" token; whoever wins set-if-absent may proceed, everyone else
// sleeps out the key's remaining TTL. Soft limit: rather than stalling a
// worker indefinitely behind a busy domain, we give up waiting past
// `max_wait` and proceed.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::store::KvStore;

fn ratelimit_key(domain: &str) -> String {
    format!("ratelimit:{domain}")
}

/// Extract the destination domain from a URL.
pub fn extract_domain(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|s| s.to_ascii_lowercase()))
}

#[derive(Clone)]
pub struct DomainRateLimiter {
    store: Arc<dyn KvStore>,
    min_spacing: Duration,
}

impl DomainRateLimiter {
    pub fn new(store: Arc<dyn KvStore>, min_spacing: Duration) -> Self {
        Self { store, min_spacing }
    }

    /// Wait until the destination's minimum spacing allows another request,
    /// or until `max_wait` elapses (whichever comes first), then claim the
    /// next slot. Returns the time actually waited.
    ///
    /// URLs without a parseable host are not limited.
    pub async fn wait_for_destination(&self, url: &str, max_wait: Duration) -> Duration {
        let Some(domain) = extract_domain(url) else {
            return Duration::ZERO;
        };
        let key = ratelimit_key(&domain);
        let started = tokio::time::Instant::now();

        loop {
            match self.store.set_if_absent(&key, "1", self.min_spacing).await {
                Ok(true) => {
                    let waited = started.elapsed();
                    if !waited.is_zero() {
                        tracing::debug!(domain = %domain, waited_ms = waited.as_millis() as u64, "rate limit wait");
                    }
                    return waited;
                }
                Ok(false) => {}
                Err(e) => {
                    // Store trouble must not block ingestion; the limiter is
                    // protective, not load-bearing.
                    tracing::warn!(error = ?e, domain = %domain, "rate limiter store error; proceeding");
                    return started.elapsed();
                }
            }

            let remaining = self
                .store
                .remaining_ttl(&key)
                .await
                .ok()
                .flatten()
                .unwrap_or(self.min_spacing)
                .max(Duration::from_millis(5));

            if started.elapsed() + remaining > max_wait {
                metrics::counter!("ratelimit_soft_overruns_total").increment(1);
                tracing::debug!(domain = %domain, "rate limit wait would exceed max_wait; proceeding");
                return started.elapsed();
            }
            tokio::time::sleep(remaining).await;
        }
    }
}
