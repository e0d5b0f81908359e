//! Per-key token-bucket rate limiting.
//!
//! Buckets are keyed by `(endpoint, client_key)` and allocated lazily on
//! first request. Pre-handshake endpoints key by peer address; every
//! authenticated endpoint keys by the caller's `runtime_id`. Endpoints
//! without configured settings are uncapped. A sweeper removes buckets
//! idle for longer than a configured threshold.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bucket key for callers that present neither an address nor an identity.
pub const ANONYMOUS_CLIENT_KEY: &str = "anonymous";

/// Per-endpoint refill rate and burst capacity.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    /// Tokens replenished per second.
    pub rate: f64,
    /// Maximum bucket capacity.
    pub burst: f64,
}

impl RateLimitSettings {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self { rate, burst }
    }
}

struct RateBucket {
    tokens: f64,
    last_refill: Instant,
    last_touched: Instant,
}

impl RateBucket {
    fn new(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
            last_touched: now,
        }
    }

    /// Refill from elapsed time, then try to consume one token.
    fn try_consume(&mut self, settings: RateLimitSettings, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * settings.rate).min(settings.burst);
        self.last_refill = now;
        self.last_touched = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token-bucket rate limiter over `(endpoint, client_key)` pairs.
///
/// The common path updates an existing bucket through the map's sharded
/// locking; creating a bucket briefly takes the shard's write side.
pub struct RateLimiter {
    buckets: DashMap<(String, String), RateBucket>,
    settings: HashMap<String, RateLimitSettings>,
}

impl RateLimiter {
    /// Build a limiter from per-endpoint settings. Endpoints absent from
    /// the map are not limited.
    pub fn new(settings: HashMap<String, RateLimitSettings>) -> Self {
        Self {
            buckets: DashMap::new(),
            settings,
        }
    }

    /// An uncapped limiter (no endpoint settings).
    pub fn unlimited() -> Self {
        Self::new(HashMap::new())
    }

    /// Whether one request for `client_key` against `endpoint` is allowed
    /// right now.
    pub fn allow(&self, endpoint: &str, client_key: &str) -> bool {
        let Some(&settings) = self.settings.get(endpoint) else {
            return true;
        };
        let now = Instant::now();
        let key = (endpoint.to_string(), client_key.to_string());
        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| RateBucket::new(settings.burst, now));
        bucket.try_consume(settings, now)
    }

    /// Remove buckets untouched for longer than `idle_threshold`. Returns
    /// the number removed.
    pub fn sweep(&self, idle_threshold: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_touched) <= idle_threshold);
        let removed = before - self.buckets.len();
        if removed > 0 {
            debug!(removed, "[RateLimit] Swept idle buckets");
        }
        removed
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Run [`RateLimiter::sweep`] every `interval` until cancelled.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    idle_threshold: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    limiter.sweep(idle_threshold);
                }
            }
        }
    })
}
