// Quota Guard: layered sliding-window buckets in front of every upstream call.
//
// Search and detail calls pass through the global monthly quota, the global
// per-second ceiling and a per-user bucket for their scope. Admission locks
// every applicable bucket in tier order, checks all of them and only then
// records the hit, so two callers can never both take the last unit.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{QuotaConfig, RateLimit, RetryConfig};
use crate::error::LayoverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Search,
    Detail,
    Upload,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Search => "search",
            Scope::Detail => "detail",
            Scope::Upload => "upload",
        }
    }

    // Scopes that end in a paid upstream call also draw from the global buckets
    fn uses_global(&self) -> bool {
        matches!(self, Scope::Search | Scope::Detail)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// A bucket had no room. `retry_after` is the longest wait among the
// exhausted buckets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bucket {bucket} exhausted, retry after {}ms", retry_after.as_millis())]
pub struct Exhausted {
    pub bucket: String,
    pub retry_after: Duration,
}

#[derive(Debug)]
pub struct RateBucket {
    name: String,
    limit: RateLimit,
    hits: Mutex<VecDeque<Instant>>,
}

impl RateBucket {
    pub fn new(name: impl Into<String>, limit: RateLimit) -> Self {
        Self {
            name: name.into(),
            limit,
            hits: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // Drop hits that fell out of the window, then report how long until a
    // slot frees up (None when one is free now)
    fn wait_time(&self, hits: &mut VecDeque<Instant>, now: Instant) -> Option<Duration> {
        let window = self.limit.window();
        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) >= window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if self.limit.max_requests == 0 {
            return Some(window);
        }
        if hits.len() < self.limit.max_requests as usize {
            return None;
        }

        // The slot frees when the hit that pushed us to capacity ages out
        let idx = hits.len() - self.limit.max_requests as usize;
        let blocking = hits[idx];
        Some((blocking + window).saturating_duration_since(now))
    }

    // No hit left inside the window
    fn is_idle(&self) -> bool {
        let mut hits = self.hits.lock();
        self.wait_time(&mut hits, Instant::now());
        hits.is_empty()
    }

    pub fn remaining(&self) -> u32 {
        let mut hits = self.hits.lock();
        self.wait_time(&mut hits, Instant::now());
        self.limit.max_requests.saturating_sub(hits.len() as u32)
    }
}

// Admissions between sweeps of idle per-user buckets
const EVICT_EVERY: usize = 1024;

pub struct QuotaGuard {
    config: QuotaConfig,
    monthly: Arc<RateBucket>,
    per_second: Arc<RateBucket>,
    scoped: DashMap<(Scope, String), Arc<RateBucket>>,
    admissions: AtomicUsize,
}

impl QuotaGuard {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            monthly: Arc::new(RateBucket::new("global:monthly", config.monthly)),
            per_second: Arc::new(RateBucket::new("global:second", config.per_second)),
            scoped: DashMap::new(),
            admissions: AtomicUsize::new(0),
            config,
        }
    }

    fn scoped_limit(&self, scope: Scope) -> RateLimit {
        match scope {
            Scope::Search => self.config.search_per_user,
            Scope::Detail => self.config.detail_per_user,
            Scope::Upload => self.config.upload_per_user,
        }
    }

    fn scoped_bucket(&self, scope: Scope, key: &str) -> Arc<RateBucket> {
        self.scoped
            .entry((scope, key.to_string()))
            .or_insert_with(|| {
                Arc::new(RateBucket::new(
                    format!("{}:{}", scope, key),
                    self.scoped_limit(scope),
                ))
            })
            .clone()
    }

    // Always monthly, then per-second, then scoped. The fixed order keeps
    // concurrent admissions from deadlocking on each other
    fn buckets_for(&self, scope: Scope, key: &str) -> Vec<Arc<RateBucket>> {
        let mut buckets = Vec::with_capacity(3);
        if scope.uses_global() {
            buckets.push(self.monthly.clone());
            buckets.push(self.per_second.clone());
        }
        buckets.push(self.scoped_bucket(scope, key));
        buckets
    }

    // Non-blocking admission. Either every applicable bucket records the
    // hit, or none does and the caller gets a retry-after hint.
    pub fn try_admit(&self, scope: Scope, key: &str) -> Result<(), Exhausted> {
        if self.admissions.fetch_add(1, Ordering::Relaxed) % EVICT_EVERY == EVICT_EVERY - 1 {
            self.evict_idle();
        }

        let buckets = self.buckets_for(scope, key);
        let mut guards: Vec<MutexGuard<'_, VecDeque<Instant>>> =
            buckets.iter().map(|b| b.hits.lock()).collect();

        let now = Instant::now();
        let mut exhausted: Option<Exhausted> = None;

        for (bucket, hits) in buckets.iter().zip(guards.iter_mut()) {
            if let Some(wait) = bucket.wait_time(hits, now) {
                let longer = exhausted
                    .as_ref()
                    .map_or(true, |e| wait > e.retry_after);
                if longer {
                    exhausted = Some(Exhausted {
                        bucket: bucket.name().to_string(),
                        retry_after: wait,
                    });
                }
            }
        }

        if let Some(e) = exhausted {
            debug!(scope = %scope, key, bucket = %e.bucket, retry_after_ms = e.retry_after.as_millis() as u64, "quota exhausted");
            return Err(e);
        }

        for hits in guards.iter_mut() {
            hits.push_back(now);
        }

        Ok(())
    }

    // Blocking admission used right before an upstream call. Waits for
    // capacity with backoff, giving up when the retry budget is spent or the
    // required wait exceeds `max_wait_ms`.
    pub async fn admit(&self, scope: Scope, key: &str) -> Result<(), LayoverError> {
        let policy = &self.config.retry;
        let max_wait = Duration::from_millis(policy.max_wait_ms);
        let mut attempt = 0;

        loop {
            let exhausted = match self.try_admit(scope, key) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if attempt >= policy.max_retries || exhausted.retry_after > max_wait {
                warn!(
                    scope = %scope,
                    key,
                    bucket = %exhausted.bucket,
                    attempts = attempt + 1,
                    "giving up waiting for quota"
                );
                return Err(exhausted.into());
            }

            let delay = exhausted
                .retry_after
                .max(calculate_backoff(attempt, policy))
                .min(max_wait);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    // Drop per-user buckets with no hit inside their window. A bucket some
    // caller still holds is kept: new handles are only handed out under the
    // map's shard lock, so a count of one means nobody can be using it.
    pub fn evict_idle(&self) -> usize {
        let before = self.scoped.len();
        self.scoped
            .retain(|_, bucket| Arc::strong_count(bucket) > 1 || !bucket.is_idle());
        let evicted = before.saturating_sub(self.scoped.len());
        if evicted > 0 {
            debug!(evicted, "evicted idle quota buckets");
        }
        evicted
    }

    pub fn tracked_buckets(&self) -> usize {
        self.scoped.len()
    }

    // Remaining capacity of every bucket that applies to `(scope, key)`.
    pub fn remaining(&self, scope: Scope, key: &str) -> Vec<(String, u32)> {
        self.buckets_for(scope, key)
            .iter()
            .map(|b| (b.name().to_string(), b.remaining()))
            .collect()
    }
}

// Exponential backoff with jitter to avoid a thundering herd
pub fn calculate_backoff(retry_attempt: u32, config: &RetryConfig) -> Duration {
    let base_backoff_ms = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powf(retry_attempt as f64))
    .min(config.max_backoff_ms as f64);

    let jitter = rand::random::<f64>() * config.jitter_factor * base_backoff_ms;
    let backoff_ms = base_backoff_ms * (1.0 - config.jitter_factor / 2.0) + jitter;

    Duration::from_millis(backoff_ms as u64)
}
