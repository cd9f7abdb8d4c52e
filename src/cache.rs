// Response cache fronting every upstream call.
//
// Entries are keyed by a digest of the canonicalized request parameters and
// carry an absolute wall-clock expiry. Expired entries read as absent and are
// reclaimed on the next write; there is no background sweeper.

use std::{
    fs::File,
    future::Future,
    io::{BufReader, BufWriter},
    path::Path,
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot encoding error: {0}")]
    Encode(String),

    #[error("Snapshot decoding error: {0}")]
    Decode(String),

    #[error("Payload serialization error: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub items_count: usize,
    pub size_bytes: usize,
    pub hit_count: usize,
    pub miss_count: usize,
    pub expired_count: usize,
    pub reclaimed_count: usize,
}

// Content address of a logical request.
//
// Built from `(name, value)` pairs sorted before hashing, so the order the
// parameters are supplied in never changes the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_params<I, K, V>(params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let mut pairs: Vec<(String, String)> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.to_string()))
            .collect();
        pairs.sort();

        Self::from_canonical(&canonicalize(&pairs))
    }

    fn from_canonical(canonical: &str) -> Self {
        let digest = Sha256::digest(canonical.as_bytes());
        CacheKey(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// `name=value` joined by `&`, each part JSON-quoted so separators inside
// values cannot collide
fn canonicalize(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                serde_json::Value::from(k.as_str()),
                serde_json::Value::from(v.as_str())
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    payload: Bytes,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_alive(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<(CacheKey, CacheEntry)>,
}

pub struct ResponseCache {
    store: DashMap<CacheKey, CacheEntry>,
    config: CacheConfig,
    cache_stats: RwLock<CacheStats>,
    // Earliest expiry among stored entries; writes skip the sweep until it passes
    earliest_expiry: Mutex<Option<DateTime<Utc>>>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            store: DashMap::new(),
            config,
            cache_stats: RwLock::new(CacheStats::default()),
            earliest_expiry: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn expiry_after(ttl: Duration) -> DateTime<Utc> {
        let ttl =
            chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let now = Utc::now();
        let hit = match self.store.get(key) {
            Some(entry) if entry.is_alive(now) => Some(entry.payload.clone()),
            Some(_) => {
                self.cache_stats.write().expired_count += 1;
                None
            }
            None => None,
        };

        let mut stats = self.cache_stats.write();
        if hit.is_some() {
            stats.hit_count += 1;
        } else {
            stats.miss_count += 1;
        }

        hit
    }

    // Replace whatever is stored under `key`. `ttl` of `None` uses the
    // configured default. Expired entries are reclaimed on the way out.
    pub fn put(&self, key: CacheKey, payload: Bytes, ttl: Option<Duration>) {
        let expires_at = Self::expiry_after(ttl.unwrap_or_else(|| self.config.default_ttl()));
        self.store.insert(
            key,
            CacheEntry {
                payload,
                expires_at,
            },
        );
        self.reclaim_expired(expires_at);
    }

    // Sweeps only once the earliest known expiry has passed, then moves the
    // watermark to the earliest survivor
    fn reclaim_expired(&self, inserted: DateTime<Utc>) {
        let now = Utc::now();
        let mut earliest = self.earliest_expiry.lock();
        let watermark = match *earliest {
            Some(t) if t <= inserted => t,
            _ => inserted,
        };
        *earliest = Some(watermark);
        if now < watermark {
            return;
        }

        let before = self.store.len();
        self.store.retain(|_, entry| entry.is_alive(now));
        let reclaimed = before.saturating_sub(self.store.len());
        *earliest = self.store.iter().map(|e| e.value().expires_at).min();

        if reclaimed > 0 {
            debug!(reclaimed, "reclaimed expired cache entries");
            self.cache_stats.write().reclaimed_count += reclaimed;
        }
    }

    // Get-or-populate. Concurrent misses on one key may each run `producer`;
    // the last writer wins, which is fine because writes replace by key.
    pub async fn use_or_insert<F, Fut, E>(
        &self,
        key: CacheKey,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<Bytes, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        if let Some(payload) = self.get(&key) {
            return Ok(payload);
        }

        let payload = producer().await?;
        self.put(key, payload.clone(), ttl);
        Ok(payload)
    }

    // Typed read. A payload that no longer deserializes counts as a miss.
    pub fn get_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let payload = self.get(key)?;
        match serde_json::from_slice(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "discarding undecodable cache payload");
                None
            }
        }
    }

    pub fn put_json<T: Serialize>(
        &self,
        key: CacheKey,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_vec(value)?;
        self.put(key, Bytes::from(payload), ttl);
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.cache_stats.read().clone();
        stats.items_count = self.store.len();
        stats.size_bytes = self
            .store
            .iter()
            .map(|e| e.key().as_str().len() + e.value().payload.len())
            .sum();
        stats
    }

    // Write every live entry to `path`. Returns how many were written.
    pub fn snapshot(&self, path: &Path) -> Result<usize, CacheError> {
        let now = Utc::now();
        let entries: Vec<(CacheKey, CacheEntry)> = self
            .store
            .iter()
            .filter(|e| e.value().is_alive(now))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let count = entries.len();

        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, &Snapshot { entries })
            .map_err(|e| CacheError::Encode(e.to_string()))?;

        info!(path = %path.display(), entries = count, "cache snapshot written");
        Ok(count)
    }

    // Load a snapshot written by `snapshot`, skipping
    // entries that expired in the meantime. Returns how many were loaded.
    pub fn restore(&self, path: &Path) -> Result<usize, CacheError> {
        let reader = BufReader::new(File::open(path)?);
        let snapshot: Snapshot =
            bincode::deserialize_from(reader).map_err(|e| CacheError::Decode(e.to_string()))?;

        let now = Utc::now();
        let mut loaded = 0;
        for (key, entry) in snapshot.entries {
            if entry.is_alive(now) {
                self.store.insert(key, entry);
                loaded += 1;
            }
        }
        *self.earliest_expiry.lock() = self.store.iter().map(|e| e.value().expires_at).min();

        info!(path = %path.display(), entries = loaded, "cache snapshot restored");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn cache() -> ResponseCache {
        ResponseCache::new(CacheConfig::default())
    }

    #[test]
    fn test_key_ignores_parameter_order() {
        let a = CacheKey::from_params([
            ("origin", "LAX"),
            ("dest", "NRT"),
            ("date", "2024-05-01"),
            ("return_date", "2024-05-10"),
        ]);
        let b = CacheKey::from_params([
            ("return_date", "2024-05-10"),
            ("date", "2024-05-01"),
            ("origin", "LAX"),
            ("dest", "NRT"),
        ]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        let swapped = CacheKey::from_params([
            ("origin", "NRT"),
            ("dest", "LAX"),
            ("date", "2024-05-01"),
            ("return_date", "2024-05-10"),
        ]);
        assert_ne!(a, swapped);
    }

    #[test]
    fn test_key_separators_do_not_collide() {
        let a = CacheKey::from_params([("a", "1&b=2")]);
        let b = CacheKey::from_params([("a", "1"), ("b", "2")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_expiration_and_ttl() {
        let cache = cache();
        let short = CacheKey::from_params([("id", "short")]);
        let long = CacheKey::from_params([("id", "long")]);

        cache.put(short.clone(), Bytes::from_static(b"a"), Some(Duration::from_millis(50)));
        cache.put(long.clone(), Bytes::from_static(b"b"), None);

        assert!(cache.get(&short).is_some());
        thread::sleep(Duration::from_millis(80));

        assert!(cache.get(&short).is_none());
        assert_eq!(cache.get(&long), Some(Bytes::from_static(b"b")));

        let stats = cache.stats();
        assert_eq!(stats.expired_count, 1);
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 1);
    }

    #[test]
    fn test_expired_entries_reclaimed_on_write() {
        let cache = cache();
        for i in 0..10 {
            let key = CacheKey::from_params([("id", i)]);
            cache.put(key, Bytes::from_static(b"x"), Some(Duration::from_millis(10)));
        }
        thread::sleep(Duration::from_millis(30));
        // Reads never delete
        assert_eq!(cache.stats().items_count, 10);

        cache.put(CacheKey::from_params([("id", "fresh")]), Bytes::from_static(b"y"), None);
        let stats = cache.stats();
        assert_eq!(stats.items_count, 1);
        assert_eq!(stats.reclaimed_count, 10);
    }

    #[test]
    fn test_sweep_waits_for_earliest_expiry() {
        let cache = cache();
        cache.put(CacheKey::from_params([("id", "a")]), Bytes::from_static(b"a"), Some(Duration::from_millis(20)));
        cache.put(CacheKey::from_params([("id", "b")]), Bytes::from_static(b"b"), Some(Duration::from_millis(200)));
        cache.put(CacheKey::from_params([("id", "c")]), Bytes::from_static(b"c"), None);
        assert_eq!(cache.stats().reclaimed_count, 0);

        thread::sleep(Duration::from_millis(40));
        cache.put(CacheKey::from_params([("id", "d")]), Bytes::from_static(b"d"), None);
        assert_eq!(cache.stats().reclaimed_count, 1);
        assert_eq!(cache.stats().items_count, 3);

        // The watermark moved on to "b", which has not expired yet
        cache.put(CacheKey::from_params([("id", "e")]), Bytes::from_static(b"e"), None);
        assert_eq!(cache.stats().items_count, 4);

        thread::sleep(Duration::from_millis(200));
        cache.put(CacheKey::from_params([("id", "f")]), Bytes::from_static(b"f"), None);
        let stats = cache.stats();
        assert_eq!(stats.reclaimed_count, 2);
        assert_eq!(stats.items_count, 4);
    }

    #[test]
    fn test_put_replaces() {
        let cache = cache();
        let key = CacheKey::from_params([("id", 1)]);
        cache.put(key.clone(), Bytes::from_static(b"old"), None);
        cache.put(key.clone(), Bytes::from_static(b"new"), None);
        assert_eq!(cache.get(&key), Some(Bytes::from_static(b"new")));
        assert_eq!(cache.stats().items_count, 1);
    }

    #[tokio::test]
    async fn test_use_or_insert_only_calls_producer_on_miss() {
        let cache = cache();
        let key = CacheKey::from_params([("id", 7)]);

        let first: Result<Bytes, String> = cache
            .use_or_insert(key.clone(), None, || async { Ok(Bytes::from_static(b"fetched")) })
            .await;
        assert_eq!(first.unwrap(), Bytes::from_static(b"fetched"));

        let second: Result<Bytes, String> = cache
            .use_or_insert(key.clone(), None, || async {
                Err("producer must not run on a hit".to_string())
            })
            .await;
        assert_eq!(second.unwrap(), Bytes::from_static(b"fetched"));

        let other = CacheKey::from_params([("id", 8)]);
        let failed: Result<Bytes, String> = cache
            .use_or_insert(other.clone(), None, || async { Err("boom".to_string()) })
            .await;
        assert!(failed.is_err());
        assert!(cache.get(&other).is_none());
    }

    #[test]
    fn test_undecodable_json_is_a_miss() {
        let cache = cache();
        let key = CacheKey::from_params([("id", "bad")]);
        cache.put(key.clone(), Bytes::from_static(b"not json"), None);
        assert!(cache.get_json::<Vec<u32>>(&key).is_none());

        cache.put_json(key.clone(), &vec![1u32, 2, 3], None).unwrap();
        assert_eq!(cache.get_json::<Vec<u32>>(&key), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_snapshot_round_trip_skips_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");

        let cache = cache();
        let live = CacheKey::from_params([("id", "live")]);
        cache.put(live.clone(), Bytes::from_static(b"keep"), None);
        cache.put(
            CacheKey::from_params([("id", "dying")]),
            Bytes::from_static(b"drop"),
            Some(Duration::from_millis(20)),
        );
        thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.snapshot(&path).unwrap(), 1);

        let restored = ResponseCache::new(CacheConfig::default());
        assert_eq!(restored.restore(&path).unwrap(), 1);
        assert_eq!(restored.get(&live), Some(Bytes::from_static(b"keep")));
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        std::fs::write(&path, b"nope").unwrap();

        let cache = cache();
        assert!(matches!(cache.restore(&path), Err(CacheError::Decode(_))));
    }

    #[test]
    fn test_concurrent_access_with_contention() {
        let cache = Arc::new(cache());
        let popular: Vec<CacheKey> = (0..3).map(|i| CacheKey::from_params([("id", i)])).collect();

        let mut handles = vec![];
        for t in 0..8 {
            let cache = cache.clone();
            let popular = popular.clone();
            handles.push(thread::spawn(move || {
                for j in 0..500usize {
                    let key = if j % 5 == 0 {
                        CacheKey::from_params([("id", format!("{}-{}", t, j))])
                    } else {
                        popular[j % popular.len()].clone()
                    };
                    if j % 10 < 8 {
                        let _ = cache.get(&key);
                    } else {
                        cache.put(key, Bytes::from(vec![t as u8, j as u8]), None);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = cache.stats();
        assert_eq!(stats.hit_count + stats.miss_count, 8 * 400);
        assert!(stats.hit_count > 0);
    }
}
