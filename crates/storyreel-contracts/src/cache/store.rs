use std::env;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::events::EventWriter;

use super::backend::{CacheRecord, StorageBackend};

const DEFAULT_MAX_ENTRIES: usize = 64;
const DEFAULT_MAX_TOTAL_BYTES: u64 = 256 * 1024 * 1024;

// Base64 expands 3 payload bytes into 4 text characters.
const ENCODED_BYTES_PER_CHUNK: u64 = 4;
const DECODED_BYTES_PER_CHUNK: u64 = 3;

/// Bounds enforced by the eviction sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_total_bytes: u64,
}

impl CacheLimits {
    pub const fn new(max_entries: usize, max_total_bytes: u64) -> Self {
        Self {
            max_entries,
            max_total_bytes,
        }
    }

    /// Compiled defaults, overridable via `STORYREEL_CACHE_MAX_ENTRIES`
    /// and `STORYREEL_CACHE_MAX_BYTES`.
    pub fn from_env() -> Self {
        let max_entries = env::var("STORYREEL_CACHE_MAX_ENTRIES")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_ENTRIES);
        let max_total_bytes = env::var("STORYREEL_CACHE_MAX_BYTES")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_MAX_TOTAL_BYTES);
        Self::new(max_entries, max_total_bytes)
    }
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_TOTAL_BYTES)
    }
}

/// Read-only snapshot of the store; computing it never mutates state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
}

/// Bounded, LRU-evicted store for generated assets keyed by fingerprint.
///
/// An explicitly constructed handle, not a process-wide singleton: every
/// consumer receives its cache (and, via the backend trait, its storage
/// medium) from whoever owns the run. The cache is strictly an
/// optimization: every storage failure is logged through the event
/// writer and degrades to a miss or a no-op, never an error the caller
/// has to handle.
#[derive(Clone)]
pub struct AssetCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    backend: Box<dyn StorageBackend>,
    limits: CacheLimits,
    events: Option<EventWriter>,
    stamp: AtomicI64,
}

impl AssetCache {
    /// Open the cache over an injected backend. Seeding the recency stamp
    /// from the newest persisted record keeps LRU order monotonic across
    /// process restarts; a failing backend seeds from the wall clock and
    /// the cache behaves as empty.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        limits: CacheLimits,
        events: Option<EventWriter>,
    ) -> Self {
        let seed = backend
            .fetch_all()
            .ok()
            .and_then(|rows| rows.iter().map(|row| row.touched_at).max())
            .unwrap_or_else(|| Utc::now().timestamp_micros());
        let cache = Self {
            inner: Arc::new(CacheInner {
                backend,
                limits,
                events,
                stamp: AtomicI64::new(seed),
            }),
        };
        let stats = cache.stats();
        cache.inner.log(
            "cache_opened",
            json!({
                "entry_count": stats.entry_count,
                "total_bytes": stats.total_bytes,
                "max_entries": limits.max_entries,
                "max_bytes": limits.max_total_bytes,
            }),
        );
        cache
    }

    /// Look up a payload. A hit refreshes and persists the entry's
    /// recency stamp before returning. Eviction order is purely
    /// stamp-driven, so a read that does not persist its touch would not
    /// protect the entry.
    pub fn get(&self, fingerprint: &str) -> Option<String> {
        let mut record = match self.inner.backend.fetch(fingerprint) {
            Ok(found) => found?,
            Err(err) => {
                self.inner.log(
                    "cache_read_failed",
                    json!({ "fingerprint": fingerprint, "error": format!("{err:#}") }),
                );
                return None;
            }
        };
        record.touched_at = self.inner.next_stamp();
        if let Err(err) = self.inner.backend.store(&record) {
            self.inner.log(
                "cache_touch_failed",
                json!({ "fingerprint": fingerprint, "error": format!("{err:#}") }),
            );
        }
        Some(record.payload)
    }

    /// Store a payload, overwriting any entry with the same fingerprint.
    /// The write completes before this returns; the eviction sweep runs on
    /// a detached thread so a caller that just stored a large asset is not
    /// blocked behind a scan of the whole store.
    pub fn put(&self, fingerprint: &str, payload_text: &str) {
        let record = CacheRecord {
            fingerprint: fingerprint.to_string(),
            payload: payload_text.to_string(),
            touched_at: self.inner.next_stamp(),
            approx_bytes: approx_payload_bytes(payload_text),
        };
        if let Err(err) = self.inner.backend.store(&record) {
            // the generated asset still reaches the caller; only the
            // memoization opportunity is lost
            self.inner.log(
                "cache_write_failed",
                json!({ "fingerprint": fingerprint, "error": format!("{err:#}") }),
            );
            return;
        }

        let inner = Arc::clone(&self.inner);
        thread::spawn(move || inner.sweep());
    }

    /// Run the eviction sweep synchronously to fixpoint. `put` triggers
    /// this in the background; callers needing deterministic bounds (and
    /// tests) can invoke it directly.
    pub fn evict(&self) {
        self.inner.sweep();
    }

    /// Remove every entry unconditionally.
    pub fn clear(&self) {
        if let Err(err) = self.inner.backend.clear() {
            self.inner
                .log("cache_clear_failed", json!({ "error": format!("{err:#}") }));
            return;
        }
        self.inner.log("cache_cleared", json!({}));
    }

    /// Snapshot the store. Degrades to an empty view when the backend is
    /// unavailable.
    pub fn stats(&self) -> CacheStats {
        match self.inner.backend.fetch_all() {
            Ok(rows) => CacheStats {
                entry_count: rows.len(),
                total_bytes: rows.iter().map(|row| row.approx_bytes).sum(),
                max_bytes: self.inner.limits.max_total_bytes,
            },
            Err(err) => {
                self.inner
                    .log("cache_stats_failed", json!({ "error": format!("{err:#}") }));
                CacheStats {
                    entry_count: 0,
                    total_bytes: 0,
                    max_bytes: self.inner.limits.max_total_bytes,
                }
            }
        }
    }

    pub fn limits(&self) -> CacheLimits {
        self.inner.limits
    }

    /// Log shutdown. Outstanding background sweeps are idempotent and
    /// safe to let run to completion.
    pub fn close(&self) {
        self.inner.log("cache_closed", json!({}));
    }
}

impl CacheInner {
    /// Monotonic microsecond stamp: wall clock when it moves forward,
    /// previous stamp plus one on ties, so LRU order is total even for
    /// writes within one clock tick.
    fn next_stamp(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let mut prev = self.stamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .stamp
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Oldest-first sweep: drop entries while the count bound is
    /// exceeded, then while the byte bound is. A failed delete is logged
    /// and the entry treated as retained; bounds may stay exceeded until
    /// the next sweep.
    fn sweep(&self) {
        let mut rows = match self.backend.fetch_all() {
            Ok(rows) => rows,
            Err(err) => {
                self.log("cache_evict_failed", json!({ "error": format!("{err:#}") }));
                return;
            }
        };
        rows.sort_by_key(|row| row.touched_at);

        let mut count = rows.len();
        let mut total: u64 = rows.iter().map(|row| row.approx_bytes).sum();
        let mut evicted = 0usize;

        for row in &rows {
            let over_count = count > self.limits.max_entries;
            let over_bytes = total > self.limits.max_total_bytes;
            if !over_count && !over_bytes {
                break;
            }
            match self.backend.remove(&row.fingerprint) {
                Ok(()) => {
                    count -= 1;
                    total -= row.approx_bytes;
                    evicted += 1;
                }
                Err(err) => {
                    self.log(
                        "cache_evict_failed",
                        json!({
                            "fingerprint": row.fingerprint,
                            "error": format!("{err:#}"),
                        }),
                    );
                }
            }
        }

        if evicted > 0 {
            self.log(
                "cache_evicted",
                json!({
                    "evicted": evicted,
                    "entry_count": count,
                    "total_bytes": total,
                }),
            );
        }
    }

    fn log(&self, event: &str, fields: Value) {
        if let Some(events) = &self.events {
            let _ = events.emit(event, fields);
        }
    }
}

/// Estimate the decoded size of a stored payload. Data-URI payloads are
/// base64 text, so the true byte count is 3/4 of the encoded body, not
/// the raw string length.
pub fn approx_payload_bytes(payload: &str) -> u64 {
    match payload.split_once(',') {
        Some((header, body)) if header.contains(";base64") => {
            (body.len() as u64) * DECODED_BYTES_PER_CHUNK / ENCODED_BYTES_PER_CHUNK
        }
        _ => payload.len() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::super::backend::{CacheRecord, MemoryBackend, StorageBackend};
    use super::{approx_payload_bytes, AssetCache, CacheLimits};

    struct BrokenBackend;

    impl StorageBackend for BrokenBackend {
        fn fetch(&self, _fingerprint: &str) -> anyhow::Result<Option<CacheRecord>> {
            anyhow::bail!("storage offline")
        }
        fn store(&self, _record: &CacheRecord) -> anyhow::Result<()> {
            anyhow::bail!("storage offline")
        }
        fn fetch_all(&self) -> anyhow::Result<Vec<CacheRecord>> {
            anyhow::bail!("storage offline")
        }
        fn remove(&self, _fingerprint: &str) -> anyhow::Result<()> {
            anyhow::bail!("storage offline")
        }
        fn clear(&self) -> anyhow::Result<()> {
            anyhow::bail!("storage offline")
        }
    }

    fn open(limits: CacheLimits) -> AssetCache {
        AssetCache::open(Box::new(MemoryBackend::new()), limits, None)
    }

    // the only test touching these variables, so no cross-test races
    #[test]
    fn limits_from_env_parse_or_fall_back() {
        use std::env;

        env::remove_var("STORYREEL_CACHE_MAX_ENTRIES");
        env::remove_var("STORYREEL_CACHE_MAX_BYTES");
        assert_eq!(CacheLimits::from_env(), CacheLimits::default());

        env::set_var("STORYREEL_CACHE_MAX_ENTRIES", " 8 ");
        env::set_var("STORYREEL_CACHE_MAX_BYTES", "4096");
        assert_eq!(CacheLimits::from_env(), CacheLimits::new(8, 4096));

        env::set_var("STORYREEL_CACHE_MAX_ENTRIES", "not-a-number");
        env::set_var("STORYREEL_CACHE_MAX_BYTES", "");
        assert_eq!(CacheLimits::from_env(), CacheLimits::default());

        env::remove_var("STORYREEL_CACHE_MAX_ENTRIES");
        env::remove_var("STORYREEL_CACHE_MAX_BYTES");
    }

    fn data_uri(body: &str) -> String {
        format!("data:image/png;base64,{body}")
    }

    #[test]
    fn put_then_get_round_trips_exactly() {
        let cache = open(CacheLimits::default());
        let payload = data_uri("AAAABBBBCCCC");
        cache.put("fp-1", &payload);
        assert_eq!(cache.get("fp-1").as_deref(), Some(payload.as_str()));
        assert_eq!(cache.get("fp-2"), None);
    }

    #[test]
    fn put_overwrites_existing_payload() {
        let cache = open(CacheLimits::default());
        cache.put("fp-1", &data_uri("old"));
        cache.put("fp-1", &data_uri("new1"));
        cache.evict();
        assert_eq!(cache.get("fp-1"), Some(data_uri("new1")));
        assert_eq!(cache.stats().entry_count, 1);
    }

    #[test]
    fn count_bound_evicts_oldest_first() {
        let cache = open(CacheLimits::new(3, u64::MAX));
        for idx in 0..5 {
            cache.put(&format!("fp-{idx}"), &data_uri("XXXX"));
        }
        cache.evict();

        assert_eq!(cache.stats().entry_count, 3);
        assert_eq!(cache.get("fp-0"), None);
        assert_eq!(cache.get("fp-1"), None);
        assert!(cache.get("fp-2").is_some());
        assert!(cache.get("fp-3").is_some());
        assert!(cache.get("fp-4").is_some());
    }

    #[test]
    fn byte_bound_evicts_until_under_limit() {
        // each payload: 16 encoded chars -> 12 approx bytes
        let cache = open(CacheLimits::new(usize::MAX, 30));
        for idx in 0..4 {
            cache.put(&format!("fp-{idx}"), &data_uri("AAAABBBBCCCCDDDD"));
        }
        cache.evict();

        let stats = cache.stats();
        assert!(stats.total_bytes <= 30);
        assert_eq!(stats.entry_count, 2);
        assert_eq!(cache.get("fp-0"), None);
        assert_eq!(cache.get("fp-1"), None);
        assert!(cache.get("fp-3").is_some());
    }

    #[test]
    fn single_put_can_push_both_bounds_over() {
        let cache = open(CacheLimits::new(2, 25));
        cache.put("fp-0", &data_uri("AAAABBBBCCCCDDDD")); // 12 bytes
        cache.put("fp-1", &data_uri("AAAABBBBCCCCDDDD")); // 12 bytes
        cache.put("fp-2", &data_uri("AAAABBBBCCCCDDDD")); // 12 bytes
        cache.evict();

        // count bound leaves two entries, byte bound then removes one more
        let stats = cache.stats();
        assert_eq!(stats.entry_count, 2);
        assert!(stats.total_bytes <= 25);
    }

    #[test]
    fn touch_on_read_saves_entry_from_eviction() {
        let cache = open(CacheLimits::new(2, u64::MAX));
        cache.put("fp-old", &data_uri("XXXX"));
        cache.put("fp-mid", &data_uri("XXXX"));

        // reading the oldest refreshes its recency
        assert!(cache.get("fp-old").is_some());

        cache.put("fp-new", &data_uri("XXXX"));
        cache.evict();

        assert_eq!(cache.stats().entry_count, 2);
        assert_eq!(cache.get("fp-mid"), None);
        assert!(cache.get("fp-old").is_some());
        assert!(cache.get("fp-new").is_some());
    }

    #[test]
    fn clear_empties_the_store() {
        let cache = open(CacheLimits::default());
        cache.put("fp-1", &data_uri("XXXX"));
        cache.put("fp-2", &data_uri("XXXX"));
        cache.clear();

        assert_eq!(cache.get("fp-1"), None);
        assert_eq!(cache.get("fp-2"), None);
        assert_eq!(cache.stats().entry_count, 0);
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[test]
    fn stats_reflect_limits_and_contents() {
        let cache = open(CacheLimits::new(10, 1000));
        cache.put("fp-1", &data_uri("AAAABBBB")); // 8 chars -> 6 bytes
        let stats = cache.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_bytes, 6);
        assert_eq!(stats.max_bytes, 1000);
    }

    #[test]
    fn broken_backend_degrades_to_miss() {
        let cache = AssetCache::open(Box::new(BrokenBackend), CacheLimits::default(), None);
        cache.put("fp-1", "data:image/png;base64,AAAA");
        assert_eq!(cache.get("fp-1"), None);

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.total_bytes, 0);

        // none of these may panic or propagate
        cache.clear();
        cache.evict();
        cache.close();
    }

    #[test]
    fn approx_bytes_applies_base64_ratio() {
        assert_eq!(approx_payload_bytes("data:image/png;base64,AAAABBBB"), 6);
        assert_eq!(approx_payload_bytes("data:video/mp4;base64,AAAA"), 3);
        // non-base64 text is counted as-is
        assert_eq!(approx_payload_bytes("plain text payload"), 18);
    }

    #[test]
    fn persisted_recency_survives_reopen() {
        use std::sync::Arc;

        #[derive(Clone)]
        struct SharedBackend(Arc<MemoryBackend>);

        impl StorageBackend for SharedBackend {
            fn fetch(&self, fingerprint: &str) -> anyhow::Result<Option<CacheRecord>> {
                self.0.fetch(fingerprint)
            }
            fn store(&self, record: &CacheRecord) -> anyhow::Result<()> {
                self.0.store(record)
            }
            fn fetch_all(&self) -> anyhow::Result<Vec<CacheRecord>> {
                self.0.fetch_all()
            }
            fn remove(&self, fingerprint: &str) -> anyhow::Result<()> {
                self.0.remove(fingerprint)
            }
            fn clear(&self) -> anyhow::Result<()> {
                self.0.clear()
            }
        }

        let shared = Arc::new(MemoryBackend::new());
        let cache = AssetCache::open(
            Box::new(SharedBackend(Arc::clone(&shared))),
            CacheLimits::new(2, u64::MAX),
            None,
        );
        cache.put("fp-old", &data_uri("XXXX"));
        cache.put("fp-new", &data_uri("XXXX"));

        // a fresh handle over the same backend must not reuse stamps older
        // than what is persisted, or new writes would sort before old ones
        let reopened = AssetCache::open(
            Box::new(SharedBackend(shared)),
            CacheLimits::new(2, u64::MAX),
            None,
        );
        reopened.put("fp-latest", &data_uri("XXXX"));
        reopened.evict();

        assert_eq!(reopened.stats().entry_count, 2);
        assert_eq!(reopened.get("fp-old"), None);
        assert!(reopened.get("fp-new").is_some());
        assert!(reopened.get("fp-latest").is_some());
    }
}
