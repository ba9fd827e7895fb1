//! Segment byte cache
//!
//! Two tiers: a preload set of idle fallback clips that is never evicted, and an
//! LRU over everything else. Misses start one spawned fetch per name; concurrent
//! requests for the same name share its result.

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{ResourceFetcher, ThroughputTracker};
use crate::config::IdleClip;
use crate::{Result, SessionError};

type SharedLoad = Shared<BoxFuture<'static, std::result::Result<Bytes, Arc<SessionError>>>>;

/// Asset cache budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetCacheConfig {
    /// Byte budget for the LRU tier
    pub max_bytes: usize,
    /// Entry budget for the LRU tier
    pub max_entries: usize,
    /// Entries idle longer than this are evicted first, in seconds
    pub idle_ttl_secs: u64,
    /// Entries always kept regardless of budget
    pub min_retained: usize,
}

impl Default for AssetCacheConfig {
    fn default() -> Self {
        Self { max_bytes: 64 * 1024 * 1024, max_entries: 48, idle_ttl_secs: 300, min_retained: 2 }
    }
}

impl AssetCacheConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

#[derive(Debug)]
struct CachedSegment {
    bytes: Bytes,
    last_access: Instant,
}

struct CacheState {
    preload: HashMap<Arc<str>, Bytes>,
    lru: LruCache<Arc<str>, CachedSegment>,
    total_bytes: usize,
    in_flight: HashMap<Arc<str>, SharedLoad>,
}

/// Segment byte cache shared by every decode worker.
pub struct AssetCache {
    fetcher: Arc<dyn ResourceFetcher>,
    config: AssetCacheConfig,
    fetch_timeout: Duration,
    base_url: RwLock<String>,
    state: Mutex<CacheState>,
    throughput: Mutex<ThroughputTracker>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AssetCache")
            .field("preloaded", &state.preload.len())
            .field("cached", &state.lru.len())
            .field("total_bytes", &state.total_bytes)
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

impl AssetCache {
    /// Create a cache. Outstanding fetches stop when `cancel` fires.
    pub fn new(
        fetcher: Arc<dyn ResourceFetcher>,
        config: AssetCacheConfig,
        fetch_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            config,
            fetch_timeout,
            base_url: RwLock::new(String::new()),
            state: Mutex::new(CacheState {
                preload: HashMap::new(),
                lru: LruCache::unbounded(),
                total_bytes: 0,
                in_flight: HashMap::new(),
            }),
            throughput: Mutex::new(ThroughputTracker::new()),
            cancel,
        }
    }

    /// Point segment names at a resource pack.
    pub fn set_base_url(&self, url: &str) {
        *self.base_url.write() = url.trim_end_matches('/').to_string();
    }

    fn segment_url(&self, name: &str) -> String {
        let base = self.base_url.read();
        if base.is_empty() { name.to_string() } else { format!("{}/{}", base, name) }
    }

    /// Bytes for segment `name`.
    pub async fn load_segment(self: &Arc<Self>, name: &str) -> Result<Bytes> {
        let load = {
            let mut state = self.state.lock();
            if let Some(bytes) = state.preload.get(name) {
                trace!(segment = name, "Preload hit");
                return Ok(bytes.clone());
            }
            if let Some(entry) = state.lru.get_mut(name) {
                entry.last_access = Instant::now();
                trace!(segment = name, "Cache hit");
                return Ok(entry.bytes.clone());
            }
            match state.in_flight.get(name).cloned() {
                Some(load) => load,
                None => self.start_load(&mut state, name),
            }
        };

        load.await.map_err(|e| SessionError::fetch_failed(name, e.to_string()))
    }

    /// Warm the cache for `name` without waiting.
    pub fn prefetch(self: &Arc<Self>, name: &str) {
        let mut state = self.state.lock();
        if state.preload.contains_key(name)
            || state.lru.contains(name)
            || state.in_flight.contains_key(name)
        {
            return;
        }
        debug!(segment = name, "Prefetching");
        // The fetch runs on its own task; later loads join it through `in_flight`
        let _ = self.start_load(&mut state, name);
    }

    // The state lock is held by the caller, so the spawned fetch cannot finish and
    // unregister itself before it is registered here.
    fn start_load(self: &Arc<Self>, state: &mut CacheState, name: &str) -> SharedLoad {
        let key: Arc<str> = Arc::from(name);
        let this = Arc::clone(self);
        let task_key = Arc::clone(&key);
        let handle = tokio::spawn(async move { this.fetch_and_store(task_key).await });

        let segment = name.to_string();
        let load = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(Arc::new(SessionError::fetch_failed(segment, e.to_string()))),
            }
        }
        .boxed()
        .shared();

        state.in_flight.insert(key, load.clone());
        load
    }

    async fn fetch_and_store(
        &self,
        key: Arc<str>,
    ) -> std::result::Result<Bytes, Arc<SessionError>> {
        let url = self.segment_url(&key);
        let started = Instant::now();

        let fetch = tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch_bytes(&url, None));
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(SessionError::Closed),
            fetched = fetch => {
                match fetched {
                    Ok(result) => result,
                    Err(_) => Err(SessionError::Timeout { duration: self.fetch_timeout }),
                }
            }
        };

        let mut state = self.state.lock();
        state.in_flight.remove(&key);

        match result {
            Ok(bytes) => {
                self.throughput.lock().record(bytes.len(), started.elapsed());
                let now = Instant::now();
                state.total_bytes += bytes.len();
                let entry = CachedSegment { bytes: bytes.clone(), last_access: now };
                if let Some(old) = state.lru.put(Arc::clone(&key), entry) {
                    state.total_bytes = state.total_bytes.saturating_sub(old.bytes.len());
                }
                self.evict(&mut state, now);
                debug!(segment = %key, bytes = bytes.len(), "Segment cached");
                Ok(bytes)
            }
            Err(e) => {
                warn!(segment = %key, error = %e, "Segment fetch failed");
                Err(Arc::new(e))
            }
        }
    }

    fn evict(&self, state: &mut CacheState, now: Instant) {
        let min_retained = self.config.min_retained;
        let ttl = self.config.idle_ttl();

        let expired: Vec<Arc<str>> = state
            .lru
            .iter()
            .rev()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_access) > ttl)
            .map(|(key, _)| Arc::clone(key))
            .collect();
        for key in expired {
            if state.lru.len() <= min_retained {
                break;
            }
            if let Some(entry) = state.lru.pop(&key) {
                state.total_bytes = state.total_bytes.saturating_sub(entry.bytes.len());
                trace!(segment = %key, "Evicted idle segment");
            }
        }

        let over_budget = |state: &CacheState| {
            state.total_bytes > self.config.max_bytes || state.lru.len() > self.config.max_entries
        };
        while state.lru.len() > min_retained && over_budget(state) {
            let Some((key, entry)) = state.lru.pop_lru() else { break };
            state.total_bytes = state.total_bytes.saturating_sub(entry.bytes.len());
            trace!(segment = %key, "Evicted least recently used segment");
        }
    }

    /// Fetch the idle fallback clips into the non-evictable preload set.
    ///
    /// Returns how many clips are available afterwards. Failures are logged and
    /// skipped; offline playback cycles whatever loaded.
    pub async fn preload_idle_clips(&self, clips: &[IdleClip]) -> usize {
        for clip in clips {
            if self.state.lock().preload.contains_key(clip.name.as_str()) {
                continue;
            }
            let url = self.segment_url(&clip.name);
            let started = Instant::now();
            let fetch =
                tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch_bytes(&url, None));
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => break,
                fetched = fetch => fetched,
            };
            match fetched {
                Ok(Ok(bytes)) => {
                    self.throughput.lock().record(bytes.len(), started.elapsed());
                    self.state.lock().preload.insert(Arc::from(clip.name.as_str()), bytes);
                    debug!(clip = %clip.name, "Preloaded idle clip");
                }
                Ok(Err(e)) => warn!(clip = %clip.name, error = %e, "Idle clip preload failed"),
                Err(_) => warn!(clip = %clip.name, "Idle clip preload timed out"),
            }
        }
        self.state.lock().preload.len()
    }

    /// Whether `name` is in the preload set.
    pub fn is_preloaded(&self, name: &str) -> bool {
        self.state.lock().preload.contains_key(name)
    }

    /// Clips to fetch ahead of the active decode task.
    pub fn prefetch_depth(&self, max_ahead: usize) -> usize {
        self.throughput.lock().prefetch_depth(max_ahead)
    }

    pub fn throughput(&self) -> ThroughputTracker {
        self.throughput.lock().clone()
    }

    /// Entries in the LRU tier.
    pub fn len(&self) -> usize {
        self.state.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by the LRU tier.
    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    /// Drop the LRU tier and forget in-flight loads. The preload set survives.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.lru.clear();
        state.total_bytes = 0;
        state.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockFetcher;

    fn cache_with(fetcher: Arc<MockFetcher>, config: AssetCacheConfig) -> Arc<AssetCache> {
        let cache =
            AssetCache::new(fetcher, config, Duration::from_millis(2000), CancellationToken::new());
        cache.set_base_url("https://cdn.example.test/pack/");
        Arc::new(cache)
    }

    #[tokio::test]
    async fn concurrent_loads_fetch_once() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond_bytes("https://cdn.example.test/pack/idle01", vec![7u8; 32]);
        fetcher.set_delay(Duration::from_millis(20));
        let cache = cache_with(fetcher.clone(), AssetCacheConfig::default());

        let (a, b, c) = tokio::join!(
            cache.load_segment("idle01"),
            cache.load_segment("idle01"),
            cache.load_segment("idle01"),
        );
        assert_eq!(a.unwrap().len(), 32);
        assert_eq!(b.unwrap(), c.unwrap());
        assert_eq!(fetcher.fetch_count("https://cdn.example.test/pack/idle01"), 1);

        cache.load_segment("idle01").await.unwrap();
        assert_eq!(fetcher.fetch_count("https://cdn.example.test/pack/idle01"), 1);
    }

    #[tokio::test]
    async fn lru_never_drops_below_min_retained() {
        let fetcher = Arc::new(MockFetcher::new());
        for name in ["a", "b", "c", "d"] {
            fetcher.respond_bytes(&format!("https://cdn.example.test/pack/{name}"), vec![0u8; 100]);
        }
        let config =
            AssetCacheConfig { max_bytes: 10, max_entries: 1, ..AssetCacheConfig::default() };
        let cache = cache_with(fetcher.clone(), config);

        for name in ["a", "b", "c", "d"] {
            cache.load_segment(name).await.unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_bytes(), 200);

        // "c" and "d" are the survivors
        cache.load_segment("d").await.unwrap();
        cache.load_segment("c").await.unwrap();
        assert_eq!(fetcher.fetch_count("https://cdn.example.test/pack/c"), 1);
        assert_eq!(fetcher.fetch_count("https://cdn.example.test/pack/d"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entries_are_evicted_first() {
        let fetcher = Arc::new(MockFetcher::new());
        for name in ["a", "b", "c", "d"] {
            fetcher.respond_bytes(&format!("https://cdn.example.test/pack/{name}"), vec![0u8; 10]);
        }
        let config = AssetCacheConfig { idle_ttl_secs: 60, ..AssetCacheConfig::default() };
        let cache = cache_with(fetcher.clone(), config);

        cache.load_segment("a").await.unwrap();
        cache.load_segment("b").await.unwrap();
        cache.load_segment("c").await.unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        cache.load_segment("d").await.unwrap();

        // Two stale entries go, one stays to honour min_retained
        assert_eq!(cache.len(), 2);
        cache.load_segment("d").await.unwrap();
        assert_eq!(fetcher.fetch_count("https://cdn.example.test/pack/d"), 1);
    }

    #[tokio::test]
    async fn preloaded_clips_bypass_the_lru() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond_bytes("https://cdn.example.test/pack/idle01", vec![1u8; 8]);
        let cache = cache_with(fetcher.clone(), AssetCacheConfig::default());

        let loaded = cache.preload_idle_clips(&[IdleClip::new("idle01", 24)]).await;
        assert_eq!(loaded, 1);
        assert!(cache.is_preloaded("idle01"));

        cache.clear();
        cache.load_segment("idle01").await.unwrap();
        assert_eq!(cache.len(), 0);
        assert_eq!(fetcher.fetch_count("https://cdn.example.test/pack/idle01"), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let fetcher = Arc::new(MockFetcher::new());
        let cache = cache_with(fetcher.clone(), AssetCacheConfig::default());

        let err = cache.load_segment("missing").await.unwrap_err();
        assert!(matches!(err, SessionError::Fetch { .. }));
        assert!(!err.is_fatal());

        fetcher.respond_bytes("https://cdn.example.test/pack/missing", vec![1u8]);
        assert!(cache.load_segment("missing").await.is_ok());
    }

    #[tokio::test]
    async fn prefetch_warms_the_cache() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond_bytes("https://cdn.example.test/pack/talk", vec![3u8; 4]);
        let cache = cache_with(fetcher.clone(), AssetCacheConfig::default());

        cache.prefetch("talk");
        cache.prefetch("talk");
        let bytes = cache.load_segment("talk").await.unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(fetcher.fetch_count("https://cdn.example.test/pack/talk"), 1);
    }

    #[tokio::test]
    async fn prefetch_completes_without_a_waiting_load() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond_bytes("https://cdn.example.test/pack/talk", vec![3u8; 4]);
        let cache = cache_with(fetcher.clone(), AssetCacheConfig::default());

        cache.prefetch("talk");
        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("prefetch never stored the segment");

        assert_eq!(cache.total_bytes(), 4);
        assert!(cache.load_segment("talk").await.is_ok());
        assert_eq!(fetcher.fetch_count("https://cdn.example.test/pack/talk"), 1);
    }
}
