//! The async execution kernel every plugin embeds.
//!
//! [`BaseAsyncPlugin`] bundles what an adapter needs to talk to a hostile
//! upstream safely: one tuned HTTP client built at construction, a bounded
//! worker semaphore for detail-page fan-out, a retry policy, and the
//! two-level cache that gives callers the
//! "initial snapshot + background refresh" behaviour.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use pansou_core::{Ext, PluginSearchResult, SearchResult};
use pansou_transport::{HttpClientConfig, RetryPolicy};

use crate::cache::{CacheLookup, TwoLevelCache};
use crate::error::{KernelError, PluginError, PluginResult};

/// Default snapshot freshness window.
const DEFAULT_FRESH_TTL: Duration = Duration::from_secs(30 * 60);
/// Default stale-but-servable window, measured from the store time.
const DEFAULT_STALE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
/// Default synchronous search budget.
const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(12);
/// Default detail-page worker pool size.
const DEFAULT_WORKERS: usize = 12;

/// Builder for [`BaseAsyncPlugin`].
pub struct BaseAsyncPluginBuilder {
    name: String,
    priority: i32,
    skip_filter: bool,
    client_config: HttpClientConfig,
    retry: RetryPolicy,
    workers: usize,
    sync_timeout: Duration,
    fresh_ttl: Duration,
    stale_ttl: Duration,
}

impl BaseAsyncPluginBuilder {
    /// Per-attempt HTTP timeout (plugin-configurable, 8–15 s band).
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.client_config.timeout = timeout;
        self
    }

    pub fn client_config(mut self, config: HttpClientConfig) -> Self {
        self.client_config = config;
        self
    }

    /// Retry budget; rate-limited upstreams pass [`RetryPolicy::once`].
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Concurrent sub-request bound, 6–30 depending on upstream tolerance.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, 64);
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn cache_ttls(mut self, fresh: Duration, stale: Duration) -> Self {
        self.fresh_ttl = fresh;
        self.stale_ttl = stale;
        self
    }

    pub fn build(self) -> Result<BaseAsyncPlugin, KernelError> {
        let client = self
            .client_config
            .build()
            .map_err(|e| KernelError::PluginConstruction {
                plugin: self.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(BaseAsyncPlugin {
            name: self.name,
            priority: self.priority,
            skip_filter: self.skip_filter,
            client,
            retry: self.retry,
            cache: TwoLevelCache::new(self.fresh_ttl, self.stale_ttl),
            workers: Arc::new(Semaphore::new(self.workers)),
            sync_timeout: self.sync_timeout,
        })
    }
}

/// Shared execution services for one plugin.
pub struct BaseAsyncPlugin {
    name: String,
    priority: i32,
    skip_filter: bool,
    client: reqwest::Client,
    retry: RetryPolicy,
    cache: TwoLevelCache,
    workers: Arc<Semaphore>,
    sync_timeout: Duration,
}

impl BaseAsyncPlugin {
    /// Builder with the given name and priority and default tuning.
    pub fn builder(name: impl Into<String>, priority: i32) -> BaseAsyncPluginBuilder {
        BaseAsyncPluginBuilder {
            name: name.into(),
            priority,
            skip_filter: false,
            client_config: HttpClientConfig::default(),
            retry: RetryPolicy::default(),
            workers: DEFAULT_WORKERS,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            fresh_ttl: DEFAULT_FRESH_TTL,
            stale_ttl: DEFAULT_STALE_TTL,
        }
    }

    /// Builder for a plugin that opts out of the aggregator's keyword
    /// filter.
    pub fn builder_with_filter(
        name: impl Into<String>,
        priority: i32,
        skip_filter: bool,
    ) -> BaseAsyncPluginBuilder {
        let mut builder = Self::builder(name, priority);
        builder.skip_filter = skip_filter;
        builder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn skip_service_filter(&self) -> bool {
        self.skip_filter
    }

    /// The plugin's shared pooled client. Never rebuild one per request.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// The detail-page worker semaphore. Acquire one permit per concurrent
    /// sub-request.
    pub fn workers(&self) -> Arc<Semaphore> {
        self.workers.clone()
    }

    /// Default cache key: `"<plugin>|<keyword>"`, extended with a hash of
    /// the call hints when any are present.
    pub fn main_cache_key(&self, keyword: &str, ext: &Ext) -> String {
        if ext.is_empty() {
            format!("{}|{}", self.name, keyword)
        } else {
            format!("{}|{}|{}", self.name, keyword, ext_hash(ext))
        }
    }

    /// Runs `search_impl` through the two-level cache.
    ///
    /// - **Miss / hard-expired**: runs synchronously under the per-call
    ///   timeout, stores fresh, returns `is_final = true`. Errors propagate.
    /// - **Fresh hit**: returns the snapshot, `is_final = true`.
    /// - **Stale hit**: returns the snapshot immediately with
    ///   `is_final = false` and starts at most one detached background
    ///   refresh for the key. The refresh has its own deadline (twice the
    ///   synchronous one); on failure the entry's stale validity is
    ///   extended instead of replaced.
    ///
    /// Concurrent callers for the same key share one upstream call via the
    /// per-key flight lock. Dropping this future (caller cancellation)
    /// aborts synchronous work only; background refreshes always run to
    /// completion for future callers.
    pub async fn async_search_with_result<F, Fut>(
        &self,
        keyword: &str,
        search_impl: F,
        cache_key: &str,
        ext: &Ext,
    ) -> PluginResult<PluginSearchResult>
    where
        F: Fn(reqwest::Client, String, Ext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = PluginResult<Vec<SearchResult>>> + Send + 'static,
    {
        match self.cache.lookup(cache_key) {
            CacheLookup::Fresh(snapshot) => Ok(self.snapshot_result(&snapshot, true)),
            CacheLookup::Stale(snapshot) => {
                self.spawn_refresh(cache_key, keyword, search_impl, ext.clone());
                Ok(self.snapshot_result(&snapshot, false))
            }
            CacheLookup::Miss => {
                let flight = self.cache.flight(cache_key);
                let guard = flight.lock().await;

                // Someone else may have filled the entry while we waited.
                if let CacheLookup::Fresh(snapshot) = self.cache.lookup(cache_key) {
                    return Ok(self.snapshot_result(&snapshot, true));
                }

                let outcome = tokio::time::timeout(
                    self.sync_timeout,
                    search_impl(self.client.clone(), keyword.to_string(), ext.clone()),
                )
                .await;

                let results = match outcome {
                    Ok(Ok(results)) => results,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(PluginError::Timeout(self.sync_timeout)),
                };

                self.cache.store(cache_key, results.clone());
                drop(guard);
                drop(flight);
                self.cache.release_flight(cache_key);

                Ok(PluginSearchResult {
                    results,
                    is_final: true,
                    source: Some(self.name.clone()),
                })
            }
        }
    }

    fn snapshot_result(&self, snapshot: &[SearchResult], is_final: bool) -> PluginSearchResult {
        PluginSearchResult {
            results: snapshot.to_vec(),
            is_final,
            source: Some(self.name.clone()),
        }
    }

    fn spawn_refresh<F, Fut>(&self, key: &str, keyword: &str, search_impl: F, ext: Ext)
    where
        F: Fn(reqwest::Client, String, Ext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = PluginResult<Vec<SearchResult>>> + Send + 'static,
    {
        let flight = self.cache.flight(key);
        // Occupied slot ⇒ a refresh for this key is already in flight.
        let Ok(guard) = flight.try_lock_owned() else {
            return;
        };

        let cache = self.cache.clone();
        let client = self.client.clone();
        let name = self.name.clone();
        let key = key.to_string();
        let keyword = keyword.to_string();
        let deadline = self.sync_timeout * 2;

        tokio::spawn(async move {
            let _guard = guard;
            match tokio::time::timeout(deadline, search_impl(client, keyword, ext)).await {
                Ok(Ok(results)) => {
                    debug!(plugin = %name, key = %key, count = results.len(), "background refresh done");
                    cache.store(&key, results);
                }
                Ok(Err(e)) => {
                    warn!(plugin = %name, key = %key, error = %e, "background refresh failed");
                    cache.extend_stale(&key);
                }
                Err(_) => {
                    warn!(plugin = %name, key = %key, "background refresh timed out");
                    cache.extend_stale(&key);
                }
            }
            drop(_guard);
            cache.release_flight(&key);
        });
    }
}

/// Order-independent hash of the call hints, for the cache key.
fn ext_hash(ext: &Ext) -> String {
    let sorted: BTreeMap<&String, String> = ext
        .iter()
        .map(|(key, value)| (key, value.to_string()))
        .collect();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    sorted.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn result(id: &str) -> SearchResult {
        SearchResult {
            unique_id: id.to_string(),
            title: id.to_string(),
            links: vec![pansou_core::Link::new("https://pan.quark.cn/s/x")],
            ..Default::default()
        }
    }

    fn base(fresh_ms: u64, stale_ms: u64) -> BaseAsyncPlugin {
        BaseAsyncPlugin::builder("stub", 3)
            .cache_ttls(
                Duration::from_millis(fresh_ms),
                Duration::from_millis(stale_ms),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn fresh_hit_is_final_and_identical() {
        let plugin = base(200, 400);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let search = move |_client: reqwest::Client, _kw: String, _ext: Ext| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![result("a")])
            }
        };

        let ext = Ext::new();
        let key = plugin.main_cache_key("kw", &ext);
        let first = plugin
            .async_search_with_result("kw", search.clone(), &key, &ext)
            .await
            .unwrap();
        assert!(first.is_final);
        assert_eq!(first.source.as_deref(), Some("stub"));

        let second = plugin
            .async_search_with_result("kw", search, &key, &ext)
            .await
            .unwrap();
        assert!(second.is_final);
        assert_eq!(second.results, first.results);
        // The second call never reached the upstream.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_serves_then_refreshes() {
        let plugin = base(40, 5_000);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let search = move |_client: reqwest::Client, _kw: String, _ext: Ext| {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![result(if n == 0 { "old" } else { "new" })])
            }
        };

        let ext = Ext::new();
        let key = plugin.main_cache_key("kw", &ext);
        plugin
            .async_search_with_result("kw", search.clone(), &key, &ext)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        // Stale window: old snapshot comes back immediately, not final.
        let stale = plugin
            .async_search_with_result("kw", search.clone(), &key, &ext)
            .await
            .unwrap();
        assert!(!stale.is_final);
        assert_eq!(stale.results[0].unique_id, "old");

        // The background refresh lands; a later call sees the new snapshot
        // as final.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let again = plugin
                .async_search_with_result("kw", search.clone(), &key, &ext)
                .await
                .unwrap();
            if again.is_final && again.results[0].unique_id == "new" {
                assert_eq!(calls.load(Ordering::SeqCst), 2);
                return;
            }
        }
        panic!("refresh never landed");
    }

    #[tokio::test]
    async fn stale_window_triggers_at_most_one_refresh() {
        let plugin = base(10, 60_000);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let search = move |_client: reqwest::Client, _kw: String, _ext: Ext| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // Slow refresh keeps the flight slot occupied.
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(vec![result("r")])
            }
        };

        let ext = Ext::new();
        let key = plugin.main_cache_key("kw", &ext);
        plugin.cache.store(&key, vec![result("seed")]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A burst of stale hits while one refresh is in flight.
        for _ in 0..5 {
            let got = plugin
                .async_search_with_result("kw", search.clone(), &key, &ext)
                .await
                .unwrap();
            assert!(!got.is_final);
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_upstream_call() {
        let plugin = Arc::new(base(5_000, 10_000));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let plugin = plugin.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let calls2 = calls.clone();
                let search = move |_client: reqwest::Client, _kw: String, _ext: Ext| {
                    let calls = calls2.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(vec![result("shared")])
                    }
                };
                let ext = Ext::new();
                let key = plugin.main_cache_key("kw", &ext);
                plugin
                    .async_search_with_result("kw", search, &key, &ext)
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            let got = handle.await.unwrap();
            assert_eq!(got.results[0].unique_id, "shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sync_timeout_becomes_plugin_error() {
        let plugin = BaseAsyncPlugin::builder("stub", 3)
            .sync_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        let search = |_client: reqwest::Client, _kw: String, _ext: Ext| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        };
        let ext = Ext::new();
        let key = plugin.main_cache_key("kw", &ext);
        let err = plugin
            .async_search_with_result("kw", search, &key, &ext)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Timeout(_)));
    }

    #[test]
    fn cache_key_includes_ext_hash() {
        let plugin = base(100, 200);
        let empty = Ext::new();
        assert_eq!(plugin.main_cache_key("kw", &empty), "stub|kw");

        let mut ext = Ext::new();
        ext.insert("title_en".into(), serde_json::Value::String("foo".into()));
        let keyed = plugin.main_cache_key("kw", &ext);
        assert_ne!(keyed, "stub|kw");
        // Same hints, same key.
        assert_eq!(keyed, plugin.main_cache_key("kw", &ext));
    }
}
