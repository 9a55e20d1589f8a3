//! The search aggregator.
//!
//! [`SearchService`] turns one user request into a final
//! [`SearchResponse`]: it fans out to every selected adapter in parallel
//! under a global budget, collects whatever comes back in completion order,
//! merges, deduplicates, keyword-filters, sorts, groups by provider and
//! caches the response. Adapter failure — errors, timeouts, even panics —
//! only ever costs coverage; the aggregator itself always answers.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use pansou_core::{
    filter_results_by_keyword, Ext, MergedLink, MergedLinks, PluginSearchResult, SearchResponse,
    SearchResult,
};

use crate::channel::ChannelSearcher;
use crate::registry::PluginRegistry;

// =============================================================================
// Request types
// =============================================================================

/// Which shapes the response should carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultType {
    #[default]
    All,
    Results,
    MergedByType,
}

impl ResultType {
    /// Lenient parse; unknown values fall back to `All`.
    pub fn parse(s: &str) -> Self {
        match s {
            "results" => Self::Results,
            "merged_by_type" => Self::MergedByType,
            _ => Self::All,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Results => "results",
            Self::MergedByType => "merged_by_type",
        }
    }

    pub fn wants_results(self) -> bool {
        matches!(self, Self::All | Self::Results)
    }

    pub fn wants_merged(self) -> bool {
        matches!(self, Self::All | Self::MergedByType)
    }
}

/// Which adapter families to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceType {
    #[default]
    All,
    /// Chat-channel adapters only.
    Tg,
    /// Website/API plugins only.
    Plugin,
}

impl SourceType {
    /// Lenient parse; unknown values fall back to `All`.
    pub fn parse(s: &str) -> Self {
        match s {
            "tg" => Self::Tg,
            "plugin" => Self::Plugin,
            _ => Self::All,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Tg => "tg",
            Self::Plugin => "plugin",
        }
    }
}

/// One search request, as the HTTP layer hands it to the aggregator.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub keyword: String,
    /// Chat channels to search; empty means the configured defaults.
    pub channels: Vec<String>,
    /// Plugin names to invoke; empty means all enabled.
    pub plugins: Vec<String>,
    pub result_type: ResultType,
    pub source_type: SourceType,
    /// Bypass the response cache.
    pub refresh: bool,
    pub ext: Ext,
}

impl SearchRequest {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Service
// =============================================================================

/// Tuning for the aggregator.
#[derive(Debug, Clone)]
pub struct SearchServiceConfig {
    /// Budget for the whole fan-out; adapters still running afterwards are
    /// abandoned.
    pub global_budget: Duration,
    /// Budget for one adapter call.
    pub per_adapter_timeout: Duration,
    /// Response-cache TTL for final responses.
    pub response_ttl: Duration,
    /// Response-cache TTL while some plugin is still refreshing, so the
    /// improved snapshot is picked up quickly.
    pub partial_response_ttl: Duration,
    /// Channels searched when a request names none.
    pub default_channels: Vec<String>,
}

impl Default for SearchServiceConfig {
    fn default() -> Self {
        Self {
            global_budget: Duration::from_secs(25),
            per_adapter_timeout: Duration::from_secs(20),
            response_ttl: Duration::from_secs(60),
            partial_response_ttl: Duration::from_secs(5),
            default_channels: Vec::new(),
        }
    }
}

struct CachedResponse {
    response: SearchResponse,
    expires_at: Instant,
}

/// What one adapter task delivered.
struct AdapterOutcome {
    source: String,
    skip_filter: bool,
    priority: i32,
    /// False when the adapter errored or timed out and contributed nothing.
    delivered: bool,
    result: PluginSearchResult,
}

impl AdapterOutcome {
    fn nothing(source: String) -> Self {
        Self {
            source,
            skip_filter: false,
            priority: i32::MAX,
            delivered: false,
            result: PluginSearchResult::empty(),
        }
    }
}

/// The aggregator.
pub struct SearchService {
    registry: Arc<PluginRegistry>,
    channel_searchers: Vec<Arc<dyn ChannelSearcher>>,
    config: SearchServiceConfig,
    response_cache: DashMap<u64, CachedResponse>,
    /// Plugins whose lazy `initialize` already succeeded.
    initialized: Arc<DashMap<String, ()>>,
}

impl SearchService {
    pub fn new(registry: Arc<PluginRegistry>, config: SearchServiceConfig) -> Self {
        Self {
            registry,
            channel_searchers: Vec::new(),
            config,
            response_cache: DashMap::new(),
            initialized: Arc::new(DashMap::new()),
        }
    }

    /// Adds a chat-channel adapter family.
    pub fn with_channel_searcher(mut self, searcher: Arc<dyn ChannelSearcher>) -> Self {
        self.channel_searchers.push(searcher);
        self
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SearchServiceConfig {
        &self.config
    }

    /// Runs one search. Never fails: with zero adapters answering, the
    /// response is empty with `total = 0`.
    pub async fn search(&self, request: &SearchRequest) -> SearchResponse {
        let cache_key = request_cache_key(request);
        if !request.refresh {
            if let Some(hit) = self.response_cache.get(&cache_key) {
                if Instant::now() < hit.expires_at {
                    debug!(keyword = %request.keyword, "response cache hit");
                    return hit.response.clone();
                }
            }
        }

        let outcomes = self.fan_out(request).await;
        let response = self.assemble(request, outcomes);

        let ttl = if response.is_final {
            self.config.response_ttl
        } else {
            self.config.partial_response_ttl
        };
        self.response_cache.insert(
            cache_key,
            CachedResponse {
                response: response.clone(),
                expires_at: Instant::now() + ttl,
            },
        );

        response
    }

    /// Launches every selected adapter and collects outcomes in completion
    /// order until all are done or the global budget elapses.
    async fn fan_out(&self, request: &SearchRequest) -> Vec<AdapterOutcome> {
        let mut tasks = FuturesUnordered::new();
        let mut abort_handles = Vec::new();

        if request.source_type != SourceType::Tg {
            for plugin in self.registry.enabled(&request.plugins) {
                let keyword = request.keyword.clone();
                let ext = request.ext.clone();
                let budget = self.config.per_adapter_timeout;
                let initialized = self.initialized.clone();
                let handle = tokio::spawn(async move {
                    run_plugin(plugin, initialized, &keyword, &ext, budget).await
                });
                abort_handles.push(handle.abort_handle());
                tasks.push(handle);
            }
        }

        if request.source_type != SourceType::Plugin {
            let channels = if request.channels.is_empty() {
                &self.config.default_channels
            } else {
                &request.channels
            };
            for searcher in &self.channel_searchers {
                for channel in channels {
                    let searcher = searcher.clone();
                    let channel = channel.clone();
                    let keyword = request.keyword.clone();
                    let budget = self.config.per_adapter_timeout;
                    let handle = tokio::spawn(async move {
                        run_channel(searcher, &channel, &keyword, budget).await
                    });
                    abort_handles.push(handle.abort_handle());
                    tasks.push(handle);
                }
            }
        }

        let mut outcomes = Vec::new();
        let collected = tokio::time::timeout(self.config.global_budget, async {
            while let Some(joined) = tasks.next().await {
                match joined {
                    Ok(outcome) => outcomes.push(outcome),
                    // A panicked adapter is contained here: logged, counted
                    // as an empty contribution.
                    Err(join_error) => warn!(error = %join_error, "adapter task died"),
                }
            }
        })
        .await;

        if collected.is_err() {
            info!(
                keyword = %request.keyword,
                collected = outcomes.len(),
                "global budget elapsed, abandoning stragglers"
            );
            for handle in abort_handles {
                handle.abort();
            }
        }

        outcomes
    }

    /// Merges outcomes into the final response. Outcome order is completion
    /// order, which is what makes first-seen dedup meaningful.
    fn assemble(&self, request: &SearchRequest, outcomes: Vec<AdapterOutcome>) -> SearchResponse {
        let mut merged: Vec<SearchResult> = Vec::new();
        let mut seen = HashSet::new();
        let mut priority_of: HashMap<String, i32> = HashMap::new();
        let mut source_of: HashMap<String, String> = HashMap::new();

        let mut contributors = 0usize;
        let mut any_final = false;

        for outcome in outcomes {
            if !outcome.delivered {
                continue;
            }
            contributors += 1;
            any_final |= outcome.result.is_final;

            let mut results = outcome.result.results;
            // Results without links never reach aggregation.
            results.retain(|result| !result.links.is_empty());
            if !outcome.skip_filter {
                results = filter_results_by_keyword(results, &request.keyword);
            }

            for result in results {
                // First-seen wins; the same URL under a different id stays,
                // because which plugin reported it is user-visible.
                if seen.insert(result.unique_id.clone()) {
                    priority_of.insert(result.unique_id.clone(), outcome.priority);
                    source_of.insert(result.unique_id.clone(), outcome.source.clone());
                    merged.push(result);
                }
            }
        }

        merged.sort_by(|a, b| {
            compare_datetime_desc(a.datetime, b.datetime)
                .then_with(|| {
                    let pa = priority_of.get(&a.unique_id).copied().unwrap_or(i32::MAX);
                    let pb = priority_of.get(&b.unique_id).copied().unwrap_or(i32::MAX);
                    pa.cmp(&pb)
                })
                .then_with(|| a.title.cmp(&b.title))
        });

        let merged_by_type = if request.result_type.wants_merged() {
            Some(build_merged_by_type(&merged, &source_of))
        } else {
            None
        };

        // Open-question policy: a response is non-final only when every
        // contributing adapter said non-final.
        let is_final = contributors == 0 || any_final;

        SearchResponse {
            total: merged.len(),
            results: request.result_type.wants_results().then_some(merged),
            merged_by_type,
            is_final,
        }
    }
}

/// Runs one plugin adapter with lazy initialization and its own budget.
async fn run_plugin(
    plugin: Arc<dyn crate::plugin::SearchPlugin>,
    initialized: Arc<DashMap<String, ()>>,
    keyword: &str,
    ext: &Ext,
    budget: Duration,
) -> AdapterOutcome {
    let name = plugin.name().to_string();

    if !initialized.contains_key(&name) {
        match plugin.initialize().await {
            Ok(()) => {
                initialized.insert(name.clone(), ());
            }
            Err(e) => {
                // Not marked: initialization is retried on the next search.
                warn!(plugin = %name, error = %e, "plugin initialization failed");
                return AdapterOutcome::nothing(name);
            }
        }
    }

    match tokio::time::timeout(budget, plugin.search_with_result(keyword, ext)).await {
        Ok(Ok(mut result)) => {
            if result.source.is_none() {
                result.source = Some(name.clone());
            }
            AdapterOutcome {
                skip_filter: plugin.skip_service_filter(),
                priority: plugin.priority(),
                delivered: true,
                result,
                source: name,
            }
        }
        Ok(Err(e)) => {
            debug!(plugin = %name, error = %e, "plugin search failed");
            AdapterOutcome::nothing(name)
        }
        Err(_) => {
            debug!(plugin = %name, "plugin search abandoned at per-adapter budget");
            AdapterOutcome::nothing(name)
        }
    }
}

/// Runs one chat-channel search with its own budget.
async fn run_channel(
    searcher: Arc<dyn ChannelSearcher>,
    channel: &str,
    keyword: &str,
    budget: Duration,
) -> AdapterOutcome {
    let source = searcher.name().to_string();
    match tokio::time::timeout(budget, searcher.search_channel(channel, keyword)).await {
        Ok(Ok(results)) => AdapterOutcome {
            source,
            skip_filter: false,
            priority: 0,
            delivered: true,
            result: PluginSearchResult::finalized(results),
        },
        Ok(Err(e)) => {
            debug!(channel, error = %e, "channel search failed");
            AdapterOutcome::nothing(source)
        }
        Err(_) => {
            debug!(channel, "channel search abandoned at per-adapter budget");
            AdapterOutcome::nothing(source)
        }
    }
}

/// Datetime descending, unknown (None) sinking to the bottom.
fn compare_datetime_desc(
    a: Option<chrono::DateTime<chrono::Utc>>,
    b: Option<chrono::DateTime<chrono::Utc>>,
) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Groups links by provider tag, deduplicating by URL within each tag and
/// ordering by datetime descending.
fn build_merged_by_type(
    results: &[SearchResult],
    source_of: &HashMap<String, String>,
) -> MergedLinks {
    let mut grouped: MergedLinks = HashMap::new();
    let mut seen_urls: HashMap<&'static str, HashSet<String>> = HashMap::new();

    for result in results {
        for link in &result.links {
            let tag = link.kind.as_str();
            if !seen_urls
                .entry(tag)
                .or_default()
                .insert(link.url.clone())
            {
                continue;
            }
            grouped.entry(tag.to_string()).or_default().push(MergedLink {
                url: link.url.clone(),
                password: link.password.clone(),
                note: result.title.clone(),
                datetime: link.datetime.or(result.datetime),
                source: source_of.get(&result.unique_id).cloned().unwrap_or_default(),
            });
        }
    }

    for links in grouped.values_mut() {
        links.sort_by(|a, b| compare_datetime_desc(a.datetime, b.datetime));
    }

    grouped
}

/// Request-level cache key over everything that shapes the response.
fn request_cache_key(request: &SearchRequest) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    request.keyword.hash(&mut hasher);
    request.channels.hash(&mut hasher);
    request.plugins.hash(&mut hasher);
    request.result_type.as_str().hash(&mut hasher);
    request.source_type.as_str().hash(&mut hasher);
    for (key, value) in &request.ext {
        key.hash(&mut hasher);
        value.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pansou_core::Link;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    use crate::error::PluginResult;
    use crate::plugin::SearchPlugin;

    fn quark_result(id: &str, title: &str) -> SearchResult {
        SearchResult {
            unique_id: id.to_string(),
            title: title.to_string(),
            links: vec![Link::new("https://pan.quark.cn/s/aaaa")],
            ..Default::default()
        }
    }

    /// Stub plugin with canned results, an optional gate to wait on and an
    /// optional notify fired after answering.
    struct Stub {
        name: &'static str,
        results: Vec<SearchResult>,
        skip_filter: bool,
        wait_for: Option<Arc<Notify>>,
        signal_after: Option<Arc<Notify>>,
        calls: AtomicUsize,
    }

    impl Stub {
        fn new(name: &'static str, results: Vec<SearchResult>) -> Self {
            Self {
                name,
                results,
                skip_filter: false,
                wait_for: None,
                signal_after: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SearchPlugin for Stub {
        fn name(&self) -> &str {
            self.name
        }

        fn skip_service_filter(&self) -> bool {
            self.skip_filter
        }

        async fn search_with_result(
            &self,
            _keyword: &str,
            _ext: &Ext,
        ) -> PluginResult<PluginSearchResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.wait_for {
                gate.notified().await;
            }
            let out = PluginSearchResult::finalized(self.results.clone());
            if let Some(signal) = &self.signal_after {
                signal.notify_one();
            }
            Ok(out)
        }
    }

    /// Stub that never answers.
    struct Sleeper;

    #[async_trait]
    impl SearchPlugin for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }

        async fn search_with_result(
            &self,
            _keyword: &str,
            _ext: &Ext,
        ) -> PluginResult<PluginSearchResult> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn service_with(plugins: Vec<Arc<dyn SearchPlugin>>) -> SearchService {
        let mut registry = PluginRegistry::new();
        for plugin in plugins {
            registry.register(plugin);
        }
        SearchService::new(Arc::new(registry), SearchServiceConfig::default())
    }

    #[tokio::test]
    async fn scenario_a_single_plugin_fresh() {
        let service = service_with(vec![Arc::new(Stub::new(
            "stub1",
            vec![quark_result("stub1-1", "alpha movie")],
        ))]);

        let mut request = SearchRequest::new("alpha");
        request.plugins = vec!["stub1".into()];
        request.result_type = ResultType::Results;

        let response = service.search(&request).await;
        assert_eq!(response.total, 1);
        let results = response.results.unwrap();
        assert_eq!(results[0].unique_id, "stub1-1");
        assert_eq!(results[0].title, "alpha movie");
        assert!(response.merged_by_type.is_none());
        assert!(response.is_final);
    }

    #[tokio::test]
    async fn scenario_b_dedup_keeps_first_reporter() {
        // stub_b only answers after stub_a has, fixing completion order.
        let gate = Arc::new(Notify::new());
        let mut first = Stub::new("stub_a", vec![quark_result("shared-1", "alpha from a")]);
        first.signal_after = Some(gate.clone());
        let mut second = Stub::new("stub_b", vec![quark_result("shared-1", "alpha from b")]);
        second.wait_for = Some(gate);

        let service = service_with(vec![Arc::new(first), Arc::new(second)]);
        let mut request = SearchRequest::new("alpha");
        request.result_type = ResultType::Results;

        let response = service.search(&request).await;
        assert_eq!(response.total, 1);
        assert_eq!(response.results.unwrap()[0].title, "alpha from a");
    }

    #[tokio::test]
    async fn scenario_c_keyword_filter_is_and() {
        let service = service_with(vec![Arc::new(Stub::new(
            "stub1",
            vec![
                quark_result("stub1-1", "alpha bravo"),
                quark_result("stub1-2", "alpha"),
            ],
        ))]);

        let mut request = SearchRequest::new("alpha bravo");
        request.result_type = ResultType::Results;

        let response = service.search(&request).await;
        assert_eq!(response.total, 1);
        assert_eq!(response.results.unwrap()[0].unique_id, "stub1-1");
    }

    #[tokio::test]
    async fn scenario_d_skip_service_filter_is_honored() {
        let mut stub = Stub::new("magnetish", vec![quark_result("magnetish-1", "charlie")]);
        stub.skip_filter = true;
        let service = service_with(vec![Arc::new(stub)]);

        let mut request = SearchRequest::new("alpha");
        request.result_type = ResultType::Results;

        let response = service.search(&request).await;
        assert_eq!(response.total, 1);
        assert_eq!(response.results.unwrap()[0].title, "charlie");
    }

    #[tokio::test]
    async fn scenario_e_merged_by_type_groups_links() {
        let result = SearchResult {
            unique_id: "stub1-1".to_string(),
            title: "alpha".to_string(),
            links: vec![
                Link::new("https://pan.quark.cn/s/u1"),
                Link::new("https://pan.baidu.com/s/u2"),
            ],
            ..Default::default()
        };
        let service = service_with(vec![Arc::new(Stub::new("stub1", vec![result]))]);

        let mut request = SearchRequest::new("alpha");
        request.result_type = ResultType::MergedByType;

        let response = service.search(&request).await;
        assert!(response.results.is_none());
        let merged = response.merged_by_type.unwrap();
        assert_eq!(merged["quark"].len(), 1);
        assert_eq!(merged["quark"][0].url, "https://pan.quark.cn/s/u1");
        assert_eq!(merged["quark"][0].source, "stub1");
        assert_eq!(merged["baidu"][0].url, "https://pan.baidu.com/s/u2");
    }

    #[tokio::test]
    async fn cancellation_bounded_by_global_budget() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Sleeper));
        let service = SearchService::new(
            Arc::new(registry),
            SearchServiceConfig {
                global_budget: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let started = Instant::now();
        let response = service.search(&SearchRequest::new("alpha")).await;
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(response.total, 0);
    }

    #[tokio::test]
    async fn linkless_results_are_dropped() {
        let mut result = quark_result("stub1-1", "alpha");
        result.links.clear();
        let service = service_with(vec![Arc::new(Stub::new("stub1", vec![result]))]);

        let response = service.search(&SearchRequest::new("alpha")).await;
        assert_eq!(response.total, 0);
        assert!(response.is_final);
    }

    #[tokio::test]
    async fn sort_is_datetime_desc_with_unknown_last() {
        use chrono::TimeZone;
        let old = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let new = chrono::Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        let mut a = quark_result("stub1-old", "alpha old");
        a.datetime = Some(old);
        let mut b = quark_result("stub1-new", "alpha new");
        b.datetime = Some(new);
        let c = quark_result("stub1-unknown", "alpha unknown");

        let service = service_with(vec![Arc::new(Stub::new("stub1", vec![a, c, b]))]);
        let mut request = SearchRequest::new("alpha");
        request.result_type = ResultType::Results;

        let results = service.search(&request).await.results.unwrap();
        let order: Vec<_> = results.iter().map(|r| r.unique_id.as_str()).collect();
        assert_eq!(order, vec!["stub1-new", "stub1-old", "stub1-unknown"]);
    }

    #[tokio::test]
    async fn response_cache_hits_until_refresh() {
        let stub = Arc::new(Stub::new("stub1", vec![quark_result("stub1-1", "alpha")]));
        let service = service_with(vec![stub.clone()]);
        let request = SearchRequest::new("alpha");

        service.search(&request).await;
        service.search(&request).await;
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);

        let mut bypass = request.clone();
        bypass.refresh = true;
        service.search(&bypass).await;
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
    }
}
