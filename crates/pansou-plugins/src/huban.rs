//! Huban VOD adapter with a referrer allow-list.
//!
//! The upstream is a semi-private VOD index: callers must present an
//! allow-listed `ext["referer"]` or the plugin refuses to search. The list
//! is compiled in and adjustable at runtime through
//! [`add_allowed_referer`] / [`remove_allowed_referer`].

use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use async_trait::async_trait;
use dashmap::DashMap;
use scraper::{Html, Selector};
use tracing::debug;

use pansou_core::{
    extract_cloud_links, filter_results_by_keyword, Ext, Link, PluginSearchResult, SearchResult,
};
use pansou_kernel::{BaseAsyncPlugin, KernelError, PluginError, PluginResult, SearchPlugin};

const SITE_URL: &str = "http://103.45.162.207:20720";
const DETAIL_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const DETAIL_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Allowed request origins. Prefix-matched against `ext["referer"]`.
static ALLOWED_REFERERS: LazyLock<RwLock<Vec<String>>> = LazyLock::new(|| {
    RwLock::new(vec![
        "https://dm.xueximeng.com".to_string(),
        "http://localhost:8888".to_string(),
    ])
});

/// Adds an origin to the allow-list. No-op if already present.
pub fn add_allowed_referer(referer: &str) {
    let mut list = ALLOWED_REFERERS.write();
    if !list.iter().any(|existing| existing == referer) {
        list.push(referer.to_string());
    }
}

/// Removes an origin from the allow-list.
pub fn remove_allowed_referer(referer: &str) {
    ALLOWED_REFERERS.write().retain(|existing| existing != referer);
}

fn referer_allowed(referer: &str) -> bool {
    ALLOWED_REFERERS
        .read()
        .iter()
        .any(|allowed| referer.starts_with(allowed.as_str()))
}

struct DetailEntry {
    links: Vec<Link>,
    expires_at: Instant,
}

pub struct HubanPlugin {
    base: Arc<BaseAsyncPlugin>,
    details: Arc<DashMap<String, DetailEntry>>,
    sweeper_started: std::sync::atomic::AtomicBool,
}

impl HubanPlugin {
    pub fn new() -> Result<Self, KernelError> {
        Ok(Self {
            base: Arc::new(
                BaseAsyncPlugin::builder("huban", 2)
                    .http_timeout(Duration::from_secs(10))
                    .workers(8)
                    .build()?,
            ),
            details: Arc::new(DashMap::new()),
            sweeper_started: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SearchPlugin for HubanPlugin {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn priority(&self) -> i32 {
        self.base.priority()
    }

    async fn initialize(&self) -> PluginResult<()> {
        if self
            .sweeper_started
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return Ok(());
        }
        let details = self.details.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DETAIL_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Instant::now();
                details.retain(|_, entry| entry.expires_at > now);
            }
        });
        Ok(())
    }

    async fn search_with_result(
        &self,
        keyword: &str,
        ext: &Ext,
    ) -> PluginResult<PluginSearchResult> {
        let referer = ext
            .get("referer")
            .and_then(|value| value.as_str())
            .unwrap_or("");
        if !referer_allowed(referer) {
            return Err(PluginError::Refused(format!(
                "referer '{referer}' is not allow-listed"
            )));
        }

        let key = self.base.main_cache_key(keyword, ext);
        let base = self.base.clone();
        let details = self.details.clone();
        self.base
            .async_search_with_result(
                keyword,
                move |client, keyword, ext| {
                    do_search(base.clone(), details.clone(), client, keyword, ext)
                },
                &key,
                ext,
            )
            .await
    }
}

async fn do_search(
    base: Arc<BaseAsyncPlugin>,
    details: Arc<DashMap<String, DetailEntry>>,
    client: reqwest::Client,
    keyword: String,
    _ext: Ext,
) -> PluginResult<Vec<SearchResult>> {
    let search_url = format!(
        "{SITE_URL}/index.php/vod/search/wd/{}.html",
        urlencoding::encode(&keyword)
    );

    let response = base
        .retry()
        .send(client.get(&search_url).header("Referer", format!("{SITE_URL}/")))
        .await?;
    if !response.status().is_success() {
        return Err(PluginError::Upstream(format!(
            "search page status {}",
            response.status()
        )));
    }
    let body = response
        .text()
        .await
        .map_err(|e| PluginError::parse(e.to_string()))?;

    let items = parse_search_page(&body);
    debug!(count = items.len(), "huban list parsed");

    let workers = base.workers();
    let fetches = items.into_iter().map(|item| {
        let base = base.clone();
        let details = details.clone();
        let client = client.clone();
        let workers = workers.clone();
        async move {
            let _permit = workers.acquire_owned().await.ok()?;
            let links = fetch_detail_links(&base, &details, &client, &item.detail_url).await;
            if links.is_empty() {
                return None;
            }
            Some(SearchResult {
                unique_id: format!("huban-{}", item.id),
                title: item.title,
                content: item.note,
                links,
                channel: String::new(),
                ..Default::default()
            })
        }
    });

    let results: Vec<SearchResult> = futures::future::join_all(fetches)
        .await
        .into_iter()
        .flatten()
        .collect();

    Ok(filter_results_by_keyword(results, &keyword))
}

struct ListItem {
    id: String,
    title: String,
    note: String,
    detail_url: String,
}

fn parse_search_page(body: &str) -> Vec<ListItem> {
    static DETAIL_ID: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"/id/(\d+)").unwrap());

    let document = Html::parse_document(body);
    let item_selector = Selector::parse(".module-search-item").unwrap();
    let title_selector = Selector::parse(".video-info-header h3 a").unwrap();
    let note_selector = Selector::parse(".video-info-aux, .video-info-item").unwrap();

    document
        .select(&item_selector)
        .filter_map(|item| {
            let anchor = item.select(&title_selector).next()?;
            let href = anchor.value().attr("href")?;
            let id = DETAIL_ID.captures(href)?[1].to_string();
            let title = anchor.text().collect::<String>().trim().to_string();
            let note = item
                .select(&note_selector)
                .map(|node| node.text().collect::<String>().trim().to_string())
                .collect::<Vec<_>>()
                .join(" | ");

            let detail_url = if href.starts_with("http") {
                href.to_string()
            } else {
                format!("{SITE_URL}{href}")
            };

            Some(ListItem {
                id,
                title,
                note,
                detail_url,
            })
        })
        .collect()
}

async fn fetch_detail_links(
    base: &BaseAsyncPlugin,
    details: &DashMap<String, DetailEntry>,
    client: &reqwest::Client,
    detail_url: &str,
) -> Vec<Link> {
    if let Some(entry) = details.get(detail_url) {
        if Instant::now() < entry.expires_at {
            return entry.links.clone();
        }
    }
    details.remove(detail_url);

    let Ok(response) = base
        .retry()
        .send(client.get(detail_url).header("Referer", format!("{SITE_URL}/")))
        .await
    else {
        return Vec::new();
    };
    if !response.status().is_success() {
        return Vec::new();
    }
    let Ok(body) = response.text().await else {
        return Vec::new();
    };

    // The detail page lists every share link in plain markup.
    let links = extract_cloud_links(&body, None);
    if !links.is_empty() {
        details.insert(
            detail_url.to_string(),
            DetailEntry {
                links: links.clone(),
                expires_at: Instant::now() + DETAIL_CACHE_TTL,
            },
        );
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referer_gate_is_prefix_matched() {
        assert!(referer_allowed("https://dm.xueximeng.com/search?q=x"));
        assert!(referer_allowed("http://localhost:8888"));
        assert!(!referer_allowed("https://evil.example.com"));
        assert!(!referer_allowed(""));
    }

    #[test]
    fn allowlist_add_remove_round_trip() {
        add_allowed_referer("https://partner.example.com");
        assert!(referer_allowed("https://partner.example.com/page"));
        remove_allowed_referer("https://partner.example.com");
        assert!(!referer_allowed("https://partner.example.com/page"));
    }

    #[test]
    fn parses_vod_search_items() {
        let html = r#"
        <div class="module-search-item">
          <div class="video-info-header"><h3>
            <a href="/index.php/vod/detail/id/4821.html">Alpha 合集</a>
          </h3></div>
          <div class="video-info-aux">2025 / 剧情</div>
        </div>"#;
        let items = parse_search_page(html);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "4821");
        assert_eq!(items[0].title, "Alpha 合集");
        assert!(items[0].detail_url.ends_with("/id/4821.html"));
    }
}
