//! JsNoteClub adapter: Ghost-blog upstream, list API + detail pages.
//!
//! The canonical list+detail adapter: one cached catalogue fetch (the Ghost
//! content API, unlocked by a `data-key` mined from the home page), keyword
//! matching over the catalogue, then bounded concurrent detail-page fetches
//! with a per-article link cache swept in the background.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use pansou_core::{
    classify_url, extract_password, filter_results_by_keyword, CloudType, Ext, Link,
    PluginSearchResult, SearchResult,
};
use pansou_kernel::{BaseAsyncPlugin, KernelError, PluginError, PluginResult, SearchPlugin};

const SITE_URL: &str = "https://jsnoteclub.com/";
const POSTS_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const DETAIL_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const DETAIL_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const MAX_MATCHED_POSTS: usize = 30;
const MAX_DETAIL_WORKERS: usize = 8;

#[derive(Default)]
struct PostsCache {
    entries: Vec<GhostPost>,
    expires_at: Option<Instant>,
}

struct DetailEntry {
    links: Vec<Link>,
    expires_at: Instant,
}

struct State {
    posts: RwLock<PostsCache>,
    details: DashMap<String, DetailEntry>,
}

pub struct JsNoteClubPlugin {
    base: Arc<BaseAsyncPlugin>,
    state: Arc<State>,
    sweeper_started: std::sync::atomic::AtomicBool,
}

impl JsNoteClubPlugin {
    pub fn new() -> Result<Self, KernelError> {
        Ok(Self {
            base: Arc::new(
                BaseAsyncPlugin::builder("jsnoteclub", 2)
                    .http_timeout(Duration::from_secs(12))
                    .workers(MAX_DETAIL_WORKERS)
                    .build()?,
            ),
            state: Arc::new(State {
                posts: RwLock::new(PostsCache::default()),
                details: DashMap::new(),
            }),
            sweeper_started: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SearchPlugin for JsNoteClubPlugin {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn priority(&self) -> i32 {
        self.base.priority()
    }

    async fn initialize(&self) -> PluginResult<()> {
        // Detail-cache sweeper; exactly one task for the plugin's lifetime.
        if self
            .sweeper_started
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return Ok(());
        }
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DETAIL_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Instant::now();
                state.details.retain(|_, entry| entry.expires_at > now);
            }
        });
        Ok(())
    }

    async fn search_with_result(
        &self,
        keyword: &str,
        ext: &Ext,
    ) -> PluginResult<PluginSearchResult> {
        let key = self.base.main_cache_key(keyword, ext);
        let base = self.base.clone();
        let state = self.state.clone();
        self.base
            .async_search_with_result(
                keyword,
                move |client, keyword, ext| {
                    do_search(base.clone(), state.clone(), client, keyword, ext)
                },
                &key,
                ext,
            )
            .await
    }
}

async fn do_search(
    base: Arc<BaseAsyncPlugin>,
    state: Arc<State>,
    client: reqwest::Client,
    keyword: String,
    ext: Ext,
) -> PluginResult<Vec<SearchResult>> {
    let mut search_keyword = keyword.trim().to_string();
    if search_keyword.is_empty() {
        return Err(PluginError::other("empty keyword"));
    }
    if let Some(title_en) = ext.get("title_en").and_then(|v| v.as_str()) {
        if !title_en.trim().is_empty() {
            search_keyword = format!("{search_keyword} {}", title_en.trim());
        }
    }

    let posts = get_all_posts(&base, &state, &client).await?;
    let mut matched = filter_posts(&posts, &search_keyword);
    if matched.is_empty() {
        return Ok(Vec::new());
    }
    matched.truncate(MAX_MATCHED_POSTS);

    let workers = base.workers();
    let fetches = matched.into_iter().map(|post| {
        let base = base.clone();
        let state = state.clone();
        let client = client.clone();
        let workers = workers.clone();
        async move {
            let _permit = workers.acquire_owned().await.ok()?;
            let links = fetch_detail_links(&base, &state, &client, &post.url).await;
            if links.is_empty() {
                return None;
            }
            Some(SearchResult {
                unique_id: format!("jsnoteclub-{}", post.id),
                title: post.title.trim().to_string(),
                content: post.excerpt.trim().to_string(),
                links,
                tags: Some(vec![post.slug.trim().to_string()]),
                channel: String::new(),
                datetime: post.updated_at_time(),
                ..Default::default()
            })
        }
    });

    let results: Vec<SearchResult> = futures::future::join_all(fetches)
        .await
        .into_iter()
        .flatten()
        .collect();

    Ok(filter_results_by_keyword(results, &search_keyword))
}

/// The full catalogue, cached for an hour with a double-checked write lock.
async fn get_all_posts(
    base: &BaseAsyncPlugin,
    state: &State,
    client: &reqwest::Client,
) -> PluginResult<Vec<GhostPost>> {
    {
        let cache = state.posts.read().await;
        if let Some(expires_at) = cache.expires_at {
            if Instant::now() < expires_at && !cache.entries.is_empty() {
                return Ok(cache.entries.clone());
            }
        }
    }

    let mut cache = state.posts.write().await;
    if let Some(expires_at) = cache.expires_at {
        if Instant::now() < expires_at && !cache.entries.is_empty() {
            return Ok(cache.entries.clone());
        }
    }

    let data_key = fetch_data_key(base, client).await?;
    let posts = fetch_posts(base, client, &data_key).await?;
    debug!(count = posts.len(), "jsnoteclub catalogue refreshed");

    cache.entries = posts.clone();
    cache.expires_at = Some(Instant::now() + POSTS_CACHE_TTL);
    Ok(posts)
}

/// Mines the Ghost content-API key out of the home page's scripts.
async fn fetch_data_key(base: &BaseAsyncPlugin, client: &reqwest::Client) -> PluginResult<String> {
    static DATA_KEY: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r#"data-key="([0-9a-fA-F]+)""#).unwrap());

    let response = base
        .retry()
        .send(client.get(SITE_URL).header("Referer", SITE_URL))
        .await?;
    if !response.status().is_success() {
        return Err(PluginError::Upstream(format!(
            "home page status {}",
            response.status()
        )));
    }
    let body = response
        .text()
        .await
        .map_err(|e| PluginError::parse(e.to_string()))?;

    DATA_KEY
        .captures(&body)
        .map(|captures| captures[1].to_string())
        .ok_or_else(|| PluginError::parse("data-key not found on home page"))
}

async fn fetch_posts(
    base: &BaseAsyncPlugin,
    client: &reqwest::Client,
    data_key: &str,
) -> PluginResult<Vec<GhostPost>> {
    let request = client
        .get(format!("{SITE_URL}ghost/api/content/posts/"))
        .query(&[
            ("key", data_key),
            ("limit", "10000"),
            ("fields", "id,slug,title,excerpt,url,updated_at,visibility"),
            ("order", "updated_at DESC"),
        ])
        .header("Referer", SITE_URL)
        .header("Accept", "application/json");

    let response = base.retry().send(request).await?;
    if !response.status().is_success() {
        return Err(PluginError::Upstream(format!(
            "content API status {}",
            response.status()
        )));
    }
    let payload: GhostPostsResponse = response
        .json()
        .await
        .map_err(|e| PluginError::parse(e.to_string()))?;
    Ok(payload.posts)
}

/// AND-of-tokens match over title, excerpt and slug.
fn filter_posts(posts: &[GhostPost], keyword: &str) -> Vec<GhostPost> {
    let tokens: Vec<String> = keyword
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if tokens.is_empty() {
        return Vec::new();
    }

    posts
        .iter()
        .filter(|post| {
            let haystack = format!(
                "{} {} {}",
                post.title.to_lowercase(),
                post.excerpt.to_lowercase(),
                post.slug.to_lowercase()
            );
            tokens.iter().all(|token| haystack.contains(token))
        })
        .cloned()
        .collect()
}

/// Links for one article, via the per-article cache.
async fn fetch_detail_links(
    base: &BaseAsyncPlugin,
    state: &State,
    client: &reqwest::Client,
    detail_url: &str,
) -> Vec<Link> {
    if let Some(entry) = state.details.get(detail_url) {
        if Instant::now() < entry.expires_at {
            return entry.links.clone();
        }
    }
    state.details.remove(detail_url);

    let response = match base
        .retry()
        .send(client.get(detail_url).header("Referer", detail_url))
        .await
    {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!(url = detail_url, status = %response.status(), "detail page rejected");
            return Vec::new();
        }
        Err(e) => {
            warn!(url = detail_url, error = %e, "detail page failed");
            return Vec::new();
        }
    };

    let Ok(body) = response.text().await else {
        return Vec::new();
    };

    let links = extract_links_from_article(&body);
    if !links.is_empty() {
        state.details.insert(
            detail_url.to_string(),
            DetailEntry {
                links: links.clone(),
                expires_at: Instant::now() + DETAIL_CACHE_TTL,
            },
        );
    }
    links
}

/// Pulls share links out of the article body: anchors first, then raw text,
/// skipping sidebar/ad containers.
fn extract_links_from_article(body: &str) -> Vec<Link> {
    let document = Html::parse_document(body);
    let content_selectors = ["section.gh-content", ".gh-content", "article", "body"];
    let anchor_selector = Selector::parse("a[href]").unwrap();

    let content = content_selectors.iter().find_map(|css| {
        let selector = Selector::parse(css).ok()?;
        document.select(&selector).next()
    });
    let Some(content) = content else {
        return Vec::new();
    };

    let mut links = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for anchor in content.select(&anchor_selector) {
        if in_excluded_container(anchor) {
            continue;
        }
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() || classify_url(href) == CloudType::Others {
            continue;
        }
        if !seen.insert(href.to_string()) {
            continue;
        }

        // Password from the anchor text, its title attribute, or the text
        // around it.
        let anchor_text = anchor.text().collect::<String>();
        let title_attr = anchor.value().attr("title").unwrap_or("");
        let nearby = parent_text(anchor);
        let password = [href, &anchor_text, title_attr, &nearby]
            .iter()
            .map(|candidate| extract_password(candidate))
            .find(|found| !found.is_empty())
            .unwrap_or_default();

        links.push(Link {
            kind: classify_url(href),
            url: href.to_string(),
            password,
            datetime: None,
            work_title: None,
        });
    }

    // Second pass over the plain text for links not wrapped in anchors.
    let text = content.text().collect::<String>();
    for mined in pansou_core::extract_cloud_links(&text, None) {
        if seen.insert(mined.url.clone()) {
            links.push(mined);
        }
    }

    links
}

fn in_excluded_container(anchor: ElementRef<'_>) -> bool {
    anchor.ancestors().any(|node| {
        let Some(element) = scraper::ElementRef::wrap(node) else {
            return false;
        };
        if element.value().name() == "aside" {
            return true;
        }
        element.value().classes().any(|class| {
            matches!(class, "gh-sidebar" | "sidebar-left" | "left-ads")
        })
    })
}

fn parent_text(anchor: ElementRef<'_>) -> String {
    anchor
        .ancestors()
        .find_map(scraper::ElementRef::wrap)
        .map(|parent| parent.text().collect::<String>())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GhostPost {
    #[serde(default)]
    id: String,
    #[serde(default)]
    slug: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    excerpt: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    updated_at: String,
}

impl GhostPost {
    fn updated_at_time(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.updated_at)
            .ok()
            .map(|fixed| fixed.with_timezone(&Utc))
    }
}

#[derive(Debug, Deserialize)]
struct GhostPostsResponse {
    #[serde(default)]
    posts: Vec<GhostPost>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(title: &str, excerpt: &str) -> GhostPost {
        GhostPost {
            id: "abc".into(),
            slug: "slug".into(),
            title: title.into(),
            excerpt: excerpt.into(),
            url: "https://jsnoteclub.com/p/abc/".into(),
            updated_at: "2025-06-01T10:00:00.000+08:00".into(),
        }
    }

    #[test]
    fn post_filter_is_and_of_tokens() {
        let posts = vec![post("Alpha Bravo", ""), post("Alpha", "")];
        let matched = filter_posts(&posts, "alpha bravo");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].title, "Alpha Bravo");
    }

    #[test]
    fn updated_at_converts_to_utc() {
        use chrono::Timelike;
        let parsed = post("t", "").updated_at_time().unwrap();
        // 10:00 at +08:00 is 02:00 UTC.
        assert_eq!(parsed.hour(), 2);
    }

    #[test]
    fn article_extraction_anchors_and_text() {
        let html = r#"
        <html><body>
          <aside><a href="https://pan.quark.cn/s/sidebar">ad</a></aside>
          <section class="gh-content">
            <p><a href="https://pan.baidu.com/s/1abc?pwd=x9y8" title="">百度网盘</a></p>
            <p>夸克：https://pan.quark.cn/s/inline 提取码：q1w2</p>
          </section>
        </body></html>"#;

        let links = extract_links_from_article(html);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].kind, CloudType::Baidu);
        assert_eq!(links[0].password, "x9y8");
        assert_eq!(links[1].kind, CloudType::Quark);
        assert_eq!(links[1].password, "q1w2");
        // The sidebar link never made it in.
        assert!(links.iter().all(|l| !l.url.contains("sidebar")));
    }

    #[test]
    fn ghost_payload_parses() {
        let payload = r#"{"posts":[{"id":"1","slug":"s","title":"T","excerpt":"E",
            "url":"https://jsnoteclub.com/p/1/","updated_at":"2025-01-01T00:00:00.000+08:00"}]}"#;
        let parsed: GhostPostsResponse = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed.posts.len(), 1);
        assert_eq!(parsed.posts[0].title, "T");
    }
}
