//! Discourse forum adapter (linux.do resource category).
//!
//! The upstream sits behind an anti-bot interstitial, so every request goes
//! through the transport layer's [`ChallengeClient`] instead of the plain
//! pooled client. Searches walk the JSON search API page by page (capped by
//! `ext["max_pages"]`) and mine links straight out of each post's blurb.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use pansou_core::{extract_cloud_links, Ext, PluginSearchResult, SearchResult};
use pansou_kernel::{BaseAsyncPlugin, KernelError, PluginError, PluginResult, SearchPlugin};
use pansou_transport::ChallengeClient;

const SEARCH_URL: &str = "https://linux.do/search.json";
const DEFAULT_MAX_PAGES: usize = 1;
const MAX_ALLOWED_PAGES: usize = 10;
const PAGE_REQUEST_DELAY: Duration = Duration::from_millis(500);

pub struct DiscoursePlugin {
    base: Arc<BaseAsyncPlugin>,
    scraper: Arc<ChallengeClient>,
}

impl DiscoursePlugin {
    pub fn new() -> Result<Self, KernelError> {
        let scraper = ChallengeClient::new().map_err(|e| KernelError::PluginConstruction {
            plugin: "discourse".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            base: Arc::new(
                BaseAsyncPlugin::builder("discourse", 2)
                    .http_timeout(Duration::from_secs(15))
                    .build()?,
            ),
            scraper: Arc::new(scraper),
        })
    }
}

#[async_trait]
impl SearchPlugin for DiscoursePlugin {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn priority(&self) -> i32 {
        self.base.priority()
    }

    async fn search_with_result(
        &self,
        keyword: &str,
        ext: &Ext,
    ) -> PluginResult<PluginSearchResult> {
        let key = self.base.main_cache_key(keyword, ext);
        let scraper = self.scraper.clone();
        self.base
            .async_search_with_result(
                keyword,
                move |_client, keyword, ext| do_search(scraper.clone(), keyword, ext),
                &key,
                ext,
            )
            .await
    }
}

async fn do_search(
    scraper: Arc<ChallengeClient>,
    keyword: String,
    ext: Ext,
) -> PluginResult<Vec<SearchResult>> {
    let max_pages = ext
        .get("max_pages")
        .and_then(|value| value.as_u64())
        .map(|pages| pages as usize)
        .unwrap_or(DEFAULT_MAX_PAGES)
        .clamp(1, MAX_ALLOWED_PAGES);

    let query = format!("{keyword} in:title #resource");
    let mut all_results: Vec<SearchResult> = Vec::new();
    let mut seen_posts = std::collections::HashSet::new();

    for page in 1..=max_pages {
        if page > 1 {
            tokio::time::sleep(PAGE_REQUEST_DELAY).await;
        }

        let url = format!(
            "{SEARCH_URL}?q={}&page={page}",
            urlencoding::encode(&query)
        );
        let body = match scraper.get_text(&url).await {
            Ok(body) => body,
            Err(e) => {
                // Partial coverage beats a failed search once something is in.
                if all_results.is_empty() {
                    return Err(e.into());
                }
                warn!(page, error = %e, "discourse page failed, returning partial results");
                break;
            }
        };

        let parsed: DiscourseSearchResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                if all_results.is_empty() {
                    return Err(PluginError::parse(e.to_string()));
                }
                warn!(page, error = %e, "discourse page unparsable, returning partial results");
                break;
            }
        };

        if parsed.posts.is_empty() {
            break;
        }

        let page_results = convert(&parsed);
        let mut fresh = 0;
        for result in page_results {
            if seen_posts.insert(result.unique_id.clone()) {
                all_results.push(result);
                fresh += 1;
            }
        }

        if fresh == 0 || !parsed.grouped_search_result.more_full_page_results {
            break;
        }
    }

    debug!(count = all_results.len(), "discourse search done");
    Ok(all_results)
}

fn convert(response: &DiscourseSearchResponse) -> Vec<SearchResult> {
    let topics: std::collections::HashMap<i64, &DiscourseTopic> = response
        .topics
        .iter()
        .map(|topic| (topic.id, topic))
        .collect();

    response
        .posts
        .iter()
        .filter_map(|post| {
            let datetime = DateTime::parse_from_rfc3339(&post.created_at)
                .ok()
                .map(|fixed| fixed.with_timezone(&Utc));

            let links = extract_cloud_links(&post.blurb, datetime);
            if links.is_empty() {
                return None;
            }

            let (title, tags) = match topics.get(&post.topic_id) {
                Some(topic) => (topic.title.clone(), topic.tags.clone()),
                None => ("未知标题".to_string(), Vec::new()),
            };

            Some(SearchResult {
                unique_id: format!("discourse-{}", post.id),
                title,
                content: clean_content(&post.blurb),
                links,
                tags: (!tags.is_empty()).then_some(tags),
                channel: String::new(),
                datetime,
                ..Default::default()
            })
        })
        .collect()
}

fn clean_content(blurb: &str) -> String {
    static TAGS: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"<[^>]+>").unwrap());
    static SPACES: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"\s+").unwrap());
    let stripped = TAGS.replace_all(blurb, "");
    SPACES.replace_all(stripped.trim(), " ").to_string()
}

#[derive(Debug, Default, Deserialize)]
struct DiscourseSearchResponse {
    #[serde(default)]
    posts: Vec<DiscoursePost>,
    #[serde(default)]
    topics: Vec<DiscourseTopic>,
    #[serde(default)]
    grouped_search_result: GroupedSearchResult,
}

#[derive(Debug, Deserialize)]
struct DiscoursePost {
    id: i64,
    #[serde(default)]
    blurb: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    topic_id: i64,
}

#[derive(Debug, Deserialize)]
struct DiscourseTopic {
    id: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GroupedSearchResult {
    #[serde(default)]
    more_full_page_results: bool,
}
