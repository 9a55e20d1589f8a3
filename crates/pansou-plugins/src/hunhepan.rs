//! Hunhepan family adapter: four sibling JSON search APIs behind one
//! plugin, queried in parallel and merged with quality-scored dedup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use pansou_core::{
    filter_results_by_keyword, CloudType, Ext, Link, PluginSearchResult, SearchResult,
};
use pansou_kernel::{BaseAsyncPlugin, KernelError, PluginResult, SearchPlugin};

const ENDPOINTS: [&str; 4] = [
    "https://hunhepan.com/open/search/disk",
    "https://qkpanso.com/v1/search/disk",
    "https://kuake8.com/v1/search/disk",
    "https://www.misoso.cc/v1/search/disk",
];

const PAGE_SIZE: usize = 30;
const MAX_PAGES: usize = 3;

pub struct HunhepanPlugin {
    base: Arc<BaseAsyncPlugin>,
}

impl HunhepanPlugin {
    pub fn new() -> Result<Self, KernelError> {
        Ok(Self {
            base: Arc::new(
                BaseAsyncPlugin::builder("hunhepan", 3)
                    .http_timeout(Duration::from_secs(10))
                    .workers(12)
                    .build()?,
            ),
        })
    }
}

#[async_trait]
impl SearchPlugin for HunhepanPlugin {
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
        let base = self.base.clone();
        self.base
            .async_search_with_result(
                keyword,
                move |client, keyword, ext| do_search(base.clone(), client, keyword, ext),
                &key,
                ext,
            )
            .await
    }
}

async fn do_search(
    base: Arc<BaseAsyncPlugin>,
    client: reqwest::Client,
    keyword: String,
    _ext: Ext,
) -> PluginResult<Vec<SearchResult>> {
    let workers = base.workers();
    let mut fetches = Vec::new();

    for endpoint in ENDPOINTS {
        for page in 1..=MAX_PAGES {
            let client = client.clone();
            let keyword = keyword.clone();
            let workers = workers.clone();
            let retry = base.retry().clone();
            fetches.push(async move {
                let _permit = workers.acquire_owned().await.ok()?;
                match search_page(&client, &retry, endpoint, &keyword, page).await {
                    Ok(items) => Some(Ok(items)),
                    Err(e) => {
                        debug!(endpoint, page, error = %e, "hunhepan page failed");
                        Some(Err(e))
                    }
                }
            });
        }
    }

    let mut items = Vec::new();
    let mut first_error = None;
    for fetched in futures::future::join_all(fetches).await.into_iter().flatten() {
        match fetched {
            Ok(page_items) => items.extend(page_items),
            Err(e) => first_error = first_error.or(Some(e)),
        }
    }

    // Every endpoint down is an error; partial coverage is a result.
    if items.is_empty() {
        if let Some(e) = first_error {
            return Err(e);
        }
    }

    let unique = deduplicate(items);
    let results = convert(unique);
    Ok(filter_results_by_keyword(results, &keyword))
}

async fn search_page(
    client: &reqwest::Client,
    retry: &pansou_transport::RetryPolicy,
    endpoint: &str,
    keyword: &str,
    page: usize,
) -> PluginResult<Vec<HunhepanItem>> {
    let body = serde_json::json!({
        "page": page,
        "q": keyword,
        "user": "",
        "exact": false,
        "format": [],
        "share_time": "",
        "size": PAGE_SIZE,
        "type": "",
        "exclude_user": [],
        "adv_params": { "wechat_pwd": "", "platform": "pc" },
    });

    let referer = referer_for(endpoint);
    let request = client
        .post(endpoint)
        .json(&body)
        .header("Referer", referer)
        .header("Origin", referer.trim_end_matches("/search"));

    let response = retry.send(request).await?;
    let parsed: HunhepanResponse = response
        .json()
        .await
        .map_err(|e| pansou_kernel::PluginError::parse(e.to_string()))?;

    if parsed.code != 200 {
        return Err(pansou_kernel::PluginError::Upstream(format!(
            "{endpoint} answered code {}: {}",
            parsed.code, parsed.msg
        )));
    }
    Ok(parsed.data.list)
}

fn referer_for(endpoint: &str) -> &'static str {
    if endpoint.contains("qkpanso.com") {
        "https://qkpanso.com/search"
    } else if endpoint.contains("kuake8.com") {
        "https://kuake8.com/search"
    } else if endpoint.contains("misoso.cc") {
        "https://www.misoso.cc/search"
    } else {
        "https://hunhepan.com/search"
    }
}

/// Dedupe by disk id (falling back to link/name composites), keeping the
/// richer record: more file listing, then known password, then known share
/// time.
fn deduplicate(items: Vec<HunhepanItem>) -> Vec<HunhepanItem> {
    let mut unique: std::collections::HashMap<String, HunhepanItem> = std::collections::HashMap::new();

    for mut item in items {
        item.disk_name = clean_title(&item.disk_name);

        let key = if !item.disk_id.is_empty() {
            item.disk_id.clone()
        } else if !item.link.is_empty() {
            format!("{}|{}", item.link, item.disk_name)
        } else {
            format!("{}|{}", item.disk_name, item.disk_type)
        };

        match unique.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                if score_against(&item, slot.get()) > slot.get().files.len() {
                    slot.insert(item);
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(item);
            }
        }
    }

    unique.into_values().collect()
}

fn score_against(candidate: &HunhepanItem, existing: &HunhepanItem) -> usize {
    let mut score = candidate.files.len();
    if existing.disk_pass.is_empty() && !candidate.disk_pass.is_empty() {
        score += 5;
    }
    if existing.shared_time.is_empty() && !candidate.shared_time.is_empty() {
        score += 3;
    }
    score
}

fn convert(items: Vec<HunhepanItem>) -> Vec<SearchResult> {
    items
        .into_iter()
        .filter(|item| !item.link.is_empty())
        .map(|item| {
            let unique_id = if item.disk_id.is_empty() {
                format!("hunhepan-{}", stable_hash(&item.link))
            } else {
                format!("hunhepan-{}", item.disk_id)
            };

            let datetime = NaiveDateTime::parse_from_str(&item.shared_time, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc());

            SearchResult {
                unique_id,
                title: clean_title(&item.disk_name),
                content: item.files.clone(),
                datetime,
                links: vec![Link {
                    kind: convert_disk_type(&item.disk_type),
                    url: item.link,
                    password: item.disk_pass,
                    datetime: None,
                    work_title: None,
                }],
                channel: String::new(),
                ..Default::default()
            }
        })
        .collect()
}

/// Upstream disk-type code → provider class.
fn convert_disk_type(disk_type: &str) -> CloudType {
    match disk_type {
        "BDY" => CloudType::Baidu,
        "ALY" => CloudType::Aliyun,
        "QUARK" => CloudType::Quark,
        "TIANYI" => CloudType::Tianyi,
        "UC" => CloudType::Uc,
        "CAIYUN" => CloudType::Mobile,
        "115" => CloudType::Pan115,
        "XUNLEI" => CloudType::Xunlei,
        "123PAN" => CloudType::Pan123,
        "PIKPAK" => CloudType::PikPak,
        _ => CloudType::Others,
    }
}

fn clean_title(title: &str) -> String {
    static TAGS: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"</?(?:em|b|strong|i)>").unwrap());
    TAGS.replace_all(title, "").trim().to_string()
}

fn stable_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..4])
}

#[derive(Debug, Deserialize)]
struct HunhepanResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: HunhepanData,
}

#[derive(Debug, Default, Deserialize)]
struct HunhepanData {
    #[serde(default)]
    list: Vec<HunhepanItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct HunhepanItem {
    #[serde(default)]
    disk_id: String,
    #[serde(default)]
    disk_name: String,
    #[serde(default)]
    disk_pass: String,
    #[serde(default)]
    disk_type: String,
    #[serde(default)]
    files: String,
    #[serde(default)]
    shared_time: String,
    #[serde(default)]
    link: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, name: &str, pass: &str, time: &str) -> HunhepanItem {
        HunhepanItem {
            disk_id: id.into(),
            disk_name: name.into(),
            disk_pass: pass.into(),
            disk_type: "QUARK".into(),
            shared_time: time.into(),
            link: "https://pan.quark.cn/s/abc".into(),
            ..Default::default()
        }
    }

    #[test]
    fn dedup_prefers_record_with_password() {
        let bare = item("d1", "Movie", "", "");
        let with_pass = item("d1", "Movie", "x1y2", "");
        let unique = deduplicate(vec![bare, with_pass]);
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].disk_pass, "x1y2");
    }

    #[test]
    fn convert_maps_types_and_parses_time() {
        let results = convert(vec![item("d1", "<em>Movie</em>", "p", "2025-07-07 13:19:48")]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].unique_id, "hunhepan-d1");
        assert_eq!(results[0].title, "Movie");
        assert_eq!(results[0].links[0].kind, CloudType::Quark);
        assert!(results[0].datetime.is_some());
        assert!(results[0].channel.is_empty());
    }

    #[test]
    fn convert_skips_linkless_items() {
        let mut linkless = item("d2", "Movie", "", "");
        linkless.link.clear();
        assert!(convert(vec![linkless]).is_empty());
    }

    #[test]
    fn fallback_id_is_stable() {
        let mut a = item("", "Movie", "", "");
        a.disk_id.clear();
        let first = convert(vec![a.clone()]);
        let second = convert(vec![a]);
        assert_eq!(first[0].unique_id, second[0].unique_id);
    }

    #[test]
    fn disk_type_mapping_is_total() {
        assert_eq!(convert_disk_type("BDY"), CloudType::Baidu);
        assert_eq!(convert_disk_type("123PAN"), CloudType::Pan123);
        assert_eq!(convert_disk_type("whatever"), CloudType::Others);
    }
}
