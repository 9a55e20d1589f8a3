//! Nyaa torrent catalogue adapter.
//!
//! Magnet-catalogue source: titles are file-level release names, not
//! comparable to the user keyword, so the plugin filters with the keyword it
//! actually searched (honoring `ext["title_en"]`) and opts out of the
//! aggregator's filter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use tracing::debug;

use pansou_core::{
    filter_results_by_keyword, CloudType, Ext, Link, PluginSearchResult, SearchResult,
};
use pansou_kernel::{BaseAsyncPlugin, KernelError, PluginError, PluginResult, SearchPlugin};

const SITE_URL: &str = "https://nyaa.si";

pub struct NyaaPlugin {
    base: Arc<BaseAsyncPlugin>,
}

impl NyaaPlugin {
    pub fn new() -> Result<Self, KernelError> {
        Ok(Self {
            base: Arc::new(
                BaseAsyncPlugin::builder_with_filter("nyaa", 3, true)
                    .http_timeout(Duration::from_secs(10))
                    .build()?,
            ),
        })
    }
}

#[async_trait]
impl SearchPlugin for NyaaPlugin {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn priority(&self) -> i32 {
        self.base.priority()
    }

    fn skip_service_filter(&self) -> bool {
        self.base.skip_service_filter()
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
    ext: Ext,
) -> PluginResult<Vec<SearchResult>> {
    // Foreign-media catalogues index English release names; prefer the
    // alternate keyword when the caller supplies one.
    let search_keyword = ext
        .get("title_en")
        .and_then(|value| value.as_str())
        .filter(|alt| !alt.is_empty())
        .unwrap_or(&keyword)
        .to_string();

    let search_url = format!(
        "{SITE_URL}/?f=0&c=0_0&q={}",
        urlencoding::encode(&search_keyword)
    );

    let response = base
        .retry()
        .send(client.get(&search_url).header("Referer", SITE_URL))
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

    let results = parse_search_page(&body);
    debug!(count = results.len(), keyword = %search_keyword, "nyaa parsed");
    Ok(filter_results_by_keyword(results, &search_keyword))
}

fn parse_search_page(body: &str) -> Vec<SearchResult> {
    static VIEW_ID: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"/view/(\d+)").unwrap());

    let document = Html::parse_document(body);
    let row_selector = Selector::parse("table.torrent-list tbody tr").unwrap();
    let category_selector = Selector::parse("td:nth-child(1) a").unwrap();
    let title_selector = Selector::parse("td[colspan='2'] a:not(.comments)").unwrap();
    let magnet_selector = Selector::parse("td.text-center a[href^='magnet:']").unwrap();
    let center_selector = Selector::parse("td.text-center").unwrap();

    let mut results = Vec::new();

    for row in document.select(&row_selector) {
        let Some(title_link) = row.select(&title_selector).next() else {
            continue;
        };
        let mut title = title_link.text().collect::<String>().trim().to_string();
        if title.is_empty() {
            title = title_link.value().attr("title").unwrap_or("").to_string();
        }
        let Some(detail_href) = title_link.value().attr("href") else {
            continue;
        };
        let Some(item_id) = VIEW_ID
            .captures(detail_href)
            .map(|captures| captures[1].to_string())
        else {
            continue;
        };

        let Some(magnet) = row
            .select(&magnet_selector)
            .next()
            .and_then(|a| a.value().attr("href"))
        else {
            continue;
        };

        let category = row
            .select(&category_selector)
            .next()
            .and_then(|a| a.value().attr("title"))
            .unwrap_or("")
            .to_string();

        let datetime = row
            .select(&center_selector)
            .find_map(|td| td.value().attr("data-timestamp"))
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));

        let centers: Vec<String> = row
            .select(&center_selector)
            .map(|td| td.text().collect::<String>().trim().to_string())
            .collect();
        // Layout: [links, size, date, seeders, leechers, downloads].
        let size = centers.get(1).cloned().unwrap_or_default();
        let (seeders, leechers, downloads) = if centers.len() >= 6 {
            (
                centers[centers.len() - 3].clone(),
                centers[centers.len() - 2].clone(),
                centers[centers.len() - 1].clone(),
            )
        } else {
            ("0".into(), "0".into(), "0".into())
        };

        let mut content_parts = Vec::new();
        if !category.is_empty() {
            content_parts.push(format!("分类: {category}"));
        }
        if !size.is_empty() {
            content_parts.push(format!("大小: {size}"));
        }
        content_parts.push(format!("做种: {seeders}"));
        content_parts.push(format!("下载: {leechers}"));
        content_parts.push(format!("完成: {downloads}"));

        let mut tags = Vec::new();
        if !category.is_empty() {
            tags.push(category.clone());
        }
        tags.push(format!("做种:{seeders}"));
        tags.push(format!("下载:{leechers}"));
        tags.push(format!("完成:{downloads}"));

        results.push(SearchResult {
            unique_id: format!("nyaa-{item_id}"),
            title: title.clone(),
            content: content_parts.join(" | "),
            datetime,
            links: vec![Link {
                kind: CloudType::Magnet,
                url: magnet.to_string(),
                password: String::new(),
                datetime,
                work_title: Some(title),
            }],
            channel: String::new(),
            tags: Some(tags),
            ..Default::default()
        });
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    <table class="torrent-list"><tbody>
      <tr>
        <td><a href="/?c=1_2" title="Anime - English-translated"><img/></a></td>
        <td colspan="2">
          <a class="comments" href="/view/1886810#comments">4</a>
          <a href="/view/1886810" title="[Group] Alpha S01 [1080p]">[Group] Alpha S01 [1080p]</a>
        </td>
        <td class="text-center">
          <a href="/download/1886810.torrent"><i></i></a>
          <a href="magnet:?xt=urn:btih:aabbccdd&amp;dn=Alpha"><i></i></a>
        </td>
        <td class="text-center">11.4 GiB</td>
        <td class="text-center" data-timestamp="1719792000">2024-07-01 00:00</td>
        <td class="text-center">12</td>
        <td class="text-center">3</td>
        <td class="text-center">140</td>
      </tr>
      <tr>
        <td><a href="/?c=1_2" title="Anime"><img/></a></td>
        <td colspan="2"><a href="/view/1886811" title="No magnet here">No magnet here</a></td>
        <td class="text-center"><a href="/download/1886811.torrent"><i></i></a></td>
      </tr>
    </tbody></table>"#;

    #[test]
    fn parses_rows_with_magnets_only() {
        let results = parse_search_page(SAMPLE);
        assert_eq!(results.len(), 1);

        let hit = &results[0];
        assert_eq!(hit.unique_id, "nyaa-1886810");
        assert_eq!(hit.title, "[Group] Alpha S01 [1080p]");
        assert_eq!(hit.links[0].kind, CloudType::Magnet);
        assert!(hit.links[0].url.starts_with("magnet:?xt=urn:btih:aabbccdd"));
        assert_eq!(hit.links[0].work_title.as_deref(), Some(hit.title.as_str()));
        assert!(hit.datetime.is_some());
        assert!(hit.content.contains("做种: 12"));
        assert!(hit.channel.is_empty());
    }

    #[test]
    fn empty_page_yields_no_results() {
        assert!(parse_search_page("<html><body>nothing</body></html>").is_empty());
    }
}
