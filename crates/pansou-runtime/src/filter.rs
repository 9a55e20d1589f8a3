//! Include/exclude filtering of a finished response.
//!
//! Distinct from the keyword filter: this one is request-supplied and
//! applied after aggregation, with strategy depending on the result type —
//! the merged view filters on link notes, the results view on titles with a
//! second pass over per-link work titles (falling back to the title).
//! Exclude always wins; include demands at least one hit when present.

use pansou_core::{MergedLinks, SearchResponse, SearchResult};
use pansou_kernel::ResultType;

/// Request-supplied include/exclude phrase lists.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl FilterConfig {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

/// Applies `filter` to `response` per the result-type strategy, recomputing
/// totals.
pub fn apply_result_filter(
    mut response: SearchResponse,
    filter: &FilterConfig,
    result_type: ResultType,
) -> SearchResponse {
    if filter.is_empty() {
        return response;
    }

    let include: Vec<String> = filter.include.iter().map(|s| s.to_lowercase()).collect();
    let exclude: Vec<String> = filter.exclude.iter().map(|s| s.to_lowercase()).collect();

    match result_type {
        ResultType::MergedByType => {
            response.merged_by_type = response
                .merged_by_type
                .map(|merged| filter_merged(merged, &include, &exclude));
            response.total = response
                .merged_by_type
                .as_ref()
                .map(|merged| merged.values().map(Vec::len).sum())
                .unwrap_or(0);
        }
        ResultType::Results | ResultType::All => {
            response.results = response
                .results
                .map(|results| filter_results(results, &include, &exclude));
            response.total = response.results.as_ref().map(Vec::len).unwrap_or(0);
            if result_type == ResultType::All {
                response.merged_by_type = response
                    .merged_by_type
                    .map(|merged| filter_merged(merged, &include, &exclude));
            }
        }
    }

    response
}

/// Merged view: the link note is the filter key; emptied tags disappear.
fn filter_merged(merged: MergedLinks, include: &[String], exclude: &[String]) -> MergedLinks {
    merged
        .into_iter()
        .filter_map(|(tag, links)| {
            let kept: Vec<_> = links
                .into_iter()
                .filter(|link| matches_filter(&link.note, include, exclude))
                .collect();
            (!kept.is_empty()).then_some((tag, kept))
        })
        .collect()
}

/// Results view: title gates the result, then each link is re-checked on
/// its work title (or the title when it has none); linkless survivors are
/// dropped.
fn filter_results(
    results: Vec<SearchResult>,
    include: &[String],
    exclude: &[String],
) -> Vec<SearchResult> {
    results
        .into_iter()
        .filter_map(|mut result| {
            if !matches_filter(&result.title, include, exclude) {
                return None;
            }
            let title = result.title.clone();
            result.links.retain(|link| {
                let key = link.work_title.as_deref().unwrap_or(&title);
                matches_filter(key, include, exclude)
            });
            (!result.links.is_empty()).then_some(result)
        })
        .collect()
}

fn matches_filter(text: &str, include: &[String], exclude: &[String]) -> bool {
    let lowered = text.to_lowercase();
    if exclude.iter().any(|banned| lowered.contains(banned)) {
        return false;
    }
    if !include.is_empty() && !include.iter().any(|wanted| lowered.contains(wanted)) {
        return false;
    }
    true
}
