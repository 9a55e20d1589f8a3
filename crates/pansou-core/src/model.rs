//! Canonical data model shared by the kernel, the aggregator and every
//! adapter.
//!
//! Wire field names follow the public JSON API (`unique_id`,
//! `merged_by_type`, …); adapters must not invent their own result shapes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::CloudType;

/// Per-call hints passed through from the API to plugins.
///
/// Known keys are `title_en`, `max_pages`, `debug` and `referer`; unknown
/// keys are ignored by every consumer.
pub type Ext = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Search results
// =============================================================================

/// One share link attached to a [`SearchResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// Provider class. Must agree with [`classify_url`](crate::classify_url)
    /// for [`Link::url`], or be [`CloudType::Others`].
    #[serde(rename = "type")]
    pub kind: CloudType,
    /// Share URL. http(s), `magnet:` or `ed2k://`.
    pub url: String,
    /// Access password, empty when the share is open.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Per-link timestamp, when the upstream exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<DateTime<Utc>>,
    /// Per-file display title, used by magnet/torrent catalogues where one
    /// hit carries several files with their own names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_title: Option<String>,
}

impl Link {
    /// Link with the provider class derived from the URL.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            kind: crate::classify::classify_url(&url),
            url,
            password: String::new(),
            datetime: None,
            work_title: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_datetime(mut self, datetime: DateTime<Utc>) -> Self {
        self.datetime = Some(datetime);
        self
    }

    pub fn with_work_title(mut self, title: impl Into<String>) -> Self {
        self.work_title = Some(title.into());
        self
    }
}

/// The canonical hit.
///
/// Invariants enforced at aggregation time:
/// - a result with no links is dropped before aggregation;
/// - `channel` is empty iff the producer is a plugin rather than a
///   chat-channel adapter;
/// - `unique_id` collisions keep the entry seen first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Globally unique within the producing plugin: `"<plugin>-<stable id>"`,
    /// stable across runs for the same upstream item.
    pub unique_id: String,
    /// Source-native id (e.g. a channel message id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Chat channel that produced this hit; `""` for plugin-produced hits.
    #[serde(default)]
    pub channel: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    /// `None` means "unknown"; unknown datetimes sort last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<DateTime<Utc>>,
    pub links: Vec<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

/// What a plugin returns to the kernel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginSearchResult {
    pub results: Vec<SearchResult>,
    /// `true` iff a later refresh cannot improve on these results; the
    /// kernel schedules no background refresh for final snapshots.
    pub is_final: bool,
    /// Producing plugin name; filled in by the kernel when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl PluginSearchResult {
    /// An empty, final result — the canonical "nothing to contribute" value.
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            is_final: true,
            source: None,
        }
    }

    pub fn finalized(results: Vec<SearchResult>) -> Self {
        Self {
            results,
            is_final: true,
            source: None,
        }
    }
}

// =============================================================================
// Response shapes
// =============================================================================

/// One entry of the by-provider grouping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedLink {
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Display note; the title of the result the link came from.
    #[serde(default)]
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<DateTime<Utc>>,
    /// Producing plugin, user-visible provenance.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
}

/// Provider tag → ordered links, deduplicated by URL within each tag.
pub type MergedLinks = HashMap<String, Vec<MergedLink>>;

/// The final answer for one search request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub total: usize,
    /// Present for `result_type` ∈ {`all`, `results`}.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<SearchResult>>,
    /// Present for `result_type` ∈ {`all`, `merged_by_type`}.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_by_type: Option<MergedLinks>,
    /// `false` while at least one contributing plugin is still refreshing
    /// its snapshot in the background.
    #[serde(default = "default_true")]
    pub is_final: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_new_classifies() {
        let link = Link::new("https://pan.quark.cn/s/abcd1234");
        assert_eq!(link.kind, CloudType::Quark);
        assert!(link.password.is_empty());
    }

    #[test]
    fn serde_wire_names() {
        let result = SearchResult {
            unique_id: "stub1-1".into(),
            title: "alpha movie".into(),
            links: vec![Link::new("https://pan.quark.cn/s/aaaa").with_password("x1y2")],
            ..Default::default()
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["unique_id"], "stub1-1");
        assert_eq!(value["links"][0]["type"], "quark");
        assert_eq!(value["links"][0]["password"], "x1y2");
        // Unknown datetime and message id are omitted entirely.
        assert!(value.get("datetime").is_none());
        assert!(value.get("message_id").is_none());

        let back: SearchResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn empty_password_omitted() {
        let value = serde_json::to_value(Link::new("magnet:?xt=urn:btih:deadbeef")).unwrap();
        assert!(value.get("password").is_none());
        assert_eq!(value["type"], "magnet");
    }
}
