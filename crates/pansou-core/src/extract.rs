//! Link mining and share-password recovery from free text.
//!
//! Upstream posts rarely hand over structured links: a hit's body is prose
//! with URLs and a password mentioned somewhere nearby. The extractors here
//! are what every adapter and both sub-services use to turn that prose into
//! [`Link`]s, so the provider patterns live in exactly one place.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::classify::{classify_url, CloudType};
use crate::model::Link;

/// Free-text URL patterns, one per provider, in classification order.
static LINK_PATTERNS: LazyLock<Vec<(Regex, CloudType)>> = LazyLock::new(|| {
    [
        (r"https?://pan\.quark\.cn/s/[^\s\n]+", CloudType::Quark),
        (r"https?://drive\.uc\.cn/s/[^\s\n]+", CloudType::Uc),
        (
            r"https?://pan\.baidu\.com/s/[^\s\n?]+(?:\?pwd=[a-zA-Z0-9]+)?",
            CloudType::Baidu,
        ),
        (
            r"https?://(?:www\.)?(?:aliyundrive\.com|alipan\.com)/s/[^\s\n]+",
            CloudType::Aliyun,
        ),
        (r"https?://pan\.xunlei\.com/s/[^\s\n]+", CloudType::Xunlei),
        (
            r"https?://cloud\.189\.cn/(?:t|web/share)[^\s\n]*",
            CloudType::Tianyi,
        ),
        (
            r"https?://caiyun\.(?:139\.com|feixin\.10086\.cn)/[^\s\n]+",
            CloudType::Mobile,
        ),
        (
            r"https?://(?:115\.com|115cdn\.com|anxia\.com)/s/[^\s\n?]+(?:\?password=[a-zA-Z0-9]+)?",
            CloudType::Pan115,
        ),
        (
            r"https?://(?:www\.)?(?:123pan\.com|123pan\.cn|123684\.com|123685\.com|123912\.com|123592\.com)/s/[^\s\n]+",
            CloudType::Pan123,
        ),
        (r"https?://(?:www\.)?mypikpak\.com/s/[^\s\n]+", CloudType::PikPak),
        (r"magnet:\?xt=urn:btih:[^\s\n]+", CloudType::Magnet),
        (r"ed2k://\|file\|[^\n]+?\|/", CloudType::Ed2k),
    ]
    .into_iter()
    .map(|(pattern, kind)| (Regex::new(pattern).expect("link pattern"), kind))
    .collect()
});

/// Query-string keys carrying a share password, in precedence order.
const PASSWORD_QUERY_KEYS: [&str; 4] = ["pwd", "password", "passcode", "code"];

/// Text patterns carrying a share password, in precedence order.
static PASSWORD_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"提取码[:：]\s*([A-Za-z0-9]{3,8})",
        r"密码[:：]\s*([A-Za-z0-9]{3,8})",
        r"pwd[=:：]\s*([A-Za-z0-9]{3,8})",
        r"code[=:：]\s*([A-Za-z0-9]{3,8})",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("password pattern"))
    .collect()
});

/// Recovers a share password from a URL's query string or from free text.
///
/// Tries, in order: the query keys `pwd`, `password`, `passcode`, `code`
/// (when the input parses as a URL), then the text patterns `提取码[:：]`,
/// `密码[:：]`, `pwd[=:：]`, `code[=:：]`. Returns the first match trimmed,
/// `""` on no match. The ordering is part of the public contract and must
/// not change.
pub fn extract_password(url_or_text: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url_or_text.trim()) {
        for key in PASSWORD_QUERY_KEYS {
            if let Some((_, value)) = parsed.query_pairs().find(|(k, _)| k == key) {
                let value = value.trim();
                if !value.is_empty() {
                    return value.to_string();
                }
            }
        }
    }

    for pattern in PASSWORD_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(url_or_text) {
            return captures[1].trim().to_string();
        }
    }

    String::new()
}

/// How many characters around a mined URL are searched for its password.
const PASSWORD_CONTEXT: usize = 50;

/// Mines every cloud-storage link out of free text.
///
/// Candidates come from the per-provider patterns; each is re-checked with
/// [`classify_url`], deduplicated by URL (first occurrence wins) and given a
/// password from its own query string or from the surrounding
/// ±[`PASSWORD_CONTEXT`] characters.
pub fn extract_cloud_links(text: &str, datetime: Option<DateTime<Utc>>) -> Vec<Link> {
    let mut links = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (pattern, _) in LINK_PATTERNS.iter() {
        for found in pattern.find_iter(text) {
            let url = found.as_str().trim_end_matches(['。', '，', ')', '）']);
            if !seen.insert(url.to_string()) {
                continue;
            }

            // Every candidate goes back through the classifier; a pattern
            // match that the classifier rejects is dropped.
            let kind = classify_url(url);
            if kind == CloudType::Others {
                continue;
            }

            let mut password = extract_password(url);
            if password.is_empty() {
                let start = found.start().saturating_sub(PASSWORD_CONTEXT);
                let end = (found.end() + PASSWORD_CONTEXT).min(text.len());
                // Clamp to char boundaries; the text is arbitrary UTF-8.
                let start = floor_char_boundary(text, start);
                let end = floor_char_boundary(text, end);
                password = extract_password(&text[start..end]);
            }

            links.push(Link {
                kind,
                url: url.to_string(),
                password,
                datetime,
                work_title: None,
            });
        }
    }

    links
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_from_query_has_precedence() {
        assert_eq!(
            extract_password("https://pan.baidu.com/s/1abc?pwd=x1y2"),
            "x1y2"
        );
        assert_eq!(
            extract_password("https://115.com/s/abc?password=8888"),
            "8888"
        );
        // Query key wins over a text pattern in the same input.
        assert_eq!(
            extract_password("https://pan.baidu.com/s/1abc?pwd=aaaa 提取码：bbbb"),
            "aaaa"
        );
    }

    #[test]
    fn password_from_text_patterns_in_order() {
        assert_eq!(extract_password("资源 提取码：ab12 密码：cd34"), "ab12");
        assert_eq!(extract_password("密码: zzz9"), "zzz9");
        assert_eq!(extract_password("pwd=q1w2"), "q1w2");
        assert_eq!(extract_password("code: 4567"), "4567");
    }

    #[test]
    fn password_extraction_is_conservative() {
        // No supported URL, no password-context keyword → empty.
        assert_eq!(extract_password("just some random prose"), "");
        assert_eq!(extract_password("https://example.com/page"), "");
        assert_eq!(extract_password(""), "");
    }

    #[test]
    fn mines_links_with_nearby_passwords() {
        let text = "新剧合集 https://pan.quark.cn/s/1a2b3c 提取码：x9z8\n\
                    备用 https://pan.baidu.com/s/1abc?pwd=y7u6 失效勿念";
        let links = extract_cloud_links(text, None);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].kind, CloudType::Quark);
        assert_eq!(links[0].password, "x9z8");
        assert_eq!(links[1].kind, CloudType::Baidu);
        assert_eq!(links[1].password, "y7u6");
    }

    #[test]
    fn deduplicates_repeated_urls() {
        let text = "https://pan.quark.cn/s/same https://pan.quark.cn/s/same";
        assert_eq!(extract_cloud_links(text, None).len(), 1);
    }

    #[test]
    fn mines_magnet_and_ed2k() {
        let text = "magnet:?xt=urn:btih:0123456789abcdef 还有\n\
                    ed2k://|file|movie.mkv|733906944|ABCDEF0123456789|/";
        let links = extract_cloud_links(text, None);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].kind, CloudType::Magnet);
        assert_eq!(links[1].kind, CloudType::Ed2k);
    }
}
