//! URL → provider-class mapping.
//!
//! The host list below is the single source of truth for the whole
//! workspace: the aggregator's grouping, every adapter's link mining and the
//! sub-services all go through [`classify_url`]. Changing an entry changes
//! the grouping semantics of the public API, so the list is fixed and
//! ordered exactly as documented.

use serde::{Deserialize, Serialize};

/// Provider class of a share link.
///
/// Serialized with the public wire tags (`"quark"`, `"115"`, `"pikpak"`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloudType {
    #[serde(rename = "quark")]
    Quark,
    #[serde(rename = "uc")]
    Uc,
    #[serde(rename = "baidu")]
    Baidu,
    #[serde(rename = "aliyun")]
    Aliyun,
    #[serde(rename = "xunlei")]
    Xunlei,
    #[serde(rename = "tianyi")]
    Tianyi,
    #[serde(rename = "mobile")]
    Mobile,
    #[serde(rename = "115")]
    Pan115,
    #[serde(rename = "123")]
    Pan123,
    #[serde(rename = "pikpak")]
    PikPak,
    #[serde(rename = "magnet")]
    Magnet,
    #[serde(rename = "ed2k")]
    Ed2k,
    #[serde(rename = "others")]
    Others,
}

impl CloudType {
    /// The wire tag, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            CloudType::Quark => "quark",
            CloudType::Uc => "uc",
            CloudType::Baidu => "baidu",
            CloudType::Aliyun => "aliyun",
            CloudType::Xunlei => "xunlei",
            CloudType::Tianyi => "tianyi",
            CloudType::Mobile => "mobile",
            CloudType::Pan115 => "115",
            CloudType::Pan123 => "123",
            CloudType::PikPak => "pikpak",
            CloudType::Magnet => "magnet",
            CloudType::Ed2k => "ed2k",
            CloudType::Others => "others",
        }
    }

    /// Every class, in classification order.
    pub const ALL: [CloudType; 13] = [
        CloudType::Quark,
        CloudType::Uc,
        CloudType::Baidu,
        CloudType::Aliyun,
        CloudType::Xunlei,
        CloudType::Tianyi,
        CloudType::Mobile,
        CloudType::Pan115,
        CloudType::Pan123,
        CloudType::PikPak,
        CloudType::Magnet,
        CloudType::Ed2k,
        CloudType::Others,
    ];
}

impl std::fmt::Display for CloudType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CloudType {
    type Err = ();

    /// Wire tag → class; unknown tags map to [`CloudType::Others`] rather
    /// than failing, mirroring the classifier's behaviour on unknown hosts.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CloudType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .unwrap_or(CloudType::Others))
    }
}

/// Fixed, ordered host table. A URL's host matches an entry when it equals
/// the entry or ends with `"." + entry`.
const HOST_RULES: &[(&str, CloudType)] = &[
    ("pan.quark.cn", CloudType::Quark),
    ("drive.uc.cn", CloudType::Uc),
    ("pan.baidu.com", CloudType::Baidu),
    ("aliyundrive.com", CloudType::Aliyun),
    ("alipan.com", CloudType::Aliyun),
    ("pan.xunlei.com", CloudType::Xunlei),
    ("cloud.189.cn", CloudType::Tianyi),
    ("caiyun.139.com", CloudType::Mobile),
    ("caiyun.feixin.10086.cn", CloudType::Mobile),
    ("115.com", CloudType::Pan115),
    ("115cdn.com", CloudType::Pan115),
    ("anxia.com", CloudType::Pan115),
    ("123pan.com", CloudType::Pan123),
    ("123pan.cn", CloudType::Pan123),
    ("123684.com", CloudType::Pan123),
    ("123685.com", CloudType::Pan123),
    ("123912.com", CloudType::Pan123),
    ("123592.com", CloudType::Pan123),
    ("mypikpak.com", CloudType::PikPak),
];

/// Classifies a URL into its provider class.
///
/// Total and pure: any input maps to exactly one class, `magnet:` and
/// `ed2k://` by scheme, http(s) by the fixed host table, everything else —
/// unknown hosts, unparsable input, other schemes — to
/// [`CloudType::Others`]. Never panics, performs no I/O.
pub fn classify_url(raw: &str) -> CloudType {
    let raw = raw.trim();

    if raw.starts_with("magnet:") {
        return CloudType::Magnet;
    }
    if raw.starts_with("ed2k://") {
        return CloudType::Ed2k;
    }

    let Ok(parsed) = url::Url::parse(raw) else {
        return CloudType::Others;
    };
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return CloudType::Others;
    }
    let Some(host) = parsed.host_str() else {
        return CloudType::Others;
    };
    let host = host.to_ascii_lowercase();

    for (rule, kind) in HOST_RULES {
        if host == *rule || host.ends_with(&format!(".{rule}")) {
            return *kind;
        }
    }

    CloudType::Others
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_every_provider() {
        let cases = [
            ("https://pan.quark.cn/s/1a2b3c", CloudType::Quark),
            ("https://drive.uc.cn/s/abc123", CloudType::Uc),
            ("https://pan.baidu.com/s/1abc?pwd=x1y2", CloudType::Baidu),
            ("https://www.aliyundrive.com/s/abc", CloudType::Aliyun),
            ("https://www.alipan.com/s/abc", CloudType::Aliyun),
            ("https://pan.xunlei.com/s/abc", CloudType::Xunlei),
            ("https://cloud.189.cn/t/abc", CloudType::Tianyi),
            ("https://cloud.189.cn/web/share?code=abc", CloudType::Tianyi),
            ("https://caiyun.139.com/m/i?abc", CloudType::Mobile),
            ("https://caiyun.feixin.10086.cn/dl/abc", CloudType::Mobile),
            ("https://115.com/s/abc", CloudType::Pan115),
            ("https://115cdn.com/s/abc", CloudType::Pan115),
            ("https://anxia.com/s/abc", CloudType::Pan115),
            ("https://www.123pan.com/s/abc", CloudType::Pan123),
            ("https://www.123684.com/s/abc", CloudType::Pan123),
            ("https://www.123912.com/s/abc", CloudType::Pan123),
            ("https://mypikpak.com/s/abc", CloudType::PikPak),
            ("magnet:?xt=urn:btih:abcdef0123456789", CloudType::Magnet),
            ("ed2k://|file|name.mkv|12345|ABCDEF|/", CloudType::Ed2k),
            ("https://example.com/s/abc", CloudType::Others),
            ("ftp://pan.quark.cn/s/abc", CloudType::Others),
            ("not a url at all", CloudType::Others),
            ("", CloudType::Others),
        ];

        for (url, expected) in cases {
            assert_eq!(classify_url(url), expected, "url: {url}");
        }
    }

    #[test]
    fn suffix_matching_requires_label_boundary() {
        // A host that merely ends with the characters of a rule must not
        // match without a dot boundary.
        assert_eq!(classify_url("https://evil115.com/s/abc"), CloudType::Others);
        assert_eq!(
            classify_url("https://share.115.com/s/abc"),
            CloudType::Pan115
        );
    }

    #[test]
    fn total_over_arbitrary_strings() {
        // Classification is a total, deterministic function of the input.
        let corpus = [
            "http://", "https://", "magnet:", "ed2k://", "://", "\0\0", "🦀",
            "https://例子.测试/s/x", "HTTPS://PAN.QUARK.CN/S/UPPER",
        ];
        for s in corpus {
            let first = classify_url(s);
            let second = classify_url(s);
            assert_eq!(first, second);
            assert!(CloudType::ALL.contains(&first));
        }
    }

    #[test]
    fn wire_tags_round_trip() {
        for kind in CloudType::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let back: CloudType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
        assert_eq!("115".parse::<CloudType>(), Ok(CloudType::Pan115));
        assert_eq!("unknown".parse::<CloudType>(), Ok(CloudType::Others));
    }
}
