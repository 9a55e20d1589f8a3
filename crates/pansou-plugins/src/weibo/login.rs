//! Weibo QR-login protocol: two-step QR issuance, scan polling, and the
//! redirect-chain cookie bootstrap.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use pansou_kernel::{PluginError, PluginResult};

use crate::cookies::{join_cookies, parse_cookie_string, set_cookies_of};

const PC_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/86.0.4240.111 Safari/537.36";
const MOBILE_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 14_0 like Mac OS X) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148";

/// Outcome of one login poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrLogin {
    /// Not scanned yet.
    Waiting,
    /// Scanned on the phone, awaiting confirmation there.
    Scanned,
    /// The QR code expired.
    Expired,
    /// Confirmed; the composed session cookie.
    Success { cookie: String },
}

/// Fetches a QR image; returns `(png_bytes, qrid)`.
///
/// Two upstream calls: the qrcode-info endpoint yields an `api_key` and the
/// `qrid` used for polling; the image endpoint renders the PNG for that key.
pub async fn generate_qr(client: &reqwest::Client) -> PluginResult<(Vec<u8>, String)> {
    static API_KEY: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r#"api_key=([^"]+)"#).unwrap());
    static QRID: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r#""qrid":"([^"]+)""#).unwrap());

    let timestamp = chrono::Utc::now().timestamp_millis();
    let info_url = format!(
        "https://passport.weibo.com/sso/v2/qrcode/image?entry=miniblog&size=180&callback=STK_{timestamp}"
    );

    let info = client
        .get(&info_url)
        .header("User-Agent", PC_UA)
        .header("Referer", "https://weibo.com/")
        .send()
        .await
        .map_err(|e| PluginError::Upstream(format!("qr info: {e}")))?
        .text()
        .await
        .map_err(|e| PluginError::Upstream(format!("qr info body: {e}")))?;

    let api_key = API_KEY
        .captures(&info)
        .map(|captures| captures[1].to_string())
        .ok_or_else(|| PluginError::parse("api_key not found in qr info"))?;
    let qrid = QRID
        .captures(&info)
        .map(|captures| captures[1].to_string())
        .ok_or_else(|| PluginError::parse("qrid not found in qr info"))?;

    let png = client
        .get(format!("https://v2.qr.weibo.cn/inf/gen?api_key={api_key}"))
        .header("User-Agent", PC_UA)
        .header("Referer", "https://weibo.com/")
        .send()
        .await
        .map_err(|e| PluginError::Upstream(format!("qr image: {e}")))?
        .bytes()
        .await
        .map_err(|e| PluginError::Upstream(format!("qr image body: {e}")))?
        .to_vec();

    Ok((png, qrid))
}

#[derive(Debug, Deserialize)]
struct CheckPayload {
    #[serde(default)]
    retcode: i64,
    #[serde(default)]
    data: CheckData,
}

#[derive(Debug, Default, Deserialize)]
struct CheckData {
    #[serde(default)]
    url: String,
}

/// Polls the scan state of `qrid` once.
///
/// Upstream retcodes: `20000000` success, `50114002` scanned-awaiting-
/// confirm, `50114004` expired; anything else keeps waiting.
pub async fn check_qr_login(client: &reqwest::Client, qrid: &str) -> PluginResult<QrLogin> {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let check_url = format!(
        "https://passport.weibo.com/sso/v2/qrcode/check?entry=sso&qrid={qrid}&callback=STK_{timestamp}"
    );

    let body = client
        .get(&check_url)
        .header("User-Agent", PC_UA)
        .header("Referer", "https://weibo.com/")
        .send()
        .await
        .map_err(|e| PluginError::Upstream(format!("qr check: {e}")))?
        .text()
        .await
        .map_err(|e| PluginError::Upstream(format!("qr check body: {e}")))?;

    // JSONP `STK_xxx({...})` or plain JSON, depending on upstream mood.
    let json_str = if body.starts_with("STK_") {
        let Some(start) = body.find("({") else {
            return Ok(QrLogin::Waiting);
        };
        let Some(end) = body.rfind("})") else {
            return Ok(QrLogin::Waiting);
        };
        &body[start + 1..=end]
    } else if body.starts_with('{') {
        body.as_str()
    } else {
        return Ok(QrLogin::Waiting);
    };

    let Ok(payload) = serde_json::from_str::<CheckPayload>(json_str) else {
        return Ok(QrLogin::Waiting);
    };
    debug!(retcode = payload.retcode, "weibo qr check");

    match payload.retcode {
        20000000 => {
            let cookie = init_cookie_from_alt(&payload.data.url).await?;
            Ok(QrLogin::Success { cookie })
        }
        50114002 => Ok(QrLogin::Scanned),
        50114004 => Ok(QrLogin::Expired),
        _ => Ok(QrLogin::Waiting),
    }
}

/// Follows the post-login `alt` URL through the PC home, mobile home and
/// mobile profile in one cookie jar, then composes the session cookie.
/// `SUB` and `SUBP` must be present or the login is treated as failed.
async fn init_cookie_from_alt(alt: &str) -> PluginResult<String> {
    let jar = Arc::new(reqwest::cookie::Jar::default());
    let client = reqwest::Client::builder()
        .cookie_provider(jar.clone())
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| PluginError::other(format!("jar client: {e}")))?;

    let chain = [
        (alt, PC_UA, "https://weibo.com/"),
        ("https://weibo.com/", PC_UA, "https://weibo.com/"),
        ("https://m.weibo.cn/", MOBILE_UA, "https://m.weibo.cn/"),
        ("https://m.weibo.cn/profile", MOBILE_UA, "https://m.weibo.cn/"),
    ];
    for (url, user_agent, referer) in chain {
        client
            .get(url)
            .header("User-Agent", user_agent)
            .header("Referer", referer)
            .send()
            .await
            .map_err(|e| PluginError::Upstream(format!("cookie chain {url}: {e}")))?;
    }

    let mut cookies: HashMap<String, String> = HashMap::new();
    for origin in ["https://weibo.com", "https://m.weibo.cn"] {
        let url = origin.parse::<reqwest::Url>().expect("static url");
        if let Some(header) = reqwest::cookie::CookieStore::cookies(jar.as_ref(), &url) {
            if let Ok(joined) = header.to_str() {
                cookies.extend(parse_cookie_string(joined));
            }
        }
    }

    for required in ["SUB", "SUBP"] {
        if !cookies.contains_key(required) {
            return Err(PluginError::Upstream(format!(
                "login cookie missing required field {required}"
            )));
        }
    }

    Ok(join_cookies(&cookies))
}

/// Touches the PC and mobile homes to rotate short-lived cookie fields
/// (XSRF-TOKEN and friends), merging whatever comes back.
pub async fn refresh_cookie(client: &reqwest::Client, cookie: &str) -> String {
    if cookie.is_empty() {
        return cookie.to_string();
    }
    let mut merged = parse_cookie_string(cookie);
    let mut updated = false;

    for (url, user_agent) in [
        ("https://weibo.com/", PC_UA),
        ("https://m.weibo.cn/", MOBILE_UA),
    ] {
        let Ok(response) = client
            .get(url)
            .header("User-Agent", user_agent)
            .header("Cookie", cookie)
            .send()
            .await
        else {
            return cookie.to_string();
        };
        for (name, value) in set_cookies_of(&response) {
            if !value.is_empty() {
                merged.insert(name, value);
                updated = true;
            }
        }
    }

    if updated {
        join_cookies(&merged)
    } else {
        cookie.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_payload_parses_both_shapes() {
        let jsonp = r#"STK_1700000({"retcode":50114002,"msg":"","data":{"url":""}})"#;
        let start = jsonp.find("({").unwrap();
        let end = jsonp.rfind("})").unwrap();
        let parsed: CheckPayload = serde_json::from_str(&jsonp[start + 1..=end]).unwrap();
        assert_eq!(parsed.retcode, 50114002);

        let plain: CheckPayload = serde_json::from_str(
            r#"{"retcode":20000000,"data":{"url":"https://weibo.com/alt?x=1"}}"#,
        )
        .unwrap();
        assert_eq!(parsed.data.url, "");
        assert_eq!(plain.data.url, "https://weibo.com/alt?x=1");
    }
}
