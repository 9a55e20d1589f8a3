//! QQ QR-login protocol: QR issuance, poll-for-scan, cookie composition,
//! and the token-folding hashes the upstream expects.

use std::collections::HashMap;

use tracing::debug;

use pansou_kernel::{PluginError, PluginResult};

use crate::cookies::{join_cookies, parse_cookie_string, parse_set_cookie};

const QRSHOW_URL: &str = "https://xui.ptlogin2.qq.com/ssl/ptqrshow?appid=1600001587&e=2&l=M&s=3&d=72&v=4&t=0.3680011491059967&daid=823&pt_3rd_aid=0";

/// Outcome of one login poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrLogin {
    /// Not scanned yet (or scanned, awaiting confirm).
    Waiting,
    /// The QR code is no longer valid.
    Expired,
    /// Scan confirmed; composed cookie and masked account id.
    Success { cookie: String, qq_masked: String },
}

/// Fetches a fresh QR PNG; returns `(png_bytes, qrsig)`.
pub async fn generate_qr(client: &reqwest::Client) -> PluginResult<(Vec<u8>, String)> {
    let response = client
        .get(QRSHOW_URL)
        .send()
        .await
        .map_err(|e| PluginError::Upstream(format!("qr request: {e}")))?;
    if !response.status().is_success() {
        return Err(PluginError::Upstream(format!(
            "qr request status {}",
            response.status()
        )));
    }

    let qrsig = response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|header| {
            let (name, value) = parse_set_cookie(header)?;
            (name == "qrsig").then_some(value)
        })
        .unwrap_or_default();

    let png = response
        .bytes()
        .await
        .map_err(|e| PluginError::Upstream(format!("qr body: {e}")))?
        .to_vec();

    Ok((png, qrsig))
}

/// Polls the upstream once for the scan state of `qrsig`.
pub async fn check_qr_login(client: &reqwest::Client, qrsig: &str) -> PluginResult<QrLogin> {
    let token = ptqr_token(qrsig);
    let check_url = format!(
        "https://xui.ptlogin2.qq.com/ssl/ptqrlogin?u1=https%3A%2F%2Fpd.qq.com%2Fexplore\
         &ptqrtoken={token}&ptredirect=1&h=1&t=1&g=1&from_ui=1&ptlang=2052\
         &action=0-0-1761211119400&js_ver=25100115&js_type=1&login_sig=&pt_uistyle=40\
         &aid=1600001587&daid=823&pt_js_version=28d22679"
    );

    let response = client
        .get(&check_url)
        .header("Cookie", format!("qrsig={qrsig}"))
        .send()
        .await
        .map_err(|e| PluginError::Upstream(format!("login poll: {e}")))?;

    let set_cookies: Vec<String> = response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok().map(str::to_string))
        .collect();

    let body = response
        .text()
        .await
        .map_err(|e| PluginError::Upstream(format!("login poll body: {e}")))?;

    if body.contains("二维码已失效") {
        return Ok(QrLogin::Expired);
    }
    if !body.contains("登录成功") {
        return Ok(QrLogin::Waiting);
    }

    let (ptsigx, uin) = extract_login_info(&body)?;
    let poll_cookies = set_cookies.join("; ");
    let cookie = fetch_full_cookie(client, &uin, &ptsigx, &poll_cookies).await?;

    Ok(QrLogin::Success {
        cookie,
        qq_masked: mask_qq(&uin),
    })
}

/// Parses `ptuiCB('0','0','<url>', …)` and pulls `ptsigx` and `uin` out of
/// the embedded URL.
fn extract_login_info(body: &str) -> PluginResult<(String, String)> {
    static CALLBACK: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"ptuiCB\('0','0','([^']+)'").unwrap());
    static PTSIGX: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"ptsigx=([A-Za-z0-9]+)").unwrap());
    static UIN: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"uin=(\d+)").unwrap());

    let url = CALLBACK
        .captures(body)
        .map(|captures| captures[1].to_string())
        .ok_or_else(|| PluginError::parse("ptuiCB callback not found"))?;
    let ptsigx = PTSIGX
        .captures(&url)
        .map(|captures| captures[1].to_string())
        .ok_or_else(|| PluginError::parse("ptsigx not found"))?;
    let uin = UIN
        .captures(&url)
        .map(|captures| captures[1].to_string())
        .ok_or_else(|| PluginError::parse("uin not found"))?;
    Ok((ptsigx, uin))
}

/// Follows the check_sig URL to accumulate the session cookies and composes
/// the final cookie string, forcing the `o0` uin form the search API needs.
async fn fetch_full_cookie(
    client: &reqwest::Client,
    uin: &str,
    ptsigx: &str,
    poll_cookies: &str,
) -> PluginResult<String> {
    let check_sig_url = format!(
        "https://ptlogin2.pd.qq.com/check_sig?pttype=1&uin={uin}&service=ptqrlogin&nodirect=1\
         &ptsigx={ptsigx}&s_url=https%3A%2F%2Fpd.qq.com%2Fexplore&f_url=&ptlang=2052\
         &ptredirect=101&aid=1600001587&daid=823&j_later=0&low_login_hour=0&regmaster=0\
         &pt_login_type=3&pt_aid=0&pt_aaid=16&pt_light=0&pt_3rd_aid=0"
    );

    let response = client
        .get(&check_sig_url)
        .header("Cookie", poll_cookies)
        .send()
        .await
        .map_err(|e| PluginError::Upstream(format!("check_sig: {e}")))?;

    let mut cookies = HashMap::new();
    for header in response.headers().get_all(reqwest::header::SET_COOKIE) {
        if let Some((name, value)) = header.to_str().ok().and_then(parse_set_cookie) {
            if !value.is_empty() {
                cookies.insert(name, value);
            }
        }
    }

    let needs_uin = cookies
        .get("uin")
        .map(|value| !value.starts_with('o'))
        .unwrap_or(true);
    if needs_uin {
        cookies.insert("uin".to_string(), format!("o0{uin}"));
    }

    debug!(keys = cookies.len(), "composed qq login cookie");
    Ok(join_cookies(&cookies))
}

/// Touches the upstream home page to rotate short-lived cookie fields,
/// merging any `Set-Cookie` answers into the existing cookie string.
pub async fn refresh_cookie(client: &reqwest::Client, cookie: &str) -> String {
    if cookie.is_empty() {
        return cookie.to_string();
    }
    let mut merged = parse_cookie_string(cookie);
    let uin = merged.get("uin").cloned().unwrap_or_default();

    let Ok(response) = client
        .get("https://pd.qq.com/explore")
        .header("Cookie", cookie)
        .send()
        .await
    else {
        return cookie.to_string();
    };

    let mut updated = false;
    for header in response.headers().get_all(reqwest::header::SET_COOKIE) {
        if let Some((name, value)) = header.to_str().ok().and_then(parse_set_cookie) {
            if !value.is_empty() {
                merged.insert(name, value);
                updated = true;
            }
        }
    }
    if !updated {
        return cookie.to_string();
    }

    // Keep the uin in the `o0` form whatever the refresh handed back.
    if merged
        .get("uin")
        .map(|value| !value.starts_with('o'))
        .unwrap_or(true)
    {
        let bare = uin.trim_start_matches("o0").trim_start_matches('o');
        if !bare.is_empty() {
            merged.insert("uin".to_string(), format!("o0{bare}"));
        }
    }

    join_cookies(&merged)
}

/// 31-bit fold of the QR signature, sent as `ptqrtoken`.
pub fn ptqr_token(qrsig: &str) -> String {
    let mut e: i64 = 0;
    for byte in qrsig.bytes() {
        e += (e << 5) + i64::from(byte);
    }
    format!("{}", 2147483647 & e)
}

/// 5381-seeded fold of `p_skey`, sent as the `bkn` URL parameter.
pub fn bkn(p_skey: &str) -> i64 {
    let mut t: i64 = 5381;
    for byte in p_skey.bytes() {
        t += (t << 5) + i64::from(byte);
    }
    t & 2147483647
}

/// Front-4/last-2 masking of an account id.
pub fn mask_qq(uin: &str) -> String {
    if uin.len() <= 4 {
        return uin.to_string();
    }
    if uin.len() > 6 {
        format!("{}****{}", &uin[..4], &uin[uin.len() - 2..])
    } else {
        format!("{}****{}", &uin[..2], &uin[uin.len() - 2..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ptqr_token_folds_as_documented() {
        // e_next = e + (e << 5) + byte, masked to 31 bits at the end.
        let mut expected: i64 = 0;
        for byte in "AbC".bytes() {
            expected += (expected << 5) + i64::from(byte);
        }
        assert_eq!(ptqr_token("AbC"), format!("{}", expected & 2147483647));
        // Deterministic.
        assert_eq!(ptqr_token("qrsig-value"), ptqr_token("qrsig-value"));
    }

    #[test]
    fn bkn_folds_from_5381() {
        assert_eq!(bkn(""), 5381);
        let mut expected: i64 = 5381;
        for byte in "pskey".bytes() {
            expected += (expected << 5) + i64::from(byte);
        }
        assert_eq!(bkn("pskey"), expected & 2147483647);
    }

    #[test]
    fn login_info_extraction() {
        let body = "ptuiCB('0','0','https://ptlogin2.pd.qq.com/check_sig?uin=123456789&ptsigx=abc123DEF','0','登录成功！', 'nick')";
        let (ptsigx, uin) = extract_login_info(body).unwrap();
        assert_eq!(ptsigx, "abc123DEF");
        assert_eq!(uin, "123456789");
    }

    #[test]
    fn qq_masking() {
        assert_eq!(mask_qq("123456789"), "1234****89");
        assert_eq!(mask_qq("123456"), "12****56");
        assert_eq!(mask_qq("123"), "123");
    }
}
