//! Cookie-string plumbing shared by the sub-services.
//!
//! Both sub-services manage upstream sessions as raw `"k=v; k2=v2"` cookie
//! strings (that is what gets persisted per user), so parsing, merging and
//! re-joining them lives here.

use std::collections::HashMap;

/// Cookie attribute names that must not be mistaken for cookies.
fn is_cookie_attribute(name: &str) -> bool {
    matches!(
        name,
        "Domain" | "Path" | "Expires" | "Max-Age" | "SameSite" | "Secure" | "HttpOnly"
    )
}

/// First `name=value` pair of a `Set-Cookie` header; `None` for attribute
/// noise.
pub fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let first = header.split(';').next()?.trim();
    let (name, value) = first.split_once('=')?;
    let name = name.trim();
    let value = value.trim();
    if name.is_empty() || is_cookie_attribute(name) {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

/// `"a=1; b=2"` → map, skipping attribute names and empty values.
pub fn parse_cookie_string(cookie: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for pair in cookie.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        if let Some((name, value)) = pair.split_once('=') {
            let name = name.trim();
            let value = value.trim();
            if !name.is_empty() && !value.is_empty() && !is_cookie_attribute(name) {
                cookies.insert(name.to_string(), value.to_string());
            }
        }
    }
    cookies
}

/// Map → `"a=1; b=2"`, sorted for deterministic output.
pub fn join_cookies(cookies: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    pairs.sort();
    pairs.join("; ")
}

/// Every `Set-Cookie` pair of a response, in header order.
pub fn set_cookies_of(response: &reqwest::Response) -> Vec<(String, String)> {
    response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(parse_set_cookie)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsing_skips_attributes() {
        let parsed = parse_cookie_string("uin=o0123; p_skey=xyz; Path=/; Secure");
        assert_eq!(parsed.get("uin").unwrap(), "o0123");
        assert_eq!(parsed.get("p_skey").unwrap(), "xyz");
        assert!(!parsed.contains_key("Path"));
        assert!(!parsed.contains_key("Secure"));
    }

    #[test]
    fn set_cookie_first_pair_only() {
        assert_eq!(
            parse_set_cookie("qrsig=AbCd; Path=/; Domain=qq.com"),
            Some(("qrsig".to_string(), "AbCd".to_string()))
        );
        assert_eq!(parse_set_cookie("Path=/"), None);
        assert_eq!(parse_set_cookie(""), None);
    }

    #[test]
    fn join_is_deterministic() {
        let mut cookies = HashMap::new();
        cookies.insert("b".to_string(), "2".to_string());
        cookies.insert("a".to_string(), "1".to_string());
        assert_eq!(join_cookies(&cookies), "a=1; b=2");
    }
}
