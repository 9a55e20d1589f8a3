//! Weibo sub-service.
//!
//! Multi-tenant proxy onto the Weibo profile-search API: each user binds
//! their own session by QR scan and maintains a list of target user ids;
//! searches walk each target's microblogs and mine share links from the
//! bodies, from `url_struct` long links, and — when a body carries nothing —
//! from the first hot comments, following the `sinaurl` redirector where
//! needed. The management page and JSON API are mounted at
//! `/weibo/{param}`.

mod login;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, warn};

use pansou_core::{extract_cloud_links, Ext, Link, PluginSearchResult, SearchResult};
use pansou_kernel::{BaseAsyncPlugin, KernelError, PluginError, PluginResult, SearchPlugin};
use pansou_transport::HttpClientConfig;

use crate::store::{
    is_identity_hash, principal_hash, CookieCipher, UserRecord, UserStatus, UserStore,
};

/// Most users searched per request.
const MAX_CONCURRENT_USERS: usize = 10;
/// Concurrent microblog processing bound (comment mining).
const MAX_CONCURRENT_WEIBO: usize = 30;
/// Comments mined per linkless microblog.
const MAX_COMMENTS: usize = 1;
/// Profile-search pages walked per target uid.
const MAX_PAGES: usize = 3;
/// QR PNG cache validity.
const QR_CACHE_TTL: Duration = Duration::from_secs(30);
/// Cookie touch cadence.
const COOKIE_REFRESH_AFTER: chrono::Duration = chrono::Duration::hours(1);
/// Session validity granted on login.
const LOGIN_VALID_DAYS: i64 = 30;

const PC_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const MOBILE_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 14_0 like Mac OS X) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148";

const PAGE_TEMPLATE: &str = include_str!("page.html");

/// One sub-service user, persisted as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub hash: String,
    #[serde(default)]
    pub cookie: String,
    #[serde(default)]
    pub status: UserStatus,
    /// Target Weibo user ids to search.
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub login_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_access_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_refresh: Option<DateTime<Utc>>,
}

impl UserRecord for User {
    fn hash(&self) -> &str {
        &self.hash
    }
    fn status(&self) -> UserStatus {
        self.status
    }
    fn set_status(&mut self, status: UserStatus) {
        self.status = status;
    }
    fn last_access_at(&self) -> DateTime<Utc> {
        self.last_access_at.unwrap_or_else(Utc::now)
    }
    fn cookie_mut(&mut self) -> &mut String {
        &mut self.cookie
    }
}

struct QrState {
    png: Vec<u8>,
    issued_at: Instant,
    qrid: String,
}

/// One target uid with the cookie of the owning user.
struct UserTask {
    uid: String,
    cookie: String,
}

struct WeiboState {
    salt: String,
    client: reqwest::Client,
    store: OnceCell<Arc<UserStore<User>>>,
    qr: DashMap<String, QrState>,
    workers: Arc<Semaphore>,
}

impl WeiboState {
    async fn store(&self) -> PluginResult<Arc<UserStore<User>>> {
        self.store
            .get_or_try_init(|| async {
                let cache_path =
                    std::env::var("CACHE_PATH").unwrap_or_else(|_| "./cache".to_string());
                let dir = std::path::Path::new(&cache_path).join("weibo_users");
                // The same optional cookie wrapping as the QQ service.
                let cipher = CookieCipher::from_key(
                    &std::env::var("QQPD_ENCRYPTION_KEY").unwrap_or_default(),
                );
                let store = Arc::new(
                    UserStore::open("weibo", dir, cipher)
                        .map_err(|e| PluginError::other(format!("user store: {e}")))?,
                );
                UserStore::spawn_sweeper(&store);
                Ok(store)
            })
            .await
            .cloned()
    }
}

pub struct WeiboPlugin {
    base: Arc<BaseAsyncPlugin>,
    state: Arc<WeiboState>,
}

impl WeiboPlugin {
    pub fn new() -> Result<Self, KernelError> {
        let client = HttpClientConfig::default()
            .with_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| KernelError::PluginConstruction {
                plugin: "weibo".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            base: Arc::new(BaseAsyncPlugin::builder_with_filter("weibo", 3, true).build()?),
            state: Arc::new(WeiboState {
                salt: std::env::var("WEIBO_HASH_SALT")
                    .unwrap_or_else(|_| "pansou_weibo_secret_2025".to_string()),
                client,
                store: OnceCell::new(),
                qr: DashMap::new(),
                workers: Arc::new(Semaphore::new(MAX_CONCURRENT_WEIBO)),
            }),
        })
    }
}

#[async_trait]
impl SearchPlugin for WeiboPlugin {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn priority(&self) -> i32 {
        self.base.priority()
    }

    /// The upstream search is already keyword-scoped; the aggregator must
    /// not filter again.
    fn skip_service_filter(&self) -> bool {
        self.base.skip_service_filter()
    }

    async fn initialize(&self) -> PluginResult<()> {
        self.state.store().await?;
        Ok(())
    }

    fn web_routes(&self) -> Option<Router> {
        let state = self.state.clone();
        Some(
            Router::new()
                .route("/weibo/{param}", get(handle_page).post(handle_action))
                .with_state(state),
        )
    }

    async fn search_with_result(
        &self,
        keyword: &str,
        _ext: &Ext,
    ) -> PluginResult<PluginSearchResult> {
        let store = self.state.store().await?;

        let mut users = active_users(&store);
        if users.is_empty() {
            return Ok(PluginSearchResult::empty());
        }
        users.sort_by_key(|user| std::cmp::Reverse(user.last_access_at()));
        users.truncate(MAX_CONCURRENT_USERS);

        let tasks = build_user_tasks(&self.state, &store, users).await;
        let results = execute_tasks(&self.state, tasks, keyword).await;

        Ok(PluginSearchResult {
            results,
            is_final: true,
            source: Some("plugin:weibo".to_string()),
        })
    }
}

fn active_users(store: &UserStore<User>) -> Vec<User> {
    let now = Utc::now();
    store
        .all()
        .into_iter()
        .filter(|user| {
            if user.status != UserStatus::Active {
                return false;
            }
            if let Some(expire_at) = user.expire_at {
                if now > expire_at {
                    let mut expired = user.clone();
                    expired.status = UserStatus::Expired;
                    expired.cookie.clear();
                    let _ = store.save(&expired);
                    return false;
                }
            }
            !user.user_ids.is_empty()
        })
        .collect()
}

/// Deduplicates target uids across users, assigns each to the least-loaded
/// owner, and touches cookies older than an hour.
async fn build_user_tasks(
    state: &WeiboState,
    store: &UserStore<User>,
    users: Vec<User>,
) -> Vec<UserTask> {
    let mut owners: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, user) in users.iter().enumerate() {
        for uid in &user.user_ids {
            owners.entry(uid.clone()).or_default().push(index);
        }
    }

    let mut users = users;
    let now = Utc::now();
    for user in users.iter_mut() {
        let stale = user
            .last_refresh
            .map(|at| now - at > COOKIE_REFRESH_AFTER)
            .unwrap_or(true);
        if stale && !user.cookie.is_empty() {
            let refreshed = login::refresh_cookie(&state.client, &user.cookie).await;
            if refreshed != user.cookie {
                user.cookie = refreshed;
            }
            user.last_refresh = Some(now);
            let _ = store.save(user);
        }
    }

    let mut tasks = Vec::new();
    let mut load: HashMap<usize, usize> = HashMap::new();
    for (uid, owner_indexes) in owners {
        let owner = owner_indexes
            .iter()
            .copied()
            .min_by_key(|index| load.get(index).copied().unwrap_or(0))
            .expect("owners are never empty");
        *load.entry(owner).or_insert(0) += 1;
        tasks.push(UserTask {
            uid,
            cookie: users[owner].cookie.clone(),
        });
    }
    tasks
}

async fn execute_tasks(
    state: &WeiboState,
    tasks: Vec<UserTask>,
    keyword: &str,
) -> Vec<SearchResult> {
    let searches = tasks.into_iter().map(|task| {
        let client = state.client.clone();
        let workers = state.workers.clone();
        let keyword = keyword.to_string();
        async move { search_user_weibo(&client, workers, &task.uid, &task.cookie, &keyword).await }
    });

    futures::future::join_all(searches)
        .await
        .into_iter()
        .flatten()
        .collect()
}

/// Walks one target's profile-search pages, mining links per microblog.
async fn search_user_weibo(
    client: &reqwest::Client,
    workers: Arc<Semaphore>,
    uid: &str,
    cookie: &str,
    keyword: &str,
) -> Vec<SearchResult> {
    let mut results = Vec::new();

    for page in 1..=MAX_PAGES {
        let response = client
            .get("https://weibo.com/ajax/profile/searchblog")
            .query(&[
                ("uid", uid),
                ("feature", "0"),
                ("q", keyword),
                ("page", &page.to_string()),
            ])
            .header("User-Agent", PC_UA)
            .header("Referer", "https://weibo.com/")
            .header("Cookie", cookie)
            .send()
            .await;

        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(uid, status = %response.status(), "weibo search rejected");
                return results;
            }
            Err(e) => {
                debug!(uid, error = %e, "weibo search failed");
                return results;
            }
        };

        let Ok(body) = response.json::<serde_json::Value>().await else {
            return results;
        };

        // `ok` arrives as a number, string or bool depending on endpoint.
        let ok = body
            .get("ok")
            .map(|value| matches!(value.to_string().trim_matches('"'), "1" | "true"))
            .unwrap_or(false);
        if !ok {
            debug!(uid, msg = ?body.get("msg"), "weibo api declined");
            break;
        }

        let Some(list) = body.pointer("/data/list").and_then(|list| list.as_array()) else {
            break;
        };
        if list.is_empty() {
            break;
        }

        let mined = futures::future::join_all(list.iter().map(|blog| {
            let client = client.clone();
            let workers = workers.clone();
            let cookie = cookie.to_string();
            async move {
                let _permit = workers.acquire_owned().await.ok()?;
                process_microblog(&client, &cookie, uid, blog).await
            }
        }))
        .await;
        results.extend(mined.into_iter().flatten());

        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    debug!(uid, count = results.len(), "weibo user search done");
    results
}

/// One microblog → canonical result, mining comments when the body carries
/// no share link.
async fn process_microblog(
    client: &reqwest::Client,
    cookie: &str,
    uid: &str,
    blog: &serde_json::Value,
) -> Option<SearchResult> {
    let mut result = parse_microblog(client, uid, blog).await;

    if result.links.is_empty() {
        if let Some(weibo_id) = microblog_id(blog) {
            for comment in get_comments(client, cookie, &weibo_id, MAX_COMMENTS).await {
                result
                    .links
                    .extend(extract_cloud_links(&comment.text, result.datetime));
                for decoded in comment.urls {
                    let direct = extract_cloud_links(&decoded, result.datetime);
                    if direct.is_empty() {
                        result
                            .links
                            .extend(fetch_page_links(client, &decoded, result.datetime).await);
                    } else {
                        result.links.extend(direct);
                    }
                }
            }
        }
    }

    dedupe_links(&mut result.links);
    (!result.links.is_empty()).then_some(result)
}

async fn parse_microblog(
    client: &reqwest::Client,
    uid: &str,
    blog: &serde_json::Value,
) -> SearchResult {
    let raw_text = blog
        .get("text_raw")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .or_else(|| blog.get("text").and_then(|t| t.as_str()))
        .unwrap_or("");
    let text = clean_html(raw_text);

    let datetime = blog
        .get("created_at")
        .and_then(|t| t.as_str())
        .and_then(parse_weibo_time);

    let mut links = extract_cloud_links(&text, datetime);

    // `url_struct` carries every external link, already expanded by the
    // API; classify directly, or fetch the destination once.
    if let Some(url_struct) = blog.get("url_struct").and_then(|u| u.as_array()) {
        for entry in url_struct {
            if entry.get("url_title").and_then(|t| t.as_str()) != Some("网页链接") {
                continue;
            }
            let Some(long_url) = entry
                .get("long_url")
                .and_then(|u| u.as_str())
                .filter(|u| !u.is_empty())
            else {
                continue;
            };
            let direct = extract_cloud_links(long_url, datetime);
            if direct.is_empty() {
                links.extend(fetch_page_links(client, long_url, datetime).await);
            } else {
                links.extend(direct);
            }
        }
    }

    let title: String = if text.chars().count() > 100 {
        let prefix: String = text.chars().take(100).collect();
        format!("{prefix}...")
    } else {
        text.clone()
    };

    let id = microblog_id(blog).unwrap_or_default();

    SearchResult {
        unique_id: format!("weibo-{uid}-{id}"),
        channel: String::new(),
        datetime,
        title,
        content: text,
        links,
        ..Default::default()
    }
}

fn microblog_id(blog: &serde_json::Value) -> Option<String> {
    if let Some(idstr) = blog.get("idstr").and_then(|id| id.as_str()) {
        return Some(idstr.to_string());
    }
    match blog.get("id") {
        Some(serde_json::Value::String(id)) => Some(id.clone()),
        Some(serde_json::Value::Number(id)) => Some(id.to_string()),
        _ => None,
    }
}

struct Comment {
    text: String,
    urls: Vec<String>,
}

/// Hot-flow comments of one microblog, paged by `max_id`, capped at `max`.
async fn get_comments(
    client: &reqwest::Client,
    cookie: &str,
    weibo_id: &str,
    max: usize,
) -> Vec<Comment> {
    let mut comments = Vec::new();
    let mut max_id: i64 = 0;
    let mut max_id_type: i64 = 0;

    while comments.len() < max {
        let response = client
            .get("https://m.weibo.cn/comments/hotflow")
            .query(&[
                ("id", weibo_id),
                ("mid", weibo_id),
                ("max_id", &max_id.to_string()),
                ("max_id_type", &max_id_type.to_string()),
            ])
            .header("User-Agent", MOBILE_UA)
            .header("Referer", "https://m.weibo.cn/")
            .header("Cookie", cookie)
            .send()
            .await;

        let Ok(response) = response else { break };
        if !response.status().is_success() {
            break;
        }
        let Ok(body) = response.json::<serde_json::Value>().await else {
            break;
        };
        let Some(data) = body.get("data") else { break };
        let Some(list) = data.get("data").and_then(|list| list.as_array()) else {
            break;
        };
        if list.is_empty() {
            break;
        }

        for item in list {
            let raw = item.get("text").and_then(|t| t.as_str()).unwrap_or("");
            comments.push(Comment {
                text: clean_html(raw),
                urls: extract_redirector_urls(raw),
            });
            if comments.len() >= max {
                break;
            }
        }

        let next_max_id = data.get("max_id").and_then(|id| id.as_i64()).unwrap_or(0);
        if next_max_id == 0 || next_max_id == max_id {
            break;
        }
        max_id = next_max_id;
        max_id_type = data
            .get("max_id_type")
            .and_then(|t| t.as_i64())
            .unwrap_or(0);

        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    comments
}

/// Decodes `sinaurl?u=` redirector targets embedded in comment markup.
fn extract_redirector_urls(html: &str) -> Vec<String> {
    static SINAURL: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r#"https://weibo\.cn/sinaurl\?u=([^"&\s]+)"#).unwrap()
    });

    SINAURL
        .captures_iter(html)
        .filter_map(|captures| {
            urlencoding::decode(&captures[1])
                .ok()
                .map(|decoded| decoded.into_owned())
        })
        .collect()
}

/// Fetches a non-provider destination once and mines its page for links.
async fn fetch_page_links(
    client: &reqwest::Client,
    url: &str,
    datetime: Option<DateTime<Utc>>,
) -> Vec<Link> {
    let response = client
        .get(url)
        .header("User-Agent", PC_UA)
        .timeout(Duration::from_secs(15))
        .send()
        .await;

    let Ok(response) = response else {
        return Vec::new();
    };
    if !response.status().is_success() {
        return Vec::new();
    }
    let Ok(body) = response.text().await else {
        return Vec::new();
    };
    extract_cloud_links(&body, datetime)
}

fn dedupe_links(links: &mut Vec<Link>) {
    let mut seen = std::collections::HashSet::new();
    links.retain(|link| seen.insert(link.url.clone()));
}

/// Weibo's RFC1123-ish `created_at`, e.g. `Mon Jan 02 15:04:05 +0800 2006`.
fn parse_weibo_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%a %b %d %H:%M:%S %z %Y")
        .ok()
        .map(|fixed| fixed.with_timezone(&Utc))
}

fn clean_html(html: &str) -> String {
    static TAGS: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"<[^>]+>").unwrap());
    static SPACES: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"\s+").unwrap());
    let stripped = TAGS.replace_all(html, "");
    SPACES.replace_all(stripped.trim(), " ").to_string()
}

// =============================================================================
// Web handlers
// =============================================================================

async fn handle_page(
    State(state): State<Arc<WeiboState>>,
    Path(param): Path<String>,
) -> axum::response::Response {
    if is_identity_hash(&param) {
        Html(PAGE_TEMPLATE.replace("HASH_PLACEHOLDER", &param)).into_response()
    } else {
        let location = format!("/weibo/{}", principal_hash(&param, &state.salt));
        (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
    }
}

async fn handle_action(
    State(state): State<Arc<WeiboState>>,
    Path(hash): Path<String>,
    body: Option<Json<serde_json::Value>>,
) -> Json<serde_json::Value> {
    let Some(Json(request)) = body else {
        return respond_error("无效的请求格式");
    };
    let Some(action) = request.get("action").and_then(|a| a.as_str()) else {
        return respond_error("缺少action字段");
    };

    let store = match state.store().await {
        Ok(store) => store,
        Err(e) => return respond_error(&format!("存储不可用: {e}")),
    };

    match action {
        "get_status" => handle_get_status(&state, &store, &hash).await,
        "refresh_qrcode" => handle_refresh_qrcode(&state, &store, &hash).await,
        "check_login" => handle_check_login(&state, &store, &hash).await,
        "logout" => handle_logout(&store, &hash),
        "set_user_ids" => handle_set_user_ids(&store, &hash, &request),
        "test_search" => handle_test_search(&state, &store, &hash, &request).await,
        other => respond_error(&format!("未知的操作类型: {other}")),
    }
}

async fn handle_get_status(
    state: &WeiboState,
    store: &UserStore<User>,
    hash: &str,
) -> Json<serde_json::Value> {
    let now = Utc::now();
    let mut user = store.get(hash).unwrap_or_else(|| User {
        hash: hash.to_string(),
        status: UserStatus::Pending,
        created_at: Some(now),
        ..Default::default()
    });
    user.last_access_at = Some(now);
    let _ = store.save(&user);

    let logged_in = user.status == UserStatus::Active && !user.cookie.is_empty();

    let mut qrcode_base64 = String::new();
    if !logged_in {
        qrcode_base64 = cached_or_fresh_qr(state, hash).await;
    }

    let expires_in_days = user
        .expire_at
        .map(|at| ((at - now).num_hours() / 24).max(0))
        .unwrap_or(0);

    respond_success(
        "获取成功",
        json!({
            "hash": hash,
            "logged_in": logged_in,
            "status": match user.status {
                UserStatus::Pending => "pending",
                UserStatus::Active => "active",
                UserStatus::Expired => "expired",
            },
            "login_time": format_time(user.login_at),
            "expire_time": format_time(user.expire_at),
            "expires_in_days": expires_in_days,
            "user_ids": user.user_ids,
            "qrcode_base64": qrcode_base64,
        }),
    )
}

async fn cached_or_fresh_qr(state: &WeiboState, hash: &str) -> String {
    if let Some(qr) = state.qr.get(hash) {
        if qr.issued_at.elapsed() < QR_CACHE_TTL {
            return format!("data:image/png;base64,{}", BASE64.encode(&qr.png));
        }
    }
    match login::generate_qr(&state.client).await {
        Ok((png, qrid)) => {
            let encoded = format!("data:image/png;base64,{}", BASE64.encode(&png));
            state.qr.insert(
                hash.to_string(),
                QrState {
                    png,
                    issued_at: Instant::now(),
                    qrid,
                },
            );
            encoded
        }
        Err(e) => {
            warn!(error = %e, "weibo qr generation failed");
            String::new()
        }
    }
}

async fn handle_refresh_qrcode(
    state: &WeiboState,
    store: &UserStore<User>,
    hash: &str,
) -> Json<serde_json::Value> {
    if store.get(hash).is_none() {
        return respond_error("用户不存在");
    }
    match login::generate_qr(&state.client).await {
        Ok((png, qrid)) => {
            let encoded = format!("data:image/png;base64,{}", BASE64.encode(&png));
            state.qr.insert(
                hash.to_string(),
                QrState {
                    png,
                    issued_at: Instant::now(),
                    qrid,
                },
            );
            respond_success("二维码已刷新", json!({ "qrcode_base64": encoded }))
        }
        Err(e) => respond_error(&format!("生成二维码失败: {e}")),
    }
}

async fn handle_check_login(
    state: &WeiboState,
    store: &UserStore<User>,
    hash: &str,
) -> Json<serde_json::Value> {
    let Some(mut user) = store.get(hash) else {
        return respond_error("用户不存在");
    };
    let Some(qrid) = state.qr.get(hash).map(|qr| qr.qrid.clone()) else {
        return respond_error("请先刷新二维码");
    };

    match login::check_qr_login(&state.client, &qrid).await {
        Ok(login::QrLogin::Success { cookie }) => {
            let now = Utc::now();
            user.cookie = cookie;
            user.status = UserStatus::Active;
            user.login_at = Some(now);
            user.expire_at = Some(now + chrono::Duration::days(LOGIN_VALID_DAYS));
            user.last_refresh = Some(now);
            state.qr.remove(hash);
            if let Err(e) = store.save(&user) {
                return respond_error(&format!("保存失败: {e}"));
            }
            respond_success("登录成功", json!({ "login_status": "success" }))
        }
        Ok(login::QrLogin::Scanned) | Ok(login::QrLogin::Waiting) => {
            respond_success("等待扫码", json!({ "login_status": "waiting" }))
        }
        Ok(login::QrLogin::Expired) => respond_error("二维码已失效，请刷新"),
        Err(e) => respond_error(&e.to_string()),
    }
}

fn handle_logout(store: &UserStore<User>, hash: &str) -> Json<serde_json::Value> {
    let Some(mut user) = store.get(hash) else {
        return respond_error("用户不存在");
    };
    user.cookie.clear();
    user.status = UserStatus::Pending;
    if store.save(&user).is_err() {
        return respond_error("退出失败");
    }
    respond_success("已退出登录", json!({ "status": "pending" }))
}

fn handle_set_user_ids(
    store: &UserStore<User>,
    hash: &str,
    request: &serde_json::Value,
) -> Json<serde_json::Value> {
    let Some(raw_ids) = request.get("user_ids").and_then(|ids| ids.as_array()) else {
        return respond_error("缺少user_ids字段");
    };
    let Some(mut user) = store.get(hash) else {
        return respond_error("用户不存在");
    };

    let mut normalized = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for uid in raw_ids.iter().filter_map(|uid| uid.as_str()) {
        let uid = uid.trim();
        if uid.is_empty() {
            continue;
        }
        if seen.insert(uid.to_string()) {
            normalized.push(uid.to_string());
        }
    }

    user.user_ids = normalized.clone();
    user.last_access_at = Some(Utc::now());
    if let Err(e) = store.save(&user) {
        return respond_error(&format!("保存失败: {e}"));
    }

    respond_success(
        "用户列表已更新",
        json!({ "user_ids": normalized, "user_count": normalized.len() }),
    )
}

async fn handle_test_search(
    state: &WeiboState,
    store: &UserStore<User>,
    hash: &str,
    request: &serde_json::Value,
) -> Json<serde_json::Value> {
    let Some(keyword) = request.get("keyword").and_then(|k| k.as_str()).filter(|k| !k.is_empty())
    else {
        return respond_error("缺少keyword字段");
    };
    let Some(user) = store.get(hash) else {
        return respond_error("请先登录");
    };
    if user.cookie.is_empty() {
        return respond_error("请先登录");
    }
    if user.user_ids.is_empty() {
        return respond_error("请先配置微博用户ID");
    }

    let tasks: Vec<UserTask> = user
        .user_ids
        .iter()
        .map(|uid| UserTask {
            uid: uid.clone(),
            cookie: user.cookie.clone(),
        })
        .collect();
    let mut results = execute_tasks(state, tasks, keyword).await;
    results.truncate(10);

    let rendered: Vec<serde_json::Value> = results
        .iter()
        .map(|result| {
            json!({
                "unique_id": result.unique_id,
                "title": result.title,
                "links": result.links.iter().map(|link| json!({
                    "type": link.kind.as_str(),
                    "url": link.url,
                    "password": link.password,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();

    respond_success(
        &format!("找到 {} 条结果", rendered.len()),
        json!({
            "keyword": keyword,
            "total_results": rendered.len(),
            "results": rendered,
        }),
    )
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn respond_success(message: &str, data: serde_json::Value) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "message": message, "data": data }))
}

fn respond_error(message: &str) -> Json<serde_json::Value> {
    Json(json!({ "success": false, "message": message, "data": null }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weibo_time_parses() {
        let parsed = parse_weibo_time("Mon Jul 01 12:30:45 +0800 2024").unwrap();
        use chrono::Timelike;
        assert_eq!(parsed.hour(), 4); // 12:30 at +08:00 is 04:30 UTC
        assert!(parse_weibo_time("not a time").is_none());
    }

    #[test]
    fn redirector_urls_are_decoded() {
        let html = r#"看评论 <a href="https://weibo.cn/sinaurl?u=https%3A%2F%2Fpan.quark.cn%2Fs%2Fabcd">链接</a>"#;
        let urls = extract_redirector_urls(html);
        assert_eq!(urls, vec!["https://pan.quark.cn/s/abcd"]);
    }

    #[test]
    fn html_cleaning_collapses_whitespace() {
        assert_eq!(
            clean_html("<span>阿凡达</span>  资源\n<a href='#'>链接</a>"),
            "阿凡达 资源 链接"
        );
    }

    #[test]
    fn microblog_id_handles_shapes() {
        assert_eq!(
            microblog_id(&json!({"idstr": "4987654321"})),
            Some("4987654321".to_string())
        );
        assert_eq!(
            microblog_id(&json!({"id": 4987654321i64})),
            Some("4987654321".to_string())
        );
        assert_eq!(microblog_id(&json!({})), None);
    }

    #[tokio::test]
    async fn microblog_parsing_mines_body_links() {
        let client = reqwest::Client::new();
        let blog = json!({
            "idstr": "100200300",
            "text_raw": "新资源 https://pan.baidu.com/s/1abc?pwd=x1y2 自取",
            "created_at": "Mon Jul 01 12:30:45 +0800 2024",
        });
        let result = parse_microblog(&client, "777", &blog).await;
        assert_eq!(result.unique_id, "weibo-777-100200300");
        assert_eq!(result.links.len(), 1);
        assert_eq!(result.links[0].password, "x1y2");
        assert!(result.datetime.is_some());
        assert!(result.channel.is_empty());
    }

    #[tokio::test]
    async fn long_text_title_is_truncated() {
        let client = reqwest::Client::new();
        let long_text = format!("{} https://pan.quark.cn/s/abcd", "资".repeat(150));
        let blog = json!({
            "idstr": "1",
            "text_raw": long_text,
            "created_at": "Mon Jul 01 12:30:45 +0800 2024",
        });
        let result = parse_microblog(&client, "u", &blog).await;
        assert!(result.title.ends_with("..."));
        assert_eq!(result.title.chars().count(), 103);
    }
}
