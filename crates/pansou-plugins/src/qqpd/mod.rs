//! QQ-channel sub-service.
//!
//! A multi-tenant proxy onto the closed in-guild search API: every user
//! binds their own QQ session by QR scan, maintains a channel list, and the
//! aggregator searches those channels with the user's cookie. Per-user
//! state lives in `<cache_path>/qqpd_users/<sha256(qq ∥ salt)>.json`; the
//! management page and JSON API are mounted at `/qqpd/{param}`.

mod login;

pub use login::{bkn, ptqr_token};

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

use pansou_core::{extract_cloud_links, Ext, PluginSearchResult, SearchResult};
use pansou_kernel::{BaseAsyncPlugin, KernelError, PluginError, PluginResult, SearchPlugin};
use pansou_transport::HttpClientConfig;

use crate::store::{
    is_identity_hash, principal_hash, CookieCipher, UserRecord, UserStatus, UserStore,
};

/// Most users searched per request, most recently active first.
const MAX_CONCURRENT_USERS: usize = 10;
/// Concurrent channel fan-out bound.
const MAX_CONCURRENT_CHANNELS: usize = 50;
/// QR PNG cache validity.
const QR_CACHE_TTL: Duration = Duration::from_secs(30);
/// Cookie touch cadence.
const COOKIE_REFRESH_AFTER: chrono::Duration = chrono::Duration::hours(1);
/// Session validity granted on login.
const LOGIN_VALID_DAYS: i64 = 2;

const PAGE_TEMPLATE: &str = include_str!("page.html");

/// One sub-service user, persisted as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub hash: String,
    #[serde(default)]
    pub qq_masked: String,
    #[serde(default)]
    pub cookie: String,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default)]
    pub channels: Vec<String>,
    /// Channel slug → resolved guild id, cached on disk.
    #[serde(default)]
    pub channel_guild_ids: HashMap<String, String>,
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

/// Volatile (never persisted) QR state per user.
struct QrState {
    png: Vec<u8>,
    issued_at: Instant,
    qrsig: String,
}

/// One channel search unit after user/channel load balancing.
struct ChannelTask {
    channel_id: String,
    guild_id: String,
    cookie: String,
}

struct QqpdState {
    salt: String,
    client: reqwest::Client,
    store: OnceCell<Arc<UserStore<User>>>,
    qr: DashMap<String, QrState>,
    /// Process-wide slug → guild-id cache with per-slug single-flight.
    guilds: DashMap<String, String>,
    guild_flights: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    workers: Arc<Semaphore>,
}

impl QqpdState {
    async fn store(&self) -> PluginResult<Arc<UserStore<User>>> {
        self.store
            .get_or_try_init(|| async {
                let cache_path =
                    std::env::var("CACHE_PATH").unwrap_or_else(|_| "./cache".to_string());
                let dir = std::path::Path::new(&cache_path).join("qqpd_users");
                let cipher = CookieCipher::from_key(
                    &std::env::var("QQPD_ENCRYPTION_KEY").unwrap_or_default(),
                );
                let store = Arc::new(
                    UserStore::open("qqpd", dir, cipher)
                        .map_err(|e| PluginError::other(format!("user store: {e}")))?,
                );
                UserStore::spawn_sweeper(&store);
                Ok(store)
            })
            .await
            .cloned()
    }

    /// Channel slug → guild id. Numeric slugs are already guild ids; others
    /// are resolved once by scraping the public channel page, concurrent
    /// callers sharing one upstream fetch.
    async fn resolve_guild(&self, slug: &str) -> String {
        if slug.chars().all(|c| c.is_ascii_digit()) {
            return slug.to_string();
        }
        if let Some(cached) = self.guilds.get(slug) {
            return cached.clone();
        }

        let flight = self
            .guild_flights
            .entry(slug.to_string())
            .or_default()
            .clone();
        let _guard = flight.lock().await;
        if let Some(cached) = self.guilds.get(slug) {
            return cached.clone();
        }

        let resolved = self.fetch_guild_id(slug).await;
        if let Some(guild_id) = &resolved {
            self.guilds.insert(slug.to_string(), guild_id.clone());
        }
        resolved.unwrap_or_else(|| slug.to_string())
    }

    async fn fetch_guild_id(&self, slug: &str) -> Option<String> {
        static CDN_PATH: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
            regex::Regex::new(r"https://groupprohead\.gtimg\.cn/(\d+)/").unwrap()
        });

        let url = format!("https://pd.qq.com/g/{slug}");
        let body = self.client.get(&url).send().await.ok()?.text().await.ok()?;
        let guild_id = CDN_PATH.captures(&body).map(|captures| captures[1].to_string());
        if guild_id.is_none() {
            debug!(slug, "guild id not found on channel page");
        }
        guild_id
    }
}

pub struct QqpdPlugin {
    base: Arc<BaseAsyncPlugin>,
    state: Arc<QqpdState>,
}

impl QqpdPlugin {
    pub fn new() -> Result<Self, KernelError> {
        let client = HttpClientConfig::default()
            .with_timeout(Duration::from_secs(15))
            .with_accept_invalid_certs(true)
            .build()
            .map_err(|e| KernelError::PluginConstruction {
                plugin: "qqpd".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            base: Arc::new(BaseAsyncPlugin::builder("qqpd", 3).build()?),
            state: Arc::new(QqpdState {
                salt: std::env::var("QQPD_HASH_SALT")
                    .unwrap_or_else(|_| "pansou_qqpd_secret_2025".to_string()),
                client,
                store: OnceCell::new(),
                qr: DashMap::new(),
                guilds: DashMap::new(),
                guild_flights: DashMap::new(),
                workers: Arc::new(Semaphore::new(MAX_CONCURRENT_CHANNELS)),
            }),
        })
    }
}

#[async_trait]
impl SearchPlugin for QqpdPlugin {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn priority(&self) -> i32 {
        self.base.priority()
    }

    async fn initialize(&self) -> PluginResult<()> {
        self.state.store().await?;
        Ok(())
    }

    fn web_routes(&self) -> Option<Router> {
        let state = self.state.clone();
        Some(
            Router::new()
                .route("/qqpd/{param}", get(handle_page).post(handle_action))
                .with_state(state),
        )
    }

    /// Fans the keyword out over every active user's channels. Always
    /// final: the sub-service has no meaningful background refresh.
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

        let tasks = self.build_channel_tasks(&store, users).await;
        let results = self.execute_tasks(tasks, keyword).await;

        Ok(PluginSearchResult::finalized(results))
    }
}

/// Users that are active, unexpired and have channels configured. Expired
/// sessions are downgraded (and their cookies wiped) on the way.
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
            !user.channels.is_empty()
        })
        .collect()
}

impl QqpdPlugin {
    /// Deduplicates channels across users and assigns each to the
    /// least-loaded owning user, refreshing cookies that have gone stale.
    async fn build_channel_tasks(
        &self,
        store: &UserStore<User>,
        users: Vec<User>,
    ) -> Vec<ChannelTask> {
        let mut owners: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, user) in users.iter().enumerate() {
            for channel in &user.channels {
                owners.entry(channel.clone()).or_default().push(index);
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
                let refreshed = login::refresh_cookie(&self.state.client, &user.cookie).await;
                if refreshed != user.cookie {
                    user.cookie = refreshed;
                }
                user.last_refresh = Some(now);
                let _ = store.save(user);
            }
        }

        let mut tasks = Vec::new();
        let mut load: HashMap<usize, usize> = HashMap::new();

        for (channel, owner_indexes) in owners {
            let owner = owner_indexes
                .iter()
                .copied()
                .min_by_key(|index| load.get(index).copied().unwrap_or(0))
                .expect("owners are never empty");
            *load.entry(owner).or_insert(0) += 1;

            let user = &users[owner];
            let guild_id = match user.channel_guild_ids.get(&channel) {
                Some(cached) => cached.clone(),
                None => self.state.resolve_guild(&channel).await,
            };

            tasks.push(ChannelTask {
                channel_id: channel,
                guild_id,
                cookie: user.cookie.clone(),
            });
        }

        tasks
    }

    /// Runs every channel task under the fan-out semaphore.
    async fn execute_tasks(&self, tasks: Vec<ChannelTask>, keyword: &str) -> Vec<SearchResult> {
        let searches = tasks.into_iter().map(|task| {
            let client = self.state.client.clone();
            let workers = self.state.workers.clone();
            let keyword = keyword.to_string();
            async move {
                let _permit = workers.acquire_owned().await.ok()?;
                Some(search_single_channel(&client, &keyword, &task).await)
            }
        });

        futures::future::join_all(searches)
            .await
            .into_iter()
            .flatten()
            .flatten()
            .collect()
    }
}

/// One call to the in-guild search API with one user's cookie.
async fn search_single_channel(
    client: &reqwest::Client,
    keyword: &str,
    task: &ChannelTask,
) -> Vec<SearchResult> {
    let cookies = crate::cookies::parse_cookie_string(&task.cookie);
    let Some(p_skey) = cookies.get("p_skey") else {
        // No p_skey, no bkn: this user cannot search.
        warn!(channel = %task.channel_id, "cookie lacks p_skey, skipping channel");
        return Vec::new();
    };

    let api_url = format!(
        "https://pd.qq.com/qunng/guild/gotrpc/auth/trpc.group_pro.in_guild_search_svr.InGuildSearch/NewSearch?bkn={}",
        bkn(p_skey)
    );
    let payload = json!({
        "guild_id": task.guild_id,
        "query": keyword,
        "cookie": "",
        "member_cookie": "",
        "search_type": { "type": 0, "feed_type": 0 },
        "cond": { "channel_ids": [], "feed_rank_type": 0, "type_list": [2, 3] },
    });

    let response = client
        .post(&api_url)
        .json(&payload)
        .header("x-oidb", r#"{"uint32_command":"0x9287","uint32_service_type":"2"}"#)
        .header("Referer", "https://pd.qq.com/")
        .header("Origin", "https://pd.qq.com")
        .header("Cookie", task.cookie.clone())
        .send()
        .await;

    let response = match response {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            debug!(channel = %task.channel_id, status = %response.status(), "guild search rejected");
            return Vec::new();
        }
        Err(e) => {
            debug!(channel = %task.channel_id, error = %e, "guild search failed");
            return Vec::new();
        }
    };

    let Ok(body) = response.json::<serde_json::Value>().await else {
        return Vec::new();
    };
    let Some(feeds) = body
        .pointer("/data/union_result/guild_feeds")
        .and_then(|value| value.as_array())
    else {
        return Vec::new();
    };

    feeds
        .iter()
        .enumerate()
        .filter_map(|(index, feed)| extract_feed(feed, &task.channel_id, index))
        .collect()
}

/// One guild feed → canonical result, or `None` when it carries nothing.
fn extract_feed(feed: &serde_json::Value, channel_id: &str, index: usize) -> Option<SearchResult> {
    let mut title = feed.get("title").and_then(|t| t.as_str()).unwrap_or("");
    if let Some(stripped) = title.strip_prefix("名称：") {
        title = stripped;
    }
    let title = title.lines().next().unwrap_or("").trim().to_string();

    let content = feed
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    let datetime = feed
        .get("create_time")
        .and_then(|t| t.as_str())
        .and_then(|raw| raw.parse::<i64>().ok())
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));

    let links = extract_cloud_links(&content, datetime);
    if title.is_empty() || links.is_empty() {
        return None;
    }

    let images: Vec<String> = feed
        .get("images")
        .and_then(|images| images.as_array())
        .map(|images| {
            images
                .iter()
                .filter_map(|image| image.get("url").and_then(|u| u.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(SearchResult {
        unique_id: format!("qqpd-{channel_id}-{index}"),
        title,
        content,
        links,
        datetime,
        images: (!images.is_empty()).then_some(images),
        channel: String::new(),
        ..Default::default()
    })
}

// =============================================================================
// Web handlers
// =============================================================================

async fn handle_page(
    State(state): State<Arc<QqpdState>>,
    Path(param): Path<String>,
) -> axum::response::Response {
    if is_identity_hash(&param) {
        Html(PAGE_TEMPLATE.replace("HASH_PLACEHOLDER", &param)).into_response()
    } else {
        // A raw principal id 302-redirects to its stable hashed path.
        let location = format!("/qqpd/{}", principal_hash(&param, &state.salt));
        (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
    }
}

async fn handle_action(
    State(state): State<Arc<QqpdState>>,
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
        "set_channels" => handle_set_channels(&state, &store, &hash, &request).await,
        "test_search" => handle_test_search(&state, &store, &hash, &request).await,
        "manual_login" => handle_manual_login(&state, &store, &hash, &request).await,
        other => respond_error(&format!("未知的操作类型: {other}")),
    }
}

async fn handle_get_status(
    state: &QqpdState,
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

    let mut logged_in = false;
    if user.status == UserStatus::Active && !user.cookie.is_empty() {
        logged_in = true;
    } else if user.status == UserStatus::Active {
        // Active without a cookie is inconsistent; reset.
        user.status = UserStatus::Pending;
        user.qq_masked.clear();
    }
    let _ = store.save(&user);

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
            "status": status_str(user.status),
            "qq_masked": user.qq_masked,
            "login_time": format_time(user.login_at),
            "expire_time": format_time(user.expire_at),
            "expires_in_days": expires_in_days,
            "channels": user.channels,
            "channel_count": user.channels.len(),
            "qrcode_base64": qrcode_base64,
        }),
    )
}

/// The cached QR while it is under 30 s old, otherwise a fresh one.
async fn cached_or_fresh_qr(state: &QqpdState, hash: &str) -> String {
    if let Some(qr) = state.qr.get(hash) {
        if qr.issued_at.elapsed() < QR_CACHE_TTL {
            return format!("data:image/png;base64,{}", BASE64.encode(&qr.png));
        }
    }

    match login::generate_qr(&state.client).await {
        Ok((png, qrsig)) => {
            let encoded = format!("data:image/png;base64,{}", BASE64.encode(&png));
            state.qr.insert(
                hash.to_string(),
                QrState {
                    png,
                    issued_at: Instant::now(),
                    qrsig,
                },
            );
            encoded
        }
        Err(e) => {
            warn!(error = %e, "qr generation failed");
            String::new()
        }
    }
}

async fn handle_refresh_qrcode(
    state: &QqpdState,
    store: &UserStore<User>,
    hash: &str,
) -> Json<serde_json::Value> {
    if store.get(hash).is_none() {
        return respond_error("用户不存在");
    }
    match login::generate_qr(&state.client).await {
        Ok((png, qrsig)) => {
            let encoded = format!("data:image/png;base64,{}", BASE64.encode(&png));
            state.qr.insert(
                hash.to_string(),
                QrState {
                    png,
                    issued_at: Instant::now(),
                    qrsig,
                },
            );
            respond_success("二维码已刷新", json!({ "qrcode_base64": encoded }))
        }
        Err(e) => respond_error(&format!("生成二维码失败: {e}")),
    }
}

async fn handle_check_login(
    state: &QqpdState,
    store: &UserStore<User>,
    hash: &str,
) -> Json<serde_json::Value> {
    let Some(mut user) = store.get(hash) else {
        return respond_error("用户不存在");
    };
    let Some(qrsig) = state.qr.get(hash).map(|qr| qr.qrsig.clone()) else {
        return respond_error("请先刷新二维码");
    };
    if qrsig.is_empty() {
        return respond_error("请先刷新二维码");
    }

    match login::check_qr_login(&state.client, &qrsig).await {
        Ok(login::QrLogin::Success { cookie, qq_masked }) => {
            let now = Utc::now();
            user.cookie = cookie;
            user.status = UserStatus::Active;
            user.qq_masked = qq_masked.clone();
            user.login_at = Some(now);
            user.expire_at = Some(now + chrono::Duration::days(LOGIN_VALID_DAYS));
            user.last_refresh = Some(now);
            state.qr.remove(hash);
            if let Err(e) = store.save(&user) {
                return respond_error(&format!("保存失败: {e}"));
            }
            respond_success(
                "登录成功",
                json!({ "login_status": "success", "qq_masked": qq_masked }),
            )
        }
        Ok(login::QrLogin::Waiting) => {
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
    user.qq_masked.clear();
    user.status = UserStatus::Pending;
    if store.save(&user).is_err() {
        return respond_error("退出失败");
    }
    respond_success("已退出登录", json!({ "status": "pending" }))
}

async fn handle_set_channels(
    state: &QqpdState,
    store: &UserStore<User>,
    hash: &str,
    request: &serde_json::Value,
) -> Json<serde_json::Value> {
    let Some(raw_channels) = request.get("channels").and_then(|c| c.as_array()) else {
        return respond_error("缺少channels字段");
    };
    let Some(mut user) = store.get(hash) else {
        return respond_error("用户不存在");
    };

    let mut normalized = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for raw in raw_channels.iter().filter_map(|c| c.as_str()) {
        let channel = normalize_channel(raw);
        if channel.is_empty() {
            continue;
        }
        if seen.insert(channel.clone()) {
            normalized.push(channel);
        }
    }

    // Resolve guild ids for slugs not yet cached, concurrently.
    let to_resolve: Vec<String> = normalized
        .iter()
        .filter(|channel| !user.channel_guild_ids.contains_key(*channel))
        .cloned()
        .collect();
    let resolutions = futures::future::join_all(
        to_resolve
            .iter()
            .map(|channel| state.resolve_guild(channel)),
    )
    .await;
    for (channel, guild_id) in to_resolve.into_iter().zip(resolutions) {
        user.channel_guild_ids.insert(channel, guild_id);
    }

    // Drop cache entries for removed channels.
    user.channel_guild_ids
        .retain(|channel, _| seen.contains(channel));

    user.channels = normalized.clone();
    user.last_access_at = Some(Utc::now());
    if let Err(e) = store.save(&user) {
        return respond_error(&format!("保存失败: {e}"));
    }

    respond_success(
        "频道列表已更新",
        json!({
            "channels": normalized,
            "channel_count": normalized.len(),
            "guild_ids_cached": user.channel_guild_ids.len(),
        }),
    )
}

async fn handle_test_search(
    state: &QqpdState,
    store: &UserStore<User>,
    hash: &str,
    request: &serde_json::Value,
) -> Json<serde_json::Value> {
    let Some(keyword) = request.get("keyword").and_then(|k| k.as_str()).filter(|k| !k.is_empty())
    else {
        return respond_error("缺少keyword字段");
    };
    let max_results = request
        .get("max_results")
        .and_then(|m| m.as_u64())
        .unwrap_or(10) as usize;

    let Some(user) = store.get(hash) else {
        return respond_error("请先登录");
    };
    if user.cookie.is_empty() {
        return respond_error("请先登录");
    }
    if user.channels.is_empty() {
        return respond_error("请先配置频道");
    }

    let mut tasks = Vec::new();
    for channel in &user.channels {
        let guild_id = match user.channel_guild_ids.get(channel) {
            Some(cached) => cached.clone(),
            None => state.resolve_guild(channel).await,
        };
        tasks.push(ChannelTask {
            channel_id: channel.clone(),
            guild_id,
            cookie: user.cookie.clone(),
        });
    }

    let searches = tasks.iter().map(|task| {
        let client = state.client.clone();
        let keyword = keyword.to_string();
        async move { search_single_channel(&client, &keyword, task).await }
    });
    let mut results: Vec<SearchResult> = futures::future::join_all(searches)
        .await
        .into_iter()
        .flatten()
        .collect();
    results.truncate(max_results);

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
            "channels_searched": user.channels,
            "results": rendered,
        }),
    )
}

async fn handle_manual_login(
    state: &QqpdState,
    store: &UserStore<User>,
    hash: &str,
    request: &serde_json::Value,
) -> Json<serde_json::Value> {
    let Some(mut user) = store.get(hash) else {
        return respond_error("用户不存在");
    };
    let Some(cookie) = request.get("cookie").and_then(|c| c.as_str()).filter(|c| !c.is_empty())
    else {
        return respond_error("缺少cookie参数");
    };
    let qq_masked = request
        .get("qq_masked")
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .to_string();

    if !cookie_works(state, cookie).await {
        return respond_error("Cookie无效或已失效");
    }

    let now = Utc::now();
    user.cookie = cookie.to_string();
    user.status = UserStatus::Active;
    user.qq_masked = qq_masked.clone();
    user.login_at = Some(now);
    user.expire_at = Some(now + chrono::Duration::days(LOGIN_VALID_DAYS));
    user.last_refresh = Some(now);
    if let Err(e) = store.save(&user) {
        return respond_error(&format!("保存失败: {e}"));
    }

    respond_success(
        "登录成功",
        json!({
            "status": "active",
            "qq_masked": qq_masked,
            "login_time": format_time(user.login_at),
            "expire_time": format_time(user.expire_at),
        }),
    )
}

/// Probes the search API with a throwaway query to validate a cookie.
async fn cookie_works(state: &QqpdState, cookie: &str) -> bool {
    let refreshed = login::refresh_cookie(&state.client, cookie).await;
    let cookies = crate::cookies::parse_cookie_string(&refreshed);
    let Some(p_skey) = cookies.get("p_skey") else {
        return false;
    };

    let probe_url = format!(
        "https://pd.qq.com/qunng/guild/gotrpc/auth/trpc.group_pro.in_guild_search_svr.InGuildSearch/NewSearch?bkn={}",
        bkn(p_skey)
    );
    let payload = json!({
        "guild_id": "592843764045681811",
        "query": "test",
        "cookie": "",
        "member_cookie": "",
        "search_type": { "type": 0, "feed_type": 0 },
        "cond": { "channel_ids": [], "feed_rank_type": 0, "type_list": [2, 3] },
    });

    let Ok(response) = state
        .client
        .post(&probe_url)
        .json(&payload)
        .header("x-oidb", r#"{"uint32_command":"0x9287","uint32_service_type":"2"}"#)
        .header("Cookie", refreshed)
        .send()
        .await
    else {
        return false;
    };
    if !response.status().is_success() {
        return false;
    }
    let Ok(body) = response.json::<serde_json::Value>().await else {
        return false;
    };
    body.get("retcode").and_then(|code| code.as_i64()) == Some(0) || body.get("data").is_some()
}

/// Channel slug out of a pasted URL or bare slug.
fn normalize_channel(input: &str) -> String {
    let input = input.trim();
    if let Some((_, slug)) = input.split_once("pd.qq.com/g/") {
        return slug.trim_matches('/').trim().to_string();
    }
    input.to_string()
}

fn status_str(status: UserStatus) -> &'static str {
    match status {
        UserStatus::Pending => "pending",
        UserStatus::Active => "active",
        UserStatus::Expired => "expired",
    }
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
    fn channel_normalization() {
        assert_eq!(normalize_channel("pd97631607"), "pd97631607");
        assert_eq!(
            normalize_channel("https://pd.qq.com/g/pd97631607"),
            "pd97631607"
        );
        assert_eq!(
            normalize_channel("  https://pd.qq.com/g/kuake12345/  "),
            "kuake12345"
        );
    }

    #[test]
    fn redirect_hash_is_stable() {
        let first = principal_hash("10001", "salt");
        let second = principal_hash("10001", "salt");
        assert_eq!(first, second);
        assert!(is_identity_hash(&first));
    }

    #[test]
    fn feed_extraction_strips_prefix_and_requires_links() {
        let feed = json!({
            "title": "名称：阿凡达合集\n更新至第二部",
            "content": "资源 https://pan.quark.cn/s/abcd 提取码：x1y2",
            "create_time": "1719792000",
            "images": [{ "url": "https://img.example/1.png" }],
        });
        let result = extract_feed(&feed, "pd97631607", 0).unwrap();
        assert_eq!(result.unique_id, "qqpd-pd97631607-0");
        assert_eq!(result.title, "阿凡达合集");
        assert_eq!(result.links.len(), 1);
        assert_eq!(result.links[0].password, "x1y2");
        assert!(result.datetime.is_some());
        assert_eq!(result.images.as_ref().unwrap().len(), 1);
        assert!(result.channel.is_empty());

        let linkless = json!({ "title": "名称：x", "content": "没有链接" });
        assert!(extract_feed(&linkless, "c", 1).is_none());
    }

    #[tokio::test]
    async fn guild_resolution_prefers_caches() {
        let plugin = QqpdPlugin::new().unwrap();
        // Numeric slugs already are guild ids; no upstream fetch.
        assert_eq!(
            plugin.state.resolve_guild("592843764045681811").await,
            "592843764045681811"
        );
        // A cached slug resolves without touching the network either.
        plugin
            .state
            .guilds
            .insert("kuake12345".to_string(), "598877".to_string());
        assert_eq!(plugin.state.resolve_guild("kuake12345").await, "598877");
    }

    #[test]
    fn active_user_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let store: UserStore<User> = UserStore::open("qqpd-test", dir.path(), None).unwrap();
        let now = Utc::now();

        let ok = User {
            hash: "a".repeat(64),
            status: UserStatus::Active,
            cookie: "p_skey=x".into(),
            channels: vec!["c1".into()],
            expire_at: Some(now + chrono::Duration::days(1)),
            last_access_at: Some(now),
            ..Default::default()
        };
        let expired = User {
            hash: "b".repeat(64),
            status: UserStatus::Active,
            cookie: "p_skey=y".into(),
            channels: vec!["c2".into()],
            expire_at: Some(now - chrono::Duration::days(1)),
            last_access_at: Some(now),
            ..Default::default()
        };
        let channelless = User {
            hash: "c".repeat(64),
            status: UserStatus::Active,
            cookie: "p_skey=z".into(),
            expire_at: Some(now + chrono::Duration::days(1)),
            last_access_at: Some(now),
            ..Default::default()
        };
        store.save(&ok).unwrap();
        store.save(&expired).unwrap();
        store.save(&channelless).unwrap();

        let active = active_users(&store);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].hash, ok.hash);

        // The expired session was downgraded and its cookie wiped.
        let downgraded = store.get(&expired.hash).unwrap();
        assert_eq!(downgraded.status, UserStatus::Expired);
        assert!(downgraded.cookie.is_empty());
    }
}
