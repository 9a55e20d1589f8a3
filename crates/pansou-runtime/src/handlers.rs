//! HTTP handlers for the search, health and auth endpoints.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use pansou_core::Ext;
use pansou_kernel::{ResultType, SearchRequest, SourceType};

use crate::auth::{generate_token, Claims};
use crate::filter::{apply_result_filter, FilterConfig};
use crate::server::AppState;

/// `"a,b"` or `["a","b"]` — both arrive from clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(raw) => split_csv(&raw),
            StringOrList::Many(items) => items
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        }
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// GET form of the search parameters.
#[derive(Debug, Default, Deserialize)]
pub struct SearchQueryParams {
    pub kw: Option<String>,
    pub channels: Option<String>,
    pub plugins: Option<String>,
    pub result_type: Option<String>,
    pub source_type: Option<String>,
    pub refresh: Option<String>,
    /// JSON object, URL-encoded.
    pub ext: Option<String>,
    pub include: Option<String>,
    pub exclude: Option<String>,
}

/// POST body of the search parameters.
#[derive(Debug, Default, Deserialize)]
pub struct SearchBody {
    pub kw: Option<String>,
    pub channels: Option<StringOrList>,
    pub plugins: Option<StringOrList>,
    pub result_type: Option<String>,
    pub source_type: Option<String>,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    pub refresh: Option<serde_json::Value>,
    pub ext: Option<Ext>,
}

struct ParsedSearch {
    request: SearchRequest,
    filter: FilterConfig,
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

pub async fn search_get(
    State(state): State<AppState>,
    Query(params): Query<SearchQueryParams>,
) -> Response {
    let Some(keyword) = params.kw.filter(|kw| !kw.trim().is_empty()) else {
        return bad_request("缺少必需的kw参数");
    };

    let ext = params
        .ext
        .as_deref()
        .and_then(|raw| serde_json::from_str::<Ext>(raw).ok())
        .unwrap_or_default();

    let parsed = ParsedSearch {
        request: SearchRequest {
            keyword: keyword.trim().to_string(),
            channels: params.channels.as_deref().map(split_csv).unwrap_or_default(),
            plugins: params.plugins.as_deref().map(split_csv).unwrap_or_default(),
            result_type: ResultType::parse(params.result_type.as_deref().unwrap_or("all")),
            source_type: SourceType::parse(params.source_type.as_deref().unwrap_or("all")),
            refresh: params.refresh.as_deref() == Some("1"),
            ext,
        },
        filter: FilterConfig {
            include: params.include.as_deref().map(split_csv).unwrap_or_default(),
            exclude: params.exclude.as_deref().map(split_csv).unwrap_or_default(),
        },
    };

    run_search(state, parsed).await
}

pub async fn search_post(State(state): State<AppState>, body: Option<Json<SearchBody>>) -> Response {
    let Some(Json(body)) = body else {
        return bad_request("无效的请求格式");
    };
    let Some(keyword) = body.kw.filter(|kw| !kw.trim().is_empty()) else {
        return bad_request("缺少必需的kw参数");
    };

    let refresh = match &body.refresh {
        Some(serde_json::Value::Bool(flag)) => *flag,
        Some(serde_json::Value::Number(n)) => n.as_i64() == Some(1),
        Some(serde_json::Value::String(s)) => s == "1" || s == "true",
        _ => false,
    };

    let parsed = ParsedSearch {
        request: SearchRequest {
            keyword: keyword.trim().to_string(),
            channels: body.channels.map(StringOrList::into_vec).unwrap_or_default(),
            plugins: body.plugins.map(StringOrList::into_vec).unwrap_or_default(),
            result_type: ResultType::parse(body.result_type.as_deref().unwrap_or("all")),
            source_type: SourceType::parse(body.source_type.as_deref().unwrap_or("all")),
            refresh,
            ext: body.ext.unwrap_or_default(),
        },
        filter: body.filter.unwrap_or_default(),
    };

    run_search(state, parsed).await
}

async fn run_search(state: AppState, parsed: ParsedSearch) -> Response {
    let response = state.service.search(&parsed.request).await;
    let filtered = apply_result_filter(response, &parsed.filter, parsed.request.result_type);
    Json(filtered).into_response()
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let registry = state.service.registry();
    let plugins_enabled = !registry.is_empty();

    let mut payload = json!({
        "status": "ok",
        "auth_enabled": state.config.auth.enabled,
        "plugins_enabled": plugins_enabled,
        "channels": state.config.channels,
        "channels_count": state.config.channels.len(),
    });
    if plugins_enabled {
        let names: Vec<&str> = registry.plugins().iter().map(|p| p.name()).collect();
        payload["plugin_count"] = json!(names.len());
        payload["plugins"] = json!(names);
    }
    Json(payload)
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(State(state): State<AppState>, body: Option<Json<LoginRequest>>) -> Response {
    let Some(Json(request)) = body else {
        return bad_request("参数错误：用户名和密码不能为空");
    };
    if request.username.is_empty() || request.password.is_empty() {
        return bad_request("参数错误：用户名和密码不能为空");
    }

    let auth = &state.config.auth;
    if !auth.enabled {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "认证功能未启用" })),
        )
            .into_response();
    }
    if auth.users.is_empty() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "认证系统未正确配置" })),
        )
            .into_response();
    }

    match auth.users.get(&request.username) {
        Some(stored) if *stored == request.password => {}
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "用户名或密码错误" })),
            )
                .into_response();
        }
    }

    let expiry = auth.token_expiry();
    match generate_token(&request.username, &auth.jwt_secret, expiry) {
        Ok(token) => {
            let expires_at = chrono::Utc::now().timestamp() + expiry.as_secs() as i64;
            Json(json!({
                "token": token,
                "expires_at": expires_at,
                "username": request.username,
            }))
            .into_response()
        }
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "生成令牌失败" })),
        )
            .into_response(),
    }
}

pub async fn verify(
    State(state): State<AppState>,
    claims: Option<Extension<Claims>>,
) -> Response {
    if !state.config.auth.enabled {
        return Json(json!({ "valid": true, "message": "认证功能未启用" })).into_response();
    }
    match claims {
        Some(Extension(claims)) => {
            Json(json!({ "valid": true, "username": claims.username })).into_response()
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "未授权" })),
        )
            .into_response(),
    }
}

pub async fn logout() -> Json<serde_json::Value> {
    // Stateless tokens: the client just discards its copy.
    Json(json!({ "message": "退出成功" }))
}
