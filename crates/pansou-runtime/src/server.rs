//! Router assembly, middleware and serving.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info};

use pansou_kernel::{PluginRegistry, SearchService, SearchServiceConfig};

use crate::auth::validate_token;
use crate::config::AppConfig;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SearchService>,
    pub config: Arc<AppConfig>,
}

/// Builds the full application router: API routes, middleware stack, and
/// whatever web routes the plugins want to mount.
pub fn build_router(service: Arc<SearchService>, config: Arc<AppConfig>) -> Router {
    let state = AppState {
        service: service.clone(),
        config,
    };

    let api = Router::new()
        .route("/api/search", get(crate::handlers::search_get).post(crate::handlers::search_post))
        .route("/api/health", get(crate::handlers::health))
        .route("/api/auth/login", post(crate::handlers::login))
        .route("/api/auth/verify", post(crate::handlers::verify))
        .route("/api/auth/logout", post(crate::handlers::logout));

    let mut router = api.with_state(state.clone());

    // Plugin-mounted endpoints (the sub-service management pages).
    for plugin in service.registry().plugins() {
        if let Some(routes) = plugin.web_routes() {
            router = router.merge(routes);
        }
    }

    router
        .layer(middleware::from_fn_with_state(state, auth_middleware))
        .layer(middleware::from_fn(logger_middleware))
        .layer(middleware::from_fn(cors_middleware))
}

/// Builds the service and router from a registry and serves until ctrl-c.
pub async fn serve(registry: Arc<PluginRegistry>, config: AppConfig) -> std::io::Result<()> {
    let config = Arc::new(config);
    let service = Arc::new(SearchService::new(
        registry,
        SearchServiceConfig {
            default_channels: config.channels.clone(),
            ..Default::default()
        },
    ));

    let router = build_router(service, config.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "pansou listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
}

// =============================================================================
// Middleware
// =============================================================================

/// Permissive CORS: any origin, GET/POST/OPTIONS, 204 preflight.
async fn cors_middleware(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return cors_headers((StatusCode::NO_CONTENT, "").into_response());
    }
    cors_headers(next.run(request).await)
}

fn cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(
            "Origin, Content-Type, Content-Length, Accept-Encoding, X-CSRF-Token, Authorization",
        ),
    );
    response
}

/// Request log line: method, decoded URI, status, latency.
async fn logger_middleware(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().to_string();

    let response = next.run(request).await;

    // Search keywords arrive percent-encoded; decode for readability.
    let display_uri = if uri.contains("/api/search") && uri.contains("kw=") {
        urlencoding::decode(&uri)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| uri.clone())
    } else {
        uri
    };

    info!(
        method = %method,
        uri = %display_uri,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// JWT gate. Public paths pass through; everything else needs a valid
/// Bearer token when auth is enabled.
async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if !state.config.auth.enabled {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    if state
        .config
        .auth
        .public_paths
        .iter()
        .any(|public| path.starts_with(public.as_str()))
    {
        return next.run(request).await;
    }

    let Some(auth_header) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return unauthorized("未授权：缺少认证令牌", "AUTH_TOKEN_MISSING");
    };

    let Some(token) = auth_header.strip_prefix("Bearer ") else {
        return unauthorized("未授权：令牌格式错误", "AUTH_TOKEN_INVALID_FORMAT");
    };

    match validate_token(token, &state.config.auth.jwt_secret) {
        Ok(claims) => {
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(e) => {
            error!(error = %e, "token rejected");
            unauthorized("未授权：令牌无效或已过期", "AUTH_TOKEN_INVALID")
        }
    }
}

fn unauthorized(message: &str, code: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": message, "code": code })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    use pansou_core::{Ext, Link, PluginSearchResult, SearchResult};
    use pansou_kernel::{PluginResult, SearchPlugin};

    struct StubPlugin;

    #[async_trait]
    impl SearchPlugin for StubPlugin {
        fn name(&self) -> &str {
            "stub1"
        }

        async fn search_with_result(
            &self,
            _keyword: &str,
            _ext: &Ext,
        ) -> PluginResult<PluginSearchResult> {
            Ok(PluginSearchResult::finalized(vec![SearchResult {
                unique_id: "stub1-1".into(),
                title: "alpha movie".into(),
                links: vec![Link::new("https://pan.quark.cn/s/aaaa")],
                ..Default::default()
            }]))
        }
    }

    fn test_router(config: AppConfig) -> Router {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(StubPlugin));
        let service = Arc::new(SearchService::new(
            Arc::new(registry),
            SearchServiceConfig::default(),
        ));
        build_router(service, Arc::new(config))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_plugins() {
        let router = test_router(AppConfig::default());
        let response = router
            .oneshot(
                HttpRequest::get("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let payload = body_json(response).await;
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["plugins_enabled"], true);
        assert_eq!(payload["plugin_count"], 1);
        assert_eq!(payload["plugins"][0], "stub1");
    }

    #[tokio::test]
    async fn search_without_kw_is_400() {
        let router = test_router(AppConfig::default());
        let response = router
            .oneshot(
                HttpRequest::get("/api/search")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn search_get_end_to_end() {
        let router = test_router(AppConfig::default());
        let response = router
            .oneshot(
                HttpRequest::get("/api/search?kw=alpha&plugins=stub1&result_type=results")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let payload = body_json(response).await;
        assert_eq!(payload["total"], 1);
        assert_eq!(payload["results"][0]["unique_id"], "stub1-1");
        assert_eq!(payload["results"][0]["links"][0]["type"], "quark");
    }

    #[tokio::test]
    async fn search_post_with_filter() {
        let router = test_router(AppConfig::default());
        let body = serde_json::json!({
            "kw": "alpha",
            "plugins": ["stub1"],
            "result_type": "results",
            "filter": { "exclude": ["movie"] },
        });
        let response = router
            .oneshot(
                HttpRequest::post("/api/search")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        // The only hit's title contains "movie", so the exclude drops it.
        assert_eq!(payload["total"], 0);
    }

    fn auth_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.auth.enabled = true;
        config.auth.jwt_secret = "test-secret".into();
        config
            .auth
            .users
            .insert("admin".to_string(), "password".to_string());
        config.auth.public_paths = vec!["/api/auth/".into(), "/api/health".into()];
        config
    }

    #[tokio::test]
    async fn auth_gates_search_with_error_codes() {
        let router = test_router(auth_config());

        // Missing token.
        let response = router
            .clone()
            .oneshot(
                HttpRequest::get("/api/search?kw=alpha")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "AUTH_TOKEN_MISSING");

        // Wrong scheme.
        let response = router
            .clone()
            .oneshot(
                HttpRequest::get("/api/search?kw=alpha")
                    .header("authorization", "Basic abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await["code"],
            "AUTH_TOKEN_INVALID_FORMAT"
        );

        // Garbage token.
        let response = router
            .clone()
            .oneshot(
                HttpRequest::get("/api/search?kw=alpha")
                    .header("authorization", "Bearer not.a.token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await["code"], "AUTH_TOKEN_INVALID");

        // Health stays public.
        let response = router
            .oneshot(
                HttpRequest::get("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn login_issues_usable_token() {
        let router = test_router(auth_config());

        let response = router
            .clone()
            .oneshot(
                HttpRequest::post("/api/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"username":"admin","password":"password"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["username"], "admin");
        let token = payload["token"].as_str().unwrap().to_string();

        // The issued token opens the search endpoint.
        let response = router
            .clone()
            .oneshot(
                HttpRequest::get("/api/search?kw=alpha")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Wrong password is a 401.
        let response = router
            .oneshot(
                HttpRequest::post("/api/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"username":"admin","password":"nope"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cors_preflight_is_204() {
        let router = test_router(AppConfig::default());
        let response = router
            .oneshot(
                HttpRequest::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/search")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }
}
