//! Route handlers.

use axum::extract::{Path, Query, State};
use axum::http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{Envelope, ProxyError, ResolveError};
use super::AppState;
use crate::activity::{ErrorRecord, DEFAULT_ERROR_LOG};
use crate::browser::SessionStatus;
use crate::rewrite::PROXY_PATH;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/getm3u8/{code}", get(get_m3u8))
        .route(PROXY_PATH, get(proxy))
        .route("/api/cache/clear", post(clear_caches))
        .route("/api/stats", get(stats))
        .route("/health", get(health))
        .with_state(state)
}

async fn get_m3u8(State(state): State<AppState>, Path(code): Path<String>) -> Response {
    match state.resolver.resolve(&code).await {
        Ok(url) => Json(Envelope::ok(url)).into_response(),
        Err(err) => {
            warn!(code = %code, "Resolution failed: {err}");
            state.errors.record(format!("getm3u8 {code}"), &err);
            ResolveError(err).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    pub m3u8: Option<String>,
}

async fn proxy(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let target = query.m3u8.unwrap_or_default();
    let origin = state
        .public_url
        .clone()
        .unwrap_or_else(|| request_origin(&headers, &uri));

    match state.proxy.fetch(&target, &origin).await {
        Ok(resource) => {
            let content_type = HeaderValue::from_str(&resource.content_type)
                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
            (
                [
                    (CONTENT_TYPE, content_type),
                    (ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
                ],
                resource.body,
            )
                .into_response()
        }
        Err(err) => {
            warn!(target = %target, "Proxy fetch failed: {err}");
            state.errors.record(format!("proxy {target}"), &err);
            ProxyError(err).into_response()
        }
    }
}

/// `<scheme>://<host>` as seen by the client.
fn request_origin(headers: &HeaderMap, uri: &Uri) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let scheme = header("x-forwarded-proto").unwrap_or("http");
    let host = header("x-forwarded-host")
        .or_else(|| header(HOST.as_str()))
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

#[derive(Debug, Serialize)]
struct Cleared {
    success: bool,
    resolutions: usize,
    resources: usize,
}

async fn clear_caches(State(state): State<AppState>) -> Json<Cleared> {
    let cleared = Cleared {
        success: true,
        resolutions: state.resolver.cache_len(),
        resources: state.proxy.cache_len(),
    };
    state.resolver.clear_cache();
    state.proxy.clear();
    tracing::info!(
        resolutions = cleared.resolutions,
        resources = cleared.resources,
        "Caches cleared"
    );
    Json(cleared)
}

#[derive(Debug, Serialize)]
pub struct Stats {
    pub uptime_secs: u64,
    pub resolution_cache: usize,
    pub resolution_cache_capacity: usize,
    pub proxy_cache: usize,
    pub proxy_cache_capacity: usize,
    pub resolutions_in_flight: usize,
    pub fetches_in_flight: usize,
    pub recent_codes: Vec<String>,
    pub recent_errors: Vec<ErrorRecord>,
    pub browser: SessionStatus,
}

async fn stats(State(state): State<AppState>) -> Json<Stats> {
    Json(Stats {
        uptime_secs: state.start_time.elapsed().as_secs(),
        resolution_cache: state.resolver.cache_len(),
        resolution_cache_capacity: state.resolver.cache_capacity(),
        proxy_cache: state.proxy.cache_len(),
        proxy_cache_capacity: state.proxy.cache_capacity(),
        resolutions_in_flight: state.resolver.in_flight(),
        fetches_in_flight: state.proxy.in_flight(),
        recent_codes: state.resolver.recent_codes(),
        recent_errors: state.errors.recent(DEFAULT_ERROR_LOG),
        browser: state.resolver.sessions().status(),
    })
}

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "version": crate::VERSION,
        })),
    )
}
