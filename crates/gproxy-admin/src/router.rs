use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;

use gproxy_core::state::AppState;
use gproxy_provider_core::quota::{DisableMode, FailureClass};
use gproxy_storage::Storage;

#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
    pub storage: Arc<dyn Storage>,
}

/// Quota/health/metrics/config/reload surface, mounted as a sibling router to
/// `gproxy-router::admin_router` under `/admin`. Shares the same admin-key auth
/// texture (header, bearer token, or `?admin_key=` query param).
pub fn admin_router(app: Arc<AppState>, storage: Arc<dyn Storage>) -> Router {
    let state = AdminState { app, storage };

    Router::new()
        .route("/metrics", get(metrics))
        .route("/config", get(get_config))
        .route("/reload", post(reload))
        .route("/quota", get(list_quota))
        .route("/quota/reset_by_alias", post(reset_quota_by_alias))
        .route("/quota/{key}", get(get_quota))
        .route("/quota/{key}/reset", post(reset_quota))
        .route("/quota/{key}/recover", post(recover_quota))
        .route("/quota/{key}/disable", post(disable_quota))
        .route("/quota/{key}/refresh", post(refresh_quota))
        .route("/quota/{key}/on_success", post(quota_on_success))
        .route("/quota/{key}/on_failure", post(quota_on_failure))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<AdminState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let key = extract_admin_key(&headers, req.uri()).ok_or(StatusCode::UNAUTHORIZED)?;
    let expected_hash = state.app.global.load().admin_key_hash.clone();
    if hash_admin_key(&key) != expected_hash {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn hash_admin_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

fn extract_admin_key(headers: &HeaderMap, uri: &axum::http::Uri) -> Option<String> {
    if let Some(value) = headers.get("x-admin-key")
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }

    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(auth) = value.to_str()
    {
        let auth = auth.trim();
        let prefix = "Bearer ";
        if auth.len() > prefix.len() && auth[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = auth[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    let query = uri.query()?;
    let parsed: std::collections::HashMap<String, String> =
        serde_urlencoded::from_str(query).ok()?;
    let key = parsed.get("admin_key")?.trim();
    if key.is_empty() {
        return None;
    }
    Some(key.to_string())
}

/// Lightweight process metrics. Counters come from in-memory state rather
/// than a dedicated metrics registry, matching what `tracing` already
/// instruments elsewhere in this codebase.
async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
    let snapshot = state.app.snapshot.load();
    let providers = state.app.quota.providers();
    let in_pool = providers
        .iter()
        .filter(|p| state.app.quota.is_in_pool(&p.key))
        .count();

    Json(serde_json::json!({
        "providers_total": snapshot.providers.len(),
        "credentials_total": snapshot.credentials.len(),
        "users_total": snapshot.users.len(),
        "quota_tracked_keys": providers.len(),
        "quota_in_pool": in_pool,
        "quota_out_of_pool": providers.len().saturating_sub(in_pool),
    }))
}

/// Redacted `GlobalConfig` snapshot: the admin key hash is never returned.
async fn get_config(State(state): State<AdminState>) -> impl IntoResponse {
    let global = state.app.global.load();
    Json(serde_json::json!({
        "host": global.host,
        "port": global.port,
        "proxy": global.proxy,
        "dsn": redact_dsn(&global.dsn),
        "event_redact_sensitive": global.event_redact_sensitive,
    }))
}

fn redact_dsn(dsn: &str) -> String {
    match dsn.split_once("://") {
        Some((scheme, _)) => format!("{scheme}://<redacted>"),
        None => "<redacted>".to_string(),
    }
}

/// Re-reads global config and the full snapshot from storage, rebuilding
/// in-memory provider runtimes and credential pools from scratch.
async fn reload(State(state): State<AdminState>) -> impl IntoResponse {
    match state.app.reload(state.storage.as_ref()).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "reload_failed", "detail": err.to_string() })),
        )
            .into_response(),
    }
}

async fn list_quota(State(state): State<AdminState>) -> impl IntoResponse {
    Json(serde_json::json!({ "providers": state.app.quota.providers() }))
}

async fn get_quota(State(state): State<AdminState>, Path(key): Path<String>) -> impl IntoResponse {
    Json(serde_json::json!({
        "key": key,
        "state": state.app.quota.state(&key),
        "in_pool": state.app.quota.is_in_pool(&key),
    }))
}

async fn reset_quota(State(state): State<AdminState>, Path(key): Path<String>) -> impl IntoResponse {
    state.app.quota.reset(&key);
    (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
}

#[derive(Debug, Deserialize)]
struct ResetByAliasBody {
    pub alias_prefix: String,
}

async fn reset_quota_by_alias(
    State(state): State<AdminState>,
    Json(body): Json<ResetByAliasBody>,
) -> impl IntoResponse {
    state.app.quota.reset_by_alias_prefix(&body.alias_prefix);
    (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
}

async fn recover_quota(
    State(state): State<AdminState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    state.app.quota.recover(&key);
    (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
}

#[derive(Debug, Deserialize)]
struct DisableQuotaBody {
    pub mode: DisableQuotaMode,
    pub duration_secs: u64,
    #[serde(default = "default_disable_reason")]
    pub reason: String,
}

fn default_disable_reason() -> String {
    "manual".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DisableQuotaMode {
    Cooldown,
    Blacklist,
}

async fn disable_quota(
    State(state): State<AdminState>,
    Path(key): Path<String>,
    Json(body): Json<DisableQuotaBody>,
) -> impl IntoResponse {
    let mode = match body.mode {
        DisableQuotaMode::Cooldown => DisableMode::Cooldown,
        DisableQuotaMode::Blacklist => DisableMode::Blacklist,
    };
    state.app.quota.disable(
        &key,
        mode,
        Duration::from_secs(body.duration_secs),
        body.reason,
    );
    (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
}

#[derive(Debug, Deserialize)]
struct RefreshQuotaBody {
    #[serde(default)]
    pub remaining_fraction: Option<f64>,
    #[serde(default)]
    pub reset_at_ms: Option<i64>,
}

async fn refresh_quota(
    State(state): State<AdminState>,
    Path(key): Path<String>,
    Json(body): Json<RefreshQuotaBody>,
) -> impl IntoResponse {
    state
        .app
        .quota
        .apply_refresh(&key, body.remaining_fraction, body.reset_at_ms);
    (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
}

async fn quota_on_success(
    State(state): State<AdminState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    state.app.quota.on_success(&key);
    (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
}

#[derive(Debug, Deserialize)]
struct OnFailureBody {
    pub class: OnFailureClass,
    #[serde(default = "default_disable_reason")]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum OnFailureClass {
    RateLimit,
    Quota,
    Auth,
    Transient,
}

async fn quota_on_failure(
    State(state): State<AdminState>,
    Path(key): Path<String>,
    Json(body): Json<OnFailureBody>,
) -> impl IntoResponse {
    let class = match body.class {
        OnFailureClass::RateLimit => FailureClass::RateLimit,
        OnFailureClass::Quota => FailureClass::Quota,
        OnFailureClass::Auth => FailureClass::Auth,
        OnFailureClass::Transient => FailureClass::Transient,
    };
    state.app.quota.on_failure(&key, class, body.reason);
    (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
}
