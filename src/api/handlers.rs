//! API route handlers.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::debug;

use crate::dispatch::{scheduler, InvokeRequest, OuterResponse};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use super::types::{
    ApiInfo, CacheStatsResponse, CleanupResponse, DependencyHealth, DetailedHealthResponse,
    EvictResponse, HealthResponse, MetricsResponse,
};

/// Bearer-token gate for the operator endpoints; a noop when no admin token
/// is configured (an external tier fronts them in that deployment shape).
fn check_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if crate::dispatch::auth::constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
            Ok(())
        }
        _ => Err(ApiError::Unauthorized("admin token required".into())),
    }
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

fn to_response(outer: OuterResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(outer.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    for (name, value) in &outer.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(outer.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `ANY /invoke/{functionId}` and `ANY /invoke/{functionId}/*path`.
pub async fn invoke(
    State(state): State<Arc<AppState>>,
    Path(params): Path<Vec<(String, String)>>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let function_id = params
        .iter()
        .find(|(name, _)| name == "functionId")
        .map(|(_, value)| value.clone())
        .unwrap_or_default();
    let subpath = params
        .iter()
        .find(|(name, _)| name == "path")
        .map(|(_, value)| format!("/{}", value))
        .unwrap_or_else(|| "/".to_string());

    let header_pairs: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let request = InvokeRequest {
        function_id,
        method: method.as_str().to_string(),
        subpath,
        query_string: query.unwrap_or_default(),
        client_ip: client_ip(&headers),
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        headers: header_pairs,
        body: body.to_vec(),
    };

    debug!(
        function_id = %request.function_id,
        method = %request.method,
        "invocation received"
    );
    to_response(state.dispatcher.invoke(request).await)
}

/// `POST /trigger-scheduled`
pub async fn trigger_scheduled(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    check_admin(&state, &headers)?;
    let report = scheduler::run_due(&state.dispatcher).await;
    Ok(Json(report))
}

/// `GET /cache/stats`
pub async fn cache_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    check_admin(&state, &headers)?;
    Ok(Json(CacheStatsResponse {
        stats: state.dispatcher.cache().stats(),
        entries: state.dispatcher.cache().entry_stats(),
    }))
}

/// `POST /cache/cleanup`
pub async fn cache_cleanup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    check_admin(&state, &headers)?;
    let report = state.dispatcher.cache().evict_to_watermark().await;
    Ok(Json(CleanupResponse { report }))
}

/// `DELETE /cache/{functionId}`
pub async fn cache_evict(
    State(state): State<Arc<AppState>>,
    Path(function_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    check_admin(&state, &headers)?;
    let freed_bytes = state.dispatcher.cache().evict_entry(&function_id).await?;
    Ok(Json(EvictResponse {
        function_id,
        freed_bytes,
    }))
}

/// `GET /metrics`
pub async fn metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    check_admin(&state, &headers)?;
    Ok(Json(MetricsResponse {
        snapshot: state.dispatcher.metrics().snapshot(),
    }))
}

/// `GET /functions/{functionId}/logs`
pub async fn function_logs(
    State(state): State<Arc<AppState>>,
    Path(function_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    check_admin(&state, &headers)?;
    let logs = state.dispatcher.store().recent_logs(&function_id, 50).await?;
    Ok(Json(logs))
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
    })
}

/// `GET /health/detailed`
pub async fn health_detailed(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cache_root = &state.config.cache_root;
    let cache_writable = tempfile::NamedTempFile::new_in(cache_root).is_ok();
    let store_reachable = state
        .dispatcher
        .store()
        .due_scheduled(chrono::Utc::now())
        .await
        .is_ok();

    let dependencies = vec![
        DependencyHealth {
            name: "cache_dir",
            healthy: cache_writable,
            detail: (!cache_writable).then(|| format!("{} is not writable", cache_root.display())),
        },
        DependencyHealth {
            name: "metadata_store",
            healthy: store_reachable,
            detail: (!store_reachable).then(|| "store query failed".to_string()),
        },
    ];
    let all_healthy = dependencies.iter().all(|d| d.healthy);

    let body = Json(DetailedHealthResponse {
        status: if all_healthy { "ok" } else { "degraded" },
        uptime_secs: state.uptime_secs(),
        guests_in_use: state.dispatcher.metrics().guests_in_use(),
        dependencies,
    });
    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, body)
}

/// `GET /`
pub async fn api_info() -> impl IntoResponse {
    Json(ApiInfo {
        name: "runlet",
        version: env!("CARGO_PKG_VERSION"),
    })
}
