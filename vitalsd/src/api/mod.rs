//! Read-only JSON API.
//!
//! Every route is a GET returning JSON with permissive CORS. Unknown paths
//! answer 200 with the list of known routes so browser clients can discover
//! them.

use crate::context::Context;
use crate::history::{HistorySummary, MetricRecord};
use crate::processes::{ProcessQuery, SortKey};
use crate::types::{CpuSnapshot, DiskSnapshot, GpuInfo, NetworkSnapshot, SystemSnapshot, format_uptime};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub const ROUTES: [&str; 14] = [
    "/api/all",
    "/api/cpu",
    "/api/memory",
    "/api/disk",
    "/api/network",
    "/api/gpu",
    "/api/system",
    "/api/processes",
    "/api/processes/stats",
    "/api/history",
    "/api/history/summary",
    "/api/alerts",
    "/health",
    "/status",
];

const DEFAULT_HISTORY_HOURS: f64 = 24.0;
const DEFAULT_HISTORY_LIMIT: i64 = 1_000;
const RECENT_ALERTS: usize = 50;

pub fn router(ctx: Context) -> Router {
    Router::new()
        .route("/api/all", get(all))
        .route("/api/cpu", get(cpu))
        .route("/api/memory", get(memory))
        .route("/api/disk", get(disk))
        .route("/api/network", get(network))
        .route("/api/gpu", get(gpu))
        .route("/api/system", get(system))
        .route("/api/processes", get(processes))
        .route("/api/processes/stats", get(process_stats))
        .route("/api/history", get(history))
        .route("/api/history/summary", get(history_summary))
        .route("/api/alerts", get(alerts))
        .route("/health", get(health))
        .route("/status", get(status))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(ctx: Context, listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("[api] listening on http://{addr}");
    }
    axum::serve(listener, router(ctx).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        warn!("[api] storage error: {err}");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "storage unavailable".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn all(State(ctx): State<Context>) -> impl IntoResponse {
    Json(ctx.snapshot().await)
}

async fn cpu(State(ctx): State<Context>) -> Json<CpuSnapshot> {
    let mut sampler = ctx.sampler.lock().await;
    Json(CpuSnapshot {
        usage: sampler.cpu_usage(),
        per_core: sampler.cpu_per_core(),
        count: sampler.cpu_count(),
        freq: sampler.cpu_frequency_ghz(),
        temp: sampler.cpu_temperature(),
    })
}

async fn memory(State(ctx): State<Context>) -> impl IntoResponse {
    Json(ctx.sampler.lock().await.memory())
}

async fn disk(State(ctx): State<Context>) -> Json<DiskSnapshot> {
    let mut sampler = ctx.sampler.lock().await;
    Json(DiskSnapshot {
        usage: sampler.disk_usage(None),
        info: sampler.disk_partitions(),
        io: sampler.disk_io_rate(),
    })
}

async fn network(State(ctx): State<Context>) -> Json<NetworkSnapshot> {
    let mut sampler = ctx.sampler.lock().await;
    Json(NetworkSnapshot {
        speed: sampler.network_rate(),
        info: sampler.network_interfaces(),
    })
}

async fn gpu(State(ctx): State<Context>) -> Json<GpuInfo> {
    Json(ctx.gpu_info().await.unwrap_or_else(GpuInfo::not_detected))
}

async fn system(State(ctx): State<Context>) -> Json<SystemSnapshot> {
    let sampler = ctx.sampler.lock().await;
    let uptime_secs = sampler.uptime();
    Json(SystemSnapshot {
        info: sampler.system_info(),
        uptime: format_uptime(uptime_secs),
        uptime_secs,
        battery: sampler.battery(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ProcessParams {
    filter: Option<String>,
    sort: Option<String>,
    desc: Option<bool>,
    limit: Option<usize>,
}

async fn processes(
    State(ctx): State<Context>,
    Query(params): Query<ProcessParams>,
) -> Result<impl IntoResponse, ApiError> {
    let sort = match params.sort.as_deref() {
        Some(raw) => raw.parse::<SortKey>().map_err(ApiError::bad_request)?,
        None => SortKey::default(),
    };
    let query = ProcessQuery {
        filter: params.filter.filter(|f| !f.trim().is_empty()),
        sort,
        descending: params.desc.unwrap_or(true),
        limit: Some(params.limit.unwrap_or(ctx.config.processes.list_limit)),
    };
    Ok(Json(ctx.list_processes(query).await))
}

async fn process_stats(State(ctx): State<Context>) -> impl IntoResponse {
    Json(ctx.process_stats().await)
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    hours: Option<f64>,
    limit: Option<i64>,
}

impl HistoryParams {
    fn window(&self) -> Result<Duration, ApiError> {
        let hours = self.hours.unwrap_or(DEFAULT_HISTORY_HOURS);
        if !hours.is_finite() || hours < 0.0 {
            return Err(ApiError::bad_request("hours must be a non-negative number"));
        }
        Duration::try_from_secs_f64(hours * 3_600.0)
            .map_err(|_| ApiError::bad_request("hours is out of range"))
    }
}

async fn history(
    State(ctx): State<Context>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<MetricRecord>> {
    let window = params.window()?;
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(ctx.history.query(window, limit).await?))
}

async fn history_summary(
    State(ctx): State<Context>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<HistorySummary> {
    Ok(Json(ctx.history.summary(params.window()?).await?))
}

async fn alerts(State(ctx): State<Context>) -> ApiResult<Value> {
    let rules = ctx.rules.list(false).await?;
    Ok(Json(json!({
        "rules": rules,
        "recent": ctx.feed.recent(RECENT_ALERTS),
    })))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(ctx): State<Context>) -> impl IntoResponse {
    Json(ctx.metrics.snapshot())
}

async fn not_found() -> Json<Value> {
    Json(json!({
        "error": "Not found",
        "available": ROUTES,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Database;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> Router {
        let ctx = Context::with_database(Config::default(), Database::in_memory().await.unwrap())
            .await
            .unwrap();
        router(ctx)
    }

    async fn call(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn fallback_lists_every_route() {
        let (status, body) = call(app().await, "/definitely/not/here").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["available"].as_array().unwrap().len(), ROUTES.len());
    }

    #[tokio::test]
    async fn gpu_falls_back_to_sentinel_shape() {
        let (status, body) = call(app().await, "/api/gpu").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["name"].is_string());
        assert!(body["usage"].is_number());
        assert!(body["temp"].is_number());
    }

    #[tokio::test]
    async fn bad_history_window_is_rejected() {
        let (status, body) = call(app().await, "/api/history/summary?hours=-2").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn oversized_history_window_is_rejected() {
        for uri in ["/api/history?hours=1e300", "/api/history/summary?hours=1e300"] {
            let (status, body) = call(app().await, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["error"], "hours is out of range");
        }
    }
}
