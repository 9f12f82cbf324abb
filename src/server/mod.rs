pub mod metrics;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::clock::{Format, TimeRange};
use crate::engine::{Engine, GroupValue, ViewerBucket};
use crate::store::rollup::CcuStat;
use crate::store::session::RendererRow;
use crate::store::ReadStore;

use self::metrics::ApiMetrics;

/// Requests rejected before any storage access.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("signalKey is required")]
    MissingSignalKey,

    #[error("format must be one of h, d, m, y (got {0:?})")]
    InvalidFormat(String),

    #[error("missing required parameter {0}")]
    MissingDateTime(&'static str),

    #[error("unparseable datetime {0:?}")]
    InvalidDateTime(String),

    #[error("startDateTime must not be after endDateTime")]
    ReversedRange,
}

/// API failure modes mapped onto HTTP statuses.
enum ApiError {
    BadRequest(RequestError),
    Internal(anyhow::Error),
}

impl From<RequestError> for ApiError {
    fn from(err: RequestError) -> Self {
        ApiError::BadRequest(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(err) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response(),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": "internal error" })),
                )
                    .into_response()
            }
        }
    }
}

/// Shared state for axum handlers.
pub struct AppState {
    pub engine: Engine<ReadStore>,
    pub metrics: Arc<ApiMetrics>,
}

/// HTTP API server exposing the aggregation engine.
pub struct ApiServer {
    addr: String,
    state: Arc<AppState>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl ApiServer {
    /// Creates a server for the given listen address and engine.
    pub fn new(addr: &str, engine: Engine<ReadStore>, metrics: Arc<ApiMetrics>) -> Self {
        Self {
            addr: addr.to_string(),
            state: Arc::new(AppState { engine, metrics }),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Starts serving in a background task.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":8080"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app = router(self.state.clone());

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "api server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "api server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/viewers/aggregate", get(aggregate_handler))
        .route("/renderers", get(renderers_handler))
        .route("/renderers/groups", get(groups_handler))
        .route("/renderers/history/started-at", get(started_at_handler))
        .route("/renderers/history/stats", get(stats_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// --- Query parameters ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangedParams {
    signal_key: Option<String>,
    format: Option<String>,
    start_date_time: Option<String>,
    end_date_time: Option<String>,
    renderer_group: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyGroupParams {
    signal_key: Option<String>,
    renderer_group: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyParams {
    signal_key: Option<String>,
}

/// A fully validated ranged request.
struct RangedRequest {
    signal_key: String,
    format: Format,
    range: TimeRange,
    renderer_group: Option<String>,
}

fn require_signal_key(value: Option<String>) -> Result<String, RequestError> {
    match value {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(RequestError::MissingSignalKey),
    }
}

fn validate_ranged(state: &AppState, params: RangedParams) -> Result<RangedRequest, RequestError> {
    let signal_key = require_signal_key(params.signal_key)?;

    let format_code = params
        .format
        .ok_or_else(|| RequestError::InvalidFormat(String::new()))?;
    let format =
        Format::from_code(&format_code).ok_or(RequestError::InvalidFormat(format_code))?;

    let clock = state.engine.clock();

    let start_raw = params
        .start_date_time
        .ok_or(RequestError::MissingDateTime("startDateTime"))?;
    let start = clock
        .parse_range_datetime(&start_raw)
        .map_err(|_| RequestError::InvalidDateTime(start_raw))?;

    let end_raw = params
        .end_date_time
        .ok_or(RequestError::MissingDateTime("endDateTime"))?;
    let end = clock
        .parse_range_datetime(&end_raw)
        .map_err(|_| RequestError::InvalidDateTime(end_raw))?;

    if end < start {
        return Err(RequestError::ReversedRange);
    }

    Ok(RangedRequest {
        signal_key,
        format,
        range: TimeRange::new(start, end),
        renderer_group: params.renderer_group.filter(|g| !g.is_empty()),
    })
}

// --- Responses ---

/// Serializes a missing peak as `{}` rather than null.
fn serialize_peak<S: Serializer>(peak: &Option<CcuStat>, serializer: S) -> Result<S::Ok, S::Error> {
    match peak {
        Some(stat) => stat.serialize(serializer),
        None => serializer.serialize_map(Some(0))?.end(),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AggregateResponse {
    signal_key: String,
    format: &'static str,
    start_date_time: DateTime<Utc>,
    end_date_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    renderer_group: Option<String>,
    total_viewers: u64,
    total_avg_duration_sec: f64,
    #[serde(serialize_with = "serialize_peak")]
    ccu: Option<CcuStat>,
    viewers: Vec<ViewerBucket>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    signal_key: String,
    format: &'static str,
    start_date_time: DateTime<Utc>,
    end_date_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    renderer_group: Option<String>,
    #[serde(serialize_with = "serialize_peak")]
    peak: Option<CcuStat>,
    series: Vec<CcuStat>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartedAtResponse {
    signal_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    renderer_group: Option<String>,
    started_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupsResponse {
    signal_key: String,
    groups: Vec<GroupValue>,
}

// --- Handlers ---

fn status_label<T>(result: &Result<T, ApiError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(ApiError::BadRequest(_)) => "bad_request",
        Err(ApiError::Internal(_)) => "error",
    }
}

/// GET /viewers/aggregate - dense viewer buckets plus peak CCU.
async fn aggregate_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangedParams>,
) -> Result<Json<AggregateResponse>, ApiError> {
    let started = Instant::now();

    let result = async {
        let req = validate_ranged(&state, params)?;

        let aggregate = state
            .engine
            .aggregate(
                &req.signal_key,
                req.format,
                req.range,
                req.renderer_group.as_deref(),
                Utc::now(),
            )
            .await?;

        Ok(AggregateResponse {
            signal_key: req.signal_key,
            format: req.format.code(),
            start_date_time: req.range.start,
            end_date_time: req.range.end,
            renderer_group: req.renderer_group,
            total_viewers: aggregate.total_viewers,
            total_avg_duration_sec: aggregate.total_avg_duration_sec,
            ccu: aggregate.ccu,
            viewers: aggregate.viewers,
        })
    }
    .await;

    state
        .metrics
        .observe("aggregate", status_label(&result), started.elapsed());

    result.map(Json)
}

/// GET /renderers/history/stats - hybrid CCU series and peak for a range.
async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangedParams>,
) -> Result<Json<StatsResponse>, ApiError> {
    let started = Instant::now();

    let result = async {
        let req = validate_ranged(&state, params)?;
        let now = Utc::now();

        let (series, peak) = tokio::try_join!(
            state.engine.ccu_series(
                &req.signal_key,
                req.format,
                req.range,
                req.renderer_group.as_deref(),
                now,
            ),
            state.engine.ccu_peak(
                &req.signal_key,
                req.format.unit(),
                req.range,
                req.renderer_group.as_deref(),
                now,
            ),
        )?;

        Ok(StatsResponse {
            signal_key: req.signal_key,
            format: req.format.code(),
            start_date_time: req.range.start,
            end_date_time: req.range.end,
            renderer_group: req.renderer_group,
            peak,
            series,
        })
    }
    .await;

    state
        .metrics
        .observe("history_stats", status_label(&result), started.elapsed());

    result.map(Json)
}

/// GET /renderers/history/started-at - earliest known bucket, or null.
async fn started_at_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KeyGroupParams>,
) -> Result<Json<StartedAtResponse>, ApiError> {
    let started = Instant::now();

    let result = async {
        let signal_key = require_signal_key(params.signal_key)?;
        let renderer_group = params.renderer_group.filter(|g| !g.is_empty());

        let started_at = state
            .engine
            .started_at(&signal_key, renderer_group.as_deref())
            .await?;

        Ok(StartedAtResponse {
            signal_key,
            renderer_group,
            started_at,
        })
    }
    .await;

    state
        .metrics
        .observe("started_at", status_label(&result), started.elapsed());

    result.map(Json)
}

/// GET /renderers/groups - distinct groups across live and history data.
async fn groups_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KeyParams>,
) -> Result<Json<GroupsResponse>, ApiError> {
    let started = Instant::now();

    let result = async {
        let signal_key = require_signal_key(params.signal_key)?;
        let groups = state.engine.groups(&signal_key).await?;

        Ok(GroupsResponse { signal_key, groups })
    }
    .await;

    state
        .metrics
        .observe("groups", status_label(&result), started.elapsed());

    result.map(Json)
}

/// GET /renderers - live renderer rows for a signal key.
async fn renderers_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KeyGroupParams>,
) -> Result<Json<Vec<RendererRow>>, ApiError> {
    let started = Instant::now();

    let result = async {
        let signal_key = require_signal_key(params.signal_key)?;
        let renderer_group = params.renderer_group.filter(|g| !g.is_empty());

        let renderers = state
            .engine
            .renderers(&signal_key, renderer_group.as_deref())
            .await?;

        Ok(renderers)
    }
    .await;

    state
        .metrics
        .observe("renderers", status_label(&result), started.elapsed());

    result.map(Json)
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_signal_key() {
        assert!(require_signal_key(None).is_err());
        assert!(require_signal_key(Some(String::new())).is_err());
        assert_eq!(
            require_signal_key(Some("key-1".to_string())).expect("valid key"),
            "key-1"
        );
    }

    #[test]
    fn test_serialize_missing_peak_as_empty_object() {
        #[derive(Serialize)]
        struct Wrapper {
            #[serde(serialize_with = "serialize_peak")]
            ccu: Option<CcuStat>,
        }

        let json = serde_json::to_value(Wrapper { ccu: None }).expect("serializable");
        assert_eq!(json["ccu"], serde_json::json!({}));
    }

    #[test]
    fn test_serialize_present_peak_keeps_fields() {
        #[derive(Serialize)]
        struct Wrapper {
            #[serde(serialize_with = "serialize_peak")]
            ccu: Option<CcuStat>,
        }

        let time = DateTime::parse_from_rfc3339("2025-05-01T00:00:00Z")
            .expect("valid rfc3339")
            .with_timezone(&Utc);
        let mut stat = CcuStat::zero(time);
        stat.max_ccu = 42.0;

        let json = serde_json::to_value(Wrapper { ccu: Some(stat) }).expect("serializable");
        assert_eq!(json["ccu"]["maxCcu"], serde_json::json!(42.0));
        assert_eq!(json["ccu"]["rendererCount"], serde_json::json!(0));
    }

    #[test]
    fn test_request_error_messages() {
        assert_eq!(
            RequestError::MissingSignalKey.to_string(),
            "signalKey is required"
        );
        assert!(RequestError::InvalidFormat("w".to_string())
            .to_string()
            .contains("\"w\""));
    }
}
