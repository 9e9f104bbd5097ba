//! HTTP query and status surface.
//!
//! Read access to the ring, aggregates, archive, ledger and mode state for
//! downstream analytics, plus the operator controls: manual mode override and
//! live settings.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::aggregate::AggregateQuery;
use crate::archive::ArchiveQuery;
use crate::config::{Settings, parse_duration};
use crate::ledger::AttemptQuery;
use crate::recorder::{Recorder, since};
use crate::storage::{Mode, StorageError};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub recorder: Arc<Recorder>,
}

/// Errors returned by handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Storage(e) => {
                tracing::error!(error = %e, "Request failed on storage");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    db: Option<String>,
}

/// Query parameters for the ring API.
#[derive(Debug, Deserialize)]
pub struct RingQueryParams {
    pub kind: String,
    /// Look-back window (`"10m"`); defaults to the mode's real-time window.
    pub range: Option<String>,
}

/// Query parameters for the aggregates API.
#[derive(Debug, Default, Deserialize)]
pub struct AggregatesQueryParams {
    pub kind: Option<String>,
    pub dim_key: Option<String>,
    pub range: Option<String>,
    pub limit: Option<u32>,
}

/// Query parameters for the archive API.
#[derive(Debug, Default, Deserialize)]
pub struct ArchiveQueryParams {
    pub kind: Option<String>,
    pub range: Option<String>,
    pub limit: Option<u32>,
}

/// Query parameters for the attempts API.
#[derive(Debug, Default, Deserialize)]
pub struct AttemptsQueryParams {
    pub kind: Option<String>,
    pub skipped: Option<bool>,
    pub range: Option<String>,
    pub limit: Option<u32>,
}

/// Body of `PUT /api/mode`.
#[derive(Debug, Deserialize)]
pub struct ModeUpdate {
    pub mode: Mode,
    pub reason: Option<String>,
}

/// Body of `PUT /api/settings`.
#[derive(Debug, Deserialize)]
pub struct SettingUpdate {
    pub key: String,
    pub value: String,
}

/// Answer of `/api/settings`: what is stored and how it is read.
#[derive(Debug, Serialize)]
pub struct SettingsView {
    pub raw: BTreeMap<String, String>,
    pub effective: Settings,
}

/// Parse a look-back range like `"1h"` into a start time.
fn parse_range(range: Option<&str>) -> Result<Option<DateTime<Utc>>, ApiError> {
    let Some(range) = range.filter(|r| !r.is_empty()) else {
        return Ok(None);
    };
    let d = parse_duration(range)
        .map_err(|e| ApiError::BadRequest(format!("invalid range '{range}': {e}")))?;
    Ok(Some(since(Utc::now(), d)))
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/api/status", get(status_handler))
        .route("/api/ring", get(ring_handler))
        .route("/api/aggregates", get(aggregates_handler))
        .route("/api/archive", get(archive_handler))
        .route("/api/attempts", get(attempts_handler))
        .route("/api/mode", get(mode_handler).put(set_mode_handler))
        .route("/api/settings", get(settings_handler).put(put_setting_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Liveness probe.
async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        db: None,
    })
}

/// Readiness probe that checks DuckDB availability.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.recorder.ledger().count() {
        Ok(_) => Json(HealthResponse {
            status: "ok".to_string(),
            db: Some("ready".to_string()),
        })
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "not_ready".to_string(),
                    db: Some(err.to_string()),
                }),
            )
                .into_response()
        }
    }
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<crate::recorder::StatusReport> {
    Ok(Json(state.recorder.status()?))
}

/// Resident ring rows; only the most recent `capacity` ticks are visible.
async fn ring_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RingQueryParams>,
) -> ApiResult<Vec<crate::ring::RingEntry>> {
    let range = params
        .range
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(|e| ApiError::BadRequest(format!("invalid range: {e}")))?;
    Ok(Json(state.recorder.read_ring(&params.kind, range)))
}

async fn aggregates_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AggregatesQueryParams>,
) -> ApiResult<Vec<crate::storage::AggregateBucket>> {
    let query = AggregateQuery {
        kind: params.kind.filter(|s| !s.is_empty()),
        dim_key: params.dim_key.filter(|s| !s.is_empty()),
        start: parse_range(params.range.as_deref())?,
        end: None,
        limit: params.limit,
    };
    Ok(Json(state.recorder.aggregates().query(query)?))
}

async fn archive_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ArchiveQueryParams>,
) -> ApiResult<Vec<crate::storage::ArchiveRecord>> {
    let query = ArchiveQuery {
        kind: params.kind.filter(|s| !s.is_empty()),
        start: parse_range(params.range.as_deref())?,
        end: None,
        limit: params.limit,
    };
    Ok(Json(state.recorder.archive_store().query(query)?))
}

async fn attempts_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AttemptsQueryParams>,
) -> ApiResult<Vec<crate::storage::CollectionAttempt>> {
    let query = AttemptQuery {
        kind: params.kind.filter(|s| !s.is_empty()),
        start: parse_range(params.range.as_deref())?,
        end: None,
        skipped: params.skipped,
        limit: params.limit,
    };
    Ok(Json(state.recorder.ledger().list(query)?))
}

async fn mode_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<crate::storage::ModeState> {
    Ok(Json(state.recorder.governor().mode()?))
}

/// Manual override; always applied, regardless of `mode.auto`.
async fn set_mode_handler(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ModeUpdate>,
) -> ApiResult<crate::storage::ModeState> {
    let reason = update
        .reason
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "manual override".to_string());
    let mode = state.recorder.set_mode(update.mode, &reason)?;
    tracing::info!(mode = %mode.mode, reason = %mode.reason, "Mode set by operator");
    Ok(Json(mode))
}

async fn settings_handler(State(state): State<Arc<AppState>>) -> ApiResult<SettingsView> {
    let settings = state.recorder.settings();
    Ok(Json(SettingsView {
        raw: settings.raw()?,
        effective: settings.load(),
    }))
}

/// Operator retune; effective on the next evaluation.
async fn put_setting_handler(
    State(state): State<Arc<AppState>>,
    Json(update): Json<SettingUpdate>,
) -> ApiResult<SettingsView> {
    let settings = state.recorder.settings();
    settings
        .put(&update.key, &update.value)
        .map_err(|w| ApiError::BadRequest(w.to_string()))?;
    Ok(Json(SettingsView {
        raw: settings.raw()?,
        effective: settings.load(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::StaticLoad;
    use crate::storage::StorageBuilder;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_state() -> AppState {
        let storage = StorageBuilder::in_memory().pool_size(2).build().unwrap();
        let recorder = Recorder::new(&storage, Arc::new(StaticLoad::default())).unwrap();
        AppState {
            recorder: Arc::new(recorder),
        }
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn put_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let app = create_router(create_test_state());
        let (status, body) = send(app, get("/api/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"]["mode"], "normal");
    }

    #[tokio::test]
    async fn test_mode_override() {
        let state = create_test_state();
        let app = create_router(state.clone());
        let (status, body) = send(
            app,
            put_json("/api/mode", serde_json::json!({ "mode": "light" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "light");
        assert_eq!(body["reason"], "manual override");

        let (_, body) = send(create_router(state), get("/api/mode")).await;
        assert_eq!(body["mode"], "light");
    }

    #[tokio::test]
    async fn test_invalid_setting_rejected() {
        let app = create_router(create_test_state());
        let (status, body) = send(
            app,
            put_json(
                "/api/settings",
                serde_json::json!({ "key": "ring.capacity", "value": "1" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("ring.capacity"));
    }

    #[tokio::test]
    async fn test_invalid_range_rejected() {
        let app = create_router(create_test_state());
        let (status, _) = send(app, get("/api/attempts?range=soon")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ring_requires_kind() {
        let app = create_router(create_test_state());
        let (status, _) = send(app, get("/api/ring")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
