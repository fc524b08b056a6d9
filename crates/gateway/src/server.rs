//! # HTTP Server Implementation
//!
//! Routes, handlers and the mapping from engine errors to status codes.
//! Engine calls block on disk I/O, so every handler runs them on the
//! blocking thread pool.

use std::ops::Bound;
use std::sync::{Arc, OnceLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::{
    extract::{MatchedPath, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use engine::{Engine, EngineError, EngineState, ErrorKind};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::metrics::{self, Metrics};

/// Default and maximum number of pairs returned by one `/scan` call.
pub const DEFAULT_SCAN_LIMIT: usize = 100;
pub const MAX_SCAN_LIMIT: usize = 1000;

// ========== API Types ==========

#[derive(Debug, Deserialize)]
pub struct WriteParams {
    pub key: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KeyParams {
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScanParams {
    /// Inclusive lower bound.
    pub start: Option<String>,
    /// Exclusive upper bound.
    pub end: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanResponse {
    pub items: Vec<KeyValue>,
    /// First key not returned; pass it as `start` to continue.
    pub next: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct StatsResponse {
    pub key_count: u64,
    pub database_size_bytes: u64,
    pub uptime_seconds: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ========== Errors ==========

/// A failed request, rendered as `{"error": ...}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound,
    Unavailable(String),
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e.kind() {
            ErrorKind::InvalidRequest => Self::BadRequest(e.to_string()),
            ErrorKind::Unavailable => Self::Unavailable(e.to_string()),
            ErrorKind::Io | ErrorKind::CorruptSegment | ErrorKind::Internal => {
                Self::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound => (StatusCode::NOT_FOUND, "Key not found".to_string()),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::Internal(detail) => {
                error!(error = %detail, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

// ========== Server State ==========

/// Shared state of the gateway.
///
/// The engine slot is empty while the engine is still recovering; requests
/// that need it answer 503 until [`AppState::install`] fills it.
pub struct AppState {
    engine: OnceLock<Arc<Engine>>,
    metrics: Metrics,
    started: Instant,
}

impl AppState {
    /// # Errors
    ///
    /// Fails if the metrics registry rejects a metric.
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            engine: OnceLock::new(),
            metrics: Metrics::new()?,
            started: Instant::now(),
        })
    }

    pub fn with_engine(engine: Arc<Engine>) -> prometheus::Result<Self> {
        let state = Self::new()?;
        state.install(engine);
        Ok(state)
    }

    /// Makes `engine` available to handlers. Returns `false` if one was
    /// already installed.
    pub fn install(&self, engine: Arc<Engine>) -> bool {
        self.engine.set(engine).is_ok()
    }

    pub fn engine(&self) -> Option<&Arc<Engine>> {
        self.engine.get()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Runs `f` against the engine on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&Engine) -> Result<T, EngineError> + Send + 'static,
        T: Send + 'static,
    {
        let engine = self
            .engine()
            .cloned()
            .ok_or_else(|| ApiError::Unavailable("engine is starting".into()))?;
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| ApiError::Internal(format!("engine task failed: {e}")))?
            .map_err(ApiError::from)
    }
}

// ========== Routes ==========

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/write", post(write))
        .route("/read", get(read))
        .route("/delete", delete(remove))
        .route("/scan", get(scan))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/stats", get(stats))
        .route("/admin/flush", post(flush))
        .route("/admin/compact", post(compact))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            track_requests,
        ))
        .with_state(state)
}

async fn track_requests(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let response = next.run(request).await;
    state.metrics.record(&method, &endpoint, started.elapsed());
    response
}

/// Treats an absent or empty query parameter as missing.
fn required(param: Option<String>) -> Option<String> {
    param.filter(|p| !p.is_empty())
}

async fn write(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WriteParams>,
) -> Result<Json<StatusResponse>, ApiError> {
    let (Some(key), Some(value)) = (required(params.key), required(params.value)) else {
        return Err(ApiError::BadRequest("Missing key or value".into()));
    };
    let engine_key = key.clone().into_bytes();
    state
        .call(move |engine| engine.put(engine_key, value.into_bytes()))
        .await?;
    Ok(Json(StatusResponse {
        status: "OK".into(),
        key: Some(key),
    }))
}

async fn read(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KeyParams>,
) -> Result<Json<KeyValue>, ApiError> {
    let Some(key) = required(params.key) else {
        return Err(ApiError::BadRequest("Missing key".into()));
    };
    let engine_key = key.clone().into_bytes();
    let value = state
        .call(move |engine| engine.get(&engine_key))
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(KeyValue {
        key,
        value: String::from_utf8_lossy(&value).into_owned(),
    }))
}

async fn remove(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KeyParams>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Some(key) = required(params.key) else {
        return Err(ApiError::BadRequest("Missing key".into()));
    };
    let engine_key = key.clone().into_bytes();
    state.call(move |engine| engine.delete(engine_key)).await?;
    Ok(Json(StatusResponse {
        status: "OK".into(),
        key: Some(key),
    }))
}

async fn scan(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ScanParams>,
) -> Result<Json<ScanResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_SCAN_LIMIT);
    if limit == 0 || limit > MAX_SCAN_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_SCAN_LIMIT
        )));
    }
    let start = match required(params.start) {
        Some(s) => Bound::Included(s.into_bytes()),
        None => Bound::Unbounded,
    };
    let end = match required(params.end) {
        Some(e) => Bound::Excluded(e.into_bytes()),
        None => Bound::Unbounded,
    };

    // One extra pair tells us whether the range continues.
    let mut pairs = state
        .call(move |engine| {
            engine
                .scan((start, end))?
                .take(limit + 1)
                .collect::<Result<Vec<_>, _>>()
        })
        .await?;
    let next = if pairs.len() > limit {
        pairs
            .pop()
            .map(|(key, _)| String::from_utf8_lossy(&key).into_owned())
    } else {
        None
    };

    let items = pairs
        .into_iter()
        .map(|(key, value)| KeyValue {
            key: String::from_utf8_lossy(&key).into_owned(),
            value: String::from_utf8_lossy(&value).into_owned(),
        })
        .collect();
    Ok(Json(ScanResponse { items, next }))
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.call(|engine| engine.health()).await {
        Ok(()) => Json(HealthResponse {
            status: "healthy".into(),
            timestamp: Some(unix_timestamp()),
            error: None,
        })
        .into_response(),
        Err(e) => {
            let detail = match e {
                ApiError::BadRequest(msg) | ApiError::Unavailable(msg) => msg,
                ApiError::Internal(detail) => {
                    warn!(error = %detail, "health check failed");
                    "internal error".to_string()
                }
                ApiError::NotFound => "not found".to_string(),
            };
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy".into(),
                    timestamp: None,
                    error: Some(detail),
                }),
            )
                .into_response()
        }
    }
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    let stats = state.call(|engine| Ok(engine.stats())).await.ok();
    match state.metrics.render(stats.as_ref()) {
        Ok(body) => ([(header::CONTENT_TYPE, metrics::CONTENT_TYPE)], body).into_response(),
        Err(e) => ApiError::Internal(format!("encoding metrics: {e}")).into_response(),
    }
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state
        .call(|engine| {
            let stats = engine.stats();
            if stats.state != EngineState::Serving {
                return Err(EngineError::Unavailable(stats.state));
            }
            Ok(stats)
        })
        .await?;
    Ok(Json(StatsResponse {
        key_count: stats.key_count,
        database_size_bytes: stats.live_bytes,
        uptime_seconds: state.started.elapsed().as_secs_f64(),
    }))
}

async fn flush(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, ApiError> {
    state.call(|engine| engine.flush()).await?;
    Ok(Json(StatusResponse {
        status: "OK".into(),
        key: None,
    }))
}

async fn compact(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, ApiError> {
    state.call(|engine| engine.compact()).await?;
    Ok(Json(StatusResponse {
        status: "OK".into(),
        key: None,
    }))
}

fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
