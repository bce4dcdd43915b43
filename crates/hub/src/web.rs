use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::{CommandError, ValidationError};
use crate::irrigation::Origin;
use crate::sensors::SensorUpdate;
use crate::state::AppState;

const DEFAULT_LOG_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/sensors", get(get_sensors).post(post_sensors))
        .route("/api/ai/analyze", get(ai_analyze))
        .route("/api/irrigation/control", post(irrigation_control))
        .route("/api/irrigation/status", get(irrigation_status))
        .route("/api/motor-log", get(motor_log))
        .route("/api/device/register", post(register_device))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// `{"success": false, "error": ...}` with a matching status code.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: e.to_string(),
        }
    }
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        let status = match e {
            CommandError::Validation(_) => StatusCode::BAD_REQUEST,
            CommandError::Conflict { .. } => StatusCode::CONFLICT,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ValidationError::InvalidBody(e.to_string()).into())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.to_status(OffsetDateTime::now_utc()).await)
}

async fn get_sensors(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sensors.current().await)
}

async fn post_sensors(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let update = SensorUpdate::from_json(&body)?;
    let out = state.ingest(&update, OffsetDateTime::now_utc()).await?;
    Ok(Json(json!({
        "success": true,
        "data": out.snapshot,
        "recommendation": out.recommendation,
        "started": out.started,
    })))
}

async fn ai_analyze(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.analyze(OffsetDateTime::now_utc()).await)
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    action: String,
    duration: Option<i64>,
    zone: Option<String>,
    #[serde(rename = "type")]
    origin: Option<Origin>,
}

async fn irrigation_control(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: ControlRequest = parse_body(&body)?;
    let now = OffsetDateTime::now_utc();

    match req.action.as_str() {
        "start" => {
            let settings = &state.settings;
            let duration = req
                .duration
                .unwrap_or_else(|| i64::from(settings.durations.light));
            let zone = req.zone.as_deref().unwrap_or(&settings.zone);
            let origin = req.origin.unwrap_or(Origin::Manual);

            let session = state
                .irrigation
                .lock()
                .await
                .request_start(origin, zone, duration, now)
                .inspect_err(|e| warn!("start rejected: {e}"))?;
            Ok(Json(json!({ "success": true, "irrigation": session })))
        }
        "stop" => {
            let session = state.irrigation.lock().await.request_stop(now);
            let message = if session.is_some() {
                "Irrigation stopping"
            } else {
                "No irrigation running"
            };
            Ok(Json(json!({
                "success": true,
                "message": message,
                "irrigation": session,
            })))
        }
        other => Err(ApiError {
            status: StatusCode::BAD_REQUEST,
            message: format!("Invalid action '{other}' (use start or stop)"),
        }),
    }
}

async fn irrigation_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.irrigation_status(OffsetDateTime::now_utc()).await)
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    limit: Option<usize>,
}

async fn motor_log(
    State(state): State<AppState>,
    Query(q): Query<LogQuery>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    let logs = state.irrigation.lock().await.recent_events(limit);
    Json(json!({ "total": logs.len(), "logs": logs }))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    url: String,
}

async fn register_device(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: RegisterRequest = parse_body(&body)?;
    let endpoint = state.registry.register(&req.url).await?;
    Ok(Json(json!({ "success": true, "endpoint": endpoint.as_str() })))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
