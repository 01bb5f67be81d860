//! Node API Module
//! Update endpoints of the node's HTTP server

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::engine::device::DeviceControl;
use crate::engine::updater::{
    check_for_updates, install_staged, prepare_update, OtaContext, OtaError,
};

#[derive(Clone)]
pub struct ApiState {
    /// Held for the whole of an OTA operation; at most one runs at a time
    pub ota: Arc<Mutex<OtaContext>>,
    pub device: Arc<dyn DeviceControl>,
    pub reset_delay: Duration,
}

impl ApiState {
    pub fn new(ota: OtaContext, device: Arc<dyn DeviceControl>, reset_delay: Duration) -> Self {
        Self {
            ota: Arc::new(Mutex::new(ota)),
            device,
            reset_delay,
        }
    }
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/updates_available", get(updates_available))
        .route("/api/v1/download_firmware", post(download_firmware))
        .route("/api/v1/install_firmware", post(install_firmware))
        .route("/api/v1/reset", post(reset))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type ApiResponse = (StatusCode, Json<Value>);

fn error_response(status: StatusCode, message: impl ToString) -> ApiResponse {
    (status, Json(json!({ "error": message.to_string() })))
}

/// Run a blocking OTA operation off the async runtime, holding the OTA lock
async fn with_ota<T, F>(state: &ApiState, op: F) -> Result<Result<T, OtaError>, ApiResponse>
where
    T: Send + 'static,
    F: FnOnce(&OtaContext) -> Result<T, OtaError> + Send + 'static,
{
    let ota = Arc::clone(&state.ota);
    tokio::task::spawn_blocking(move || -> Result<Result<T, OtaError>, String> {
        let ctx = ota.lock().map_err(|_| "OTA state poisoned by an earlier panic".to_string())?;
        Ok(op(&*ctx))
    })
    .await
    .map_err(|e| e.to_string())
    .and_then(|r| r)
    .map_err(|e| {
        error!("OTA task failed: {}", e);
        error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
    })
}

fn schedule_reset(state: &ApiState) {
    let device = Arc::clone(&state.device);
    let delay = state.reset_delay;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        device.reset();
    });
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn updates_available(State(state): State<ApiState>) -> ApiResponse {
    match with_ota(&state, check_for_updates).await {
        Ok(Ok(check)) => (StatusCode::OK, Json(json!(check))),
        Ok(Err(e)) => {
            warn!("Version check failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
        Err(response) => response,
    }
}

#[derive(Deserialize)]
pub struct DownloadParams {
    #[serde(default)]
    force: Option<String>,
}

impl DownloadParams {
    fn force(&self) -> bool {
        matches!(self.force.as_deref(), Some("1") | Some("true"))
    }
}

async fn download_firmware(
    State(state): State<ApiState>,
    Query(params): Query<DownloadParams>,
) -> ApiResponse {
    let force = params.force();
    match with_ota(&state, move |ctx| prepare_update(ctx, force)).await {
        Ok(Ok(prepared)) => {
            info!("Firmware {} ready to install", prepared.version);
            (StatusCode::OK, Json(json!({ "ready": true })))
        }
        Ok(Err(OtaError::NoUpdateAvailable { .. })) => {
            error_response(StatusCode::BAD_REQUEST, "no updates available")
        }
        Ok(Err(e)) => {
            warn!("Firmware download failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
        Err(response) => response,
    }
}

async fn install_firmware(State(state): State<ApiState>) -> ApiResponse {
    match with_ota(&state, install_staged).await {
        Ok(Ok(report)) => {
            schedule_reset(&state);
            (
                StatusCode::OK,
                Json(json!({ "status": "installed", "version": report.version })),
            )
        }
        Ok(Err(OtaError::Commit(e))) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": e.to_string(), "state": e.state().to_string() })),
        ),
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
        Err(response) => response,
    }
}

async fn reset(State(state): State<ApiState>) -> Json<Value> {
    info!("Reset requested over HTTP");
    schedule_reset(&state);
    Json(json!({ "status": "resetting" }))
}
