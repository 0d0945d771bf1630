//! HTTP endpoints of the PoW control plane.
//!
//! All mutation goes through the shared [`Manager`]; these handlers only
//! translate between JSON payloads and manager calls, and map the error
//! taxonomy onto status codes: precondition conflicts are 400, a loading
//! model or saturated ingress is 503, everything else is 500. Long-running
//! work never happens here; it belongs to the workers and the sender.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::instrument;

use crate::batch::ProofBatch;
use crate::controller::ControllerError;
use crate::manager::{ManagerError, PowInitRequest, SharedManager};

pub fn routes() -> Router<SharedManager> {
    Router::new()
        .route("/pow/init", post(pow_init))
        .route("/pow/init/generate", post(pow_init_generate))
        .route("/pow/init/validate", post(pow_init_validate))
        .route("/pow/phase/generate", post(pow_phase_generate))
        .route("/pow/phase/validate", post(pow_phase_validate))
        .route("/pow/validate", post(pow_validate))
        .route("/pow/status", get(pow_status))
        .route("/pow/stop", post(pow_stop))
}

/// `POST /pow/init`: construct the session and start the workers; phase
/// stays IDLE while models load.
#[instrument(skip_all)]
async fn pow_init(
    State(manager): State<SharedManager>,
    Json(body): Json<PowInitRequest>,
) -> Response {
    match manager.lock().await.init_pow(body).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// `POST /pow/init/generate`: idempotent init, then the generate phase.
#[instrument(skip_all)]
async fn pow_init_generate(
    State(manager): State<SharedManager>,
    Json(body): Json<PowInitRequest>,
) -> Response {
    match manager.lock().await.init_generate(body).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// `POST /pow/init/validate`: idempotent init, then the validate phase.
#[instrument(skip_all)]
async fn pow_init_validate(
    State(manager): State<SharedManager>,
    Json(body): Json<PowInitRequest>,
) -> Response {
    match manager.lock().await.init_validate(body).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// `POST /pow/phase/generate`: require a running controller, set GENERATE.
#[instrument(skip_all)]
async fn pow_phase_generate(State(manager): State<SharedManager>) -> Response {
    match manager.lock().await.start_generation().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// `POST /pow/phase/validate`: require a running controller, set VALIDATE.
#[instrument(skip_all)]
async fn pow_phase_validate(State(manager): State<SharedManager>) -> Response {
    match manager.lock().await.start_validation().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// `POST /pow/validate`: accept a peer batch for validation and register it
/// for fraud scoring.
#[instrument(skip_all)]
async fn pow_validate(
    State(manager): State<SharedManager>,
    Json(batch): Json<ProofBatch>,
) -> Response {
    match manager.lock().await.submit_validation(batch).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "queued"}))).into_response(),
        Err(error) => {
            tracing::warn!(error = %error, "rejected validation submission");
            error.into_response()
        }
    }
}

/// `GET /pow/status`: current engine state.
#[instrument(skip_all)]
async fn pow_status(State(manager): State<SharedManager>) -> Response {
    match manager.lock().await.status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// `POST /pow/stop`: tear the session down.
#[instrument(skip_all)]
async fn pow_stop(State(manager): State<SharedManager>) -> Response {
    match manager.lock().await.stop_pow().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(error) => error.into_response(),
    }
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ManagerError::AlreadyInitialized
            | ManagerError::NotInitialized
            | ManagerError::ResourceConflict { .. }
            | ManagerError::Protocol(_) => StatusCode::BAD_REQUEST,
            ManagerError::Controller(ControllerError::InvalidParams(_)) => StatusCode::BAD_REQUEST,
            ManagerError::ModelLoading | ManagerError::Controller(ControllerError::Backpressure) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ManagerError::Degraded
            | ManagerError::Controller(_)
            | ManagerError::Runner { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
