use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Container spawn failed: {0}")]
    Spawn(String),

    #[error("Container '{name}' did not become ready within {deadline_secs}s")]
    StartupTimeout { name: String, deadline_secs: u64 },

    #[error("Worker transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("No idle worker available")]
    NoIdleWorker,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Worker is busy with job {0}")]
    WorkerBusy(String),
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            OrchestratorError::BadRequest(ref message) => {
                (StatusCode::BAD_REQUEST, message.clone())
            }
            OrchestratorError::WorkerBusy(ref job_id) => (
                StatusCode::CONFLICT,
                format!("worker is busy with job {job_id}"),
            ),
            OrchestratorError::Json(ref err) => (StatusCode::BAD_REQUEST, err.to_string()),
            ref err => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };

        let body = json!({
            "error": error_message
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<axum::extract::rejection::JsonRejection> for OrchestratorError {
    fn from(rej: axum::extract::rejection::JsonRejection) -> Self {
        OrchestratorError::BadRequest(rej.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
