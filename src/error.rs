use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Errors surfaced by the registry, the status services and the log multiplexer.
///
/// `Clone` because a single failed external execution is handed to every
/// caller that was waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("command timeout after {timeout_ms}ms: {command}")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("command failed: {command}: {stderr}")]
    ExternalExecution { command: String, stderr: String },

    #[error("parsing {what}: {message}")]
    Parse { what: String, message: String },

    #[error("cluster {0} has an incomplete namespace")]
    Conflict(String),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    InvalidInput(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn parse(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
        CoreError::Parse {
            what: what.into(),
            message: err.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CoreError::ExternalExecution { .. } | CoreError::Parse { .. } => {
                StatusCode::BAD_GATEWAY
            }
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e.to_string())
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "success": false,
            "error": self.to_string(),
        });
        if let CoreError::ExternalExecution { stderr, .. } = &self {
            body["stderr"] = json!(stderr);
        }
        (self.status_code(), Json(body)).into_response()
    }
}
