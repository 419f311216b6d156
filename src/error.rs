use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use crate::{
    artifacts::StoreError,
    probe::ProbeError,
    rate_limit::Rejection,
    runner::RunnerError,
};

pub const GENERIC_INTERNAL_MESSAGE: &str = "Error interno del servidor. Intenta nuevamente.";

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

/// Every failure leaving a handler. Messages are short, user-facing, and
/// never carry paths or internal detail.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub detail: Option<String>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            detail: None,
            retry_after_seconds: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::REQUEST_TIMEOUT, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// Logs the cause and answers with a generic 500.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        error!("Error interno: {cause}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_INTERNAL_MESSAGE)
    }

    pub fn rate_limited(rejection: &Rejection) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "Limite de solicitudes excedido".to_string(),
            detail: Some(rejection.message()),
            retry_after_seconds: Some(rejection.retry_after_seconds),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            message: self.detail,
            retry_after: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        Self::rate_limited(&rejection)
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => Self::not_found("Archivo no encontrado"),
            other => Self::internal(other),
        }
    }
}

impl From<RunnerError> for ApiError {
    fn from(error: RunnerError) -> Self {
        Self::internal(error)
    }
}

impl From<ProbeError> for ApiError {
    fn from(error: ProbeError) -> Self {
        match error {
            ProbeError::Failed { stderr_excerpt, .. } => {
                tracing::warn!("yt-dlp no pudo obtener metadatos: {stderr_excerpt}");
                Self::bad_request("No se pudo obtener informacion del video")
            }
            ProbeError::TimedOut(_) => Self::timeout("Tiempo de espera agotado"),
            ProbeError::Parse(error) => {
                error!("Respuesta de yt-dlp no interpretable: {error}");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "No se pudo interpretar la informacion del video",
                )
            }
            ProbeError::Runner(error) => Self::internal(error),
        }
    }
}
