use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {message}")]
    BadRequest { code: &'static str, message: String },
    #[error("unexpected upstream response: {message}")]
    Extraction { code: &'static str, message: String },
    #[error("not found: {message}")]
    NotFound { code: &'static str, message: String },
    #[error("{message}")]
    Upstream {
        code: &'static str,
        status: Option<u16>,
        message: String,
    },
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request cancelled")]
    Cancelled,
    #[error("unauthorized: {message}")]
    Unauthorized {
        code: &'static str,
        message: &'static str,
    },
    #[error("internal error")]
    Internal { code: &'static str, message: String },
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

impl AppError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn extraction(code: &'static str, message: impl Into<String>) -> Self {
        Self::Extraction {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Upstream {
            code: "upstream_error",
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(code: &'static str, message: &'static str) -> Self {
        Self::Unauthorized { code, message }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            code: "internal_error",
            message: message.into(),
        }
    }

    /// Stable machine-readable code reported alongside the human message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest { code, .. }
            | Self::Extraction { code, .. }
            | Self::NotFound { code, .. }
            | Self::Upstream { code, .. }
            | Self::Unauthorized { code, .. }
            | Self::Internal { code, .. } => code,
            Self::Timeout(_) => "upstream_timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::upstream(err.status().map(|status| status.as_u16()), err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message) = match self {
            Self::BadRequest { message, .. } => (StatusCode::BAD_REQUEST, message),
            Self::NotFound { message, .. } => (StatusCode::NOT_FOUND, message),
            Self::Unauthorized { message, .. } => (StatusCode::UNAUTHORIZED, message.to_string()),
            Self::Extraction { message, .. } | Self::Upstream { message, .. } => {
                (StatusCode::BAD_GATEWAY, message)
            }
            Self::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            Self::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Self::Internal { message, .. } => {
                tracing::error!(error = %message, "request failed with internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorResponse {
                code: code.to_string(),
                message,
                details: json!({}),
            }),
        )
            .into_response()
    }
}
