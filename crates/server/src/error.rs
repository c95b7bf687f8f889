use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use library::{CatalogError, LyricsError};
use serde::Serialize;
use tracing::error;

use crate::covers::CoverError;
use crate::pipeline::PipelineError;
use crate::transcode::PlanError;

pub const CODE_GENERIC: u32 = 0;
pub const CODE_MISSING_PARAMETER: u32 = 10;
pub const CODE_WRONG_CREDENTIALS: u32 = 40;
pub const CODE_NOT_AUTHORIZED: u32 = 50;
pub const CODE_NOT_FOUND: u32 = 70;

#[derive(Debug)]
pub enum ApiError {
    /// A parameter is missing.
    MissingParameter(String),
    /// A parameter is present but unusable.
    InvalidParameter(String),
    WrongCredentials,
    NotAuthorized,
    NotFound(String),
    ScanInProgress,
    Planning(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    code: u32,
    message: String,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    status: &'static str,
    error: ErrorBody,
}

impl ApiError {
    pub fn code(&self) -> u32 {
        match self {
            ApiError::MissingParameter(_) => CODE_MISSING_PARAMETER,
            ApiError::WrongCredentials => CODE_WRONG_CREDENTIALS,
            ApiError::NotAuthorized => CODE_NOT_AUTHORIZED,
            ApiError::NotFound(_) => CODE_NOT_FOUND,
            ApiError::InvalidParameter(_)
            | ApiError::ScanInProgress
            | ApiError::Planning(_)
            | ApiError::Internal(_) => CODE_GENERIC,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingParameter(_) | ApiError::InvalidParameter(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::WrongCredentials => StatusCode::UNAUTHORIZED,
            ApiError::NotAuthorized => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ScanInProgress => StatusCode::CONFLICT,
            ApiError::Planning(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::MissingParameter(name) => format!("Missing parameter: {}", name),
            ApiError::InvalidParameter(message) => message.clone(),
            ApiError::WrongCredentials => "Wrong username or password".to_string(),
            ApiError::NotAuthorized => "User is not authorized for this operation".to_string(),
            ApiError::NotFound(what) => format!("{} not found", what),
            ApiError::ScanInProgress => "A scan is already running".to_string(),
            ApiError::Planning(message) | ApiError::Internal(message) => message.clone(),
        }
    }

    pub fn missing(name: &str) -> Self {
        ApiError::MissingParameter(name.to_string())
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message())
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            error!("Request failed: {}", self);
        }
        let envelope = ErrorEnvelope {
            status: "failed",
            error: ErrorBody {
                code: self.code(),
                message: self.message(),
            },
        };
        (self.status(), Json(envelope)).into_response()
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(what) => ApiError::NotFound(what),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<PlanError> for ApiError {
    fn from(err: PlanError) -> Self {
        ApiError::Planning(err.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<CoverError> for ApiError {
    fn from(err: CoverError) -> Self {
        match err {
            CoverError::NotFound(what) => ApiError::NotFound(format!("Cover art for {}", what)),
            CoverError::Catalog(err) => ApiError::from(err),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<LyricsError> for ApiError {
    fn from(err: LyricsError) -> Self {
        match err {
            LyricsError::Catalog(err) => ApiError::from(err),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("background task failed: {}", err))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Internal(format!("io error: {}", err))
    }
}
